// crates/contextd-server/src/store/embedded.rs
// Embedded vector backend - rusqlite files under the tenant directory,
// brute-force cosine scan in process

use super::{
    apply_tenancy, cosine_similarity, matches_filter, normalize_cosine, sort_hits, CollectionRef,
    Metadata, MetadataFilter, Record, SearchHit, VectorStore,
};
use crate::error::{ContextdError, Result};
use crate::tenant::TenantRouter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

const DB_FILE: &str = "contextd.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    name        TEXT PRIMARY KEY,
    dimension   INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS records (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    vector      BLOB NOT NULL,
    content     TEXT NOT NULL,
    metadata    TEXT NOT NULL,
    org         TEXT NOT NULL,
    team        TEXT,
    project     TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE INDEX IF NOT EXISTS idx_records_tenancy
    ON records (collection, org, team, project);
"#;

/// Local, in-process vector store. One SQLite file per tenant directory;
/// vectors are little-endian f32 blobs scanned with brute-force cosine.
///
/// Collection volumes here are small (this is the warm fallback, not the
/// primary index), so a linear scan beats maintaining an ANN structure.
pub struct EmbeddedStore {
    router: TenantRouter,
    connections: Mutex<HashMap<PathBuf, Arc<Mutex<Connection>>>>,
}

impl EmbeddedStore {
    pub fn new(router: TenantRouter) -> Self {
        Self {
            router,
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn connection(&self, collection: &CollectionRef) -> Result<Arc<Mutex<Connection>>> {
        let dir = self
            .router
            .ensure_storage_dir(collection.scope, &collection.tenant)?;
        let path = dir.join(DB_FILE);

        let mut cache = lock_unpoisoned(&self.connections);
        if let Some(conn) = cache.get(&path) {
            return Ok(conn.clone());
        }

        let created = !path.exists();
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        if created {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
        }
        debug!(path = %path.display(), "opened embedded store");

        let conn = Arc::new(Mutex::new(conn));
        cache.insert(path, conn.clone());
        Ok(conn)
    }

    fn load_matching(
        &self,
        conn: &Connection,
        collection: &CollectionRef,
    ) -> Result<Vec<Record>> {
        let mut stmt = conn.prepare(
            "SELECT id, vector, content, metadata, created_at, updated_at
             FROM records WHERE collection = ?1",
        )?;
        let tenancy = collection.tenancy_filter();
        let rows = stmt.query_map(params![collection.name], row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            let record = row.map_err(ContextdError::from)??;
            if matches_filter(&record, &tenancy) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

type RawRow = (String, Vec<u8>, String, String, String, String);

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Record>> {
    let raw: RawRow = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    );
    Ok(parse_record(raw))
}

fn parse_record((id, vector, content, metadata, created_at, updated_at): RawRow) -> Result<Record> {
    Ok(Record {
        id: Uuid::parse_str(&id)
            .map_err(|e| ContextdError::Other(format!("corrupt record id {id}: {e}")))?,
        vector: decode_vector(&vector),
        content,
        metadata: serde_json::from_str(&metadata)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ContextdError::Other(format!("corrupt timestamp {raw}: {e}")))
}

#[async_trait]
impl VectorStore for EmbeddedStore {
    async fn ensure_collection(&self, collection: &CollectionRef) -> Result<()> {
        collection.require_tenancy()?;
        let conn = self.connection(collection)?;
        let conn = lock_unpoisoned(&conn);

        let existing: Option<i64> = conn
            .query_row(
                "SELECT dimension FROM collections WHERE name = ?1",
                params![collection.name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(dim) if dim as usize != collection.dimension => {
                Err(ContextdError::DimensionMismatch {
                    expected: dim as usize,
                    actual: collection.dimension,
                })
            }
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO collections (name, dimension, created_at) VALUES (?1, ?2, ?3)",
                    params![
                        collection.name,
                        collection.dimension as i64,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &CollectionRef, records: Vec<Record>) -> Result<Vec<Uuid>> {
        collection.require_tenancy()?;
        self.ensure_collection(collection).await?;

        let conn = self.connection(collection)?;
        let mut conn = lock_unpoisoned(&conn);
        let tx = conn.transaction()?;

        let mut ids = Vec::with_capacity(records.len());
        for mut record in records {
            collection.check_dimension(&record)?;
            apply_tenancy(&mut record, collection);
            tx.execute(
                "INSERT OR REPLACE INTO records
                 (collection, id, vector, content, metadata, org, team, project, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    collection.name,
                    record.id.to_string(),
                    encode_vector(&record.vector),
                    record.content,
                    serde_json::to_string(&record.metadata)?,
                    collection.tenant.org,
                    collection.tenant.team,
                    collection.tenant.project,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            ids.push(record.id);
        }
        tx.commit()?;
        Ok(ids)
    }

    async fn search(
        &self,
        collection: &CollectionRef,
        query: &[f32],
        k: usize,
        extra: Option<MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        collection.require_tenancy()?;
        if k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != collection.dimension {
            return Err(ContextdError::DimensionMismatch {
                expected: collection.dimension,
                actual: query.len(),
            });
        }

        let conn = self.connection(collection)?;
        let records = {
            let conn = lock_unpoisoned(&conn);
            self.load_matching(&conn, collection)?
        };

        let mut hits: Vec<SearchHit> = records
            .into_iter()
            .filter(|record| {
                extra
                    .as_ref()
                    .map(|f| matches_filter(record, f))
                    .unwrap_or(true)
            })
            .map(|record| {
                let score = normalize_cosine(cosine_similarity(query, &record.vector));
                SearchHit {
                    record,
                    score,
                    stale_warning: false,
                }
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn list(
        &self,
        collection: &CollectionRef,
        limit: usize,
        offset: usize,
        extra: Option<MetadataFilter>,
    ) -> Result<Vec<Record>> {
        collection.require_tenancy()?;
        let conn = self.connection(collection)?;
        let mut records = {
            let conn = lock_unpoisoned(&conn);
            self.load_matching(&conn, collection)?
        };
        if let Some(extra) = &extra {
            records.retain(|record| matches_filter(record, extra));
        }
        super::sort_for_listing(&mut records);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn get(&self, collection: &CollectionRef, id: Uuid) -> Result<Record> {
        collection.require_tenancy()?;
        let conn = self.connection(collection)?;
        let conn = lock_unpoisoned(&conn);

        let raw: Option<RawRow> = conn
            .query_row(
                "SELECT id, vector, content, metadata, created_at, updated_at
                 FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.name, id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        let record = raw
            .map(parse_record)
            .transpose()?
            .ok_or_else(|| ContextdError::NotFound(id.to_string()))?;
        if !matches_filter(&record, &collection.tenancy_filter()) {
            return Err(ContextdError::NotFound(id.to_string()));
        }
        Ok(record)
    }

    async fn update(&self, collection: &CollectionRef, id: Uuid, patch: Metadata) -> Result<()> {
        collection.require_tenancy()?;
        let mut record = self.get(collection, id).await?;
        for (key, value) in patch {
            record.metadata.insert(key, value);
        }
        record.updated_at = Utc::now();

        let conn = self.connection(collection)?;
        let conn = lock_unpoisoned(&conn);
        conn.execute(
            "UPDATE records SET metadata = ?3, updated_at = ?4
             WHERE collection = ?1 AND id = ?2",
            params![
                collection.name,
                id.to_string(),
                serde_json::to_string(&record.metadata)?,
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn delete(&self, collection: &CollectionRef, id: Uuid) -> Result<()> {
        collection.require_tenancy()?;
        // Tenancy check happens on the read; a foreign-tenant id looks absent.
        self.get(collection, id).await?;

        let conn = self.connection(collection)?;
        let conn = lock_unpoisoned(&conn);
        conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.name, id.to_string()],
        )?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        lock_unpoisoned(&self.connections).clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::*;
    use contextd_types::{CollectionType, Scope};
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> EmbeddedStore {
        EmbeddedStore::new(TenantRouter::new(dir.to_path_buf()))
    }

    fn project_ref(org: &str, project: &str) -> CollectionRef {
        collection_ref(
            &format!("{project}_memories"),
            CollectionType::Memories,
            Scope::Project,
            org,
            None,
            Some(project),
            4,
        )
    }

    #[tokio::test]
    async fn test_upsert_search_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let c = project_ref("acme", "api");

        let mut meta = Metadata::new();
        meta.insert("state".into(), "active".into());
        let record = Record::new(axis_vector(4, 0), "use context cancellation".into(), meta);
        let id = record.id;

        let ids = store.upsert(&c, vec![record]).await.unwrap();
        assert_eq!(ids, vec![id]);

        let hits = store
            .search(&c, &axis_vector(4, 0), 5, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, id);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert_eq!(hits[0].record.meta_str("org"), Some("acme"));
    }

    #[tokio::test]
    async fn test_tenancy_isolation_between_orgs() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let t1 = project_ref("t1", "api");
        let record = Record::new(axis_vector(4, 0), "t1 secret plan".into(), Metadata::new());
        let id = record.id;
        store.upsert(&t1, vec![record]).await.unwrap();

        let t2 = project_ref("t2", "api");
        let hits = store.search(&t2, &axis_vector(4, 0), 5, None).await.unwrap();
        assert!(hits.is_empty());

        let err = store.get(&t2, id).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_ensure_collection_dimension_conflict() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let c = project_ref("acme", "api");
        store.ensure_collection(&c).await.unwrap();
        store.ensure_collection(&c).await.unwrap();

        let mut wrong = c.clone();
        wrong.dimension = 8;
        let err = store.ensure_collection(&wrong).await.unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_on_write() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let c = project_ref("acme", "api");
        let bad = Record::new(vec![1.0; 3], "short".into(), Metadata::new());
        let err = store.upsert(&c, vec![bad]).await.unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[tokio::test]
    async fn test_update_patches_metadata_only() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let c = project_ref("acme", "api");

        let mut meta = Metadata::new();
        meta.insert("confidence".into(), 0.5.into());
        let record = Record::new(axis_vector(4, 1), "original content".into(), meta);
        let id = record.id;
        store.upsert(&c, vec![record]).await.unwrap();

        let mut patch = Metadata::new();
        patch.insert("confidence".into(), 0.6.into());
        store.update(&c, id, patch).await.unwrap();

        let updated = store.get(&c, id).await.unwrap();
        assert_eq!(updated.meta_f64("confidence"), Some(0.6));
        assert_eq!(updated.content, "original content");
        assert_eq!(updated.vector, axis_vector(4, 1));
    }

    #[tokio::test]
    async fn test_delete_then_not_found() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let c = project_ref("acme", "api");

        let record = Record::new(axis_vector(4, 2), "gone soon".into(), Metadata::new());
        let id = record.id;
        store.upsert(&c, vec![record]).await.unwrap();

        store.delete(&c, id).await.unwrap();
        assert_eq!(store.delete(&c, id).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_search_k_zero_is_empty() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let c = project_ref("acme", "api");
        let record = Record::new(axis_vector(4, 0), "x".into(), Metadata::new());
        store.upsert(&c, vec![record]).await.unwrap();

        let hits = store.search(&c, &axis_vector(4, 0), 0, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_extra_filter_narrowing() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let c = project_ref("acme", "api");

        let mut active = Metadata::new();
        active.insert("state".into(), "active".into());
        let mut archived = Metadata::new();
        archived.insert("state".into(), "archived".into());

        store
            .upsert(
                &c,
                vec![
                    Record::new(axis_vector(4, 0), "keep".into(), active),
                    Record::new(axis_vector(4, 0), "hide".into(), archived),
                ],
            )
            .await
            .unwrap();

        let mut filter = MetadataFilter::new();
        filter.insert("state".into(), "active".into());
        let hits = store
            .search(&c, &axis_vector(4, 0), 10, Some(filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.content, "keep");
    }

    #[tokio::test]
    async fn test_vector_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0, 0.0];
        assert_eq!(decode_vector(&encode_vector(&v)), v);
    }
}
