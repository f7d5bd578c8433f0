// crates/contextd-server/src/store/qdrant.rs
// Remote vector backend over Qdrant

use super::{
    normalize_cosine, sort_hits, CollectionRef, Metadata, MetadataFilter, MetadataValue, Record,
    SearchHit, VectorStore,
};
use crate::error::{ContextdError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId,
    PointStruct, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::{Qdrant, QdrantError};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Hard cap on records per upsert batch.
const MAX_BATCH_RECORDS: usize = 10_000;

/// Remote store backed by a Qdrant server.
///
/// Collections are created with cosine distance; per-record tenancy fields
/// ride in the payload and every read carries a must-filter over them.
pub struct QdrantStore {
    client: Qdrant,
    /// Dimensions observed per collection, to reject conflicting re-ensures
    /// without re-fetching collection info on every call.
    dimensions: Mutex<HashMap<String, usize>>,
}

impl QdrantStore {
    /// Connect to a Qdrant server. Compatibility check is skipped so minor
    /// client/server version drift does not block startup.
    pub fn connect(url: &str, api_key: Option<&str>) -> Result<Self> {
        let mut builder = Qdrant::from_url(url).skip_compatibility_check();
        if let Some(key) = api_key {
            builder = builder.api_key(key.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| ContextdError::Unavailable(format!("qdrant connect: {e}")))?;
        Ok(Self {
            client,
            dimensions: Mutex::new(HashMap::new()),
        })
    }

    fn filter_for(
        &self,
        collection: &CollectionRef,
        extra: Option<&MetadataFilter>,
    ) -> Result<Filter> {
        let mut conditions = Vec::new();
        for (key, value) in collection.tenancy_filter() {
            conditions.push(condition_for(&key, &value)?);
        }
        if let Some(extra) = extra {
            for (key, value) in extra {
                conditions.push(condition_for(key, value)?);
            }
        }
        Ok(Filter::must(conditions))
    }

    async fn fetch_one(&self, collection: &CollectionRef, id: Uuid) -> Result<Record> {
        let mut filter = self.filter_for(collection, None)?;
        filter
            .must
            .push(Condition::matches("id", id.to_string()));

        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&collection.name)
                    .filter(filter)
                    .limit(1)
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await
            .map_err(map_qdrant_err)?;

        let point = response
            .result
            .into_iter()
            .next()
            .ok_or_else(|| ContextdError::NotFound(id.to_string()))?;
        retrieved_to_record(point)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, collection: &CollectionRef) -> Result<()> {
        collection.require_tenancy()?;

        {
            let cache = lock_unpoisoned(&self.dimensions);
            if let Some(&dim) = cache.get(&collection.name) {
                if dim != collection.dimension {
                    return Err(ContextdError::DimensionMismatch {
                        expected: dim,
                        actual: collection.dimension,
                    });
                }
                return Ok(());
            }
        }

        let exists = self
            .client
            .collection_exists(&collection.name)
            .await
            .map_err(map_qdrant_err)?;

        if !exists {
            info!(collection = %collection.name, "creating qdrant collection");
            let create = self
                .client
                .create_collection(
                    CreateCollectionBuilder::new(&collection.name).vectors_config(
                        VectorParamsBuilder::new(collection.dimension as u64, Distance::Cosine),
                    ),
                )
                .await;
            if let Err(e) = create {
                // Another process may have created it between the exists
                // check and the create call.
                let msg = e.to_string();
                if msg.contains("already exists") {
                    debug!(collection = %collection.name, "collection created concurrently");
                } else {
                    return Err(map_qdrant_err(e));
                }
            }
        }

        lock_unpoisoned(&self.dimensions).insert(collection.name.clone(), collection.dimension);
        Ok(())
    }

    async fn upsert(&self, collection: &CollectionRef, records: Vec<Record>) -> Result<Vec<Uuid>> {
        collection.require_tenancy()?;
        if records.len() > MAX_BATCH_RECORDS {
            return Err(ContextdError::ResourceExhausted(format!(
                "batch of {} exceeds {} records",
                records.len(),
                MAX_BATCH_RECORDS
            )));
        }
        self.ensure_collection(collection).await?;

        let mut ids = Vec::with_capacity(records.len());
        let mut points = Vec::with_capacity(records.len());
        for mut record in records {
            collection.check_dimension(&record)?;
            super::apply_tenancy(&mut record, collection);
            ids.push(record.id);
            points.push(record_to_point(&record));
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&collection.name, points).wait(true))
            .await
            .map_err(map_qdrant_err)?;

        debug!(collection = %collection.name, count = ids.len(), "upserted points");
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

        let filter = self.filter_for(collection, extra.as_ref())?;
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&collection.name, query.to_vec(), k as u64)
                    .filter(filter)
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await
            .map_err(map_qdrant_err)?;

        let mut hits = Vec::with_capacity(response.result.len());
        for point in response.result {
            let score = normalize_cosine(point.score);
            let record = scored_to_record(point)?;
            hits.push(SearchHit {
                record,
                score,
                stale_warning: false,
            });
        }
        sort_hits(&mut hits);
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
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = self.filter_for(collection, extra.as_ref())?;

        // Qdrant scroll has no server-side ordering; page everything under
        // the filter and order deterministically here.
        let mut records = Vec::new();
        let mut cursor: Option<PointId> = None;
        let page: u32 = 256;
        loop {
            let mut builder = ScrollPointsBuilder::new(&collection.name)
                .filter(filter.clone())
                .limit(page)
                .with_payload(true)
                .with_vectors(true);
            if let Some(ref offset_id) = cursor {
                builder = builder.offset(offset_id.clone());
            }

            let response = self.client.scroll(builder).await.map_err(map_qdrant_err)?;
            if response.result.is_empty() {
                break;
            }
            let fetched = response.result.len();
            cursor = response.result.last().and_then(|p| p.id.clone());
            for point in response.result {
                records.push(retrieved_to_record(point)?);
            }
            if fetched < page as usize {
                break;
            }
        }

        super::sort_for_listing(&mut records);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn get(&self, collection: &CollectionRef, id: Uuid) -> Result<Record> {
        collection.require_tenancy()?;
        self.fetch_one(collection, id).await
    }

    async fn update(&self, collection: &CollectionRef, id: Uuid, patch: Metadata) -> Result<()> {
        collection.require_tenancy()?;
        // Read-modify-upsert keeps vector and content untouched; concurrent
        // writers to the same id are serialised by the backend.
        let mut record = self.fetch_one(collection, id).await?;
        for (key, value) in patch {
            record.metadata.insert(key, value);
        }
        record.updated_at = Utc::now();

        self.client
            .upsert_points(
                UpsertPointsBuilder::new(&collection.name, vec![record_to_point(&record)])
                    .wait(true),
            )
            .await
            .map_err(map_qdrant_err)?;
        Ok(())
    }

    async fn delete(&self, collection: &CollectionRef, id: Uuid) -> Result<()> {
        collection.require_tenancy()?;
        // The read enforces tenancy; a foreign-tenant id reads as absent.
        self.fetch_one(collection, id).await?;

        self.client
            .delete_points(
                DeletePointsBuilder::new(&collection.name)
                    .points(vec![PointId::from(id.to_string())])
                    .wait(true),
            )
            .await
            .map_err(map_qdrant_err)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .health_check()
            .await
            .map(|_| ())
            .map_err(map_qdrant_err)
    }

    async fn close(&self) -> Result<()> {
        // The tonic channel closes on drop; nothing to flush.
        Ok(())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Classify a qdrant-client failure into the store error model.
fn map_qdrant_err(e: QdrantError) -> ContextdError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("unauthenticated")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
    {
        ContextdError::Unauthenticated(msg)
    } else if lower.contains("deadline") || lower.contains("timed out") || lower.contains("timeout")
    {
        ContextdError::DeadlineExceeded(msg)
    } else if lower.contains("not found") || lower.contains("doesn't exist") {
        ContextdError::NotFound(msg)
    } else if lower.contains("transport")
        || lower.contains("connect")
        || lower.contains("unavailable")
        || lower.contains("broken pipe")
        || lower.contains("refused")
    {
        ContextdError::Unavailable(msg)
    } else {
        ContextdError::Other(msg)
    }
}

fn condition_for(key: &str, value: &MetadataValue) -> Result<Condition> {
    match value {
        MetadataValue::Str(s) => Ok(Condition::matches(key, s.clone())),
        MetadataValue::Bool(b) => Ok(Condition::matches(key, *b)),
        MetadataValue::Int(i) => Ok(Condition::matches(key, *i)),
        MetadataValue::Timestamp(ts) => Ok(Condition::matches(key, ts.to_rfc3339())),
        MetadataValue::Num(_) => Err(ContextdError::InvalidArgument(format!(
            "cannot filter on float field {key}"
        ))),
    }
}

fn record_to_point(record: &Record) -> PointStruct {
    let mut payload: HashMap<String, QdrantValue> = HashMap::new();
    payload.insert("id".to_string(), record.id.to_string().into());
    payload.insert("content".to_string(), record.content.clone().into());
    payload.insert(
        "created_at".to_string(),
        record.created_at.to_rfc3339().into(),
    );
    payload.insert(
        "updated_at".to_string(),
        record.updated_at.to_rfc3339().into(),
    );
    for (key, value) in &record.metadata {
        payload.insert(key.clone(), metadata_to_qdrant(value));
    }
    PointStruct::new(record.id.to_string(), record.vector.clone(), payload)
}

fn metadata_to_qdrant(value: &MetadataValue) -> QdrantValue {
    match value {
        MetadataValue::Str(s) => s.clone().into(),
        MetadataValue::Bool(b) => (*b).into(),
        MetadataValue::Int(i) => (*i).into(),
        MetadataValue::Num(n) => (*n).into(),
        MetadataValue::Timestamp(ts) => ts.to_rfc3339().into(),
    }
}

fn qdrant_to_metadata(value: &QdrantValue) -> Option<MetadataValue> {
    if let Some(b) = value.as_bool() {
        return Some(MetadataValue::Bool(b));
    }
    if let Some(i) = value.as_integer() {
        return Some(MetadataValue::Int(i));
    }
    if let Some(n) = value.as_double() {
        return Some(MetadataValue::Num(n));
    }
    if let Some(s) = value.as_str() {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(MetadataValue::Timestamp(ts.with_timezone(&Utc)));
        }
        return Some(MetadataValue::Str(s.to_string()));
    }
    None
}

fn payload_to_record(
    payload: HashMap<String, QdrantValue>,
    vector: Option<Vec<f32>>,
) -> Result<Record> {
    let id = payload
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ContextdError::Other("point payload missing id".into()))?;
    let content = payload
        .get("content")
        .and_then(|v| v.as_str())
        .cloned()
        .unwrap_or_default();
    let created_at = parse_payload_ts(&payload, "created_at")?;
    let updated_at = parse_payload_ts(&payload, "updated_at")?;

    let mut metadata = Metadata::new();
    for (key, value) in &payload {
        if matches!(key.as_str(), "id" | "content" | "created_at" | "updated_at") {
            continue;
        }
        if let Some(converted) = qdrant_to_metadata(value) {
            metadata.insert(key.clone(), converted);
        }
    }

    Ok(Record {
        id,
        vector: vector.unwrap_or_default(),
        content,
        metadata,
        created_at,
        updated_at,
    })
}

fn parse_payload_ts(
    payload: &HashMap<String, QdrantValue>,
    key: &str,
) -> Result<DateTime<Utc>> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| ContextdError::Other(format!("point payload missing {key}")))
}

fn scored_to_record(point: qdrant_client::qdrant::ScoredPoint) -> Result<Record> {
    let vector = extract_dense(point.vectors);
    payload_to_record(point.payload, vector)
}

fn retrieved_to_record(point: qdrant_client::qdrant::RetrievedPoint) -> Result<Record> {
    let vector = extract_dense(point.vectors);
    payload_to_record(point.payload, vector)
}

fn extract_dense(vectors: Option<qdrant_client::qdrant::VectorsOutput>) -> Option<Vec<f32>> {
    use qdrant_client::qdrant::vector_output::Vector;
    use qdrant_client::qdrant::vectors_output::VectorsOptions;

    match vectors?.vectors_options? {
        VectorsOptions::Vector(v) => match v.into_vector() {
            Vector::Dense(dense) => Some(dense.data),
            _ => None,
        },
        _ => None,
    }
}
