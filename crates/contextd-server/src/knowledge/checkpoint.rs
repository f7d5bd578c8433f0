// crates/contextd-server/src/knowledge/checkpoint.rs
// Checkpoint service - named session snapshots with searchable summaries

use super::{join_list, split_list, ServiceContext};
use crate::error::{ContextdError, Result};
use crate::store::{Metadata, MetadataFilter, Record};
use contextd_types::{Checkpoint, CollectionType, ResumeLevel, TenantId};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Inputs for a checkpoint save.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSave {
    pub session_id: String,
    pub name: String,
    pub summary: String,
    pub description: Option<String>,
    pub project_path: String,
    pub tags: Vec<String>,
    pub token_count: u64,
    pub full_state: Option<String>,
}

/// One checkpoint search result.
#[derive(Debug, Clone)]
pub struct CheckpointSearchHit {
    pub checkpoint: Checkpoint,
    pub score: f32,
    pub stale_warning: bool,
}

pub struct CheckpointService {
    ctx: Arc<ServiceContext>,
}

impl CheckpointService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Save a snapshot; the embedding covers summary + description so
    /// either can be searched later. Read-only after creation.
    pub async fn save(&self, tenant: &TenantId, input: CheckpointSave) -> Result<Checkpoint> {
        if input.session_id.trim().is_empty() {
            return Err(ContextdError::InvalidArgument("empty session_id".into()));
        }
        if input.name.trim().is_empty() {
            return Err(ContextdError::InvalidArgument("empty checkpoint name".into()));
        }
        self.ctx.register_tenancy(tenant)?;

        let summary = self.ctx.scrubber.scrub_text(&input.summary);
        let description = input
            .description
            .as_deref()
            .map(|d| self.ctx.scrubber.scrub_text(d));
        let full_state = input
            .full_state
            .as_deref()
            .map(|s| self.ctx.scrubber.scrub_text(s));

        let embed_text = match &description {
            Some(description) => format!("{summary}\n\n{description}"),
            None => summary.clone(),
        };
        let vector = self.ctx.embedder.embed(&embed_text).await?;

        let mut metadata = Metadata::new();
        metadata.insert("session_id".into(), input.session_id.as_str().into());
        metadata.insert("name".into(), input.name.as_str().into());
        if let Some(description) = &description {
            metadata.insert("description".into(), description.as_str().into());
        }
        metadata.insert("project_path".into(), input.project_path.as_str().into());
        metadata.insert("tags".into(), join_list(&input.tags).into());
        metadata.insert("token_count".into(), (input.token_count as i64).into());
        if let Some(full_state) = &full_state {
            metadata.insert("full_state".into(), full_state.as_str().into());
        }
        // Soft-delete tombstone flag; reads filter on it.
        metadata.insert("deleted".into(), false.into());

        let record = Record::new(vector, summary, metadata);
        let collection = self.ctx.write_ref(tenant, CollectionType::Checkpoints)?;
        let ids = self.ctx.store.upsert(&collection, vec![record.clone()]).await?;
        debug!(id = %ids[0], name = %input.name, "saved checkpoint");

        Ok(record_to_checkpoint(&record, ResumeLevel::Full))
    }

    /// Return the checkpoint at the requested detail level. A soft-deleted
    /// checkpoint reads as absent.
    pub async fn resume(
        &self,
        tenant: &TenantId,
        id: Uuid,
        level: ResumeLevel,
    ) -> Result<Checkpoint> {
        let (_, record) = self
            .ctx
            .scoped_get(tenant, CollectionType::Checkpoints, id)
            .await?;
        if is_deleted(&record) {
            return Err(ContextdError::NotFound(id.to_string()));
        }
        Ok(record_to_checkpoint(&record, level))
    }

    /// Newest first, paginated deterministically by `(created_at DESC, id ASC)`.
    pub async fn list(
        &self,
        tenant: &TenantId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Checkpoint>> {
        let collection = self.ctx.write_ref(tenant, CollectionType::Checkpoints)?;
        let records = self
            .ctx
            .store
            .list(&collection, limit, offset, Some(live_filter()))
            .await?;
        Ok(records
            .iter()
            .map(|r| record_to_checkpoint(r, ResumeLevel::Standard))
            .collect())
    }

    pub async fn search(
        &self,
        tenant: &TenantId,
        query: &str,
        k: usize,
    ) -> Result<Vec<CheckpointSearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.ctx.embedder.embed(query).await?;
        let hits = self
            .ctx
            .scoped_search(
                tenant,
                CollectionType::Checkpoints,
                &vector,
                k,
                Some(live_filter()),
            )
            .await?;

        let mut results: Vec<CheckpointSearchHit> = hits
            .into_iter()
            .map(|hit| CheckpointSearchHit {
                checkpoint: record_to_checkpoint(&hit.record, ResumeLevel::Standard),
                score: hit.score,
                stale_warning: hit.stale_warning,
            })
            .collect();
        results.truncate(k);
        Ok(results)
    }

    /// Soft delete: the record stays in its collection as a tombstone, but
    /// every read path filters it out. Deleting twice reads as absent.
    pub async fn delete(&self, tenant: &TenantId, id: Uuid) -> Result<()> {
        let (collection, record) = self
            .ctx
            .scoped_get(tenant, CollectionType::Checkpoints, id)
            .await?;
        if is_deleted(&record) {
            return Err(ContextdError::NotFound(id.to_string()));
        }
        let mut patch = Metadata::new();
        patch.insert("deleted".into(), true.into());
        self.ctx.store.update(&collection, id, patch).await
    }
}

fn is_deleted(record: &Record) -> bool {
    record.meta_bool("deleted").unwrap_or(false)
}

/// Filter clause matching only live (non-tombstoned) checkpoints.
fn live_filter() -> MetadataFilter {
    let mut filter = MetadataFilter::new();
    filter.insert("deleted".into(), false.into());
    filter
}

/// Project a stored record down to the requested resume level.
fn record_to_checkpoint(record: &Record, level: ResumeLevel) -> Checkpoint {
    let base = Checkpoint {
        id: record.id.to_string(),
        session_id: record.meta_str("session_id").unwrap_or_default().to_string(),
        name: record.meta_str("name").unwrap_or_default().to_string(),
        summary: record.content.clone(),
        description: None,
        project_path: record.meta_str("project_path").unwrap_or_default().to_string(),
        tags: Vec::new(),
        token_count: record.meta_i64("token_count").unwrap_or(0).max(0) as u64,
        full_state: None,
        created_at: record.created_at,
    };

    match level {
        ResumeLevel::Summary => base,
        ResumeLevel::Standard => Checkpoint {
            description: record.meta_str("description").map(str::to_string),
            tags: split_list(record.meta_str("tags")),
            ..base
        },
        ResumeLevel::Full => Checkpoint {
            description: record.meta_str("description").map(str::to_string),
            tags: split_list(record.meta_str("tags")),
            full_state: record.meta_str("full_state").map(str::to_string),
            ..base
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::testing::*;

    fn sample_save(name: &str) -> CheckpointSave {
        CheckpointSave {
            session_id: "s1".into(),
            name: name.into(),
            summary: format!("summary of {name}"),
            description: Some("worked on the parser".into()),
            project_path: "/home/dev/api".into(),
            tags: vec!["wip".into()],
            token_count: 1200,
            full_state: Some("full conversation state".into()),
        }
    }

    #[tokio::test]
    async fn test_save_resume_levels() {
        let t = service_context();
        let service = CheckpointService::new(t.ctx.clone());
        let tenant_id = tenant("acme", None, Some("api"));

        let saved = service.save(&tenant_id, sample_save("cp-1")).await.unwrap();
        let id = Uuid::parse_str(&saved.id).unwrap();

        let summary = service
            .resume(&tenant_id, id, ResumeLevel::Summary)
            .await
            .unwrap();
        assert_eq!(summary.summary, "summary of cp-1");
        assert!(summary.description.is_none());
        assert!(summary.full_state.is_none());

        let standard = service
            .resume(&tenant_id, id, ResumeLevel::Standard)
            .await
            .unwrap();
        assert_eq!(standard.description.as_deref(), Some("worked on the parser"));
        assert_eq!(standard.tags, vec!["wip".to_string()]);
        assert!(standard.full_state.is_none());

        let full = service.resume(&tenant_id, id, ResumeLevel::Full).await.unwrap();
        assert_eq!(full.full_state.as_deref(), Some("full conversation state"));
        assert_eq!(full.token_count, 1200);
    }

    #[tokio::test]
    async fn test_save_resume_full_round_trips_fields() {
        let t = service_context();
        let service = CheckpointService::new(t.ctx.clone());
        let tenant_id = tenant("acme", None, Some("api"));

        let input = sample_save("round-trip");
        let saved = service.save(&tenant_id, input.clone()).await.unwrap();
        let id = Uuid::parse_str(&saved.id).unwrap();
        let resumed = service.resume(&tenant_id, id, ResumeLevel::Full).await.unwrap();

        assert_eq!(resumed.session_id, input.session_id);
        assert_eq!(resumed.name, input.name);
        assert_eq!(resumed.summary, input.summary);
        assert_eq!(resumed.description, input.description);
        assert_eq!(resumed.project_path, input.project_path);
        assert_eq!(resumed.tags, input.tags);
        assert_eq!(resumed.token_count, input.token_count);
        assert_eq!(resumed.full_state, input.full_state);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_pagination() {
        let t = service_context();
        let service = CheckpointService::new(t.ctx.clone());
        let tenant_id = tenant("acme", None, Some("api"));

        for i in 0..5 {
            service.save(&tenant_id, sample_save(&format!("cp-{i}"))).await.unwrap();
            // Distinct created_at values for a deterministic order.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let first_page = service.list(&tenant_id, 2, 0).await.unwrap();
        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[0].name, "cp-4");
        assert_eq!(first_page[1].name, "cp-3");

        let second_page = service.list(&tenant_id, 2, 2).await.unwrap();
        assert_eq!(second_page[0].name, "cp-2");
    }

    #[tokio::test]
    async fn test_tenant_isolation_on_resume() {
        let t = service_context();
        let service = CheckpointService::new(t.ctx.clone());

        let t1 = tenant("t1", None, None);
        let saved = service.save(&t1, sample_save("t1-cp")).await.unwrap();
        let id = Uuid::parse_str(&saved.id).unwrap();

        let t2 = tenant("t2", None, None);
        let err = service
            .resume(&t2, id, ResumeLevel::Summary)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let hits = service.search(&t2, "summary of t1-cp", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_soft_and_hides_from_reads() {
        let t = service_context();
        let service = CheckpointService::new(t.ctx.clone());
        let tenant_id = tenant("acme", None, Some("api"));

        let saved = service.save(&tenant_id, sample_save("gone")).await.unwrap();
        let id = Uuid::parse_str(&saved.id).unwrap();
        service.delete(&tenant_id, id).await.unwrap();

        // Hidden from every read path...
        let err = service
            .resume(&tenant_id, id, ResumeLevel::Summary)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(service.list(&tenant_id, 10, 0).await.unwrap().is_empty());
        assert!(service
            .search(&tenant_id, "summary of gone", 5)
            .await
            .unwrap()
            .is_empty());

        // ...but the tombstone record itself is retained.
        let collection = t
            .ctx
            .write_ref(&tenant_id, contextd_types::CollectionType::Checkpoints)
            .unwrap();
        let raw = t.ctx.store.get(&collection, id).await.unwrap();
        assert_eq!(raw.meta_bool("deleted"), Some(true));

        // Deleting again reads as absent.
        let err = service.delete(&tenant_id, id).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
