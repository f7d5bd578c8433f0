// crates/contextd-server/src/knowledge/memory.rs
// Memory service - reusable reasoning traces with confidence and usage

use super::{join_list, split_list, ServiceContext};
use crate::error::{ContextdError, Result};
use crate::store::{Metadata, MetadataValue, Record};
use contextd_types::{CollectionType, Memory, MemoryState, TenantId};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Initial confidence for a fresh memory.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Confidence step applied by feedback.
pub const FEEDBACK_DELTA: f64 = 0.1;

/// Feedback event ids kept per record for idempotence.
const MAX_FEEDBACK_EVENTS: usize = 64;

/// Whether archived memories appear in search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemorySearchPolicy {
    #[default]
    ExcludeArchived,
    IncludeArchived,
}

/// One memory search result. `score` is the raw semantic similarity; the
/// ordering additionally weighs confidence and usage.
#[derive(Debug, Clone)]
pub struct MemorySearchHit {
    pub memory: Memory,
    pub score: f32,
    pub stale_warning: bool,
}

pub struct MemoryService {
    ctx: Arc<ServiceContext>,
}

impl MemoryService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Record a new memory at the tenant's most specific scope.
    pub async fn record(
        &self,
        tenant: &TenantId,
        summary: &str,
        description: Option<&str>,
        tags: &[String],
    ) -> Result<Memory> {
        if summary.trim().is_empty() {
            return Err(ContextdError::InvalidArgument("empty memory summary".into()));
        }
        self.ctx.register_tenancy(tenant)?;

        let summary = self.ctx.scrubber.scrub_text(summary);
        let description = description.map(|d| self.ctx.scrubber.scrub_text(d));

        let vector = self.ctx.embedder.embed(&summary).await?;
        let mut metadata = Metadata::new();
        if let Some(description) = &description {
            metadata.insert("description".into(), description.as_str().into());
        }
        metadata.insert("tags".into(), join_list(tags).into());
        metadata.insert("confidence".into(), DEFAULT_CONFIDENCE.into());
        metadata.insert("usage_count".into(), 0i64.into());
        metadata.insert("state".into(), MemoryState::Active.as_str().into());

        let record = Record::new(vector, summary, metadata);
        let collection = self.ctx.write_ref(tenant, CollectionType::Memories)?;
        let ids = self.ctx.store.upsert(&collection, vec![record.clone()]).await?;
        debug!(id = %ids[0], "recorded memory");

        record_to_memory(&record)
    }

    /// Hierarchical search, re-ranked by `score × f(confidence, usage)`.
    pub async fn search(
        &self,
        tenant: &TenantId,
        query: &str,
        k: usize,
        min_score: Option<f32>,
        policy: MemorySearchPolicy,
    ) -> Result<Vec<MemorySearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.ctx.embedder.embed(query).await?;
        let hits = self
            .ctx
            .scoped_search(tenant, CollectionType::Memories, &vector, k, None)
            .await?;

        let mut ranked: Vec<(f64, MemorySearchHit)> = Vec::with_capacity(hits.len());
        for hit in hits {
            let memory = match record_to_memory(&hit.record) {
                Ok(m) => m,
                Err(e) => {
                    debug!(id = %hit.record.id, error = %e, "skipping malformed memory record");
                    continue;
                }
            };
            if policy == MemorySearchPolicy::ExcludeArchived
                && memory.state == MemoryState::Archived
            {
                continue;
            }
            if let Some(min) = min_score {
                if hit.score < min {
                    continue;
                }
            }
            let combined = hit.score as f64 * rank_factor(memory.confidence, memory.usage_count);
            ranked.push((
                combined,
                MemorySearchHit {
                    memory,
                    score: hit.score,
                    stale_warning: hit.stale_warning,
                },
            ));
        }

        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.memory.updated_at.cmp(&a.1.memory.updated_at))
                .then_with(|| a.1.memory.id.cmp(&b.1.memory.id))
        });
        ranked.truncate(k);
        Ok(ranked.into_iter().map(|(_, hit)| hit).collect())
    }

    /// Apply feedback. Idempotent per `(id, event_id)`: replaying an event
    /// changes nothing, across restarts too (event ids ride in metadata).
    pub async fn feedback(
        &self,
        tenant: &TenantId,
        id: Uuid,
        helpful: bool,
        event_id: &str,
    ) -> Result<Memory> {
        if event_id.trim().is_empty() {
            return Err(ContextdError::InvalidArgument("empty feedback event id".into()));
        }
        let (collection, record) = self
            .ctx
            .scoped_get(tenant, CollectionType::Memories, id)
            .await?;

        let mut events = split_list(record.meta_str("feedback_events"));
        if events.iter().any(|e| e == event_id) {
            return record_to_memory(&record);
        }

        let confidence = record.meta_f64("confidence").unwrap_or(DEFAULT_CONFIDENCE);
        let confidence = if helpful {
            (confidence + FEEDBACK_DELTA).min(1.0)
        } else {
            (confidence - FEEDBACK_DELTA).max(0.0)
        };
        let usage_count = record.meta_i64("usage_count").unwrap_or(0) + 1;

        events.push(event_id.to_string());
        if events.len() > MAX_FEEDBACK_EVENTS {
            let excess = events.len() - MAX_FEEDBACK_EVENTS;
            events.drain(..excess);
        }

        let mut patch = Metadata::new();
        patch.insert("confidence".into(), confidence.into());
        patch.insert("usage_count".into(), usage_count.into());
        patch.insert("feedback_events".into(), join_list(&events).into());
        self.ctx.store.update(&collection, id, patch).await?;

        let updated = self.ctx.store.get(&collection, id).await?;
        record_to_memory(&updated)
    }

    pub async fn get(&self, tenant: &TenantId, id: Uuid) -> Result<Memory> {
        let (_, record) = self
            .ctx
            .scoped_get(tenant, CollectionType::Memories, id)
            .await?;
        record_to_memory(&record)
    }

    /// Newest first at the tenant's own scope.
    pub async fn list(&self, tenant: &TenantId, limit: usize, offset: usize) -> Result<Vec<Memory>> {
        let collection = self.ctx.write_ref(tenant, CollectionType::Memories)?;
        let records = self.ctx.store.list(&collection, limit, offset, None).await?;
        records.iter().map(record_to_memory).collect()
    }
}

/// Monotonically non-decreasing in both confidence and usage.
pub fn rank_factor(confidence: f64, usage_count: u64) -> f64 {
    (0.5 + confidence / 2.0) * (1.0 + (1.0 + usage_count as f64).ln())
}

/// Decode a stored record into the memory DTO.
pub fn record_to_memory(record: &Record) -> Result<Memory> {
    let state = record
        .meta_str("state")
        .map(MemoryState::from_str)
        .transpose()
        .map_err(ContextdError::Other)?
        .unwrap_or(MemoryState::Active);

    Ok(Memory {
        id: record.id.to_string(),
        summary: record.content.clone(),
        description: record.meta_str("description").map(str::to_string),
        tags: split_list(record.meta_str("tags")),
        confidence: record.meta_f64("confidence").unwrap_or(DEFAULT_CONFIDENCE),
        usage_count: record.meta_i64("usage_count").unwrap_or(0).max(0) as u64,
        state,
        consolidation_id: record.meta_str("consolidation_id").map(str::to_string),
        source_ids: split_list(record.meta_str("source_ids")),
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}

/// Metadata patch that archives a source memory under a consolidation.
pub fn archive_patch(consolidation_id: Uuid) -> Metadata {
    let mut patch = Metadata::new();
    patch.insert(
        "state".into(),
        MetadataValue::from(MemoryState::Archived.as_str()),
    );
    patch.insert(
        "consolidation_id".into(),
        consolidation_id.to_string().into(),
    );
    patch
}
