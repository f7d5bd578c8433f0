// crates/contextd-server/src/consolidate/mod.rs
// Memory consolidation - cluster near-duplicate memories and fuse them

mod prompt;

use crate::error::{ContextdError, Result};
use crate::knowledge::memory::archive_patch;
use crate::knowledge::ServiceContext;
use crate::llm::LlmClient;
use crate::store::{cosine_similarity, Metadata, MetadataFilter, Record};
use contextd_types::{CollectionType, ConsolidationReport, MemoryState, TenantId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
#[cfg(test)]
use uuid::Uuid;

/// Pairwise cosine similarity required for cluster membership.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// How many candidate memories one run will load.
const MAX_CANDIDATES: usize = 5_000;

#[derive(Debug, Clone)]
pub struct ConsolidationOptions {
    pub similarity_threshold: f64,
    /// 0 means unlimited.
    pub max_clusters: usize,
    pub dry_run: bool,
    pub force_all: bool,
}

impl Default for ConsolidationOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            max_clusters: 0,
            dry_run: false,
            force_all: false,
        }
    }
}

/// Structured merge result expected from the language model.
#[derive(Debug, Deserialize)]
struct MergedMemory {
    summary: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// Clusters active memories by greedy cosine neighbourhood and fuses each
/// cluster through the LLM, archiving the sources with back-links.
pub struct Consolidator {
    ctx: Arc<ServiceContext>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Consolidator {
    pub fn new(ctx: Arc<ServiceContext>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { ctx, llm }
    }

    pub async fn run(
        &self,
        tenant: &TenantId,
        options: ConsolidationOptions,
    ) -> Result<ConsolidationReport> {
        if !(0.0..=1.0).contains(&options.similarity_threshold) {
            return Err(ContextdError::InvalidArgument(
                "similarity_threshold must be in [0, 1]".into(),
            ));
        }
        let llm = match (&self.llm, options.dry_run) {
            (Some(llm), _) => Some(llm.clone()),
            // Dry runs stop before the merge step, so no client is needed.
            (None, true) => None,
            (None, false) => {
                return Err(ContextdError::LlmUnavailable(
                    "consolidation requires a configured LLM provider".into(),
                ))
            }
        };

        let collection = self.ctx.write_ref(tenant, CollectionType::Memories)?;
        let mut active_filter = MetadataFilter::new();
        active_filter.insert("state".into(), MemoryState::Active.as_str().into());
        let candidates = self
            .ctx
            .store
            .list(&collection, MAX_CANDIDATES, 0, Some(active_filter))
            .await?;
        debug!(candidates = candidates.len(), "consolidation candidates loaded");

        let clusters = cluster_by_similarity(
            candidates,
            options.similarity_threshold as f32,
            options.max_clusters,
        );

        let mut report = ConsolidationReport {
            clusters_found: clusters.len(),
            total: clusters.len(),
            dry_run: options.dry_run,
            ..Default::default()
        };

        if options.dry_run {
            report.would_create = Some(clusters.len());
            report.would_archive = Some(clusters.iter().map(Vec::len).sum());
            return Ok(report);
        }
        let llm = llm.unwrap_or_else(|| unreachable!("checked above"));

        for cluster in clusters {
            match self.merge_cluster(&collection, &cluster, llm.as_ref()).await {
                Ok(archived) => {
                    report.created += 1;
                    report.archived += archived;
                }
                Err(e) if is_run_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(error = %e, size = cluster.len(), "cluster skipped");
                    report.skipped += 1;
                }
            }
        }

        info!(
            clusters = report.clusters_found,
            created = report.created,
            archived = report.archived,
            skipped = report.skipped,
            "consolidation run complete"
        );
        Ok(report)
    }

    /// Fuse one cluster. Returns the number of archived sources. Archival
    /// happens only after the consolidated memory is persisted, so a failure
    /// can never orphan a source.
    async fn merge_cluster(
        &self,
        collection: &crate::store::CollectionRef,
        cluster: &[Record],
        llm: &dyn LlmClient,
    ) -> Result<usize> {
        let prompt = prompt::merge_prompt(cluster);
        let response = llm.complete(&prompt).await?;
        let merged = parse_merge_response(&response)?;

        let confidence = weighted_confidence(cluster);
        let source_ids: Vec<String> = cluster.iter().map(|r| r.id.to_string()).collect();
        let description = format!(
            "{}\n\nSynthesized from {} memories",
            merged.description.trim(),
            cluster.len()
        );

        let vector = self.ctx.embedder.embed(&merged.summary).await?;
        let mut metadata = Metadata::new();
        metadata.insert("description".into(), description.trim().into());
        metadata.insert("tags".into(), merged.tags.join(",").into());
        metadata.insert("confidence".into(), confidence.into());
        metadata.insert("usage_count".into(), 0i64.into());
        metadata.insert(
            "state".into(),
            MemoryState::Consolidated.as_str().into(),
        );
        metadata.insert("source_ids".into(), source_ids.join(",").into());

        let consolidated = Record::new(vector, merged.summary, metadata);
        let consolidated_id = consolidated.id;
        self.ctx
            .store
            .upsert(collection, vec![consolidated])
            .await?;

        let mut archived = 0;
        for source in cluster {
            self.ctx
                .store
                .update(collection, source.id, archive_patch(consolidated_id))
                .await?;
            archived += 1;
        }
        debug!(id = %consolidated_id, archived, "cluster consolidated");
        Ok(archived)
    }
}

/// A whole run aborts only when the LLM itself is unreachable; a cluster
/// whose response cannot be parsed is merely skipped.
fn is_run_fatal(e: &ContextdError) -> bool {
    matches!(
        e,
        ContextdError::LlmUnavailable(_)
            | ContextdError::Unauthenticated(_)
            | ContextdError::DeadlineExceeded(_)
    )
}

/// Usage-weighted mean of the sources' confidences.
fn weighted_confidence(cluster: &[Record]) -> f64 {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for record in cluster {
        let confidence = record.meta_f64("confidence").unwrap_or(0.5);
        let usage = record.meta_i64("usage_count").unwrap_or(0).max(0) as f64;
        numerator += confidence * (1.0 + usage);
        denominator += 1.0 + usage;
    }
    if denominator == 0.0 {
        0.5
    } else {
        (numerator / denominator).clamp(0.0, 1.0)
    }
}

/// Greedy neighbourhood clustering. Seeds iterate in `created_at` order so
/// the earlier memory wins contested membership. Clusters of one are not
/// clusters. `max_clusters` of 0 means unlimited.
fn cluster_by_similarity(
    mut candidates: Vec<Record>,
    threshold: f32,
    max_clusters: usize,
) -> Vec<Vec<Record>> {
    candidates.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut processed = vec![false; candidates.len()];
    let mut clusters = Vec::new();

    for seed_idx in 0..candidates.len() {
        if processed[seed_idx] {
            continue;
        }
        if max_clusters > 0 && clusters.len() >= max_clusters {
            break;
        }

        let mut member_indices = vec![seed_idx];
        for other_idx in (seed_idx + 1)..candidates.len() {
            if processed[other_idx] {
                continue;
            }
            let similarity = cosine_similarity(
                &candidates[seed_idx].vector,
                &candidates[other_idx].vector,
            );
            // Exactly at the threshold counts as in.
            if similarity >= threshold {
                member_indices.push(other_idx);
            }
        }

        if member_indices.len() < 2 {
            continue;
        }
        for &idx in &member_indices {
            processed[idx] = true;
        }
        clusters.push(
            member_indices
                .into_iter()
                .map(|idx| candidates[idx].clone())
                .collect(),
        );
    }
    clusters
}

/// Parse the model's merge response: JSON, possibly inside a code fence.
/// Empty summaries are a parse failure; the cluster stays untouched.
fn parse_merge_response(response: &str) -> Result<MergedMemory> {
    let trimmed = response.trim();
    let body = strip_code_fence(trimmed);

    let merged: MergedMemory = serde_json::from_str(body)
        .map_err(|e| ContextdError::LlmParseError(format!("merge response: {e}")))?;
    if merged.summary.trim().is_empty() {
        return Err(ContextdError::LlmParseError("empty merged summary".into()));
    }
    Ok(merged)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. "json") up to the first newline.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::memory::{record_to_memory, MemoryService, MemorySearchPolicy};
    use crate::knowledge::testing::*;

    fn merged_json() -> String {
        serde_json::json!({
            "summary": "Always cancel long-running RPCs via context",
            "description": "Several memories agreed on context cancellation.",
            "tags": ["go", "net"]
        })
        .to_string()
    }

    async fn seed_similar_memories(
        t: &TestContext,
        service: &MemoryService,
        tenant_id: &contextd_types::TenantId,
    ) -> Vec<String> {
        let close = [
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.99, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.98, 0.15, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let summaries = [
            "cancel RPCs with context",
            "long RPCs need context cancellation",
            "use ctx cancellation on slow RPCs",
        ];
        let mut ids = Vec::new();
        for (summary, vector) in summaries.iter().zip(close.iter()) {
            t.embedder.set(summary, vector.clone());
            let memory = service.record(tenant_id, summary, None, &[]).await.unwrap();
            ids.push(memory.id);
        }
        ids
    }

    #[tokio::test]
    async fn test_three_similar_memories_consolidate() {
        let t = service_context();
        let service = MemoryService::new(t.ctx.clone());
        let tenant_id = tenant("acme", None, Some("api"));
        let source_ids = seed_similar_memories(&t, &service, &tenant_id).await;

        let llm = Arc::new(StubLlm::with_responses(vec![Ok(merged_json())]));
        let consolidator = Consolidator::new(t.ctx.clone(), Some(llm));

        let report = consolidator
            .run(
                &tenant_id,
                ConsolidationOptions {
                    similarity_threshold: 0.8,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.clusters_found, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.archived, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.total, 1);

        // Default search returns the consolidated memory and no sources.
        t.embedder.set("rpc cancellation", vec![1.0, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let hits = service
            .search(&tenant_id, "rpc cancellation", 10, None, MemorySearchPolicy::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.state, MemoryState::Consolidated);
        assert!(hits[0]
            .memory
            .description
            .as_deref()
            .unwrap_or_default()
            .contains("Synthesized from 3 memories"));
        assert_eq!(hits[0].memory.source_ids.len(), 3);

        // Each source is archived with a back-link.
        for id in source_ids {
            let source = service
                .get(&tenant_id, Uuid::parse_str(&id).unwrap())
                .await
                .unwrap();
            assert_eq!(source.state, MemoryState::Archived);
            assert_eq!(
                source.consolidation_id.as_deref(),
                Some(hits[0].memory.id.as_str())
            );
        }
    }

    #[tokio::test]
    async fn test_weighted_confidence_formula() {
        let mk = |confidence: f64, usage: i64| {
            let mut metadata = Metadata::new();
            metadata.insert("confidence".into(), confidence.into());
            metadata.insert("usage_count".into(), usage.into());
            Record::new(vec![1.0], "m".into(), metadata)
        };
        // (0.8*3 + 0.4*1) / (3 + 1) = 0.7
        let cluster = vec![mk(0.8, 2), mk(0.4, 0)];
        assert!((weighted_confidence(&cluster) - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let t = service_context();
        let service = MemoryService::new(t.ctx.clone());
        let tenant_id = tenant("acme", None, Some("api"));
        seed_similar_memories(&t, &service, &tenant_id).await;

        // No LLM configured: dry run still works.
        let consolidator = Consolidator::new(t.ctx.clone(), None);
        let report = consolidator
            .run(
                &tenant_id,
                ConsolidationOptions {
                    similarity_threshold: 0.8,
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.clusters_found, 1);
        assert_eq!(report.would_create, Some(1));
        assert_eq!(report.would_archive, Some(3));
        assert_eq!(report.created, 0);

        let memories = service.list(&tenant_id, 10, 0).await.unwrap();
        assert_eq!(memories.len(), 3);
        assert!(memories.iter().all(|m| m.state == MemoryState::Active));
    }

    #[tokio::test]
    async fn test_unparseable_merge_skips_cluster_without_archiving() {
        let t = service_context();
        let service = MemoryService::new(t.ctx.clone());
        let tenant_id = tenant("acme", None, Some("api"));
        seed_similar_memories(&t, &service, &tenant_id).await;

        let llm = Arc::new(StubLlm::with_responses(vec![Ok("not json at all".into())]));
        let consolidator = Consolidator::new(t.ctx.clone(), Some(llm));
        let report = consolidator
            .run(
                &tenant_id,
                ConsolidationOptions {
                    similarity_threshold: 0.8,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.clusters_found, 1);
        assert_eq!(report.created, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.archived, 0);

        let memories = service.list(&tenant_id, 10, 0).await.unwrap();
        assert!(memories.iter().all(|m| m.state == MemoryState::Active));
    }

    #[tokio::test]
    async fn test_unavailable_llm_fails_run() {
        let t = service_context();
        let service = MemoryService::new(t.ctx.clone());
        let tenant_id = tenant("acme", None, Some("api"));
        seed_similar_memories(&t, &service, &tenant_id).await;

        let llm = Arc::new(StubLlm::with_responses(vec![Err(
            ContextdError::LlmUnavailable("down".into()),
        )]));
        let consolidator = Consolidator::new(t.ctx.clone(), Some(llm));
        let err = consolidator
            .run(
                &tenant_id,
                ConsolidationOptions {
                    similarity_threshold: 0.8,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "llm_unavailable");
    }

    #[tokio::test]
    async fn test_no_llm_configured_fails_fast() {
        let t = service_context();
        let tenant_id = tenant("acme", None, Some("api"));
        let consolidator = Consolidator::new(t.ctx.clone(), None);
        let err = consolidator
            .run(&tenant_id, ConsolidationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "llm_unavailable");
    }

    #[test]
    fn test_clustering_threshold_boundary() {
        let mk = |vector: Vec<f32>, secs: i64| {
            let mut record = Record::new(vector, "m".into(), Metadata::new());
            record.created_at = chrono::DateTime::from_timestamp(1_700_000_000 + secs, 0)
                .expect("timestamp")
                .with_timezone(&chrono::Utc);
            record
        };
        // Identical vectors sit exactly at a threshold of 1.0: included.
        let clusters = cluster_by_similarity(
            vec![mk(vec![1.0, 0.0], 0), mk(vec![1.0, 0.0], 1)],
            1.0,
            0,
        );
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);

        // cos(a, b) = 0.8: in at a threshold just below, out just above.
        let a = mk(vec![1.0, 0.0], 0);
        let b = mk(vec![0.8, 0.6], 1);
        let clusters = cluster_by_similarity(vec![a.clone(), b.clone()], 0.79, 0);
        assert_eq!(clusters.len(), 1);
        let clusters = cluster_by_similarity(vec![a, b], 0.81, 0);
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_max_clusters_caps_run() {
        let mk = |axis: usize, secs: i64| {
            let mut vector = vec![0.0; 4];
            vector[axis] = 1.0;
            let mut record = Record::new(vector, "m".into(), Metadata::new());
            record.created_at = chrono::DateTime::from_timestamp(1_700_000_000 + secs, 0)
                .expect("timestamp")
                .with_timezone(&chrono::Utc);
            record
        };
        // Two separate pairs.
        let records = vec![mk(0, 0), mk(0, 1), mk(1, 2), mk(1, 3)];
        let clusters = cluster_by_similarity(records.clone(), 0.9, 1);
        assert_eq!(clusters.len(), 1);
        let clusters = cluster_by_similarity(records, 0.9, 0);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_parse_merge_response_variants() {
        let plain = parse_merge_response(&merged_json()).unwrap();
        assert!(!plain.summary.is_empty());

        let fenced = format!("```json\n{}\n```", merged_json());
        let parsed = parse_merge_response(&fenced).unwrap();
        assert_eq!(parsed.tags, vec!["go", "net"]);

        assert!(parse_merge_response("not json").is_err());
        assert!(parse_merge_response(r#"{"summary": ""}"#).is_err());
    }

    #[tokio::test]
    async fn test_consolidated_record_survives_round_trip() {
        let t = service_context();
        let service = MemoryService::new(t.ctx.clone());
        let tenant_id = tenant("acme", None, Some("api"));
        seed_similar_memories(&t, &service, &tenant_id).await;

        let llm = Arc::new(StubLlm::with_responses(vec![Ok(merged_json())]));
        let consolidator = Consolidator::new(t.ctx.clone(), Some(llm));
        consolidator
            .run(
                &tenant_id,
                ConsolidationOptions {
                    similarity_threshold: 0.8,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let collection = t.ctx.write_ref(&tenant_id, CollectionType::Memories).unwrap();
        let all = t.ctx.store.list(&collection, 10, 0, None).await.unwrap();
        let consolidated = all
            .iter()
            .find(|r| r.meta_str("state") == Some("consolidated"))
            .expect("consolidated record");
        let memory = record_to_memory(consolidated).unwrap();
        // Weighted mean of three untouched sources stays at the default.
        assert!((memory.confidence - 0.5).abs() < 1e-9);
        assert_eq!(memory.source_ids.len(), 3);
    }
}
