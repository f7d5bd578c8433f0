// crates/contextd-server/src/indexer/search.rs
// Semantic code search with a deterministic grep fallback

use super::walk_files;
use crate::error::Result;
use crate::knowledge::ServiceContext;
use contextd_types::{CollectionType, TenantId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Similarity floor under which semantic hits do not count.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.6;

/// Shortest query token the grep pass will look for.
const MIN_TOKEN_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Semantic,
    Grep,
}

/// One code search result.
#[derive(Debug, Clone, Serialize)]
pub struct RepoSearchHit {
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub score: f32,
    pub snippet: String,
    pub search_type: SearchType,
    pub stale_warning: bool,
}

pub struct RepositorySearcher {
    ctx: Arc<ServiceContext>,
}

impl RepositorySearcher {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Semantic-first search over the project's indexed chunks. When fewer
    /// than `k` results clear `min_similarity`, a deterministic grep pass
    /// over the tree serves instead.
    pub async fn search(
        &self,
        tenant: &TenantId,
        project_root: &Path,
        query: &str,
        k: usize,
        min_similarity: Option<f32>,
    ) -> Result<Vec<RepoSearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let min_similarity = min_similarity.unwrap_or(DEFAULT_MIN_SIMILARITY);

        let vector = self.ctx.embedder.embed(query).await?;
        let hits = self
            .ctx
            .scoped_search(tenant, CollectionType::Codebase, &vector, k, None)
            .await?;

        let semantic: Vec<RepoSearchHit> = hits
            .into_iter()
            .filter(|hit| hit.score >= min_similarity)
            .map(|hit| RepoSearchHit {
                file_path: hit.record.meta_str("file_path").unwrap_or_default().to_string(),
                line_start: hit.record.meta_i64("line_start").unwrap_or(0).max(0) as u32,
                line_end: hit.record.meta_i64("line_end").unwrap_or(0).max(0) as u32,
                score: hit.score,
                snippet: first_lines(&hit.record.content, 3),
                search_type: SearchType::Semantic,
                stale_warning: hit.stale_warning,
            })
            .collect();

        if semantic.len() >= k {
            return Ok(semantic);
        }
        debug!(
            semantic = semantic.len(),
            k, "semantic results under target, running grep fallback"
        );
        self.grep(project_root, query, k)
    }

    /// Deterministic token grep: lines ranked by how many distinct query
    /// tokens they contain.
    fn grep(&self, project_root: &Path, query: &str, k: usize) -> Result<Vec<RepoSearchHit>> {
        let tokens = query_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches: Vec<(usize, RepoSearchHit)> = Vec::new();
        for path in walk_files(project_root, &[], &[])? {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let relative = path
                .strip_prefix(project_root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();

            for (line_no, line) in content.lines().enumerate() {
                let lower = line.to_lowercase();
                let distinct_hits = tokens.iter().filter(|t| lower.contains(*t)).count();
                if distinct_hits == 0 {
                    continue;
                }
                matches.push((
                    distinct_hits,
                    RepoSearchHit {
                        file_path: relative.clone(),
                        line_start: line_no as u32 + 1,
                        line_end: line_no as u32 + 1,
                        score: distinct_hits as f32 / tokens.len() as f32,
                        snippet: line.trim_end().to_string(),
                        search_type: SearchType::Grep,
                        stale_warning: false,
                    },
                ));
            }
        }

        matches.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.file_path.cmp(&b.1.file_path))
                .then_with(|| a.1.line_start.cmp(&b.1.line_start))
        });
        Ok(matches.into_iter().take(k).map(|(_, hit)| hit).collect())
    }
}

/// Lowercased distinct word tokens of length >= 3, in stable order.
fn query_tokens(query: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(str::to_lowercase)
        .filter(|t| t.len() >= MIN_TOKEN_LEN)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn first_lines(text: &str, n: usize) -> String {
    text.lines().take(n).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{IndexerConfig, RepositoryIndexer};
    use crate::knowledge::testing::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_query_tokens_filter_and_dedupe() {
        assert_eq!(
            query_tokens("fix the DB pool, fix it"),
            vec!["fix".to_string(), "the".to_string(), "pool".to_string()]
        );
        assert!(query_tokens("a b c").is_empty());
    }

    #[tokio::test]
    async fn test_semantic_hit_served_when_similar() {
        let t = service_context();
        let tenant_id = tenant("acme", None, Some("api"));
        let indexer = RepositoryIndexer::new(t.ctx.clone());
        let searcher = RepositorySearcher::new(t.ctx.clone());

        let repo = tempfile::tempdir().unwrap();
        let body = "fn spawn_worker_pool() {\n    // worker pool setup\n}\n";
        write(repo.path(), "src/pool.rs", body);

        // The indexed chunk is scrubbed but unchanged here; pin both the
        // chunk text and the query to the same axis.
        t.embedder.set(body.trim_end_matches('\n'), vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        t.embedder.set("worker pool construction", vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);

        indexer
            .index(&tenant_id, repo.path(), &IndexerConfig::default())
            .await
            .unwrap();

        let hits = searcher
            .search(&tenant_id, repo.path(), "worker pool construction", 1, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].search_type, SearchType::Semantic);
        assert_eq!(hits[0].file_path, "src/pool.rs");
        assert!(hits[0].score >= DEFAULT_MIN_SIMILARITY);
    }

    #[tokio::test]
    async fn test_grep_fallback_when_semantic_misses() {
        let t = service_context();
        let tenant_id = tenant("acme", None, Some("api"));
        let searcher = RepositorySearcher::new(t.ctx.clone());

        // Nothing indexed at all: fallback must still find the text.
        let repo = tempfile::tempdir().unwrap();
        write(
            repo.path(),
            "src/retry.rs",
            "fn retry_with_backoff() {}\nfn unrelated() {}\n",
        );

        let hits = searcher
            .search(&tenant_id, repo.path(), "retry backoff logic", 5, None)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].search_type, SearchType::Grep);
        assert_eq!(hits[0].file_path, "src/retry.rs");
        assert_eq!(hits[0].line_start, 1);
        // Two of three tokens hit that line.
        assert!(hits[0].score > 0.5);
    }

    #[tokio::test]
    async fn test_grep_ranks_by_distinct_token_hits() {
        let t = service_context();
        let tenant_id = tenant("acme", None, Some("api"));
        let searcher = RepositorySearcher::new(t.ctx.clone());

        let repo = tempfile::tempdir().unwrap();
        write(
            repo.path(),
            "notes.txt",
            "connection timeout\nconnection\nconnection pool timeout tuning\n",
        );

        let hits = searcher
            .search(&tenant_id, repo.path(), "connection pool timeout", 3, None)
            .await
            .unwrap();
        assert_eq!(hits[0].line_start, 3);
        assert_eq!(hits[1].line_start, 1);
        assert_eq!(hits[2].line_start, 2);
    }
}
