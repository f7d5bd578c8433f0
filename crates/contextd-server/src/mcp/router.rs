// crates/contextd-server/src/mcp/router.rs
// MCP tool router - #[tool] annotated methods

use super::requests::*;
use super::responses;
use super::ContextdServer;
use crate::consolidate::ConsolidationOptions;
use crate::error::{ContextdError, Result};
use crate::knowledge::checkpoint::CheckpointSave;
use crate::knowledge::memory::MemorySearchPolicy;
use contextd_types::ResumeLevel;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content};
use rmcp::{tool, tool_router, ErrorData};
use serde::Serialize;
use uuid::Uuid;

/// Serialise a response, scrub it, and wrap it for the wire. Domain errors
/// become structured tool errors carrying their stable kind.
fn tool_result<T: Serialize>(
    server: &ContextdServer,
    result: Result<T>,
) -> std::result::Result<CallToolResult, ErrorData> {
    match result {
        Ok(value) => {
            let json = serde_json::to_string_pretty(&value)
                .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
            let scrubbed = server.scrubber.scrub_text(&json);
            Ok(CallToolResult::success(vec![Content::text(scrubbed)]))
        }
        Err(e) => {
            let body = serde_json::json!({
                "kind": e.kind(),
                "message": e.to_string(),
            });
            Ok(CallToolResult::error(vec![Content::text(body.to_string())]))
        }
    }
}

fn parse_k(k: Option<i64>, default: usize) -> Result<usize> {
    match k {
        None => Ok(default),
        Some(k) if k < 0 => Err(ContextdError::InvalidArgument(format!(
            "k must be non-negative, got {k}"
        ))),
        Some(k) => Ok(k as usize),
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| ContextdError::InvalidArgument(format!("malformed id: {raw}")))
}

fn parse_level(raw: Option<&str>) -> Result<ResumeLevel> {
    match raw.unwrap_or("standard") {
        "summary" => Ok(ResumeLevel::Summary),
        "standard" => Ok(ResumeLevel::Standard),
        "full" => Ok(ResumeLevel::Full),
        other => Err(ContextdError::InvalidArgument(format!(
            "level must be summary, standard, or full, got {other}"
        ))),
    }
}

#[tool_router]
impl ContextdServer {
    #[tool(
        description = "Search stored memories by semantic similarity, re-ranked by confidence and usage. Archived memories are excluded."
    )]
    async fn memory_search(
        &self,
        Parameters(req): Parameters<MemorySearchRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let k = parse_k(req.k, 5)?;
            let policy = if req.include_archived.unwrap_or(false) {
                MemorySearchPolicy::IncludeArchived
            } else {
                MemorySearchPolicy::ExcludeArchived
            };
            let hits = self
                .memory
                .search(&tenant, &req.query, k, req.min_score, policy)
                .await?;
            Ok(responses::MemorySearchResponse {
                results: hits
                    .into_iter()
                    .map(|h| responses::MemoryHit {
                        memory: h.memory,
                        score: h.score,
                        stale_warning: h.stale_warning,
                    })
                    .collect(),
            })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(description = "Store a reusable reasoning trace as a memory.")]
    async fn memory_record(
        &self,
        Parameters(req): Parameters<MemoryRecordRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let memory = self
                .memory
                .record(
                    &tenant,
                    &req.summary,
                    req.description.as_deref(),
                    &req.tags.unwrap_or_default(),
                )
                .await?;
            Ok(responses::MemoryRecordResponse { memory })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(
        description = "Report whether a recalled memory helped. Idempotent per event_id; positive feedback raises confidence, negative lowers it."
    )]
    async fn memory_feedback(
        &self,
        Parameters(req): Parameters<MemoryFeedbackRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let id = parse_id(&req.id)?;
            let memory = self
                .memory
                .feedback(&tenant, id, req.helpful, &req.event_id)
                .await?;
            Ok(responses::MemoryFeedbackResponse { memory })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(
        description = "Cluster near-duplicate memories and fuse each cluster into one consolidated memory, archiving the sources with back-links."
    )]
    async fn memory_consolidate(
        &self,
        Parameters(req): Parameters<MemoryConsolidateRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let mut options = ConsolidationOptions::default();
            if let Some(threshold) = req.similarity_threshold {
                options.similarity_threshold = threshold;
            }
            if let Some(max_clusters) = req.max_clusters {
                options.max_clusters = max_clusters;
            }
            options.dry_run = req.dry_run.unwrap_or(false);
            options.force_all = req.force_all.unwrap_or(false);

            let report = self.consolidator.run(&tenant, options).await?;
            Ok(responses::ConsolidateResponse { report })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(description = "Save a named snapshot of the current session.")]
    async fn checkpoint_save(
        &self,
        Parameters(req): Parameters<CheckpointSaveRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let checkpoint = self
                .checkpoint
                .save(
                    &tenant,
                    CheckpointSave {
                        session_id: req.session_id,
                        name: req.name,
                        summary: req.summary,
                        description: req.description,
                        project_path: req.project_path,
                        tags: req.tags.unwrap_or_default(),
                        token_count: req.token_count.unwrap_or(0),
                        full_state: req.full_state,
                    },
                )
                .await?;
            Ok(responses::CheckpointSaveResponse { checkpoint })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(description = "List checkpoints, newest first.")]
    async fn checkpoint_list(
        &self,
        Parameters(req): Parameters<CheckpointListRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let limit = parse_k(req.limit, 20)?;
            let offset = parse_k(req.offset, 0)?;
            let checkpoints = self.checkpoint.list(&tenant, limit, offset).await?;
            Ok(responses::CheckpointListResponse { checkpoints })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(
        description = "Resume a checkpoint at a detail level: summary, standard (summary + description + tags), or full (everything)."
    )]
    async fn checkpoint_resume(
        &self,
        Parameters(req): Parameters<CheckpointResumeRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let id = parse_id(&req.id)?;
            let level = parse_level(req.level.as_deref())?;
            let checkpoint = self.checkpoint.resume(&tenant, id, level).await?;
            Ok(responses::CheckpointResumeResponse { checkpoint })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(description = "Search checkpoint summaries by semantic similarity.")]
    async fn checkpoint_search(
        &self,
        Parameters(req): Parameters<CheckpointSearchRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let k = parse_k(req.k, 5)?;
            let hits = self.checkpoint.search(&tenant, &req.query, k).await?;
            Ok(responses::CheckpointSearchResponse {
                results: hits
                    .into_iter()
                    .map(|h| responses::CheckpointHit {
                        checkpoint: h.checkpoint,
                        score: h.score,
                        stale_warning: h.stale_warning,
                    })
                    .collect(),
            })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(description = "Record an error-to-fix pattern for later retrieval.")]
    async fn remediation_record(
        &self,
        Parameters(req): Parameters<RemediationRecordRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let remediation = self
                .remediation
                .record(
                    &tenant,
                    &req.error_message,
                    &req.solution,
                    req.context.as_deref(),
                )
                .await?;
            Ok(responses::RemediationRecordResponse { remediation })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(
        description = "Find known fixes for an error using hybrid semantic + signature matching."
    )]
    async fn remediation_search(
        &self,
        Parameters(req): Parameters<RemediationSearchRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let k = parse_k(req.k, 5)?;
            let hits = self
                .remediation
                .search(&tenant, &req.error_message, k, req.min_score)
                .await?;
            Ok(responses::RemediationSearchResponse {
                results: hits
                    .into_iter()
                    .map(|h| responses::RemediationHit {
                        remediation: h.remediation,
                        score: h.score,
                        stale_warning: h.stale_warning,
                    })
                    .collect(),
            })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(description = "Diagnose an error against the known remediation base.")]
    async fn troubleshoot_diagnose(
        &self,
        Parameters(req): Parameters<TroubleshootDiagnoseRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let combined = match req.context.as_deref() {
                Some(context) => format!("{}\n{}", req.error_message, context),
                None => req.error_message.clone(),
            };
            let diagnosis = self.remediation.diagnose(&tenant, &combined).await?;
            Ok(responses::DiagnoseResponse { diagnosis })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(
        description = "Index a project tree for semantic code search. Full replace: prior chunks for the project are dropped first."
    )]
    async fn repository_index(
        &self,
        Parameters(req): Parameters<RepositoryIndexRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let mut config = self.indexer_config.clone();
            if let Some(include) = req.include_patterns {
                config.include = include;
            }
            if let Some(exclude) = req.exclude_patterns {
                config.exclude = exclude;
            }
            if let Some(max) = req.max_file_size {
                config.max_file_size = max;
            }
            let report = self
                .indexer
                .index(&tenant, std::path::Path::new(&req.path), &config)
                .await?;
            Ok(responses::RepositoryIndexResponse { report })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(
        description = "Search indexed code semantically; falls back to a deterministic grep over the tree when similarity is low."
    )]
    async fn repository_search(
        &self,
        Parameters(req): Parameters<RepositorySearchRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result = async {
            let tenant = self.resolve_tenancy(&req.tenancy)?;
            let k = parse_k(req.k, 5)?;
            let results = self
                .searcher
                .search(
                    &tenant,
                    std::path::Path::new(&req.path),
                    &req.query,
                    k,
                    req.min_similarity,
                )
                .await?;
            Ok(responses::RepositorySearchResponse { results })
        }
        .await;
        tool_result(self, result)
    }

    #[tool(
        description = "Daemon health: remote backend state, fallback mode, pending WAL depth, last sync outcome."
    )]
    async fn status(
        &self,
        Parameters(_req): Parameters<StatusRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let report = self.fallback.status_report();
        tool_result(self, Ok(responses::StatusResponse { status: report }))
    }
}

impl ContextdServer {
    /// Expose the macro-generated tool_router() to the parent module.
    pub(super) fn create_tool_router() -> ToolRouter<Self> {
        Self::tool_router()
    }

    /// All tool names, for CLI parity checks.
    pub fn list_tool_names(&self) -> Vec<String> {
        Self::tool_router()
            .list_all()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect()
    }
}
