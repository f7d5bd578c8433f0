// crates/contextd-server/src/mcp/requests.rs
// MCP tool request types

use rmcp::schemars;
use serde::Deserialize;

/// Tenancy fields accepted on every tool call; absent fields fall back to
/// the daemon's environment defaults.
#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct TenancyFields {
    #[schemars(description = "Organization name")]
    pub org: Option<String>,
    #[schemars(description = "Team name")]
    pub team: Option<String>,
    #[schemars(description = "Project name")]
    pub project: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MemorySearchRequest {
    #[schemars(description = "Search query")]
    pub query: String,
    #[schemars(description = "Max results (default 5)")]
    pub k: Option<i64>,
    #[schemars(description = "Minimum semantic score in [0,1]")]
    pub min_score: Option<f32>,
    #[schemars(description = "Include archived memories")]
    pub include_archived: Option<bool>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MemoryRecordRequest {
    #[schemars(description = "One-sentence reasoning trace to remember")]
    pub summary: String,
    #[schemars(description = "Longer details")]
    pub description: Option<String>,
    #[schemars(description = "Tags")]
    pub tags: Option<Vec<String>>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MemoryFeedbackRequest {
    #[schemars(description = "Memory ID")]
    pub id: String,
    #[schemars(description = "Whether the memory helped")]
    pub helpful: bool,
    #[schemars(description = "Caller-supplied idempotency key for this feedback event")]
    pub event_id: String,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MemoryConsolidateRequest {
    #[schemars(description = "Pairwise cosine similarity threshold in [0,1] (default 0.85)")]
    pub similarity_threshold: Option<f64>,
    #[schemars(description = "Max clusters per run, 0 = unlimited")]
    pub max_clusters: Option<usize>,
    #[schemars(description = "Report without writing")]
    pub dry_run: Option<bool>,
    #[schemars(description = "Ignore the incremental window and consider all memories")]
    pub force_all: Option<bool>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckpointSaveRequest {
    #[schemars(description = "Session this checkpoint belongs to")]
    pub session_id: String,
    #[schemars(description = "Checkpoint name")]
    pub name: String,
    #[schemars(description = "Searchable summary")]
    pub summary: String,
    #[schemars(description = "Longer description")]
    pub description: Option<String>,
    #[schemars(description = "Project root path")]
    pub project_path: String,
    #[schemars(description = "Tags")]
    pub tags: Option<Vec<String>>,
    #[schemars(description = "Context size at save time")]
    pub token_count: Option<u64>,
    #[schemars(description = "Opaque full conversation state")]
    pub full_state: Option<String>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckpointListRequest {
    #[schemars(description = "Max results (default 20)")]
    pub limit: Option<i64>,
    #[schemars(description = "Offset for pagination")]
    pub offset: Option<i64>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckpointResumeRequest {
    #[schemars(description = "Checkpoint ID")]
    pub id: String,
    #[schemars(description = "Detail level: summary, standard, or full")]
    pub level: Option<String>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckpointSearchRequest {
    #[schemars(description = "Search query")]
    pub query: String,
    #[schemars(description = "Max results (default 5)")]
    pub k: Option<i64>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RemediationRecordRequest {
    #[schemars(description = "The error message that was fixed")]
    pub error_message: String,
    #[schemars(description = "What fixed it")]
    pub solution: String,
    #[schemars(description = "Extra context about the fix")]
    pub context: Option<String>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RemediationSearchRequest {
    #[schemars(description = "Error message to match")]
    pub error_message: String,
    #[schemars(description = "Max results (default 5)")]
    pub k: Option<i64>,
    #[schemars(description = "Minimum combined score (default 0.6)")]
    pub min_score: Option<f64>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct TroubleshootDiagnoseRequest {
    #[schemars(description = "Error message to diagnose")]
    pub error_message: String,
    #[schemars(description = "Extra context")]
    pub context: Option<String>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RepositoryIndexRequest {
    #[schemars(description = "Absolute path of the project tree")]
    pub path: String,
    #[schemars(description = "Include globs; when set, files must match one")]
    pub include_patterns: Option<Vec<String>>,
    #[schemars(description = "Exclude globs")]
    pub exclude_patterns: Option<Vec<String>>,
    #[schemars(description = "Per-file size gate in bytes (default 1 MiB, capped at 10 MiB)")]
    pub max_file_size: Option<u64>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RepositorySearchRequest {
    #[schemars(description = "Absolute path of the project tree")]
    pub path: String,
    #[schemars(description = "Search query")]
    pub query: String,
    #[schemars(description = "Max results (default 5)")]
    pub k: Option<i64>,
    #[schemars(description = "Semantic floor before the grep fallback (default 0.6)")]
    pub min_similarity: Option<f32>,
    #[serde(flatten)]
    pub tenancy: TenancyFields,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StatusRequest {}
