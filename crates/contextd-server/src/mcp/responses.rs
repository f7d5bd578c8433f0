// crates/contextd-server/src/mcp/responses.rs
// MCP tool response payloads

use crate::indexer::{IndexReport, RepoSearchHit};
use contextd_types::{Checkpoint, ConsolidationReport, Memory, Remediation, StatusReport};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct MemoryHit {
    pub memory: Memory,
    pub score: f32,
    pub stale_warning: bool,
}

#[derive(Debug, Serialize)]
pub struct MemorySearchResponse {
    pub results: Vec<MemoryHit>,
}

#[derive(Debug, Serialize)]
pub struct MemoryRecordResponse {
    pub memory: Memory,
}

#[derive(Debug, Serialize)]
pub struct MemoryFeedbackResponse {
    pub memory: Memory,
}

#[derive(Debug, Serialize)]
pub struct ConsolidateResponse {
    pub report: ConsolidationReport,
}

#[derive(Debug, Serialize)]
pub struct CheckpointSaveResponse {
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Serialize)]
pub struct CheckpointListResponse {
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Serialize)]
pub struct CheckpointResumeResponse {
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Serialize)]
pub struct CheckpointHit {
    pub checkpoint: Checkpoint,
    pub score: f32,
    pub stale_warning: bool,
}

#[derive(Debug, Serialize)]
pub struct CheckpointSearchResponse {
    pub results: Vec<CheckpointHit>,
}

#[derive(Debug, Serialize)]
pub struct RemediationRecordResponse {
    pub remediation: Remediation,
}

#[derive(Debug, Serialize)]
pub struct RemediationHit {
    pub remediation: Remediation,
    pub score: f64,
    pub stale_warning: bool,
}

#[derive(Debug, Serialize)]
pub struct RemediationSearchResponse {
    pub results: Vec<RemediationHit>,
}

#[derive(Debug, Serialize)]
pub struct DiagnoseResponse {
    pub diagnosis: String,
}

#[derive(Debug, Serialize)]
pub struct RepositoryIndexResponse {
    pub report: IndexReport,
}

#[derive(Debug, Serialize)]
pub struct RepositorySearchResponse {
    pub results: Vec<RepoSearchHit>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: StatusReport,
}
