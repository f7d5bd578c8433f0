// crates/contextd-types/src/lib.rs

//! Shared data contracts between the contextd daemon and its clients.
//!
//! This crate provides the core domain model for:
//! - **Tenancy**: the org / team / project hierarchy and record scopes
//! - **Collections**: the closed set of collection types
//! - **Knowledge payloads**: memories, checkpoints, remediations, code chunks
//! - **Reports**: consolidation runs and daemon status
//!
//! Types here cross the MCP wire, so they carry serde and schemars derives
//! and no server-only dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ===================================================
// TENANCY
// ===================================================

/// The three levels of the tenancy hierarchy.
///
/// Every persisted record has exactly one scope; the scope fixes which
/// tenancy fields participate in its storage key and in search fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Org,
    Team,
    Project,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Org => "org",
            Scope::Team => "team",
            Scope::Project => "project",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated tenancy tuple `(org, team?, project?)`.
///
/// `team` and `project` form a strict prefix: a project-scoped id always
/// carries its org, and its team when it lives under one. Construction goes
/// through the tenant router's validation; this struct only models the shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId {
    pub org: String,
    pub team: Option<String>,
    pub project: Option<String>,
}

impl TenantId {
    /// The most specific scope this id can address.
    pub fn scope(&self) -> Scope {
        if self.project.is_some() {
            Scope::Project
        } else if self.team.is_some() {
            Scope::Team
        } else {
            Scope::Org
        }
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.org)?;
        if let Some(team) = &self.team {
            write!(f, "/{}", team)?;
        }
        if let Some(project) = &self.project {
            write!(f, "/{}", project)?;
        }
        Ok(())
    }
}

// ===================================================
// COLLECTIONS
// ===================================================

/// The closed set of collection types. Callers never name a collection
/// freely; new types require a code change here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    Memories,
    Remediations,
    Checkpoints,
    Skills,
    Policies,
    Sessions,
    Codebase,
    Troubleshooting,
    ResearchDocuments,
    Notes,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::Memories => "memories",
            CollectionType::Remediations => "remediations",
            CollectionType::Checkpoints => "checkpoints",
            CollectionType::Skills => "skills",
            CollectionType::Policies => "policies",
            CollectionType::Sessions => "sessions",
            CollectionType::Codebase => "codebase",
            CollectionType::Troubleshooting => "troubleshooting",
            CollectionType::ResearchDocuments => "research_documents",
            CollectionType::Notes => "notes",
        }
    }

    pub fn all() -> &'static [CollectionType] {
        &[
            CollectionType::Memories,
            CollectionType::Remediations,
            CollectionType::Checkpoints,
            CollectionType::Skills,
            CollectionType::Policies,
            CollectionType::Sessions,
            CollectionType::Codebase,
            CollectionType::Troubleshooting,
            CollectionType::ResearchDocuments,
            CollectionType::Notes,
        ]
    }
}

impl std::fmt::Display for CollectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CollectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionType::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown collection type: {}", s))
    }
}

// ===================================================
// KNOWLEDGE PAYLOADS
// ===================================================

/// Lifecycle state of a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MemoryState {
    Active,
    Consolidated,
    Archived,
}

impl MemoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryState::Active => "active",
            MemoryState::Consolidated => "consolidated",
            MemoryState::Archived => "archived",
        }
    }
}

impl std::str::FromStr for MemoryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MemoryState::Active),
            "consolidated" => Ok(MemoryState::Consolidated),
            "archived" => Ok(MemoryState::Archived),
            other => Err(format!("unknown memory state: {}", other)),
        }
    }
}

/// A reusable reasoning trace with a confidence score and usage count.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Memory {
    pub id: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub usage_count: u64,
    pub state: MemoryState,
    /// Back-link from an archived source to the consolidated memory
    /// that absorbed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation_id: Option<String>,
    /// Forward links from a consolidated memory to its sources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named snapshot of a session: summary, description, optional full state.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub project_path: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_state: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// How much of a checkpoint to return on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResumeLevel {
    Summary,
    Standard,
    Full,
}

/// An error-to-fix pattern keyed by a normalised error signature.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Remediation {
    pub id: String,
    pub error_signature: String,
    pub error_message: String,
    pub solution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One indexed chunk of a source file.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CodeChunk {
    pub id: String,
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub chunk_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

// ===================================================
// REPORTS
// ===================================================

/// Outcome of a consolidation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ConsolidationReport {
    pub clusters_found: usize,
    pub created: usize,
    pub archived: usize,
    pub skipped: usize,
    pub total: usize,
    pub dry_run: bool,
    /// Dry-run only: clusters that would have been fused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub would_create: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub would_archive: Option<usize>,
}

/// Result of the most recent WAL sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Never,
    Success { replayed: usize },
    Failure { error: String },
}

/// Daemon health snapshot returned by the `status` tool.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct StatusReport {
    pub remote_healthy: bool,
    pub fallback_active: bool,
    pub wal_pending: usize,
    pub last_sync: SyncOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_scope_precedence() {
        let org_only = TenantId {
            org: "acme".into(),
            team: None,
            project: None,
        };
        assert_eq!(org_only.scope(), Scope::Org);

        let with_project = TenantId {
            org: "acme".into(),
            team: Some("core".into()),
            project: Some("api".into()),
        };
        assert_eq!(with_project.scope(), Scope::Project);
    }

    #[test]
    fn test_collection_type_round_trip() {
        for c in CollectionType::all() {
            let parsed: CollectionType = c.as_str().parse().unwrap();
            assert_eq!(parsed, *c);
        }
        assert!("anything_else".parse::<CollectionType>().is_err());
    }

    #[test]
    fn test_memory_serializes_state_lowercase() {
        let memory = Memory {
            id: "m1".into(),
            summary: "use context cancellation".into(),
            description: None,
            tags: vec!["go".into()],
            confidence: 0.5,
            usage_count: 0,
            state: MemoryState::Active,
            consolidation_id: None,
            source_ids: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&memory).unwrap();
        assert!(json.contains("\"state\":\"active\""));
    }

    #[test]
    fn test_status_report_round_trip() {
        let report = StatusReport {
            remote_healthy: false,
            fallback_active: true,
            wal_pending: 3,
            last_sync: SyncOutcome::Failure {
                error: "unavailable".into(),
            },
            last_sync_at: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: StatusReport = serde_json::from_str(&json).unwrap();
        assert!(back.fallback_active);
        assert_eq!(back.wal_pending, 3);
    }
}
