// crates/contextd-server/src/mcp/mod.rs
// MCP server implementation

mod handler;
pub mod requests;
pub mod responses;
mod router;

use crate::config::TenancyEnv;
use crate::consolidate::Consolidator;
use crate::error::{ContextdError, Result};
use crate::fallback::FallbackStore;
use crate::indexer::{IndexerConfig, RepositoryIndexer, RepositorySearcher};
use crate::knowledge::{CheckpointService, MemoryService, RemediationService, ServiceContext};
use crate::scrub::Scrubber;
use crate::tenant::TenantRouter;
use contextd_types::TenantId;
use requests::TenancyFields;
use rmcp::handler::server::router::tool::ToolRouter;
use std::sync::Arc;

/// MCP server state. Cheap to clone; all real state sits behind the
/// shared handles.
#[derive(Clone)]
pub struct ContextdServer {
    pub memory: Arc<MemoryService>,
    pub checkpoint: Arc<CheckpointService>,
    pub remediation: Arc<RemediationService>,
    pub consolidator: Arc<Consolidator>,
    pub indexer: Arc<RepositoryIndexer>,
    pub searcher: Arc<RepositorySearcher>,
    pub fallback: Arc<FallbackStore>,
    pub scrubber: Arc<Scrubber>,
    pub default_tenancy: TenancyEnv,
    /// Configured indexer defaults; per-call arguments override field-wise.
    pub indexer_config: IndexerConfig,
    tenant_router: TenantRouter,
    tool_router: ToolRouter<Self>,
}

impl ContextdServer {
    pub fn new(
        ctx: Arc<ServiceContext>,
        consolidator: Consolidator,
        fallback: Arc<FallbackStore>,
        default_tenancy: TenancyEnv,
        indexer_config: IndexerConfig,
    ) -> Self {
        Self {
            memory: Arc::new(MemoryService::new(ctx.clone())),
            checkpoint: Arc::new(CheckpointService::new(ctx.clone())),
            remediation: Arc::new(RemediationService::new(ctx.clone())),
            consolidator: Arc::new(consolidator),
            indexer: Arc::new(RepositoryIndexer::new(ctx.clone())),
            searcher: Arc::new(RepositorySearcher::new(ctx.clone())),
            fallback,
            scrubber: ctx.scrubber.clone(),
            default_tenancy,
            indexer_config,
            tenant_router: ctx.router.clone(),
            tool_router: Self::create_tool_router(),
        }
    }

    /// Resolve the request's tenancy. A request that names an org supplies
    /// the whole triple; otherwise the daemon's environment defaults apply.
    /// No org anywhere is a request-level error before any I/O.
    pub fn resolve_tenancy(&self, fields: &TenancyFields) -> Result<TenantId> {
        let (org, team, project) = if fields.org.is_some() {
            (
                fields.org.clone(),
                fields.team.clone(),
                fields.project.clone(),
            )
        } else {
            (
                self.default_tenancy.org.clone(),
                self.default_tenancy.team.clone(),
                self.default_tenancy.project.clone(),
            )
        };
        let org = org.ok_or(ContextdError::TenancyRequired)?;
        self.tenant_router
            .tenant(&org, team.as_deref(), project.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenancyEnv;
    use crate::fallback::{FallbackConfig, WriteAheadLog};
    use crate::knowledge::testing::*;
    use crate::store::EmbeddedStore;

    fn server_with_env(env: TenancyEnv) -> (ContextdServer, tempfile::TempDir) {
        let t = service_context();
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = Arc::new(EmbeddedStore::new(TenantRouter::new(
            dir.path().join("remote"),
        )));
        let local = Arc::new(EmbeddedStore::new(TenantRouter::new(
            dir.path().join("local"),
        )));
        let wal = Arc::new(
            WriteAheadLog::open(&dir.path().join("wal-base"), chrono::Duration::days(7))
                .expect("wal"),
        );
        let fallback = FallbackStore::new(remote, local, wal, &FallbackConfig::default());
        let consolidator = Consolidator::new(t.ctx.clone(), None);
        let server = ContextdServer::new(
            t.ctx.clone(),
            consolidator,
            fallback,
            env,
            IndexerConfig::default(),
        );
        (server, dir)
    }

    #[test]
    fn test_request_tenancy_wins_over_env() {
        let env = TenancyEnv {
            org: Some("envorg".into()),
            team: Some("envteam".into()),
            project: None,
        };
        let (server, _dir) = server_with_env(env);

        let fields = TenancyFields {
            org: Some("acme".into()),
            team: None,
            project: Some("api".into()),
        };
        let tenant = server.resolve_tenancy(&fields).unwrap();
        assert_eq!(tenant.org, "acme");
        // A request-supplied org never mixes with env team/project.
        assert_eq!(tenant.team, None);
        assert_eq!(tenant.project.as_deref(), Some("api"));
    }

    #[test]
    fn test_env_tenancy_used_when_request_is_silent() {
        let env = TenancyEnv {
            org: Some("envorg".into()),
            team: None,
            project: Some("envproj".into()),
        };
        let (server, _dir) = server_with_env(env);

        let tenant = server.resolve_tenancy(&TenancyFields::default()).unwrap();
        assert_eq!(tenant.org, "envorg");
        assert_eq!(tenant.project.as_deref(), Some("envproj"));
    }

    #[test]
    fn test_missing_org_is_tenancy_required() {
        let (server, _dir) = server_with_env(TenancyEnv::default());
        let err = server.resolve_tenancy(&TenancyFields::default()).unwrap_err();
        assert_eq!(err.kind(), "tenancy_required");
    }

    #[test]
    fn test_invalid_org_rejected_before_io() {
        let (server, _dir) = server_with_env(TenancyEnv::default());
        let fields = TenancyFields {
            org: Some("..".into()),
            team: None,
            project: None,
        };
        let err = server.resolve_tenancy(&fields).unwrap_err();
        assert_eq!(err.kind(), "invalid_identifier");
    }
}
