// crates/contextd-server/src/cli/serve.rs
// Server initialization and the MCP stdio loop

use crate::config::Settings;
use crate::consolidate::Consolidator;
use crate::embeddings::{Embedder, EmbeddingClient};
use crate::error::ContextdError;
use crate::fallback::{FallbackConfig, FallbackStore, WriteAheadLog};
use crate::knowledge::ServiceContext;
use crate::mcp::ContextdServer;
use crate::scrub::Scrubber;
use crate::store::{EmbeddedStore, QdrantStore, VectorStore};
use crate::tenant::{TenantRegistry, TenantRouter};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Wired server plus the knobs the caller may still need.
pub struct BuiltServer {
    pub server: ContextdServer,
    pub fallback_config: FallbackConfig,
}

/// Initialize configuration, stores, WAL, fallback, and services.
/// Shared by `serve` and the one-shot CLI commands.
pub async fn build_server() -> Result<BuiltServer> {
    let settings = Settings::load();
    let base_dir = settings.base_dir();
    let fallback_config = settings.fallback_config();

    let router = TenantRouter::new(base_dir.clone());
    let registry = Arc::new(TenantRegistry::open(&base_dir)?);

    let embedder: Arc<dyn Embedder> =
        match EmbeddingClient::from_config(&settings.env.api_keys, &settings.env.embeddings) {
            Some(client) => Arc::new(client),
            None => {
                return Err(ContextdError::Config(
                    "no embedding provider configured; set OPENAI_API_KEY or OLLAMA_HOST".into(),
                )
                .into())
            }
        };

    let local: Arc<dyn VectorStore> = Arc::new(EmbeddedStore::new(router.clone()));
    let remote: Arc<dyn VectorStore> = match settings.env.qdrant_url.as_deref() {
        Some(url) => {
            info!(url, "using Qdrant remote backend");
            Arc::new(QdrantStore::connect(
                url,
                settings.env.api_keys.qdrant.as_deref(),
            )?)
        }
        None => {
            // Embedded-only mode: the local store is authoritative and the
            // fallback machinery idles against an always-healthy backend.
            info!("no QDRANT_URL set, running embedded-only");
            local.clone()
        }
    };

    let wal = Arc::new(WriteAheadLog::open(&base_dir, fallback_config.wal_retention)?);
    let fallback = FallbackStore::new(remote, local, wal, &fallback_config);

    let scrubber = Arc::new(if settings.env.scrub_disabled {
        Scrubber::disabled()
    } else {
        Scrubber::with_allowlist(settings.scrub_allowlist())
    });
    if !scrubber.is_enabled() {
        tracing::warn!("secret scrubbing is DISABLED (CONTEXTD_DISABLE_SCRUB)");
    }

    let ctx = Arc::new(ServiceContext {
        router,
        registry,
        store: fallback.clone() as Arc<dyn VectorStore>,
        embedder,
        scrubber,
    });

    let llm = crate::llm::client_from_config(&settings.env.api_keys);
    if llm.is_none() {
        info!("no LLM provider configured; memory_consolidate will be unavailable");
    }
    let consolidator = Consolidator::new(ctx.clone(), llm);

    let server = ContextdServer::new(
        ctx,
        consolidator,
        fallback,
        settings.env.tenancy.clone(),
        settings.indexer_config(),
    );
    Ok(BuiltServer {
        server,
        fallback_config,
    })
}

/// Run the MCP server with stdio transport.
pub async fn run_mcp_server() -> Result<()> {
    let built = build_server().await?;
    built.server.fallback.start(&built.fallback_config);
    info!(
        tools = built.server.list_tool_names().len(),
        "contextd MCP server starting on stdio"
    );

    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(built.server, transport).await?;
    service.waiting().await?;
    Ok(())
}
