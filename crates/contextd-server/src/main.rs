// crates/contextd-server/src/main.rs
// contextd - durable context and knowledge daemon for AI coding assistants

use anyhow::Result;
use clap::Parser;
use contextd::cli::{self, Cli, Commands};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from the config dir only (never from CWD - a malicious repo
    // could override API keys or the storage base).
    if let Some(config_dir) = dirs::config_dir() {
        if let Err(e) = dotenvy::from_path(config_dir.join("contextd/.env")) {
            tracing::debug!("no global .env loaded: {e}");
        }
    }

    let cli = Cli::parse();

    // Serve must stay quiet: stdout carries the protocol, stderr the logs.
    let log_level = match &cli.command {
        None | Some(Commands::Serve) => Level::WARN,
        Some(Commands::Status) | Some(Commands::ScrubCheck) => Level::WARN,
        Some(Commands::Index { .. }) | Some(Commands::Consolidate { .. }) => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        None | Some(Commands::Serve) => cli::run_mcp_server().await,
        Some(Commands::Status) => cli::run_status().await,
        Some(Commands::Index {
            path,
            include,
            exclude,
            max_file_size,
        }) => cli::run_index(path, include, exclude, max_file_size).await,
        Some(Commands::Consolidate {
            dry_run,
            threshold,
            max_clusters,
        }) => cli::run_consolidate(dry_run, threshold, max_clusters).await,
        Some(Commands::ScrubCheck) => cli::run_scrub_check(),
    }
}
