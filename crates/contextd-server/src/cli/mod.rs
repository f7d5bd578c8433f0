// crates/contextd-server/src/cli/mod.rs
// Command-line interface

mod serve;

pub use serve::{build_server, run_mcp_server};

use crate::store::VectorStore;
use anyhow::Result;
use clap::{Parser, Subcommand};
use contextd_types::ConsolidationReport;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "contextd", version, about = "Context and knowledge daemon for AI coding assistants")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the MCP server on stdio (default)
    Serve,
    /// Print daemon health as JSON
    Status,
    /// Index a project tree for semantic search
    Index {
        /// Absolute path of the project tree
        path: PathBuf,
        /// Include globs; when set, files must match one
        #[arg(long)]
        include: Vec<String>,
        /// Exclude globs
        #[arg(long)]
        exclude: Vec<String>,
        /// Per-file size gate in bytes
        #[arg(long)]
        max_file_size: Option<u64>,
    },
    /// Cluster and fuse near-duplicate memories
    Consolidate {
        /// Report without writing
        #[arg(long)]
        dry_run: bool,
        /// Pairwise similarity threshold in [0,1]
        #[arg(long)]
        threshold: Option<f64>,
        /// Max clusters per run, 0 = unlimited
        #[arg(long)]
        max_clusters: Option<usize>,
    },
    /// Scrub stdin and report findings without leaking matches
    ScrubCheck,
}

/// `contextd status`
pub async fn run_status() -> Result<()> {
    let built = build_server().await?;
    // One live probe so the report reflects reality, not just the default.
    if built.server.fallback.health_check().await.is_err() {
        built.server.fallback.health().record_failure();
    }
    let report = built.server.fallback.status_report();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `contextd index <path>`
pub async fn run_index(
    path: PathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
    max_file_size: Option<u64>,
) -> Result<()> {
    let built = build_server().await?;
    let tenant = built.server.resolve_tenancy(&Default::default())?;

    // Config-file defaults, overridden field-wise by CLI flags.
    let mut config = built.server.indexer_config.clone();
    if !include.is_empty() {
        config.include = include;
    }
    if !exclude.is_empty() {
        config.exclude = exclude;
    }
    if let Some(max) = max_file_size {
        config.max_file_size = max;
    }

    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };
    let report = built.server.indexer.index(&tenant, &absolute, &config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `contextd consolidate`
pub async fn run_consolidate(
    dry_run: bool,
    threshold: Option<f64>,
    max_clusters: Option<usize>,
) -> Result<()> {
    let built = build_server().await?;
    let tenant = built.server.resolve_tenancy(&Default::default())?;

    let mut options = crate::consolidate::ConsolidationOptions {
        dry_run,
        ..Default::default()
    };
    if let Some(threshold) = threshold {
        options.similarity_threshold = threshold;
    }
    if let Some(max_clusters) = max_clusters {
        options.max_clusters = max_clusters;
    }

    let report: ConsolidationReport = built.server.consolidator.run(&tenant, options).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `contextd scrub-check`: findings summary only, never matched content.
pub fn run_scrub_check() -> Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let scrubber = crate::scrub::Scrubber::new();
    let outcome = scrubber.scrub(&input);

    let findings: Vec<serde_json::Value> = outcome
        .findings
        .iter()
        .map(|f| {
            serde_json::json!({
                "rule": f.rule_id,
                "severity": f.severity,
                "line": f.line,
            })
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "findings": findings.len(),
            "details": findings,
        }))?
    );
    Ok(())
}
