// crates/contextd-server/src/indexer/mod.rs
// Repository indexer - turn a project tree into searchable records

pub mod chunking;
pub mod search;

pub use search::{RepoSearchHit, RepositorySearcher, SearchType};

use crate::error::{ContextdError, Result};
use crate::knowledge::ServiceContext;
use crate::store::{Metadata, Record};
use chunking::FileChunk;
use contextd_types::{CollectionType, TenantId};
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default per-file size gate.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

/// Absolute ceiling regardless of configuration.
pub const HARD_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Binary sniff window: a NUL byte in the first 8 KiB rejects the file.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Embedding batch size per store write.
const WRITE_BATCH: usize = 64;

const CHUNK_LINES: usize = 120;
const CHUNK_OVERLAP: usize = 20;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub max_file_size: u64,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Split files into overlapping line windows; off means one chunk per file.
    pub chunking: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            include: Vec::new(),
            exclude: Vec::new(),
            chunking: true,
        }
    }
}

/// Outcome of one index run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IndexReport {
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub chunks_written: usize,
    pub deleted_previous: usize,
}

pub struct RepositoryIndexer {
    ctx: Arc<ServiceContext>,
}

impl RepositoryIndexer {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Full-replace reindex of a project tree: prior chunks are deleted
    /// before the new records are written.
    pub async fn index(
        &self,
        tenant: &TenantId,
        root: &Path,
        config: &IndexerConfig,
    ) -> Result<IndexReport> {
        if !root.is_absolute() {
            return Err(ContextdError::InvalidArgument(format!(
                "index path must be absolute: {}",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(ContextdError::InvalidArgument(format!(
                "not a directory: {}",
                root.display()
            )));
        }
        let max_file_size = config.max_file_size.min(HARD_MAX_FILE_SIZE);
        self.ctx.register_tenancy(tenant)?;

        let collection = self.ctx.write_ref(tenant, CollectionType::Codebase)?;
        let branch = current_branch(root);

        let mut report = IndexReport {
            deleted_previous: self.delete_previous(&collection).await?,
            ..Default::default()
        };

        let mut pending: Vec<(PathBuf, FileChunk, u32)> = Vec::new();
        for path in walk_files(root, &config.include, &config.exclude)? {
            match gate_file(&path, max_file_size) {
                Ok(content) => {
                    let chunks = if config.chunking {
                        chunking::chunk_lines(&content, CHUNK_LINES, CHUNK_OVERLAP)
                    } else {
                        chunking::single_chunk(&content)
                    };
                    if chunks.is_empty() {
                        report.files_skipped += 1;
                        continue;
                    }
                    report.files_indexed += 1;
                    for (chunk_id, chunk) in chunks.into_iter().enumerate() {
                        pending.push((path.clone(), chunk, chunk_id as u32));
                    }
                }
                Err(reason) => {
                    debug!(path = %path.display(), reason, "file skipped");
                    report.files_skipped += 1;
                }
            }
        }

        for batch in pending.chunks(WRITE_BATCH) {
            let records = self
                .build_records(root, branch.as_deref(), batch)
                .await?;
            report.chunks_written += records.len();
            self.ctx.store.upsert(&collection, records).await?;
        }

        info!(
            files = report.files_indexed,
            skipped = report.files_skipped,
            chunks = report.chunks_written,
            "index run complete"
        );
        Ok(report)
    }

    async fn build_records(
        &self,
        root: &Path,
        branch: Option<&str>,
        batch: &[(PathBuf, FileChunk, u32)],
    ) -> Result<Vec<Record>> {
        let texts: Vec<String> = batch
            .iter()
            .map(|(_, chunk, _)| self.ctx.scrubber.scrub_text(&chunk.content))
            .collect();
        let vectors = self.ctx.embedder.embed_batch(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(ContextdError::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }

        let mut records = Vec::with_capacity(batch.len());
        for (((path, chunk, chunk_id), text), vector) in
            batch.iter().zip(texts).zip(vectors)
        {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .to_string();
            let mut metadata = Metadata::new();
            metadata.insert("file_path".into(), relative.into());
            metadata.insert("line_start".into(), (chunk.line_start as i64).into());
            metadata.insert("line_end".into(), (chunk.line_end as i64).into());
            metadata.insert("chunk_id".into(), (*chunk_id as i64).into());
            if let Some(branch) = branch {
                metadata.insert("branch".into(), branch.into());
            }
            records.push(Record::new(vector, text, metadata));
        }
        Ok(records)
    }

    /// Remove every chunk the project currently holds.
    async fn delete_previous(&self, collection: &crate::store::CollectionRef) -> Result<usize> {
        let mut deleted = 0;
        loop {
            let page = self.ctx.store.list(collection, 512, 0, None).await?;
            if page.is_empty() {
                break;
            }
            for record in page {
                match self.ctx.store.delete(collection, record.id).await {
                    Ok(()) | Err(ContextdError::NotFound(_)) => deleted += 1,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(deleted)
    }
}

/// Walk the tree depth-first, applying include/exclude globs. Symlinks are
/// never followed.
pub(crate) fn walk_files(
    root: &Path,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<PathBuf>> {
    let mut overrides = OverrideBuilder::new(root);
    for pattern in include {
        overrides
            .add(pattern)
            .map_err(|e| ContextdError::InvalidArgument(format!("include glob {pattern}: {e}")))?;
    }
    for pattern in exclude {
        overrides
            .add(&format!("!{pattern}"))
            .map_err(|e| ContextdError::InvalidArgument(format!("exclude glob {pattern}: {e}")))?;
    }
    let overrides = overrides
        .build()
        .map_err(|e| ContextdError::InvalidArgument(format!("globs: {e}")))?;

    let mut files = Vec::new();
    let walker = WalkBuilder::new(root)
        .follow_links(false)
        .hidden(true)
        .git_ignore(true)
        .overrides(overrides)
        .sort_by_file_path(|a, b| a.cmp(b))
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "walk error, continuing");
                continue;
            }
        };
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Size and binary gates. Returns the content when the file qualifies,
/// or a static reason when it does not.
fn gate_file(path: &Path, max_file_size: u64) -> std::result::Result<String, &'static str> {
    let metadata = std::fs::metadata(path).map_err(|_| "unreadable metadata")?;
    // Exactly at the limit passes; one byte over does not.
    if metadata.len() > max_file_size {
        return Err("over size limit");
    }
    let bytes = std::fs::read(path).map_err(|_| "unreadable")?;
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0u8) {
        return Err("binary");
    }
    String::from_utf8(bytes).map_err(|_| "not utf-8")
}

/// Current branch name, if the tree is a git checkout.
fn current_branch(root: &Path) -> Option<String> {
    let repo = git2::Repository::discover(root).ok()?;
    let head = repo.head().ok()?;
    head.shorthand().map(str::to_string)
}
