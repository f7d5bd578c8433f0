// crates/contextd-server/src/fallback/wal.rs
// Write-ahead log for degraded-mode writes - append-only, checksummed segments

use crate::error::{ContextdError, Result};
use crate::store::{CollectionRef, Record};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Maximum serialized size of a single entry.
const MAX_ENTRY_BYTES: usize = 10 * 1024 * 1024;

/// Segment rotation threshold.
const MAX_SEGMENT_BYTES: u64 = 10 * 1024 * 1024;

/// HMAC key file, created once per installation.
const KEY_FILE: &str = ".key";
const KEY_BYTES: usize = 32;

/// Only writes are logged; reads never touch the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOperation {
    Add,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalStatus {
    Pending,
    Synced,
}

/// One logged write. `record` is present for `Add`, `record_id` for `Delete`.
/// The payload is stored post-scrub; nothing here is ever re-redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub op: WalOperation,
    pub collection: CollectionRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Uuid>,
    pub status: WalStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    /// HMAC-SHA256 over the entry's immutable fields, hex encoded.
    pub checksum: String,
}

/// Append-only log of pending writes under `<base>/wal/<collection>/`.
///
/// Entries are JSON lines inside numbered segment files. Status changes
/// rewrite the owning segment through a temp sibling + rename; entry bodies
/// are never mutated, so the checksum stays valid for the entry's lifetime.
pub struct WriteAheadLog {
    inner: Mutex<WalState>,
    retention: Duration,
}

struct WalState {
    dir: PathBuf,
    key: Vec<u8>,
    next_seq: u64,
}

impl WriteAheadLog {
    /// Open the WAL under `<base>/wal`, creating the directory and the HMAC
    /// key on first start.
    pub fn open(base_dir: &Path, retention: Duration) -> Result<Self> {
        let dir = base_dir.join("wal");
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let key = load_or_create_key(&dir)?;
        let next_seq = scan_max_seq(&dir)? + 1;

        Ok(Self {
            inner: Mutex::new(WalState { dir, key, next_seq }),
            retention,
        })
    }

    /// Append one write. Returns the assigned sequence number.
    pub fn append(
        &self,
        op: WalOperation,
        collection: &CollectionRef,
        record: Option<Record>,
        record_id: Option<Uuid>,
        status: WalStatus,
    ) -> Result<u64> {
        let mut state = lock(&self.inner);
        let seq = state.next_seq;

        let mut entry = WalEntry {
            seq,
            op,
            collection: collection.clone(),
            record,
            record_id,
            status,
            retry_count: 0,
            created_at: Utc::now(),
            synced_at: if status == WalStatus::Synced {
                Some(Utc::now())
            } else {
                None
            },
            checksum: String::new(),
        };
        entry.checksum = checksum(&state.key, &entry)?;

        let line = serde_json::to_string(&entry)?;
        if line.len() > MAX_ENTRY_BYTES {
            return Err(ContextdError::ResourceExhausted(format!(
                "WAL entry of {} bytes exceeds {} byte limit",
                line.len(),
                MAX_ENTRY_BYTES
            )));
        }

        let segment = state.active_segment(&collection.name)?;
        append_line(&segment, &line)?;
        state.next_seq += 1;
        debug!(seq, collection = %collection.name, ?op, ?status, "appended WAL entry");
        Ok(seq)
    }

    /// All pending entries across collections, in append (seq) order.
    /// Corrupt entries are quarantined and skipped.
    pub fn pending(&self) -> Result<Vec<WalEntry>> {
        let state = lock(&self.inner);
        let mut entries = self.read_all(&state)?;
        entries.retain(|e| e.status == WalStatus::Pending);
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Number of pending entries.
    pub fn pending_count(&self) -> usize {
        self.pending().map(|p| p.len()).unwrap_or(0)
    }

    /// Mark an entry synced. The checksum covers only immutable fields, so
    /// the rewrite does not invalidate it.
    pub fn mark_synced(&self, seq: u64) -> Result<()> {
        self.mutate_entry(seq, |entry| {
            entry.status = WalStatus::Synced;
            entry.synced_at = Some(Utc::now());
        })
    }

    /// Bump the retry counter after a failed replay.
    pub fn bump_retry(&self, seq: u64) -> Result<u32> {
        let mut bumped = 0;
        self.mutate_entry(seq, |entry| {
            entry.retry_count += 1;
            bumped = entry.retry_count;
        })?;
        Ok(bumped)
    }

    /// Drop synced entries older than the retention window. Pending entries
    /// are never pruned. Returns how many entries were removed.
    pub fn prune_synced(&self) -> Result<usize> {
        let state = lock(&self.inner);
        let cutoff = Utc::now() - self.retention;
        let mut removed = 0;

        for segment in list_segments(&state.dir)? {
            let (mut entries, quarantined) = read_segment(&state.key, &segment)?;
            let before = entries.len();
            entries.retain(|e| match (e.status, e.synced_at) {
                (WalStatus::Synced, Some(at)) => at > cutoff,
                _ => true,
            });
            if entries.len() != before || quarantined {
                removed += before - entries.len();
                rewrite_segment(&segment, &entries)?;
            }
        }
        if removed > 0 {
            debug!(removed, "pruned synced WAL entries");
        }
        Ok(removed)
    }

    fn read_all(&self, state: &WalState) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        for segment in list_segments(&state.dir)? {
            let (mut segment_entries, quarantined) = read_segment(&state.key, &segment)?;
            if quarantined {
                rewrite_segment(&segment, &segment_entries)?;
            }
            entries.append(&mut segment_entries);
        }
        Ok(entries)
    }

    fn mutate_entry(&self, seq: u64, apply: impl FnOnce(&mut WalEntry)) -> Result<()> {
        let state = lock(&self.inner);
        for segment in list_segments(&state.dir)? {
            let (mut entries, _) = read_segment(&state.key, &segment)?;
            if let Some(entry) = entries.iter_mut().find(|e| e.seq == seq) {
                apply(entry);
                rewrite_segment(&segment, &entries)?;
                return Ok(());
            }
        }
        Err(ContextdError::NotFound(format!("WAL entry seq {seq}")))
    }
}

impl WalState {
    /// Active segment for a collection: the highest-numbered file under the
    /// rotation threshold, or the next number up.
    fn active_segment(&self, collection_name: &str) -> Result<PathBuf> {
        let dir = self.dir.join(collection_name);
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let mut highest: Option<(u64, PathBuf)> = None;
        for path in segment_files(&dir)? {
            if let Some(n) = segment_number(&path) {
                if highest.as_ref().map(|(h, _)| n > *h).unwrap_or(true) {
                    highest = Some((n, path));
                }
            }
        }

        match highest {
            Some((n, path)) => {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                if size >= MAX_SEGMENT_BYTES {
                    Ok(dir.join(format!("{:06}.log", n + 1)))
                } else {
                    Ok(path)
                }
            }
            None => Ok(dir.join("000001.log")),
        }
    }
}

fn lock(mutex: &Mutex<WalState>) -> std::sync::MutexGuard<'_, WalState> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn load_or_create_key(dir: &Path) -> Result<Vec<u8>> {
    let path = dir.join(KEY_FILE);
    if path.exists() {
        return Ok(std::fs::read(&path)?);
    }
    let key: Vec<u8> = (0..KEY_BYTES).map(|_| rand::random::<u8>()).collect();
    std::fs::write(&path, &key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(key)
}

/// Checksum over the fields that never change after append.
fn checksum(key: &[u8], entry: &WalEntry) -> Result<String> {
    let payload = match (&entry.record, &entry.record_id) {
        (Some(record), _) => serde_json::to_string(record)?,
        (None, Some(id)) => id.to_string(),
        (None, None) => String::new(),
    };
    let material = format!(
        "{}|{:?}|{}|{}|{}",
        entry.seq,
        entry.op,
        entry.collection.name,
        entry.created_at.to_rfc3339(),
        payload
    );

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ContextdError::Other(format!("invalid WAL key: {e}")))?;
    mac.update(material.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(hex_encode(&digest))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut segments: BTreeMap<(String, u64), PathBuf> = BTreeMap::new();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    for entry in walkdir::WalkDir::new(dir).min_depth(2).max_depth(2) {
        let entry = entry.map_err(|e| ContextdError::Other(format!("WAL scan: {e}")))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().map(|e| e != "log").unwrap_or(true)
        {
            continue;
        }
        let collection = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(n) = segment_number(path) {
            segments.insert((collection, n), path.to_path_buf());
        }
    }
    Ok(segments.into_values().collect())
}

fn segment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for item in std::fs::read_dir(dir)? {
        let path = item?.path();
        if path.extension().map(|e| e == "log").unwrap_or(false) {
            files.push(path);
        }
    }
    Ok(files)
}

fn segment_number(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// Read a segment, verifying checksums. Corrupt lines are moved to a
/// `*.corrupted.<ts>` sibling; the bool reports whether any were found.
fn read_segment(key: &[u8], segment: &Path) -> Result<(Vec<WalEntry>, bool)> {
    let raw = std::fs::read_to_string(segment)?;
    let mut entries = Vec::new();
    let mut corrupt_lines = Vec::new();

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: Option<WalEntry> = serde_json::from_str(line).ok();
        match parsed {
            Some(entry) => {
                let expected = checksum(key, &entry)?;
                if expected == entry.checksum {
                    entries.push(entry);
                } else {
                    warn!(seq = entry.seq, segment = %segment.display(), "WAL checksum mismatch, quarantining entry");
                    corrupt_lines.push(line.to_string());
                }
            }
            None => {
                warn!(segment = %segment.display(), "unparseable WAL line, quarantining");
                corrupt_lines.push(line.to_string());
            }
        }
    }

    let quarantined = !corrupt_lines.is_empty();
    if quarantined {
        let quarantine = segment.with_extension(format!("corrupted.{}", Utc::now().timestamp()));
        let mut body = corrupt_lines.join("\n");
        body.push('\n');
        std::fs::write(&quarantine, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&quarantine, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok((entries, quarantined))
}

fn append_line(segment: &Path, line: &str) -> Result<()> {
    let created = !segment.exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_data()?;
    if created {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(segment, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok(())
}

/// Rewrite a segment atomically: temp sibling, fsync, rename.
fn rewrite_segment(segment: &Path, entries: &[WalEntry]) -> Result<()> {
    if entries.is_empty() {
        if segment.exists() {
            std::fs::remove_file(segment)?;
        }
        return Ok(());
    }
    let tmp = segment.with_extension("log.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        for entry in entries {
            let line = serde_json::to_string(entry)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_data()?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, segment)?;
    Ok(())
}

fn scan_max_seq(dir: &Path) -> Result<u64> {
    let key = load_or_create_key(dir)?;
    let mut max_seq = 0;
    for segment in list_segments(dir)? {
        let (entries, quarantined) = read_segment(&key, &segment)?;
        if quarantined {
            rewrite_segment(&segment, &entries)?;
        }
        for entry in entries {
            max_seq = max_seq.max(entry.seq);
        }
    }
    Ok(max_seq)
}
