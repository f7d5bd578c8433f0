// crates/contextd-server/src/fallback/sync.rs
// Background replay of pending WAL entries against the recovered remote

use super::breaker::CircuitBreaker;
use super::health::{HealthMonitor, HealthState};
use super::wal::{WalOperation, WriteAheadLog};
use crate::error::{ContextdError, Result};
use crate::store::VectorStore;
use chrono::{DateTime, Utc};
use contextd_types::SyncOutcome;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Bound on queued sync triggers; extra events coalesce.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Interval for periodic replay attempts while entries are pending.
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Base delay for per-entry exponential back-off.
const BASE_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF_EXP: u32 = 6;

/// Replays pending WAL entries in append order. FIFO is preserved: a failed
/// entry stops the pass so causally later writes never reach the remote
/// before earlier ones.
pub struct SyncManager {
    remote: Arc<dyn VectorStore>,
    wal: Arc<WriteAheadLog>,
    health: Arc<HealthMonitor>,
    breaker: CircuitBreaker,
    last_sync: Mutex<(SyncOutcome, Option<DateTime<Utc>>)>,
}

impl SyncManager {
    pub fn new(
        remote: Arc<dyn VectorStore>,
        wal: Arc<WriteAheadLog>,
        health: Arc<HealthMonitor>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            remote,
            wal,
            health,
            breaker,
            last_sync: Mutex::new((SyncOutcome::Never, None)),
        }
    }

    pub fn last_sync(&self) -> (SyncOutcome, Option<DateTime<Utc>>) {
        match self.last_sync.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record_outcome(&self, outcome: SyncOutcome) {
        let mut guard = match self.last_sync.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = (outcome, Some(Utc::now()));
    }

    /// One replay pass. Returns the number of entries synced; stops at the
    /// first failure to preserve FIFO order. Honours the circuit breaker.
    pub async fn sync_once(&self) -> Result<usize> {
        if !self.breaker.allow_attempt() {
            debug!("sync skipped: circuit open");
            return Ok(0);
        }

        let pending = self.wal.pending()?;
        if pending.is_empty() {
            if self.health.state() == HealthState::Recovering {
                self.health.mark_healthy();
            }
            self.breaker.record_success();
            return Ok(0);
        }

        let mut replayed = 0usize;
        for entry in pending {
            let result = match entry.op {
                WalOperation::Add => match entry.record.clone() {
                    // The record replays with its original timestamps; if
                    // the remote holds a newer version, local wins wholesale.
                    Some(record) => self
                        .remote
                        .upsert(&entry.collection, vec![record])
                        .await
                        .map(|_| ()),
                    None => Err(ContextdError::Other(format!(
                        "WAL add entry {} has no record",
                        entry.seq
                    ))),
                },
                WalOperation::Delete => match entry.record_id {
                    Some(id) => match self.remote.delete(&entry.collection, id).await {
                        // Already gone at the remote is success for a delete.
                        Err(ContextdError::NotFound(_)) => Ok(()),
                        other => other,
                    },
                    None => Err(ContextdError::Other(format!(
                        "WAL delete entry {} has no record id",
                        entry.seq
                    ))),
                },
            };

            match result {
                Ok(()) => {
                    self.wal.mark_synced(entry.seq)?;
                    replayed += 1;
                }
                Err(e) => {
                    let retries = if e.is_retryable() {
                        self.wal.bump_retry(entry.seq)?
                    } else {
                        entry.retry_count
                    };
                    warn!(
                        seq = entry.seq,
                        retries,
                        error = %e,
                        "WAL replay failed, stopping pass"
                    );
                    self.breaker.record_failure();
                    self.record_outcome(SyncOutcome::Failure {
                        error: e.to_user_string(),
                    });
                    if e.is_retryable() {
                        self.health.record_failure();
                    }
                    return Err(e);
                }
            }
        }

        self.breaker.record_success();
        self.wal.prune_synced()?;
        self.health.mark_healthy();
        self.record_outcome(SyncOutcome::Success { replayed });
        info!(replayed, "WAL replay complete");
        Ok(replayed)
    }

    /// Back-off before the next automatic attempt, derived from the retry
    /// count of the oldest pending entry.
    fn next_backoff(&self) -> Duration {
        let retries = self
            .wal
            .pending()
            .ok()
            .and_then(|p| p.first().map(|e| e.retry_count))
            .unwrap_or(0);
        BASE_BACKOFF * 2u32.pow(retries.min(MAX_BACKOFF_EXP))
    }
}

/// Handle for triggering and stopping the background sync loop.
pub struct SyncHandle {
    trigger: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SyncHandle {
    /// Request a replay soon. Non-blocking; bursts coalesce once the
    /// bounded channel is full.
    pub fn notify(&self) {
        let _ = self.trigger.try_send(());
    }

    /// A cloneable trigger for wiring into health-transition callbacks.
    pub fn trigger(&self) -> mpsc::Sender<()> {
        self.trigger.clone()
    }

    /// Stop the loop, waiting up to `timeout` for the in-flight pass.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(timeout, self.task).await.is_err() {
            warn!("sync loop did not stop within {:?}", timeout);
        }
    }
}

/// Spawn the sync loop: wakes on demand, on the periodic interval, and
/// applies exponential back-off after failed passes.
pub fn spawn(manager: Arc<SyncManager>, interval: Option<Duration>) -> SyncHandle {
    let (trigger_tx, mut trigger_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = interval.unwrap_or(DEFAULT_SYNC_INTERVAL);

    let task = tokio::spawn(async move {
        let mut delay = interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                event = trigger_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    // Drain queued triggers; one pass serves them all.
                    while trigger_rx.try_recv().is_ok() {}
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match manager.sync_once().await {
                Ok(_) => delay = interval,
                Err(_) => delay = manager.next_backoff().max(interval.min(BASE_BACKOFF)),
            }
        }
        debug!("sync loop stopped");
    });

    SyncHandle {
        trigger: trigger_tx,
        shutdown: shutdown_tx,
        task,
    }
}
