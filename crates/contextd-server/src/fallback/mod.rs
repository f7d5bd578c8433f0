// crates/contextd-server/src/fallback/mod.rs
// Fallback decorator - keeps writes flowing when the remote backend is down

pub mod breaker;
pub mod health;
pub mod sync;
pub mod wal;

pub use breaker::CircuitBreaker;
pub use health::{HealthMonitor, HealthState};
pub use sync::{SyncHandle, SyncManager};
pub use wal::{WalOperation, WalStatus, WriteAheadLog};

use crate::error::{ContextdError, Result};
use crate::store::{CollectionRef, Metadata, MetadataFilter, Record, SearchHit, VectorStore};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use contextd_types::StatusReport;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tuning for the fallback layer.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub ping_interval: Duration,
    pub sync_interval: Duration,
    pub rpc_timeout: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub wal_retention: ChronoDuration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            ping_interval: health::DEFAULT_PING_INTERVAL,
            sync_interval: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(5),
            breaker_threshold: breaker::DEFAULT_FAILURE_THRESHOLD,
            breaker_cooldown: breaker::DEFAULT_COOLDOWN,
            wal_retention: ChronoDuration::days(7),
        }
    }
}

struct RuntimeHandles {
    ping_shutdown: tokio::sync::watch::Sender<bool>,
    sync_handle: SyncHandle,
}

/// Decorator around a remote and an embedded store.
///
/// Healthy: writes go to the remote, are mirrored locally to keep the
/// fallback warm, and land in the WAL as `synced`. Unhealthy: writes go to
/// the WAL as `pending` plus the local store; reads come from local with a
/// stale warning. Callers cannot distinguish the two paths.
pub struct FallbackStore {
    remote: Arc<dyn VectorStore>,
    local: Arc<dyn VectorStore>,
    wal: Arc<WriteAheadLog>,
    health: Arc<HealthMonitor>,
    sync: Arc<SyncManager>,
    rpc_timeout: Duration,
    handles: Mutex<Option<RuntimeHandles>>,
}

impl FallbackStore {
    pub fn new(
        remote: Arc<dyn VectorStore>,
        local: Arc<dyn VectorStore>,
        wal: Arc<WriteAheadLog>,
        config: &FallbackConfig,
    ) -> Arc<Self> {
        let health = Arc::new(HealthMonitor::new(config.ping_interval));
        let circuit = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown);
        let sync = Arc::new(SyncManager::new(
            remote.clone(),
            wal.clone(),
            health.clone(),
            circuit,
        ));
        Arc::new(Self {
            remote,
            local,
            wal,
            health,
            sync,
            rpc_timeout: config.rpc_timeout,
            handles: Mutex::new(None),
        })
    }

    /// Spawn the ping loop and the sync loop, and wire recovery transitions
    /// to immediate replay.
    pub fn start(self: &Arc<Self>, config: &FallbackConfig) {
        let ping_shutdown = self.health.spawn_ping_loop(self.remote.clone());
        let sync_handle = sync::spawn(self.sync.clone(), Some(config.sync_interval));

        let trigger = sync_handle.trigger();
        self.health.on_transition(move |_, to| {
            if to == HealthState::Recovering {
                let _ = trigger.try_send(());
            }
        });

        let mut handles = lock_handles(&self.handles);
        *handles = Some(RuntimeHandles {
            ping_shutdown,
            sync_handle,
        });
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn sync_manager(&self) -> Arc<SyncManager> {
        self.sync.clone()
    }

    pub fn status_report(&self) -> StatusReport {
        let healthy = self.health.is_healthy();
        let (last_sync, last_sync_at) = self.sync.last_sync();
        StatusReport {
            remote_healthy: healthy,
            fallback_active: !healthy,
            wal_pending: self.wal.pending_count(),
            last_sync,
            last_sync_at,
        }
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        }
    }

    /// Run a remote call; on a transient failure flip to fallback and report
    /// the error for the caller to degrade on.
    async fn try_remote<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.with_deadline(fut).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_retryable() {
                    self.health.record_failure();
                }
                Err(e)
            }
        }
    }

    fn log_wal(
        &self,
        op: WalOperation,
        collection: &CollectionRef,
        record: Option<Record>,
        record_id: Option<Uuid>,
        status: WalStatus,
    ) {
        if let Err(e) = self.wal.append(op, collection, record, record_id, status) {
            // A WAL bookkeeping failure must not fail the write itself;
            // pending entries are the exception and are appended first.
            warn!(error = %e, "failed to append WAL entry");
        }
    }

    async fn degraded_upsert(
        &self,
        collection: &CollectionRef,
        records: Vec<Record>,
    ) -> Result<Vec<Uuid>> {
        for record in &records {
            self.wal.append(
                WalOperation::Add,
                collection,
                Some(record.clone()),
                None,
                WalStatus::Pending,
            )?;
        }
        self.local.upsert(collection, records).await
    }
}

#[async_trait]
impl VectorStore for FallbackStore {
    async fn ensure_collection(&self, collection: &CollectionRef) -> Result<()> {
        self.local.ensure_collection(collection).await?;
        if self.health.is_healthy() {
            match self.try_remote(self.remote.ensure_collection(collection)).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    debug!(collection = %collection.name, "remote ensure deferred to replay");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn upsert(&self, collection: &CollectionRef, records: Vec<Record>) -> Result<Vec<Uuid>> {
        collection.require_tenancy()?;
        if !self.health.is_healthy() {
            return self.degraded_upsert(collection, records).await;
        }

        match self
            .try_remote(self.remote.upsert(collection, records.clone()))
            .await
        {
            Ok(ids) => {
                if let Err(e) = self.local.upsert(collection, records.clone()).await {
                    warn!(error = %e, "local mirror write failed");
                }
                for record in records {
                    self.log_wal(
                        WalOperation::Add,
                        collection,
                        Some(record),
                        None,
                        WalStatus::Synced,
                    );
                }
                Ok(ids)
            }
            Err(e) if e.is_retryable() => self.degraded_upsert(collection, records).await,
            Err(e) => Err(e),
        }
    }

    async fn search(
        &self,
        collection: &CollectionRef,
        query: &[f32],
        k: usize,
        extra: Option<MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        collection.require_tenancy()?;
        if self.health.is_healthy() {
            match self
                .try_remote(self.remote.search(collection, query, k, extra.clone()))
                .await
            {
                Ok(hits) => return Ok(hits),
                Err(e) if e.is_retryable() => {
                    debug!("search degrading to local: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        let mut hits = self.local.search(collection, query, k, extra).await?;
        for hit in &mut hits {
            hit.stale_warning = true;
        }
        Ok(hits)
    }

    async fn list(
        &self,
        collection: &CollectionRef,
        limit: usize,
        offset: usize,
        extra: Option<MetadataFilter>,
    ) -> Result<Vec<Record>> {
        collection.require_tenancy()?;
        if self.health.is_healthy() {
            match self
                .try_remote(self.remote.list(collection, limit, offset, extra.clone()))
                .await
            {
                Ok(records) => return Ok(records),
                Err(e) if e.is_retryable() => {
                    debug!("list degrading to local: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        self.local.list(collection, limit, offset, extra).await
    }

    async fn get(&self, collection: &CollectionRef, id: Uuid) -> Result<Record> {
        collection.require_tenancy()?;
        if self.health.is_healthy() {
            match self.try_remote(self.remote.get(collection, id)).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_retryable() => {
                    debug!("get degrading to local: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        self.local.get(collection, id).await
    }

    async fn update(&self, collection: &CollectionRef, id: Uuid, patch: Metadata) -> Result<()> {
        collection.require_tenancy()?;
        if self.health.is_healthy() {
            match self
                .try_remote(self.remote.update(collection, id, patch.clone()))
                .await
            {
                Ok(()) => {
                    // Re-read the post-state so the local mirror and the WAL
                    // carry exactly what the remote now holds.
                    match self.try_remote(self.remote.get(collection, id)).await {
                        Ok(record) => {
                            if let Err(e) =
                                self.local.upsert(collection, vec![record.clone()]).await
                            {
                                warn!(error = %e, "local mirror update failed");
                            }
                            self.log_wal(
                                WalOperation::Add,
                                collection,
                                Some(record),
                                None,
                                WalStatus::Synced,
                            );
                        }
                        Err(e) => warn!(error = %e, "post-update read failed"),
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    debug!("update degrading to local: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        self.local.update(collection, id, patch).await?;
        let record = self.local.get(collection, id).await?;
        self.wal.append(
            WalOperation::Add,
            collection,
            Some(record),
            None,
            WalStatus::Pending,
        )?;
        Ok(())
    }

    async fn delete(&self, collection: &CollectionRef, id: Uuid) -> Result<()> {
        collection.require_tenancy()?;
        if self.health.is_healthy() {
            match self.try_remote(self.remote.delete(collection, id)).await {
                Ok(()) => {
                    match self.local.delete(collection, id).await {
                        Ok(()) | Err(ContextdError::NotFound(_)) => {}
                        Err(e) => warn!(error = %e, "local mirror delete failed"),
                    }
                    self.log_wal(
                        WalOperation::Delete,
                        collection,
                        None,
                        Some(id),
                        WalStatus::Synced,
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    debug!("delete degrading to local: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        // Degraded delete: the remote may hold the record even if the local
        // mirror does not, so the WAL entry is appended unconditionally.
        self.wal.append(
            WalOperation::Delete,
            collection,
            None,
            Some(id),
            WalStatus::Pending,
        )?;
        match self.local.delete(collection, id).await {
            Ok(()) | Err(ContextdError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.remote.health_check().await
    }

    async fn close(&self) -> Result<()> {
        let handles = {
            let mut guard = lock_handles(&self.handles);
            guard.take()
        };
        if let Some(handles) = handles {
            let _ = handles.ping_shutdown.send(true);
            handles.sync_handle.shutdown(Duration::from_secs(5)).await;
        }
        self.local.close().await?;
        self.remote.close().await?;
        Ok(())
    }
}

fn lock_handles(mutex: &Mutex<Option<RuntimeHandles>>) -> std::sync::MutexGuard<'_, Option<RuntimeHandles>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
