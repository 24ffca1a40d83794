//! Lock client façade
//!
//! Owns the client identity, per-client defaults, the registry of live
//! handles, and the lifecycle of the background heartbeat scheduler.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acquire::AcquireOptions;
use crate::error::{LockError, Result};
use crate::handle::LockHandle;
use crate::heartbeat::{run_scheduler, HeartbeatOptions};
use crate::record::LockRecord;
use crate::release::ReleaseOptions;
use crate::rvn::RvnSource;
use crate::store::{ItemPath, LockStore};

/// Configuration for a [`LockClient`].
#[derive(Clone, Debug)]
pub struct LockClientOptions {
    /// Wall-clock lifetime of a lease. After this much time without an
    /// observed write, other clients may steal the lock.
    pub lease_duration: Duration,
    /// Interval of the background heartbeat scheduler. Zero disables it;
    /// callers then heartbeat manually. When non-zero, must satisfy
    /// `heartbeat_period * 2 <= lease_duration`.
    pub heartbeat_period: Duration,
    /// Identity stamped into items this client writes. Defaults to a
    /// fresh UUID per client.
    pub owner_name: Option<String>,
    /// Name of the table's partition key attribute.
    pub partition_key_name: String,
}

impl Default for LockClientOptions {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            heartbeat_period: Duration::ZERO,
            owner_name: None,
            partition_key_name: "key".to_string(),
        }
    }
}

pub(crate) struct ClientInner {
    pub(crate) store: Arc<dyn LockStore>,
    pub(crate) table: String,
    pub(crate) partition_key: String,
    pub(crate) owner_name: String,
    pub(crate) lease_duration: Duration,
    pub(crate) heartbeat_period: Duration,
    pub(crate) rvn: RvnSource,
    /// Live handles by lock name. At most one non-released handle per
    /// name; a successful acquisition supersedes any stale predecessor.
    pub(crate) handles: DashMap<String, Arc<LockHandle>>,
}

impl ClientInner {
    pub(crate) fn path<'a>(&'a self, name: &'a str) -> ItemPath<'a> {
        ItemPath {
            table: &self.table,
            partition_key: &self.partition_key,
            name,
        }
    }

    pub(crate) fn drop_handle(&self, handle: &Arc<LockHandle>) {
        self.handles
            .remove_if(handle.name(), |_, live| Arc::ptr_eq(live, handle));
    }
}

/// Client for advisory locks held in a conditional key-value store.
///
/// Safe for concurrent use. All state lives in the client instance; two
/// clients with distinct owner names are independent actors even inside
/// one process.
pub struct LockClient {
    inner: Arc<ClientInner>,
    cancel: CancellationToken,
    scheduler: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockClient").finish_non_exhaustive()
    }
}

impl LockClient {
    /// Create a client for `table` on the given store adapter.
    ///
    /// When `options.heartbeat_period` is non-zero this spawns the
    /// background scheduler and therefore must run inside a tokio
    /// runtime.
    pub fn new(
        store: Arc<dyn LockStore>,
        table: &str,
        options: LockClientOptions,
    ) -> Result<Self> {
        if table.is_empty() {
            return Err(LockError::InvalidOptions(
                "table name must not be empty".to_string(),
            ));
        }
        if options.partition_key_name.is_empty() {
            return Err(LockError::InvalidOptions(
                "partition key name must not be empty".to_string(),
            ));
        }
        if options.lease_duration.is_zero() {
            return Err(LockError::InvalidOptions(
                "lease duration must be positive".to_string(),
            ));
        }
        if !options.heartbeat_period.is_zero()
            && options.heartbeat_period * 2 > options.lease_duration
        {
            return Err(LockError::InvalidOptions(format!(
                "heartbeat period {:?} must be at most half the lease duration {:?}",
                options.heartbeat_period, options.lease_duration
            )));
        }

        let owner_name = options
            .owner_name
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let inner = Arc::new(ClientInner {
            store,
            table: table.to_string(),
            partition_key: options.partition_key_name,
            owner_name,
            lease_duration: options.lease_duration,
            heartbeat_period: options.heartbeat_period,
            rvn: RvnSource::new(),
            handles: DashMap::new(),
        });

        let cancel = CancellationToken::new();
        let scheduler = if inner.heartbeat_period.is_zero() {
            None
        } else {
            Some(tokio::spawn(run_scheduler(
                inner.clone(),
                cancel.child_token(),
            )))
        };

        info!(
            "lock client ready: table={}, owner={}, lease={:?}",
            inner.table, inner.owner_name, inner.lease_duration
        );

        Ok(Self {
            inner,
            cancel,
            scheduler: tokio::sync::Mutex::new(scheduler),
        })
    }

    pub fn owner_name(&self) -> &str {
        &self.inner.owner_name
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    /// Acquire the lock `name`, waiting out a contested holder within the
    /// options' budget.
    pub async fn acquire(&self, name: &str, options: &AcquireOptions) -> Result<Arc<LockHandle>> {
        self.acquire_with(&CancellationToken::new(), name, options)
            .await
    }

    /// As [`acquire`](Self::acquire), cancellable.
    pub async fn acquire_with(
        &self,
        cancel: &CancellationToken,
        name: &str,
        options: &AcquireOptions,
    ) -> Result<Arc<LockHandle>> {
        self.inner.acquire(cancel, name, options).await
    }

    /// Refresh the lease on `handle`, proving continued liveness.
    pub async fn heartbeat(&self, handle: &Arc<LockHandle>, options: &HeartbeatOptions) -> Result<()> {
        self.heartbeat_with(&CancellationToken::new(), handle, options)
            .await
    }

    /// As [`heartbeat`](Self::heartbeat), cancellable. A token that fires
    /// after the write was sent does not lose the lease: the engine
    /// re-reads and reconciles.
    pub async fn heartbeat_with(
        &self,
        cancel: &CancellationToken,
        handle: &Arc<LockHandle>,
        options: &HeartbeatOptions,
    ) -> Result<()> {
        self.inner.heartbeat(cancel, handle, options).await
    }

    /// Release `handle`. Terminal: the handle never re-enters the held
    /// state, whatever the store says.
    pub async fn release(&self, handle: &Arc<LockHandle>, options: &ReleaseOptions) -> Result<()> {
        self.release_with(&CancellationToken::new(), handle, options)
            .await
    }

    /// As [`release`](Self::release), cancellable.
    pub async fn release_with(
        &self,
        cancel: &CancellationToken,
        handle: &Arc<LockHandle>,
        options: &ReleaseOptions,
    ) -> Result<()> {
        self.inner.release(cancel, handle, options).await
    }

    /// Read the current record for `name` without acquiring it. `None`
    /// when no item exists.
    pub async fn lookup(&self, name: &str) -> Result<Option<LockRecord>> {
        self.lookup_with(&CancellationToken::new(), name).await
    }

    /// As [`lookup`](Self::lookup), cancellable.
    pub async fn lookup_with(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Option<LockRecord>> {
        let item = self
            .inner
            .store
            .get(cancel, &self.inner.path(name))
            .await
            .map_err(LockError::from_store)?;
        match item {
            None => Ok(None),
            Some(wire) => LockRecord::from_wire(&self.inner.partition_key, &wire)
                .map(Some)
                .map_err(LockError::StoreUnavailable),
        }
    }

    /// Shut the client down: stop the scheduler, wait for any in-flight
    /// heartbeat, then best-effort release every live handle. Release
    /// failures are logged, not propagated.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(task) = self.scheduler.lock().await.take() {
            if let Err(e) = task.await {
                warn!("heartbeat scheduler did not shut down cleanly: {}", e);
            }
        }

        let handles: Vec<Arc<LockHandle>> = self
            .inner
            .handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            if handle.is_released() {
                self.inner.drop_handle(&handle);
                continue;
            }
            match self
                .inner
                .release(
                    &CancellationToken::new(),
                    &handle,
                    &ReleaseOptions::default(),
                )
                .await
            {
                Ok(()) | Err(LockError::AlreadyReleased) => {}
                Err(e) => warn!("releasing lock '{}' on close: {}", handle.name(), e),
            }
        }
        info!("lock client closed: owner={}", self.inner.owner_name);
    }
}

impl Drop for LockClient {
    fn drop(&mut self) {
        // Stops the scheduler; handles are left in their last state.
        self.cancel.cancel();
    }
}
