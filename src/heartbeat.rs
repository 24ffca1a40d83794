//! Heartbeat engine
//!
//! A heartbeat proves liveness by writing a new record version number
//! conditioned on the one this handle last wrote. The delicate part is
//! what happens when the store errors *after* it may have applied the
//! write: the next heartbeat would then assert a stale version, be
//! refused, and the holder would lose a lease it still owns. So every
//! ambiguous outcome is reconciled by re-reading the item: after any
//! heartbeat returns, the handle's version equals the store's version or
//! the handle is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientInner;
use crate::error::{LockError, Result};
use crate::handle::{HandleState, LockHandle};
use crate::record::{
    LockRecord, ATTR_DATA, ATTR_IS_RELEASED, ATTR_LEASE_DURATION, ATTR_OWNER_NAME, ATTR_RVN,
};
use crate::store::{StoreError, WireItem};

/// Options for a heartbeat.
#[derive(Clone, Debug, Default)]
pub struct HeartbeatOptions {
    /// Replace the stored payload along with the lease refresh.
    pub data: Option<Vec<u8>>,
    /// Additional attempts after an inconclusive transient failure.
    /// Contention is never retried: a refused precondition means the
    /// lock is gone.
    pub retries: u32,
    /// Sleep between attempts.
    pub retry_backoff: Duration,
}

/// How a single attempt ended, short of success.
enum AttemptError {
    /// The lock is lost or the handle is done; retrying cannot help.
    Fatal(LockError),
    /// The write provably did not take, or we could not find out.
    Inconclusive(LockError),
}

impl ClientInner {
    pub(crate) async fn heartbeat(
        &self,
        cancel: &CancellationToken,
        handle: &Arc<LockHandle>,
        options: &HeartbeatOptions,
    ) -> Result<()> {
        let mut state = handle.state().lock().await;
        if state.released {
            return Err(LockError::Released);
        }

        let mut attempts_left = options.retries;
        loop {
            match self.heartbeat_once(cancel, handle, &mut state, options).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Inconclusive(err)) => {
                    if attempts_left == 0 {
                        return Err(err);
                    }
                    attempts_left -= 1;
                    debug!(
                        "heartbeat '{}': inconclusive, {} attempts left: {}",
                        handle.name(),
                        attempts_left,
                        err
                    );
                    if !options.retry_backoff.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(LockError::Cancelled),
                            _ = tokio::time::sleep(options.retry_backoff) => {}
                        }
                    }
                }
            }
        }
    }

    /// One conditional write plus, on ambiguity, one reconciling read.
    async fn heartbeat_once(
        &self,
        cancel: &CancellationToken,
        handle: &Arc<LockHandle>,
        state: &mut HandleState,
        options: &HeartbeatOptions,
    ) -> std::result::Result<(), AttemptError> {
        let next_rvn = self.rvn.next();

        let mut fields = WireItem::new();
        fields.insert(
            ATTR_OWNER_NAME.to_string(),
            Value::String(handle.owner().to_string()),
        );
        fields.insert(ATTR_RVN.to_string(), Value::String(next_rvn.clone()));
        fields.insert(
            ATTR_LEASE_DURATION.to_string(),
            (handle.lease_duration().as_millis() as u64).into(),
        );
        fields.insert(ATTR_IS_RELEASED.to_string(), Value::Bool(false));
        if let Some(data) = &options.data {
            fields.insert(
                ATTR_DATA.to_string(),
                Value::String(crate::record::encode_payload(data)),
            );
        }

        let path = self.path(handle.name());
        let err = match self
            .store
            .update_if_rvn_matches(cancel, &path, &state.rvn, fields)
            .await
        {
            Ok(()) => {
                debug!(
                    "heartbeat '{}': rvn {} -> {}",
                    handle.name(),
                    state.rvn,
                    next_rvn
                );
                self.advance(state, next_rvn, options);
                return Ok(());
            }
            Err(StoreError::ConditionalFailure) => {
                warn!(
                    "heartbeat '{}': version assertion refused, lock is lost",
                    handle.name()
                );
                self.evict(handle, state);
                return Err(AttemptError::Fatal(LockError::Stolen));
            }
            // Cancellation and transient failures alike: the write may
            // have been applied. Find out before giving up the version.
            Err(err) => err,
        };

        warn!(
            "heartbeat '{}': write outcome unknown ({}), re-reading to reconcile",
            handle.name(),
            err
        );
        match self.store.get(cancel, &path).await {
            Ok(Some(wire)) => match LockRecord::from_wire(&self.partition_key, &wire) {
                Ok(record) if record.owner_name == handle.owner() => {
                    if record.record_version_number == next_rvn {
                        info!(
                            "heartbeat '{}': write had succeeded, advanced to rvn {}",
                            handle.name(),
                            next_rvn
                        );
                        self.advance(state, next_rvn, options);
                        Ok(())
                    } else if record.record_version_number == state.rvn {
                        // The write never landed; the original error stands.
                        Err(AttemptError::Inconclusive(LockError::from_store(err)))
                    } else {
                        self.evict(handle, state);
                        Err(AttemptError::Fatal(LockError::Stolen))
                    }
                }
                Ok(record) => {
                    warn!(
                        "heartbeat '{}': owner is now {}, lock is lost",
                        handle.name(),
                        record.owner_name
                    );
                    self.evict(handle, state);
                    Err(AttemptError::Fatal(LockError::Stolen))
                }
                Err(decode_err) => {
                    debug!(
                        "heartbeat '{}': reconciliation read undecodable: {}",
                        handle.name(),
                        decode_err
                    );
                    Err(AttemptError::Inconclusive(LockError::from_store(err)))
                }
            },
            Ok(None) => {
                warn!("heartbeat '{}': item is gone, lock is lost", handle.name());
                self.evict(handle, state);
                Err(AttemptError::Fatal(LockError::Stolen))
            }
            Err(read_err) => {
                debug!(
                    "heartbeat '{}': reconciliation read failed: {}",
                    handle.name(),
                    read_err
                );
                Err(AttemptError::Inconclusive(LockError::from_store(err)))
            }
        }
    }

    fn advance(&self, state: &mut HandleState, next_rvn: String, options: &HeartbeatOptions) {
        state.rvn = next_rvn;
        state.acquired_at = Instant::now();
        if let Some(data) = &options.data {
            state.data = data.clone();
        }
    }

    /// Terminal: the lease is gone. Mark the handle released and drop it
    /// from the scheduler's working set.
    fn evict(&self, handle: &Arc<LockHandle>, state: &mut HandleState) {
        state.released = true;
        handle.flag_released();
        self.drop_handle(handle);
    }
}

/// Background heartbeat worker: one cooperative loop per client. Each
/// tick snapshots the live handles and heartbeats them in turn; a handle
/// whose heartbeat fails for anything but cancellation is dropped from
/// the set. Exits when the client shuts down.
pub(crate) async fn run_scheduler(inner: Arc<ClientInner>, cancel: CancellationToken) {
    let period = inner.heartbeat_period;
    debug!("heartbeat scheduler started: period {:?}", period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        let handles: Vec<Arc<LockHandle>> = inner
            .handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            if cancel.is_cancelled() {
                break;
            }
            if handle.is_released() {
                inner.drop_handle(&handle);
                continue;
            }
            match inner
                .heartbeat(&cancel, &handle, &HeartbeatOptions::default())
                .await
            {
                Ok(()) => {}
                // Shutdown mid-tick: leave the handle in its last state.
                Err(LockError::Cancelled) => {}
                Err(LockError::Stolen) | Err(LockError::Released) => {
                    warn!("scheduler: lock '{}' no longer held", handle.name());
                }
                Err(err) => {
                    warn!(
                        "scheduler: heartbeat for '{}' failed, dropping handle: {}",
                        handle.name(),
                        err
                    );
                    handle.mark_released().await;
                    inner.drop_handle(&handle);
                }
            }
        }
    }
    debug!("heartbeat scheduler stopped");
}
