//! Acquisition engine
//!
//! Observe, classify, conditionally write. A contested lock is polled
//! until its holder either writes (timer resets) or goes a full lease
//! duration without writing (takeover). Expiry is measured on this
//! client's monotonic clock from its own first observation of the
//! present record version number, never from server timestamps, so a
//! freshly started client always waits out one full lease before
//! stealing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ClientInner;
use crate::error::{LockError, Result};
use crate::handle::LockHandle;
use crate::record::LockRecord;
use crate::store::{StoreError, WireItem};

/// Options for a single acquisition.
#[derive(Clone, Debug)]
pub struct AcquireOptions {
    /// Payload to store with the lock.
    pub data: Option<Vec<u8>>,
    /// Overwrite the existing payload on takeover. When false, the
    /// payload already in the record is preserved.
    pub replace_data: bool,
    /// Delete the item on release instead of writing a tombstone.
    pub delete_on_release: bool,
    /// Poll budget for a contested lock. `None` waits one full lease
    /// duration, which is the minimum a stalled holder needs to expire.
    pub additional_time_to_wait: Option<Duration>,
    /// Sleep between polls of a contested lock.
    pub refresh_period: Duration,
    /// Fail with `NotGranted` on the first observation of a live holder
    /// instead of polling.
    pub fail_if_locked: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            data: None,
            replace_data: true,
            delete_on_release: false,
            additional_time_to_wait: None,
            refresh_period: Duration::from_secs(1),
            fail_if_locked: false,
        }
    }
}

/// Observation of a contested holder: the record version number seen and
/// when this client first saw it.
struct Observation {
    rvn: String,
    first_seen: Instant,
}

impl ClientInner {
    pub(crate) async fn acquire(
        &self,
        cancel: &CancellationToken,
        name: &str,
        options: &AcquireOptions,
    ) -> Result<Arc<LockHandle>> {
        if name.is_empty() {
            return Err(LockError::InvalidOptions(
                "lock name must not be empty".to_string(),
            ));
        }

        let budget = options
            .additional_time_to_wait
            .unwrap_or(self.lease_duration);
        let deadline = Instant::now() + budget;
        let mut observed: Option<Observation> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }

            let item = match self.store.get(cancel, &self.path(name)).await {
                Ok(item) => item,
                Err(StoreError::Cancelled) => return Err(LockError::Cancelled),
                Err(err) => {
                    // Transient read failure: retryable while budget lasts.
                    if Instant::now() >= deadline {
                        return Err(LockError::from_store(err));
                    }
                    debug!("acquire '{}': read failed, retrying: {}", name, err);
                    self.wait_for_next_poll(cancel, options.refresh_period, deadline)
                        .await?;
                    continue;
                }
            };

            match item {
                None => {
                    let record = self.fresh_record(name, options.data.clone());
                    match self
                        .store
                        .put_if_absent(
                            cancel,
                            &self.path(name),
                            record.to_wire(&self.partition_key),
                        )
                        .await
                    {
                        Ok(()) => {
                            debug!(
                                "acquired '{}' as {}: inserted rvn {}",
                                name, self.owner_name, record.record_version_number
                            );
                            return Ok(self.install_handle(record, options).await);
                        }
                        Err(StoreError::ConditionalFailure) => {
                            // Lost the insert race; observe the winner.
                            if Instant::now() >= deadline {
                                return Err(LockError::NotGranted);
                            }
                            continue;
                        }
                        Err(StoreError::Cancelled) => return Err(LockError::Cancelled),
                        Err(err) => {
                            if Instant::now() >= deadline {
                                return Err(LockError::from_store(err));
                            }
                            debug!("acquire '{}': insert failed, retrying: {}", name, err);
                            self.wait_for_next_poll(cancel, options.refresh_period, deadline)
                                .await?;
                        }
                    }
                }
                Some(wire) => {
                    let existing = LockRecord::from_wire(&self.partition_key, &wire)
                        .map_err(LockError::StoreUnavailable)?;

                    if existing.is_released {
                        match self.try_takeover(cancel, name, &existing, options).await {
                            Ok(handle) => return Ok(handle),
                            Err(StoreError::ConditionalFailure) => {
                                if Instant::now() >= deadline {
                                    return Err(LockError::NotGranted);
                                }
                                continue;
                            }
                            Err(StoreError::Cancelled) => return Err(LockError::Cancelled),
                            Err(err) => {
                                if Instant::now() >= deadline {
                                    return Err(LockError::from_store(err));
                                }
                                debug!("acquire '{}': takeover failed, retrying: {}", name, err);
                            }
                        }
                    } else {
                        // A live holder, possibly ourselves. No reentrancy:
                        // our own record gets the same expiry treatment.
                        if options.fail_if_locked {
                            return Err(LockError::NotGranted);
                        }

                        let up_to_date = observed
                            .as_ref()
                            .map(|o| o.rvn == existing.record_version_number)
                            .unwrap_or(false);
                        if !up_to_date {
                            // New state: restart the expiry timer.
                            observed = Some(Observation {
                                rvn: existing.record_version_number.clone(),
                                first_seen: Instant::now(),
                            });
                        } else {
                            let holder_lease =
                                existing.lease().unwrap_or(self.lease_duration);
                            let watched = observed.as_ref().expect("observation recorded");
                            if watched.first_seen.elapsed() >= holder_lease {
                                debug!(
                                    "acquire '{}': holder {} expired, attempting takeover",
                                    name, existing.owner_name
                                );
                                match self.try_takeover(cancel, name, &existing, options).await
                                {
                                    Ok(handle) => return Ok(handle),
                                    Err(StoreError::ConditionalFailure) => {
                                        // Someone beat us to it; re-observe.
                                        observed = None;
                                    }
                                    Err(StoreError::Cancelled) => {
                                        return Err(LockError::Cancelled)
                                    }
                                    Err(err) => {
                                        if Instant::now() >= deadline {
                                            return Err(LockError::from_store(err));
                                        }
                                        debug!(
                                            "acquire '{}': takeover failed, retrying: {}",
                                            name, err
                                        );
                                    }
                                }
                            }
                        }
                    }

                    if Instant::now() >= deadline {
                        return Err(LockError::NotGranted);
                    }
                    self.wait_for_next_poll(cancel, options.refresh_period, deadline)
                        .await?;
                }
            }
        }
    }

    /// Conditional update chained on the observed record: takes over a
    /// released tombstone or an expired holder.
    async fn try_takeover(
        &self,
        cancel: &CancellationToken,
        name: &str,
        existing: &LockRecord,
        options: &AcquireOptions,
    ) -> std::result::Result<Arc<LockHandle>, StoreError> {
        let data = if options.replace_data {
            options.data.clone().unwrap_or_default()
        } else {
            existing.data.clone()
        };
        let record = self.fresh_record(name, Some(data));

        self.store
            .update_if_rvn_matches(
                cancel,
                &self.path(name),
                &existing.record_version_number,
                record.to_update_fields(),
            )
            .await?;

        debug!(
            "acquired '{}' as {}: rvn {} -> {}",
            name, self.owner_name, existing.record_version_number, record.record_version_number
        );
        Ok(self.install_handle(record, options).await)
    }

    fn fresh_record(&self, name: &str, data: Option<Vec<u8>>) -> LockRecord {
        LockRecord {
            name: name.to_string(),
            owner_name: self.owner_name.clone(),
            record_version_number: self.rvn.next(),
            lease_duration: Some(self.lease_duration.as_millis() as u64),
            data: data.unwrap_or_default(),
            is_released: false,
            extra: WireItem::new(),
        }
    }

    /// Register the freshly acquired handle. A stale predecessor for the
    /// same name is terminally released so one name never has two live
    /// handles in this process.
    async fn install_handle(
        &self,
        record: LockRecord,
        options: &AcquireOptions,
    ) -> Arc<LockHandle> {
        let handle = Arc::new(LockHandle::new(
            record.name.clone(),
            record.owner_name,
            self.lease_duration,
            options.delete_on_release,
            record.record_version_number,
            record.data,
        ));
        if let Some(previous) = self.handles.insert(record.name.clone(), handle.clone()) {
            if !previous.is_released() {
                debug!("superseding stale local handle for '{}'", record.name);
                previous.mark_released().await;
            }
        }
        handle
    }

    /// Sleep one refresh period, capped by the deadline, watching the
    /// token.
    async fn wait_for_next_poll(
        &self,
        cancel: &CancellationToken,
        refresh_period: Duration,
        deadline: Instant,
    ) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            _ = cancel.cancelled() => Err(LockError::Cancelled),
            _ = tokio::time::sleep(refresh_period.min(remaining)) => Ok(()),
        }
    }
}
