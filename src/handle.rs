//! In-memory representation of a held lock

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// A successfully acquired lock.
///
/// Handles are shared (`Arc`) between the caller and the client's
/// background scheduler. All mutation goes through the state mutex, and
/// the mutex is deliberately held across the store call during heartbeat
/// and release so no two operations on the same handle can interleave.
/// Once released, a handle never re-enters the held state.
pub struct LockHandle {
    name: String,
    owner_name: String,
    lease_duration: Duration,
    delete_on_release: bool,
    /// Mirrors `state.released` for lock-free reads.
    released: AtomicBool,
    state: Mutex<HandleState>,
}

pub(crate) struct HandleState {
    /// The record version number this handle last wrote successfully.
    pub rvn: String,
    pub data: Vec<u8>,
    /// Monotonic instant of the last successful write.
    pub acquired_at: Instant,
    pub released: bool,
}

impl LockHandle {
    pub(crate) fn new(
        name: String,
        owner_name: String,
        lease_duration: Duration,
        delete_on_release: bool,
        rvn: String,
        data: Vec<u8>,
    ) -> Self {
        Self {
            name,
            owner_name,
            lease_duration,
            delete_on_release,
            released: AtomicBool::new(false),
            state: Mutex::new(HandleState {
                rvn,
                data,
                acquired_at: Instant::now(),
                released: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner_name
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Current payload bytes, as of the last successful write.
    pub async fn data(&self) -> Vec<u8> {
        self.state.lock().await.data.clone()
    }

    /// The record version number of the last write this handle requested
    /// and knows to have taken effect.
    pub async fn rvn(&self) -> String {
        self.state.lock().await.rvn.clone()
    }

    /// Local-clock estimate of expiry: the lease duration has elapsed
    /// since the last successful write. Another client may steal the lock
    /// once this is true; keep heartbeating to prevent it.
    pub async fn is_expired(&self) -> bool {
        if self.is_released() {
            return true;
        }
        self.state.lock().await.acquired_at.elapsed() >= self.lease_duration
    }

    pub(crate) fn delete_on_release(&self) -> bool {
        self.delete_on_release
    }

    pub(crate) fn state(&self) -> &Mutex<HandleState> {
        &self.state
    }

    /// Flip the lock-free mirror; callers set `state.released` themselves
    /// while holding the state mutex.
    pub(crate) fn flag_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Terminally release without touching the store. Used when another
    /// acquisition supersedes this handle locally.
    pub(crate) async fn mark_released(&self) {
        let mut state = self.state.lock().await;
        state.released = true;
        self.flag_released();
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name)
            .field("owner", &self.owner_name)
            .field("released", &self.is_released())
            .finish()
    }
}
