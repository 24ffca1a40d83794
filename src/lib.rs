//! leaselock - distributed advisory locks over a conditional key-value store
//!
//! This crate provides:
//! - Mutual exclusion on named resources across uncoordinated processes
//! - Lease-based expiry with takeover of stalled holders
//! - On-demand and background heartbeats, with reconciliation of writes
//!   whose outcome the network swallowed
//! - A narrow store contract (`LockStore`) any document store with
//!   conditional single-item writes can implement, plus an in-memory
//!   implementation for tests and embedding
//!
//! All correctness derives from chaining conditional writes through
//! record version numbers; there is no server-side logic and no reliance
//! on synchronized clocks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use leaselock::{AcquireOptions, LockClient, LockClientOptions, MemoryLockStore, ReleaseOptions};
//!
//! # async fn demo() -> leaselock::Result<()> {
//! let store = Arc::new(MemoryLockStore::new());
//! let client = LockClient::new(store, "locks", LockClientOptions::default())?;
//!
//! let handle = client
//!     .acquire(
//!         "reports/nightly",
//!         &AcquireOptions {
//!             data: Some(b"worker-7".to_vec()),
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//!
//! // ... exclusive work ...
//!
//! client.release(&handle, &ReleaseOptions::default()).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod acquire;
pub mod client;
pub mod error;
pub mod handle;
pub mod heartbeat;
pub mod memory;
pub mod record;
pub mod release;
pub mod rvn;
pub mod store;

pub use acquire::AcquireOptions;
pub use client::{LockClient, LockClientOptions};
pub use error::{LockError, Result};
pub use handle::LockHandle;
pub use heartbeat::HeartbeatOptions;
pub use memory::MemoryLockStore;
pub use record::LockRecord;
pub use release::ReleaseOptions;
pub use rvn::RvnSource;
pub use store::{ItemPath, LockStore, StoreError, StoreResult, WireItem};
