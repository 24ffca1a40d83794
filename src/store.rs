//! Store adapter contract
//!
//! The lock protocol only needs four operations from its backend: a
//! strongly consistent single-item read and three conditional single-item
//! writes. Any document store that can compare one attribute atomically
//! can implement this trait; correctness never depends on server-side
//! logic beyond the condition check.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Wire representation of one stored item: a flat attribute map.
///
/// Attributes the client does not recognize must survive a round trip
/// untouched, so peers at newer protocol versions do not lose data.
pub type WireItem = Map<String, Value>;

/// Addresses a single item: table, partition key attribute name, lock name.
#[derive(Clone, Copy, Debug)]
pub struct ItemPath<'a> {
    pub table: &'a str,
    pub partition_key: &'a str,
    pub name: &'a str,
}

/// Error type for store adapter operations.
///
/// `ConditionalFailure` is the only semantically meaningful failure: the
/// precondition did not hold, so somebody else wrote first. Everything in
/// `Unavailable` (network faults, timeouts, throttling, server errors)
/// may have partially succeeded at the backend, and callers must treat it
/// that way. `Cancelled` is surfaced when the token fires before the call
/// returns; a cancelled write is likewise a "may have written".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conditional check failed")]
    ConditionalFailure,

    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Unavailable(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Conditional CRUD over a single table keyed by lock name.
///
/// Requirements on implementations:
/// - `get` must be a strongly consistent read.
/// - The three write operations must be atomic per item, and must fail
///   with [`StoreError::ConditionalFailure`] exactly when the stated
///   precondition does not hold.
/// - `update_if_rvn_matches` merges `fields` into the stored item;
///   attributes not named in `fields` are left as they are.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Strongly consistent read. `None` when no item exists under `path`.
    async fn get(&self, cancel: &CancellationToken, path: &ItemPath<'_>)
        -> StoreResult<Option<WireItem>>;

    /// Insert `item`, failing with `ConditionalFailure` if any item
    /// already exists under `path`.
    async fn put_if_absent(
        &self,
        cancel: &CancellationToken,
        path: &ItemPath<'_>,
        item: WireItem,
    ) -> StoreResult<()>;

    /// Merge `fields` into the stored item iff its current record version
    /// number equals `expected_rvn`.
    async fn update_if_rvn_matches(
        &self,
        cancel: &CancellationToken,
        path: &ItemPath<'_>,
        expected_rvn: &str,
        fields: WireItem,
    ) -> StoreResult<()>;

    /// Delete the stored item iff its current record version number
    /// equals `expected_rvn`.
    async fn delete_if_rvn_matches(
        &self,
        cancel: &CancellationToken,
        path: &ItemPath<'_>,
        expected_rvn: &str,
    ) -> StoreResult<()>;
}
