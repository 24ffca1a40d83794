//! Error types surfaced by the lock client

use crate::store::StoreError;

/// Error type for lock client operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock not granted within the wait budget")]
    NotGranted,

    #[error("lock taken over by another owner")]
    Stolen,

    #[error("operation on a released lock handle")]
    Released,

    #[error("lock was already released")]
    AlreadyReleased,

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

pub type Result<T> = std::result::Result<T, LockError>;

impl LockError {
    /// Map an adapter error onto the client taxonomy. Callers handle
    /// `ConditionalFailure` before reaching for this; it is contention,
    /// which means the lock moved under us.
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::ConditionalFailure => LockError::Stolen,
            StoreError::Cancelled => LockError::Cancelled,
            StoreError::Unavailable(e) => LockError::StoreUnavailable(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LockError::NotGranted;
        assert_eq!(err.to_string(), "lock not granted within the wait budget");

        let err = LockError::Stolen;
        assert_eq!(err.to_string(), "lock taken over by another owner");

        let err = LockError::AlreadyReleased;
        assert_eq!(err.to_string(), "lock was already released");

        let err = LockError::InvalidOptions("lease duration must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "invalid options: lease duration must be positive"
        );
    }

    #[test]
    fn test_from_store_error() {
        let err = LockError::from_store(StoreError::Cancelled);
        assert!(matches!(err, LockError::Cancelled));

        let err = LockError::from_store(StoreError::Unavailable(anyhow::anyhow!("boom")));
        assert!(matches!(err, LockError::StoreUnavailable(_)));
    }
}
