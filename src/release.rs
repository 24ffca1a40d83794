//! Release engine
//!
//! Releasing either deletes the item or leaves a tombstone: the record
//! stays put with `isReleased` set and a fresh version number, so the
//! next acquirer has something to condition on. Either way the handle is
//! finished; release is terminal even when the store call fails.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ClientInner;
use crate::error::{LockError, Result};
use crate::handle::LockHandle;
use crate::record::{encode_payload, ATTR_DATA, ATTR_IS_RELEASED, ATTR_RVN};
use crate::store::{StoreError, WireItem};

/// Options for a release.
#[derive(Clone, Debug, Default)]
pub struct ReleaseOptions {
    /// Override the handle's acquisition-time choice of delete versus
    /// tombstone.
    pub delete_on_release: Option<bool>,
    /// Rewrite the payload into the tombstone. Ignored when deleting.
    pub data: Option<Vec<u8>>,
}

impl ClientInner {
    pub(crate) async fn release(
        &self,
        cancel: &CancellationToken,
        handle: &Arc<LockHandle>,
        options: &ReleaseOptions,
    ) -> Result<()> {
        let mut state = handle.state().lock().await;
        if state.released {
            return Err(LockError::AlreadyReleased);
        }

        let delete = options
            .delete_on_release
            .unwrap_or(handle.delete_on_release());
        let path = self.path(handle.name());

        let outcome = if delete {
            self.store
                .delete_if_rvn_matches(cancel, &path, &state.rvn)
                .await
        } else {
            let next_rvn = self.rvn.next();
            let mut fields = WireItem::new();
            fields.insert(ATTR_RVN.to_string(), Value::String(next_rvn));
            fields.insert(ATTR_IS_RELEASED.to_string(), Value::Bool(true));
            if let Some(data) = &options.data {
                fields.insert(ATTR_DATA.to_string(), Value::String(encode_payload(data)));
            }
            self.store
                .update_if_rvn_matches(cancel, &path, &state.rvn, fields)
                .await
        };

        // Terminal regardless of what the store said.
        state.released = true;
        handle.flag_released();
        self.drop_handle(handle);

        match outcome {
            Ok(()) => {
                debug!("released '{}' ({})", handle.name(), if delete { "deleted" } else { "tombstone" });
                Ok(())
            }
            Err(StoreError::ConditionalFailure) => {
                // The record moved on without us; nothing left to give up.
                debug!("release '{}': already lost", handle.name());
                Err(LockError::AlreadyReleased)
            }
            Err(err) => Err(LockError::from_store(err)),
        }
    }
}
