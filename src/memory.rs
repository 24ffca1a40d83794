//! In-memory store adapter
//!
//! Reference implementation of the conditional-write semantics the lock
//! protocol needs. Useful for tests and for single-process embedding; a
//! production deployment points the client at a remote document store
//! instead.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::record::ATTR_RVN;
use crate::store::{ItemPath, LockStore, StoreError, StoreResult, WireItem};

/// Conditional key-value store backed by a process-local map.
///
/// Every operation is atomic under one mutex, which is exactly the
/// per-item atomicity the contract asks for.
pub struct MemoryLockStore {
    items: Mutex<HashMap<(String, String), WireItem>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }

    fn key(path: &ItemPath<'_>) -> (String, String) {
        (path.table.to_string(), path.name.to_string())
    }

    fn stored_rvn(item: &WireItem) -> Option<&str> {
        item.get(ATTR_RVN).and_then(Value::as_str)
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get(
        &self,
        cancel: &CancellationToken,
        path: &ItemPath<'_>,
    ) -> StoreResult<Option<WireItem>> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let items = self.items.lock().expect("store mutex poisoned");
        Ok(items.get(&Self::key(path)).cloned())
    }

    async fn put_if_absent(
        &self,
        cancel: &CancellationToken,
        path: &ItemPath<'_>,
        item: WireItem,
    ) -> StoreResult<()> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut items = self.items.lock().expect("store mutex poisoned");
        if items.contains_key(&Self::key(path)) {
            return Err(StoreError::ConditionalFailure);
        }
        items.insert(Self::key(path), item);
        Ok(())
    }

    async fn update_if_rvn_matches(
        &self,
        cancel: &CancellationToken,
        path: &ItemPath<'_>,
        expected_rvn: &str,
        fields: WireItem,
    ) -> StoreResult<()> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut items = self.items.lock().expect("store mutex poisoned");
        let item = items
            .get_mut(&Self::key(path))
            .ok_or(StoreError::ConditionalFailure)?;
        if Self::stored_rvn(item) != Some(expected_rvn) {
            return Err(StoreError::ConditionalFailure);
        }
        // Merge: attributes not named in `fields` stay as they are.
        for (attr, value) in fields {
            item.insert(attr, value);
        }
        Ok(())
    }

    async fn delete_if_rvn_matches(
        &self,
        cancel: &CancellationToken,
        path: &ItemPath<'_>,
        expected_rvn: &str,
    ) -> StoreResult<()> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut items = self.items.lock().expect("store mutex poisoned");
        let key = Self::key(path);
        match items.get(&key) {
            Some(item) if Self::stored_rvn(item) == Some(expected_rvn) => {
                items.remove(&key);
                Ok(())
            }
            _ => Err(StoreError::ConditionalFailure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PATH: ItemPath<'static> = ItemPath {
        table: "locks",
        partition_key: "key",
        name: "lockName",
    };

    fn item(rvn: &str) -> WireItem {
        let mut item = WireItem::new();
        item.insert("key".to_string(), json!("lockName"));
        item.insert(ATTR_RVN.to_string(), json!(rvn));
        item
    }

    #[tokio::test]
    async fn test_put_if_absent_rejects_existing() {
        let store = MemoryLockStore::new();
        let cancel = CancellationToken::new();

        store.put_if_absent(&cancel, &PATH, item("r1")).await.unwrap();
        let err = store
            .put_if_absent(&cancel, &PATH, item("r2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionalFailure));
    }

    #[tokio::test]
    async fn test_update_requires_matching_rvn() {
        let store = MemoryLockStore::new();
        let cancel = CancellationToken::new();
        store.put_if_absent(&cancel, &PATH, item("r1")).await.unwrap();

        let err = store
            .update_if_rvn_matches(&cancel, &PATH, "r0", item("r2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionalFailure));

        store
            .update_if_rvn_matches(&cancel, &PATH, "r1", item("r2"))
            .await
            .unwrap();
        let stored = store.get(&cancel, &PATH).await.unwrap().unwrap();
        assert_eq!(stored.get(ATTR_RVN), Some(&json!("r2")));
    }

    #[tokio::test]
    async fn test_update_merge_preserves_unlisted_attributes() {
        let store = MemoryLockStore::new();
        let cancel = CancellationToken::new();

        let mut initial = item("r1");
        initial.insert("color".to_string(), json!("green"));
        store.put_if_absent(&cancel, &PATH, initial).await.unwrap();

        let mut fields = WireItem::new();
        fields.insert(ATTR_RVN.to_string(), json!("r2"));
        store
            .update_if_rvn_matches(&cancel, &PATH, "r1", fields)
            .await
            .unwrap();

        let stored = store.get(&cancel, &PATH).await.unwrap().unwrap();
        assert_eq!(stored.get("color"), Some(&json!("green")));
        assert_eq!(stored.get(ATTR_RVN), Some(&json!("r2")));
    }

    #[tokio::test]
    async fn test_delete_requires_matching_rvn() {
        let store = MemoryLockStore::new();
        let cancel = CancellationToken::new();
        store.put_if_absent(&cancel, &PATH, item("r1")).await.unwrap();

        let err = store
            .delete_if_rvn_matches(&cancel, &PATH, "r9")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionalFailure));

        store.delete_if_rvn_matches(&cancel, &PATH, "r1").await.unwrap();
        assert!(store.get(&cancel, &PATH).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let store = MemoryLockStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store.get(&cancel, &PATH).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }
}
