use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::provider::{matches_prefix, normalize_prefix, Node, PutCondition, Store, StoreError};

/// In-memory store backed by an ordered map
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    nodes: BTreeMap<String, Node>,
    /// Monotonic write counter, used as node seq
    seq: u64,
    closed: bool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryStoreError {
    #[error("memory store error: {0}")]
    Internal(String),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryStoreInner::default())),
        }
    }

    /// Number of writes that have taken effect so far
    pub fn version(&self) -> u64 {
        self.inner.read().map(|inner| inner.seq).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().map(|inner| inner.closed).unwrap_or(true)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_error<E: std::fmt::Display>(what: &str, e: E) -> StoreError<MemoryStoreError> {
    StoreError::Provider(MemoryStoreError::Internal(format!(
        "failed to acquire {} lock: {}",
        what, e
    )))
}

#[async_trait]
impl Store for MemoryStore {
    type Error = MemoryStoreError;

    async fn get(&self, key: &str) -> Result<Option<Node>, StoreError<Self::Error>> {
        let inner = self.inner.read().map_err(|e| lock_error("read", e))?;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner.nodes.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        condition: PutCondition,
    ) -> Result<bool, StoreError<Self::Error>> {
        let mut inner = self.inner.write().map_err(|e| lock_error("write", e))?;
        if inner.closed {
            return Err(StoreError::Closed);
        }

        let existing = inner.nodes.get(key).map(|node| &node.value);
        if !condition.allows(existing, &value) {
            return Ok(false);
        }

        inner.seq += 1;
        let seq = inner.seq;
        inner.nodes.insert(
            key.to_string(),
            Node {
                key: key.to_string(),
                value,
                seq,
            },
        );
        Ok(true)
    }

    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<Node>, StoreError<Self::Error>> {
        let inner = self.inner.read().map_err(|e| lock_error("read", e))?;
        if inner.closed {
            return Err(StoreError::Closed);
        }

        let prefix = normalize_prefix(prefix);
        Ok(inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| matches_prefix(key, &prefix, recursive))
            .map(|(_, node)| node.clone())
            .collect())
    }

    async fn close(&self) -> Result<(), StoreError<Self::Error>> {
        let mut inner = self.inner.write().map_err(|e| lock_error("write", e))?;
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryStore::new();
        assert!(store.get("config/a").await.unwrap().is_none());

        assert!(store
            .put("config/a", json!(1), PutCondition::Always)
            .await
            .unwrap());
        let node = store.get("config/a").await.unwrap().unwrap();
        assert_eq!(node.value, json!(1));
        assert_eq!(node.seq, 1);
    }

    #[tokio::test]
    async fn test_conditional_puts() {
        let store = MemoryStore::new();

        assert!(store
            .put("k", json!("first"), PutCondition::IfAbsent)
            .await
            .unwrap());
        assert!(!store
            .put("k", json!("second"), PutCondition::IfAbsent)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().value, json!("first"));

        assert!(!store
            .put("k", json!("first"), PutCondition::IfChanged)
            .await
            .unwrap());
        assert_eq!(store.version(), 1);
        assert!(store
            .put("k", json!("third"), PutCondition::IfChanged)
            .await
            .unwrap());
        assert_eq!(store.version(), 2);
    }

    #[tokio::test]
    async fn test_list_depth() {
        let store = MemoryStore::new();
        for key in [
            "sales/aa/key-pair",
            "sales/aa/feeds/b1",
            "sales/bb/key-pair",
            "buys/feeds/s1",
        ] {
            store.put(key, json!(key), PutCondition::Always).await.unwrap();
        }

        let all = store.list("sales", true).await.unwrap();
        assert_eq!(all.len(), 3);
        let direct = store.list("sales/aa", false).await.unwrap();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].key, "sales/aa/key-pair");

        let streamed: Vec<Node> = store.iter("buys").await.unwrap().collect().await;
        assert_eq!(streamed.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_errors() {
        let store = MemoryStore::new();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.get("k").await, Err(StoreError::Closed)));
        assert!(matches!(
            store.put("k", json!(1), PutCondition::Always).await,
            Err(StoreError::Closed)
        ));
    }
}
