use std::fmt::{Debug, Display};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A versioned record in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: String,
    pub value: Value,
    /// Store-wide write sequence at which this value was written
    pub seq: u64,
}

/// When a `put` is allowed to take effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutCondition {
    /// Unconditional last-write-wins
    #[default]
    Always,
    /// Only write if nothing is stored under the key
    IfAbsent,
    /// Only write if the stored value differs from the new one
    IfChanged,
}

impl PutCondition {
    /// Decide whether a write of `value` over `existing` should happen
    pub fn allows(&self, existing: Option<&Value>, value: &Value) -> bool {
        match (self, existing) {
            (PutCondition::Always, _) => true,
            (PutCondition::IfAbsent, existing) => existing.is_none(),
            (PutCondition::IfChanged, Some(existing)) => existing != value,
            (PutCondition::IfChanged, None) => true,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError<T> {
    #[error("unhandled store provider error: {0}")]
    Provider(#[from] T),
    /// The store was closed
    #[error("store is closed")]
    Closed,
    /// A stored value did not have the expected shape -- key, reason
    #[error("invalid record at {0}: {1}")]
    InvalidRecord(String, String),
}

/// Hierarchical key-value storage with JSON values.
///
/// Keys are `/` separated paths. Implementations must make conditional
/// writes atomic with respect to each other: two concurrent `IfAbsent`
/// puts on the same key must result in exactly one write.
#[async_trait]
pub trait Store: Send + Sync + Debug + Clone + 'static {
    type Error: Display + Debug + Send + Sync + 'static;

    async fn get(&self, key: &str) -> Result<Option<Node>, StoreError<Self::Error>>;

    /// Write `value` under `key` if `condition` allows it
    ///
    /// # Returns
    /// * `Ok(true)` - the value was written
    /// * `Ok(false)` - the condition suppressed the write
    async fn put(
        &self,
        key: &str,
        value: Value,
        condition: PutCondition,
    ) -> Result<bool, StoreError<Self::Error>>;

    /// List nodes under `prefix`, ordered by key
    ///
    /// With `recursive` set every descendant is returned, otherwise only
    /// the direct children of `prefix`.
    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<Node>, StoreError<Self::Error>>;

    /// Stream every node under `prefix`
    async fn iter(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, Node>, StoreError<Self::Error>> {
        let nodes = self.list(prefix, true).await?;
        Ok(stream::iter(nodes).boxed())
    }

    async fn close(&self) -> Result<(), StoreError<Self::Error>>;
}

/// Normalize a prefix to end in exactly one `/`, or be empty
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Whether `key` sits under `prefix` (already normalized) at the requested depth
pub fn matches_prefix(key: &str, prefix: &str, recursive: bool) -> bool {
    match key.strip_prefix(prefix) {
        Some(rest) if !rest.is_empty() => recursive || !rest.contains('/'),
        _ => false,
    }
}
