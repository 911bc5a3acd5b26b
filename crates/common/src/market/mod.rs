//! Identity store, buyers and sellers
//!
//! A [`Market`] owns the master key and the storage handle. Every identity it
//! uses is derived from the master key, so the store only needs to remember the
//! master key itself plus a few caches that let listings work without a live
//! connection.

mod buyer;
mod events;
mod messaging;
mod ready;
pub mod records;
mod seller;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use crate::crypto::{EncodedKeyPair, KeyError, KeyPair, MasterKey, PublicKey};
use crate::feed::Feed;
use crate::protocol::Validation;
use crate::store::{PutCondition, Store};
use ready::Ready;

pub use buyer::{Buyer, BuyerOptions};
pub use events::{BuyerEvent, Events, SellerEvent};
pub use messaging::{MessageHandler, Messaging, Target};
pub use records::{BuyerRecord, BuyingRecord, SellingRecord};
pub use seller::{Seller, SellerOptions};

use records::{BuyerFeedRecord, BUYER_FEEDS, BUYER_KEY_PAIR, MASTER_KEY, SALES};

/// Default time between two validate calls on one session
pub const DEFAULT_REVALIDATE_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, thiserror::Error)]
pub enum MarketError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{0}")]
    Precondition(String),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("feed error: {0}")]
    Feed(#[from] crate::feed::FeedError),
}

impl MarketError {
    pub(crate) fn storage(e: impl Display) -> Self {
        MarketError::Storage(e.to_string())
    }
}

/// Host supplied subscription check
pub type Validator = Arc<dyn Fn(PublicKey) -> BoxFuture<'static, Validation> + Send + Sync>;

/// Wrap an async check into a [`Validator`]
///
/// `Ok(Some(info))` accepts and forwards `info` to the remote,
/// `Ok(None)` accepts silently and `Err(e)` rejects with `e`'s text.
pub fn validator<F, Fut, E>(f: F) -> Validator
where
    F: Fn(PublicKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, E>> + Send + 'static,
    E: Display,
{
    Arc::new(move |key| {
        f(key)
            .map(|result| result.map_err(|e| e.to_string()))
            .boxed()
    })
}

/// Library level defaults
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Used only if the store holds no master key yet
    pub master_key: Option<MasterKey>,
    /// Applied to buyers and sellers that do not set their own
    pub revalidate_interval: Duration,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            revalidate_interval: DEFAULT_REVALIDATE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
struct Identity {
    master: MasterKey,
    buyer: KeyPair,
}

struct MarketInner<S: Store> {
    store: S,
    config: MarketConfig,
    identity: Ready<Identity>,
}

/// Owner of the master key and storage
pub struct Market<S: Store> {
    inner: Arc<MarketInner<S>>,
}

impl<S: Store> Clone for Market<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Store> std::fmt::Debug for Market<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Market")
            .field("store", &self.inner.store)
            .field("buyer", &self.buyer())
            .finish()
    }
}

impl<S: Store> Market<S> {
    pub fn new(store: S, config: MarketConfig) -> Self {
        Self {
            inner: Arc::new(MarketInner {
                store,
                config,
                identity: Ready::default(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &MarketConfig {
        &self.inner.config
    }

    /// Load or create the master key
    ///
    /// Concurrent calls share one bootstrap and see the same result. A failed
    /// bootstrap is retried by the next call.
    pub async fn ready(&self) -> Result<(), MarketError> {
        let this = self.clone();
        self.inner
            .identity
            .get_or_load(move || async move { this.bootstrap().await })
            .await
    }

    async fn bootstrap(&self) -> Result<Identity, MarketError> {
        let store = &self.inner.store;
        let master = match self.read_master_key().await? {
            Some(master) => master,
            None => {
                let candidate = self
                    .inner
                    .config
                    .master_key
                    .clone()
                    .unwrap_or_else(MasterKey::generate);
                let written = store
                    .put(
                        MASTER_KEY,
                        Value::String(candidate.to_hex()),
                        PutCondition::IfAbsent,
                    )
                    .await
                    .map_err(MarketError::storage)?;
                if written {
                    tracing::info!("generated new master key");
                    candidate
                } else {
                    self.read_master_key().await?.ok_or_else(|| {
                        MarketError::Storage("master key vanished during bootstrap".to_string())
                    })?
                }
            }
        };

        let buyer = master.derive(BUYER_KEY_PAIR);
        tracing::debug!(buyer = %buyer.public, "market ready");
        Ok(Identity { master, buyer })
    }

    async fn read_master_key(&self) -> Result<Option<MasterKey>, MarketError> {
        let node = self
            .inner
            .store
            .get(MASTER_KEY)
            .await
            .map_err(MarketError::storage)?;
        let Some(node) = node else {
            return Ok(None);
        };
        let hex = node
            .value
            .as_str()
            .ok_or_else(|| MarketError::Storage("master key is not a string".to_string()))?;
        let master = MasterKey::from_hex(hex).map_err(MarketError::storage)?;
        Ok(Some(master))
    }

    fn identity(&self) -> Result<&Identity, MarketError> {
        self.inner
            .identity
            .get()
            .ok_or_else(|| MarketError::Precondition("Market is not ready".to_string()))
    }

    /// Buyer identity, `None` before `ready`
    pub fn buyer(&self) -> Option<PublicKey> {
        self.inner.identity.get().map(|id| id.buyer.public)
    }

    /// Keypair buyers created by this market authenticate with
    pub fn key_pair(&self) -> Option<KeyPair> {
        self.inner.identity.get().map(|id| id.buyer.clone())
    }

    pub fn master_key(&self) -> Result<MasterKey, MarketError> {
        Ok(self.identity()?.master.clone())
    }

    /// Derive the keypair for `context` from the master key
    pub fn derive(&self, context: &str) -> Result<KeyPair, MarketError> {
        Ok(self.identity()?.master.derive(context))
    }

    /// Get-or-create the keypair stored under `path`
    ///
    /// A missing keypair is derived from `path` and written with a put-if-absent,
    /// so concurrent creators agree on one record.
    pub(crate) async fn load_key_pair(&self, path: &str) -> Result<KeyPair, MarketError> {
        if let Some(key_pair) = self.read_key_pair(path).await? {
            return Ok(key_pair);
        }

        let key_pair = self.derive(path)?;
        let value = serde_json::to_value(EncodedKeyPair::from(&key_pair))
            .map_err(MarketError::storage)?;
        let written = self
            .inner
            .store
            .put(path, value, PutCondition::IfAbsent)
            .await
            .map_err(MarketError::storage)?;
        if written {
            return Ok(key_pair);
        }
        self.read_key_pair(path)
            .await?
            .ok_or_else(|| MarketError::Storage(format!("key pair at {} vanished", path)))
    }

    async fn read_key_pair(&self, path: &str) -> Result<Option<KeyPair>, MarketError> {
        let Some(node) = self
            .inner
            .store
            .get(path)
            .await
            .map_err(MarketError::storage)?
        else {
            return Ok(None);
        };
        let encoded: EncodedKeyPair =
            serde_json::from_value(node.value).map_err(MarketError::storage)?;
        Ok(Some(KeyPair::try_from(&encoded)?))
    }

    /// Store a config value; returns false if it was unchanged
    pub async fn set_config<T: Serialize>(&self, key: &str, value: T) -> Result<bool, MarketError> {
        let value = serde_json::to_value(value).map_err(MarketError::storage)?;
        self.inner
            .store
            .put(&records::config_key(key), value, PutCondition::IfChanged)
            .await
            .map_err(MarketError::storage)
    }

    pub async fn get_config<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MarketError> {
        let node = self
            .inner
            .store
            .get(&records::config_key(key))
            .await
            .map_err(MarketError::storage)?;
        match node {
            Some(node) => Ok(Some(
                serde_json::from_value(node.value).map_err(MarketError::storage)?,
            )),
            None => Ok(None),
        }
    }

    /// Sellers this market has bought from, with the feed each issued
    pub async fn list_buying(&self) -> Result<Vec<BuyingRecord>, MarketError> {
        let nodes = self
            .inner
            .store
            .list(BUYER_FEEDS, false)
            .await
            .map_err(MarketError::storage)?;

        let mut list = Vec::with_capacity(nodes.len());
        for node in nodes {
            let record: BuyerFeedRecord = match serde_json::from_value(node.value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %node.key, "skipping malformed buyer record: {}", e);
                    continue;
                }
            };
            list.push(BuyingRecord {
                seller: PublicKey::from_hex(&record.seller)?,
                unique_feed: PublicKey::from_hex(&record.unique_feed)?,
            });
        }
        Ok(list)
    }

    /// Feeds this market sells, with the identity each is sold under
    pub async fn list_selling(&self) -> Result<Vec<SellingRecord>, MarketError> {
        let nodes = self
            .inner
            .store
            .list(SALES, true)
            .await
            .map_err(MarketError::storage)?;

        let mut list = Vec::new();
        for node in nodes {
            let Some(feed) = records::parse_sale_key_pair_path(&node.key) else {
                continue;
            };
            let encoded: EncodedKeyPair =
                serde_json::from_value(node.value).map_err(MarketError::storage)?;
            list.push(SellingRecord {
                seller: PublicKey::from_hex(&encoded.public_key)?,
                feed: PublicKey::from_hex(feed)?,
            });
        }
        Ok(list)
    }

    /// Offer `feed` for sale
    ///
    /// Must be called within a Tokio runtime.
    pub fn sell(&self, feed: Feed, options: SellerOptions) -> Seller<S> {
        Seller::new(self.clone(), feed, options)
    }

    /// Buy from the seller identified by `seller`
    ///
    /// Must be called within a Tokio runtime.
    pub fn buy(&self, seller: PublicKey, options: BuyerOptions) -> Buyer<S> {
        Buyer::new(self.clone(), seller, options)
    }

    /// Release the storage handle
    pub async fn destroy(&self) -> Result<(), MarketError> {
        self.inner
            .store
            .close()
            .await
            .map_err(MarketError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Node, StoreError};
    use serde_json::json;

    #[tokio::test]
    async fn test_ready_is_idempotent_under_concurrency() {
        let store = MemoryStore::new();
        let market = Market::new(store.clone(), MarketConfig::default());
        assert!(market.buyer().is_none());
        assert!(matches!(
            market.master_key(),
            Err(MarketError::Precondition(_))
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let market = market.clone();
                tokio::spawn(async move {
                    market.ready().await.unwrap();
                    market.buyer().unwrap()
                })
            })
            .collect();

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap());
        }
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        // exactly one write: the master key
        assert_eq!(store.version(), 1);
    }

    /// A store whose reads fail after a short delay
    #[derive(Debug, Clone, Default)]
    struct BrokenStore {
        gets: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Store for BrokenStore {
        type Error = String;

        async fn get(&self, _key: &str) -> Result<Option<Node>, StoreError<String>> {
            let n = self.gets.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(StoreError::Provider(format!("disk gone ({})", n)))
        }

        async fn put(
            &self,
            _key: &str,
            _value: Value,
            _condition: PutCondition,
        ) -> Result<bool, StoreError<String>> {
            Err(StoreError::Closed)
        }

        async fn list(
            &self,
            _prefix: &str,
            _recursive: bool,
        ) -> Result<Vec<Node>, StoreError<String>> {
            Err(StoreError::Closed)
        }

        async fn close(&self) -> Result<(), StoreError<String>> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_ready_is_shared_by_concurrent_callers() {
        let store = BrokenStore::default();
        let market = Market::new(store.clone(), MarketConfig::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let market = market.clone();
                tokio::spawn(async move { market.ready().await })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(
                matches!(&err, MarketError::Storage(msg) if msg.contains("disk gone (0)")),
                "unexpected error: {}",
                err
            );
        }
        assert_eq!(store.gets.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(market.buyer().is_none());

        // no internal retry, but the next call tries again
        assert!(market.ready().await.is_err());
        assert_eq!(store.gets.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_master_key_survives_reopen() {
        let store = MemoryStore::new();
        let first = Market::new(store.clone(), MarketConfig::default());
        first.ready().await.unwrap();

        let supplied = MasterKey::generate();
        let second = Market::new(
            store,
            MarketConfig {
                master_key: Some(supplied.clone()),
                ..Default::default()
            },
        );
        second.ready().await.unwrap();

        assert_eq!(first.buyer(), second.buyer());
        assert_ne!(second.master_key().unwrap(), supplied);
    }

    #[tokio::test]
    async fn test_supplied_master_key_is_used_when_empty() {
        let master = MasterKey::generate();
        let market = Market::new(
            MemoryStore::new(),
            MarketConfig {
                master_key: Some(master.clone()),
                ..Default::default()
            },
        );
        market.ready().await.unwrap();
        assert_eq!(market.master_key().unwrap(), master);
        assert_eq!(
            market.buyer().unwrap(),
            master.derive(BUYER_KEY_PAIR).public
        );
    }

    #[tokio::test]
    async fn test_set_config_suppresses_unchanged_writes() {
        let store = MemoryStore::new();
        let market = Market::new(store.clone(), MarketConfig::default());

        assert!(market.set_config("plan", json!({"price": 5})).await.unwrap());
        let version = store.version();
        assert!(!market.set_config("plan", json!({"price": 5})).await.unwrap());
        assert_eq!(store.version(), version);
        assert!(market.set_config("plan", json!({"price": 6})).await.unwrap());

        let plan: Value = market.get_config("plan").await.unwrap().unwrap();
        assert_eq!(plan, json!({"price": 6}));
        assert!(market.get_config::<Value>("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_key_pair_is_stable() {
        let market = Market::new(MemoryStore::new(), MarketConfig::default());
        market.ready().await.unwrap();

        let a = market.load_key_pair("sales/aa/key-pair").await.unwrap();
        let b = market.load_key_pair("sales/aa/key-pair").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, market.derive("sales/aa/key-pair").unwrap());
    }

    #[tokio::test]
    async fn test_destroy_closes_store() {
        let store = MemoryStore::new();
        let market = Market::new(store.clone(), MarketConfig::default());
        market.destroy().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(market.ready().await, Err(MarketError::Storage(_))));
    }
}
