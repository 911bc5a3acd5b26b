use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;

use super::events::{BuyerEvent, Events};
use super::messaging::{Messaging, Target};
use super::ready::Ready;
use super::records::{buyer_feed_cache, BuyerFeedRecord};
use super::{Market, MarketError, Validator};
use crate::crypto::{discovery_key, DiscoveryKey, KeyPair, PublicKey};
use crate::feed::Feed;
use crate::protocol::session::{self, SessionCtx, SessionError, SessionHandle, SessionRole};
use crate::protocol::{parse_json, Message, Peer, Validation};
use crate::store::{PutCondition, Store};
use crate::swarm::{JoinOptions, Swarm};
use crate::transport::Transport;

/// Options for [`Market::buy`]
#[derive(Clone, Default)]
pub struct BuyerOptions {
    /// Only download entries that are read
    pub sparse: bool,
    /// Check the seller before and while downloading
    pub validate: Option<Validator>,
    /// Defaults to the market's interval
    pub revalidate_interval: Option<Duration>,
}

impl std::fmt::Debug for BuyerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuyerOptions")
            .field("sparse", &self.sparse)
            .field("validate", &self.validate.is_some())
            .field("revalidate_interval", &self.revalidate_interval)
            .finish()
    }
}

struct BuyerInner<S: Store> {
    market: Market<S>,
    seller: PublicKey,
    sparse: bool,
    validate: Option<Validator>,
    revalidate_interval: Duration,
    feed: watch::Sender<Option<Feed>>,
    info: RwLock<Option<Value>>,
    messaging: Messaging,
    events: Events<BuyerEvent>,
    loaded: Ready<()>,
    destroyed: AtomicBool,
    swarm: Mutex<Option<Arc<dyn Swarm>>>,
}

/// One purchase relationship with a seller
pub struct Buyer<S: Store> {
    inner: Arc<BuyerInner<S>>,
}

impl<S: Store> Clone for Buyer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Store> std::fmt::Debug for Buyer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buyer")
            .field("seller", &self.inner.seller)
            .field("feed", &self.feed().map(|feed| feed.key()))
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl<S: Store> Buyer<S> {
    pub(crate) fn new(market: Market<S>, seller: PublicKey, options: BuyerOptions) -> Self {
        let revalidate_interval = options
            .revalidate_interval
            .unwrap_or(market.config().revalidate_interval);
        let (feed, _) = watch::channel(None);
        let buyer = Self {
            inner: Arc::new(BuyerInner {
                market,
                seller,
                sparse: options.sparse,
                validate: options.validate,
                revalidate_interval,
                feed,
                info: RwLock::new(None),
                messaging: Messaging::new(),
                events: Events::default(),
                loaded: Ready::default(),
                destroyed: AtomicBool::new(false),
                swarm: Mutex::new(None),
            }),
        };

        let this = buyer.clone();
        tokio::spawn(async move {
            match this.ready().await {
                Ok(()) => this.inner.events.emit(BuyerEvent::Ready),
                Err(e) => {
                    tracing::error!(seller = %this.inner.seller, "buyer failed to load: {}", e);
                    this.inner.events.emit(BuyerEvent::Error(e.to_string()));
                }
            }
        });
        buyer
    }

    /// Wait for the market identity and any cached feed
    pub async fn ready(&self) -> Result<(), MarketError> {
        let this = self.clone();
        self.inner
            .loaded
            .get_or_load(move || async move { this.load().await })
            .await
    }

    async fn load(&self) -> Result<(), MarketError> {
        self.inner.market.ready().await?;
        let node = self
            .inner
            .market
            .store()
            .get(&buyer_feed_cache(&self.inner.seller))
            .await
            .map_err(MarketError::storage)?;
        if let Some(node) = node {
            let record: BuyerFeedRecord =
                serde_json::from_value(node.value).map_err(MarketError::storage)?;
            let key = PublicKey::from_hex(&record.unique_feed)?;
            tracing::debug!(seller = %self.inner.seller, feed = %key, "loaded cached feed");
            self.set_feed(key).await?;
        }
        Ok(())
    }

    /// Create the replica of the issued feed, once
    async fn set_feed(&self, key: PublicKey) -> Result<Option<Feed>, MarketError> {
        let mut created = None;
        self.inner.feed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            let feed = Feed::replica(key, self.inner.sparse);
            *current = Some(feed.clone());
            created = Some(feed);
            true
        });

        let Some(feed) = created else {
            let existing = self.feed();
            if let Some(existing) = &existing {
                if existing.key() != key {
                    tracing::warn!(
                        cached = %existing.key(),
                        offered = %key,
                        "seller offered a different feed than the one cached"
                    );
                }
            }
            return Ok(existing);
        };

        let record = BuyerFeedRecord {
            seller: self.inner.seller.to_hex(),
            unique_feed: key.to_hex(),
        };
        let value = serde_json::to_value(record).map_err(MarketError::storage)?;
        self.inner
            .market
            .store()
            .put(
                &buyer_feed_cache(&self.inner.seller),
                value,
                PutCondition::IfAbsent,
            )
            .await
            .map_err(MarketError::storage)?;

        feed.ready().await?;
        self.inner.events.emit(BuyerEvent::Feed(feed.clone()));
        Ok(Some(feed))
    }

    /// Seller identity this buyer is pinned to
    pub fn key(&self) -> PublicKey {
        self.inner.seller
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        discovery_key(&self.inner.seller)
    }

    /// Keypair sessions authenticate with, `None` before ready
    pub fn key_pair(&self) -> Option<KeyPair> {
        self.inner.market.key_pair()
    }

    /// Replica of the purchased feed, once issued
    pub fn feed(&self) -> Option<Feed> {
        self.inner.feed.borrow().clone()
    }

    /// Last info object the seller sent with a valid message
    pub fn info(&self) -> Option<Value> {
        self.inner.info.read().clone()
    }

    pub fn events(&self) -> &Events<BuyerEvent> {
        &self.inner.events
    }

    pub fn messaging(&self) -> &Messaging {
        &self.inner.messaging
    }

    pub fn receive<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, &Peer) + Send + Sync + 'static,
    {
        self.inner.messaging.receive(name, handler);
    }

    pub fn send(&self, name: &str, message: &Value, target: impl Into<Target>) -> usize {
        self.inner.messaging.send(name, message, target)
    }

    pub fn broadcast(&self, name: &str, message: &Value) -> usize {
        self.inner.messaging.broadcast(name, message)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.messaging.peers()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Look for the seller on `swarm`
    pub async fn join(&self, swarm: Arc<dyn Swarm>) -> Result<(), MarketError> {
        if self.is_destroyed() {
            return Err(MarketError::Precondition("Buyer is destroyed".to_string()));
        }
        swarm
            .join(self.discovery_key(), JoinOptions::BUYER)
            .await
            .map_err(|e| MarketError::Storage(format!("swarm join failed: {}", e)))?;
        *self.inner.swarm.lock() = Some(swarm);
        Ok(())
    }

    /// Run the buyer protocol over an authenticated connection
    pub fn replicate(&self, transport: Arc<dyn Transport>) -> Result<SessionHandle, MarketError> {
        if self.is_destroyed() {
            return Err(MarketError::Precondition("Buyer is destroyed".to_string()));
        }
        let role = BuyerSession {
            buyer: self.clone(),
            valid: None,
        };
        Ok(session::spawn(role, transport))
    }

    /// Stop buying. Safe to call more than once.
    pub async fn destroy(&self) -> Result<(), MarketError> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready().await?;

        let swarm = self.inner.swarm.lock().take();
        if let Some(swarm) = swarm {
            if let Err(e) = swarm.leave(self.discovery_key()).await {
                tracing::warn!("failed to leave swarm: {}", e);
            }
        }
        for peer in self.peers() {
            peer.close("Buyer is destroyed");
        }
        if let Some(feed) = self.feed() {
            feed.close();
        }
        tracing::debug!(seller = %self.inner.seller, "buyer destroyed");
        Ok(())
    }
}

struct BuyerSession<S: Store> {
    buyer: Buyer<S>,
    /// Result of the last local check of the seller
    valid: Option<bool>,
}

impl<S: Store> BuyerSession<S> {
    fn start_validation(&mut self, ctx: &mut SessionCtx) {
        let inner = &self.buyer.inner;
        let (Some(validate), Some(feed)) = (&inner.validate, self.buyer.feed()) else {
            return;
        };
        if self.buyer.is_destroyed() || ctx.is_validating() {
            return;
        }
        feed.set_downloading(false);
        let seller = ctx.peer().remote_public_key();
        inner.events.emit(BuyerEvent::SellerValidate(seller));
        ctx.validate(validate(seller));
    }

    fn wait_for_feed(&self) -> futures::future::BoxFuture<'static, ()> {
        let mut rx = self.buyer.inner.feed.subscribe();
        async move {
            let _ = rx.wait_for(|feed| feed.is_some()).await;
        }
        .boxed()
    }
}

#[async_trait]
impl<S: Store> SessionRole for BuyerSession<S> {
    fn name(&self) -> &'static str {
        "buyer"
    }

    fn messaging(&self) -> &Messaging {
        &self.buyer.inner.messaging
    }

    fn shutdown_reason(&self) -> Option<&'static str> {
        self.buyer.is_destroyed().then_some("Buyer is destroyed")
    }

    async fn ready(&mut self) -> Result<(), SessionError> {
        self.buyer
            .ready()
            .await
            .map_err(|e| SessionError::Storage(e.to_string()))
    }

    async fn authenticate(&mut self, remote: &PublicKey) -> Result<(), SessionError> {
        let expected = self.buyer.inner.seller;
        if *remote != expected {
            self.buyer.inner.events.emit(BuyerEvent::Invalid {
                error: "Not connected to seller".to_string(),
                remote: *remote,
            });
            return Err(SessionError::AuthenticationMismatch {
                expected,
                actual: *remote,
            });
        }
        Ok(())
    }

    async fn opened(&mut self, ctx: &mut SessionCtx) {
        self.buyer
            .inner
            .events
            .emit(BuyerEvent::PeerAdded(ctx.peer().clone()));
    }

    async fn handshake(&mut self, ctx: &mut SessionCtx) -> Result<(), SessionError> {
        if self.buyer.inner.validate.is_none() {
            return Ok(());
        }
        if self.buyer.feed().is_some() {
            self.start_validation(ctx);
        } else {
            ctx.wake_on(self.wait_for_feed());
        }
        Ok(())
    }

    async fn woken(&mut self, ctx: &mut SessionCtx) -> Result<(), SessionError> {
        self.start_validation(ctx);
        Ok(())
    }

    async fn message(&mut self, ctx: &mut SessionCtx, msg: Message) -> Result<(), SessionError> {
        let remote = ctx.peer().remote_public_key();
        match msg {
            Message::OneTimeFeed(key) => {
                let feed = self
                    .buyer
                    .set_feed(key)
                    .await
                    .map_err(|e| SessionError::Storage(e.to_string()))?;
                let Some(feed) = feed else {
                    return Ok(());
                };
                // hold downloads until our own check of the seller passes
                if self.buyer.inner.validate.is_some() && self.valid != Some(true) {
                    feed.set_downloading(false);
                }
                self.buyer.inner.events.emit(BuyerEvent::Validated {
                    feed: key,
                    peer: ctx.peer().clone(),
                });
                ctx.replicate(feed);
            }
            Message::SellerId(id) => {
                self.buyer.inner.events.emit(BuyerEvent::SellerId {
                    id,
                    peer: ctx.peer().clone(),
                });
            }
            Message::Valid(raw) => {
                let info = match parse_json(&raw) {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::warn!("dropping malformed valid message: {}", e);
                        return Ok(());
                    }
                };
                *self.buyer.inner.info.write() = Some(info.clone());
                self.buyer
                    .inner
                    .events
                    .emit(BuyerEvent::Valid { info, remote });
            }
            Message::Invalid { error } => {
                tracing::debug!(%error, "seller reported subscription invalid");
                self.buyer
                    .inner
                    .events
                    .emit(BuyerEvent::Invalid { error, remote });
            }
            other => tracing::debug!(channel = ?other.channel(), "ignoring frame"),
        }
        Ok(())
    }

    async fn validated(
        &mut self,
        ctx: &mut SessionCtx,
        result: Validation,
    ) -> Result<(), SessionError> {
        if self.buyer.is_destroyed() {
            return Ok(());
        }
        let seller = ctx.peer().remote_public_key();
        let events = &self.buyer.inner.events;
        let feed = self.buyer.feed();

        match result {
            Ok(info) => {
                if let Some(feed) = &feed {
                    feed.set_downloading(true);
                }
                self.valid = Some(true);
                let info = info.filter(|info| !info.is_null());
                if let Some(info) = &info {
                    ctx.send(Message::valid(info));
                }
                events.emit(BuyerEvent::SellerValid { seller, info });
            }
            Err(error) => {
                if let Some(feed) = &feed {
                    feed.set_downloading(false);
                }
                if self.valid != Some(false) {
                    self.valid = Some(false);
                    ctx.send(Message::Invalid {
                        error: error.clone(),
                    });
                    events.emit(BuyerEvent::SellerInvalid { seller, error });
                }
            }
        }

        ctx.schedule(self.buyer.inner.revalidate_interval);
        Ok(())
    }

    async fn revalidate(&mut self, ctx: &mut SessionCtx) -> Result<(), SessionError> {
        self.start_validation(ctx);
        Ok(())
    }

    async fn closed(&mut self, ctx: &mut SessionCtx, _result: &Result<(), SessionError>) {
        ctx.cancel_timer();
        self.buyer
            .inner
            .events
            .emit(BuyerEvent::PeerRemoved(ctx.peer().clone()));
    }
}
