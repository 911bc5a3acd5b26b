use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use super::events::{Events, SellerEvent};
use super::messaging::{Messaging, Target};
use super::ready::Ready;
use super::records::{sale_buyer_feed, sale_buyer_feeds, sale_key_pair, BuyerReKeyRecord};
use super::{validator, BuyerRecord, Market, MarketError, Validator};
use crate::crypto::{discovery_key, DiscoveryKey, EncodedKeyPair, KeyPair, PublicKey};
use crate::feed::Feed;
use crate::protocol::session::{self, SessionCtx, SessionError, SessionHandle, SessionRole};
use crate::protocol::{parse_json, Message, Peer, Validation, SELLER_ID_SIZE};
use crate::store::{PutCondition, Store};
use crate::swarm::{JoinOptions, Swarm};
use crate::transport::Transport;

/// Options for [`Market::sell`]
#[derive(Clone)]
pub struct SellerOptions {
    /// Issue every buyer its own re-keyed view of the feed
    pub unique_feed: bool,
    /// Subscription check; without one every buyer is accepted
    pub validate: Option<Validator>,
    /// Defaults to the market's interval
    pub revalidate_interval: Option<Duration>,
    /// Close sessions that failed this many checks in a row
    pub close_after_invalid: Option<u32>,
}

impl Default for SellerOptions {
    fn default() -> Self {
        Self {
            unique_feed: true,
            validate: None,
            revalidate_interval: None,
            close_after_invalid: None,
        }
    }
}

impl std::fmt::Debug for SellerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SellerOptions")
            .field("unique_feed", &self.unique_feed)
            .field("validate", &self.validate.is_some())
            .field("revalidate_interval", &self.revalidate_interval)
            .field("close_after_invalid", &self.close_after_invalid)
            .finish()
    }
}

struct SellerInner<S: Store> {
    market: Market<S>,
    feed: Feed,
    unique_feed: bool,
    validate: Validator,
    revalidate_interval: Duration,
    close_after_invalid: Option<u32>,
    seller_id: [u8; SELLER_ID_SIZE],
    key_pair: Ready<KeyPair>,
    info: RwLock<Option<Value>>,
    messaging: Messaging,
    events: Events<SellerEvent>,
    destroyed: AtomicBool,
    swarm: Mutex<Option<Arc<dyn Swarm>>>,
}

/// One offer of a feed
pub struct Seller<S: Store> {
    inner: Arc<SellerInner<S>>,
}

impl<S: Store> Clone for Seller<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Store> std::fmt::Debug for Seller<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seller")
            .field("feed", &self.inner.feed.key())
            .field("key", &self.key())
            .field("unique_feed", &self.inner.unique_feed)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl<S: Store> Seller<S> {
    pub(crate) fn new(market: Market<S>, feed: Feed, options: SellerOptions) -> Self {
        let validate = match (options.unique_feed, options.validate) {
            (false, _) => validator(|_| async { Ok::<_, String>(Some(json!({ "free": true }))) }),
            (true, Some(validate)) => validate,
            (true, None) => validator(|_| async { Ok::<_, String>(None) }),
        };
        let revalidate_interval = options
            .revalidate_interval
            .unwrap_or(market.config().revalidate_interval);

        let mut seller_id = [0u8; SELLER_ID_SIZE];
        getrandom::getrandom(&mut seller_id).expect("failed to generate random bytes");

        let seller = Self {
            inner: Arc::new(SellerInner {
                market,
                feed,
                unique_feed: options.unique_feed,
                validate,
                revalidate_interval,
                close_after_invalid: options.close_after_invalid,
                seller_id,
                key_pair: Ready::default(),
                info: RwLock::new(None),
                messaging: Messaging::new(),
                events: Events::default(),
                destroyed: AtomicBool::new(false),
                swarm: Mutex::new(None),
            }),
        };

        let this = seller.clone();
        tokio::spawn(async move {
            match this.ready().await {
                Ok(()) => this.inner.events.emit(SellerEvent::Ready),
                Err(e) => {
                    tracing::error!(feed = %this.inner.feed.key(), "seller failed to load: {}", e);
                    this.inner.events.emit(SellerEvent::Error(e.to_string()));
                }
            }
        });
        seller
    }

    /// Wait for the feed and the seller identity
    pub async fn ready(&self) -> Result<(), MarketError> {
        let inner = self.inner.clone();
        self.inner
            .key_pair
            .get_or_load(move || async move {
                inner.feed.ready().await?;
                inner.market.ready().await?;
                let key_pair = inner
                    .market
                    .load_key_pair(&sale_key_pair(&inner.feed.key()))
                    .await?;
                tracing::debug!(feed = %inner.feed.key(), seller = %key_pair.public, "seller ready");
                Ok::<_, MarketError>(key_pair)
            })
            .await
    }

    /// Identity buyers connect to, `None` before ready
    pub fn key(&self) -> Option<PublicKey> {
        self.inner.key_pair.get().map(|kp| kp.public)
    }

    pub fn key_pair(&self) -> Option<KeyPair> {
        self.inner.key_pair.get().cloned()
    }

    pub fn discovery_key(&self) -> Option<DiscoveryKey> {
        self.key().map(|key| discovery_key(&key))
    }

    /// The content feed being sold
    pub fn feed(&self) -> &Feed {
        &self.inner.feed
    }

    /// Random id of this seller instance, sent to every buyer
    pub fn seller_id(&self) -> [u8; SELLER_ID_SIZE] {
        self.inner.seller_id
    }

    /// Last info object a validate call produced
    pub fn info(&self) -> Option<Value> {
        self.inner.info.read().clone()
    }

    pub fn events(&self) -> &Events<SellerEvent> {
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

    /// Identities of the buyers with an open session
    pub fn connected_buyers(&self) -> Vec<PublicKey> {
        self.peers()
            .iter()
            .map(|peer| peer.remote_public_key())
            .collect()
    }

    /// Every buyer that was ever issued a view of this feed
    pub async fn buyers(&self) -> Result<Vec<BuyerRecord>, MarketError> {
        self.inner.feed.ready().await?;
        let nodes = self
            .inner
            .market
            .store()
            .list(&sale_buyer_feeds(&self.inner.feed.key()), false)
            .await
            .map_err(MarketError::storage)?;

        let mut list = Vec::with_capacity(nodes.len());
        for node in nodes {
            let record: BuyerReKeyRecord =
                serde_json::from_value(node.value).map_err(MarketError::storage)?;
            list.push(BuyerRecord {
                buyer: PublicKey::from_hex(&record.buyer)?,
                unique_feed: KeyPair::try_from(&record.unique_feed)?,
            });
        }
        Ok(list)
    }

    /// The feed handle `buyer` replicates
    ///
    /// With unique feeds this is a view of the content feed under a keypair that is
    /// derived once per buyer and stored with a put-if-absent.
    pub async fn unique_feed(&self, buyer: &PublicKey) -> Result<Feed, MarketError> {
        let feed = &self.inner.feed;
        feed.ready().await?;
        if !self.inner.unique_feed {
            return Ok(feed.clone());
        }

        let path = sale_buyer_feed(&feed.key(), buyer);
        let store = self.inner.market.store();
        let existing = store.get(&path).await.map_err(MarketError::storage)?;
        let key_pair = match existing {
            Some(node) => read_rekey(node.value)?,
            None => {
                let key_pair = self.inner.market.derive(&path)?;
                let record = BuyerReKeyRecord {
                    buyer: buyer.to_hex(),
                    unique_feed: EncodedKeyPair::from(&key_pair),
                };
                let value = serde_json::to_value(record).map_err(MarketError::storage)?;
                let written = store
                    .put(&path, value, PutCondition::IfAbsent)
                    .await
                    .map_err(MarketError::storage)?;
                if written {
                    tracing::info!(%buyer, view = %key_pair.public, "issued feed view");
                    key_pair
                } else {
                    let node = store
                        .get(&path)
                        .await
                        .map_err(MarketError::storage)?
                        .ok_or_else(|| MarketError::Storage(format!("{} vanished", path)))?;
                    read_rekey(node.value)?
                }
            }
        };

        Ok(feed.rekey(key_pair))
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Announce the seller identity on `swarm`
    pub async fn join(&self, swarm: Arc<dyn Swarm>) -> Result<(), MarketError> {
        if self.is_destroyed() {
            return Err(MarketError::Precondition("Seller is destroyed".to_string()));
        }
        self.ready().await?;
        let topic = self
            .discovery_key()
            .ok_or_else(|| MarketError::Precondition("Seller is not ready".to_string()))?;
        swarm
            .join(topic, JoinOptions::SELLER)
            .await
            .map_err(|e| MarketError::Storage(format!("swarm join failed: {}", e)))?;
        *self.inner.swarm.lock() = Some(swarm);
        Ok(())
    }

    /// Run the seller protocol over an authenticated connection
    pub fn replicate(&self, transport: Arc<dyn Transport>) -> Result<SessionHandle, MarketError> {
        if self.is_destroyed() {
            return Err(MarketError::Precondition("Seller is destroyed".to_string()));
        }
        let role = SellerSession {
            seller: self.clone(),
            view: None,
            valid: None,
            invalid_streak: 0,
        };
        Ok(session::spawn(role, transport))
    }

    /// Stop selling. Safe to call more than once.
    pub async fn destroy(&self) -> Result<(), MarketError> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready().await?;

        let swarm = self.inner.swarm.lock().take();
        if let (Some(swarm), Some(topic)) = (swarm, self.discovery_key()) {
            if let Err(e) = swarm.leave(topic).await {
                tracing::warn!("failed to leave swarm: {}", e);
            }
        }
        for peer in self.peers() {
            peer.close("Seller is destroyed");
        }
        self.inner.feed.close();
        tracing::debug!(feed = %self.inner.feed.key(), "seller destroyed");
        Ok(())
    }
}

fn read_rekey(value: Value) -> Result<KeyPair, MarketError> {
    let record: BuyerReKeyRecord = serde_json::from_value(value).map_err(MarketError::storage)?;
    Ok(KeyPair::try_from(&record.unique_feed)?)
}

struct SellerSession<S: Store> {
    seller: Seller<S>,
    /// Feed handle issued on the first successful check
    view: Option<Feed>,
    valid: Option<bool>,
    invalid_streak: u32,
}

impl<S: Store> SellerSession<S> {
    fn start_validation(&mut self, ctx: &mut SessionCtx) {
        if self.seller.is_destroyed() || ctx.is_validating() {
            return;
        }
        let buyer = ctx.peer().remote_public_key();
        self.seller
            .inner
            .events
            .emit(SellerEvent::BuyerValidate(buyer));
        ctx.validate((self.seller.inner.validate)(buyer));
    }

    async fn issue_view(&mut self, ctx: &mut SessionCtx) -> Result<Feed, SessionError> {
        if let Some(view) = &self.view {
            return Ok(view.clone());
        }
        let buyer = ctx.peer().remote_public_key();
        let view = self
            .seller
            .unique_feed(&buyer)
            .await
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        if self.seller.inner.unique_feed {
            self.seller.inner.events.emit(SellerEvent::BuyerFeed {
                buyer,
                feed: view.clone(),
            });
        }
        ctx.send(Message::OneTimeFeed(view.key()));
        ctx.replicate(view.clone());
        self.view = Some(view.clone());
        Ok(view)
    }
}

#[async_trait]
impl<S: Store> SessionRole for SellerSession<S> {
    fn name(&self) -> &'static str {
        "seller"
    }

    fn messaging(&self) -> &Messaging {
        &self.seller.inner.messaging
    }

    fn shutdown_reason(&self) -> Option<&'static str> {
        self.seller.is_destroyed().then_some("Seller is destroyed")
    }

    async fn ready(&mut self) -> Result<(), SessionError> {
        self.seller
            .ready()
            .await
            .map_err(|e| SessionError::Storage(e.to_string()))
    }

    async fn authenticate(&mut self, _remote: &PublicKey) -> Result<(), SessionError> {
        Ok(())
    }

    async fn opened(&mut self, ctx: &mut SessionCtx) {
        self.seller
            .inner
            .events
            .emit(SellerEvent::PeerAdded(ctx.peer().clone()));
    }

    async fn handshake(&mut self, ctx: &mut SessionCtx) -> Result<(), SessionError> {
        ctx.send(Message::SellerId(self.seller.inner.seller_id));
        self.start_validation(ctx);
        Ok(())
    }

    async fn message(&mut self, ctx: &mut SessionCtx, msg: Message) -> Result<(), SessionError> {
        let remote = ctx.peer().remote_public_key();
        match msg {
            Message::Valid(raw) => match parse_json(&raw) {
                Ok(info) => self
                    .seller
                    .inner
                    .events
                    .emit(SellerEvent::Valid { info, remote }),
                Err(e) => tracing::warn!("dropping malformed valid message: {}", e),
            },
            Message::Invalid { error } => {
                tracing::debug!(%error, "buyer reported seller invalid");
                self.seller
                    .inner
                    .events
                    .emit(SellerEvent::Invalid { error, remote });
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
        if self.seller.is_destroyed() {
            return Ok(());
        }
        let buyer = ctx.peer().remote_public_key();

        match result {
            Ok(info) => {
                let view = self.issue_view(ctx).await?;
                view.set_uploading(true);
                self.valid = Some(true);
                self.invalid_streak = 0;

                let info = info.filter(|info| !info.is_null());
                if let Some(info) = &info {
                    *self.seller.inner.info.write() = Some(info.clone());
                    ctx.send(Message::valid(info));
                }
                self.seller
                    .inner
                    .events
                    .emit(SellerEvent::BuyerValid { buyer, info });
            }
            Err(error) => {
                if let Some(view) = &self.view {
                    view.set_uploading(false);
                }
                if self.valid != Some(false) {
                    self.valid = Some(false);
                    ctx.send(Message::Invalid {
                        error: error.clone(),
                    });
                    self.seller.inner.events.emit(SellerEvent::BuyerInvalid {
                        buyer,
                        error: error.clone(),
                    });
                }

                self.invalid_streak += 1;
                if let Some(limit) = self.seller.inner.close_after_invalid {
                    if self.invalid_streak >= limit {
                        tracing::info!(%buyer, checks = self.invalid_streak, "closing invalid session");
                        ctx.peer().close(format!("Subscription invalid: {}", error));
                        return Ok(());
                    }
                }
            }
        }

        ctx.schedule(self.seller.inner.revalidate_interval);
        Ok(())
    }

    async fn revalidate(&mut self, ctx: &mut SessionCtx) -> Result<(), SessionError> {
        self.start_validation(ctx);
        Ok(())
    }

    async fn closed(&mut self, ctx: &mut SessionCtx, _result: &Result<(), SessionError>) {
        ctx.cancel_timer();
        if let Some(view) = self.view.take() {
            if view.key() != self.seller.inner.feed.key() {
                view.close();
            }
        }
        self.seller
            .inner
            .events
            .emit(SellerEvent::PeerRemoved(ctx.peer().clone()));
    }
}
