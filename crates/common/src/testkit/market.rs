use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::crypto::PublicKey;
use crate::feed::Feed;
use crate::market::{Buyer, Market, MarketConfig, Seller, SellerOptions};
use crate::protocol::{SessionError, SessionHandle};
use crate::store::MemoryStore;
use crate::transport::MemoryTransport;

/// Default wait used by [`next_event`]
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A named market over an in-memory store
pub struct TestMarket {
    pub name: String,
    pub store: MemoryStore,
    pub market: Market<MemoryStore>,
}

impl TestMarket {
    /// Create a market and wait for its identity
    pub async fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_config(name, MarketConfig::default()).await
    }

    pub async fn with_config(name: impl Into<String>, config: MarketConfig) -> Result<Self> {
        let store = MemoryStore::new();
        let market = Market::new(store.clone(), config);
        market.ready().await?;
        Ok(Self {
            name: name.into(),
            store,
            market,
        })
    }

    /// Buyer identity of this market
    pub fn buyer_key(&self) -> Result<PublicKey> {
        self.market
            .buyer()
            .ok_or_else(|| anyhow!("market {} is not ready", self.name))
    }

    /// Sell a freshly generated feed holding `entries`
    pub async fn sell_entries(
        &self,
        entries: &[&str],
        options: SellerOptions,
    ) -> Result<Seller<MemoryStore>> {
        let feed = Feed::generate();
        for entry in entries {
            feed.append(entry.to_string())?;
        }
        let seller = self.market.sell(feed, options);
        seller.ready().await?;
        Ok(seller)
    }
}

/// Both ends of one in-process buyer/seller connection
#[derive(Debug)]
pub struct Connection {
    pub buyer: SessionHandle,
    pub seller: SessionHandle,
}

impl Connection {
    /// Close the buyer side and wait for both sessions to end
    pub async fn close(self) -> (Result<(), SessionError>, Result<(), SessionError>) {
        self.buyer.close("test finished");
        let buyer = self.buyer.join().await;
        let seller = self.seller.join().await;
        (buyer, seller)
    }
}

/// Connect `buyer` to `seller` with correctly authenticated identities
pub async fn connect(
    buyer: &Buyer<MemoryStore>,
    seller: &Seller<MemoryStore>,
) -> Result<Connection> {
    seller.ready().await?;
    let seller_key = seller
        .key()
        .ok_or_else(|| anyhow!("seller has no identity"))?;
    connect_with_key(buyer, seller, seller_key).await
}

/// Connect `buyer` to `seller` while the seller end claims to be `seller_key`
pub async fn connect_with_key(
    buyer: &Buyer<MemoryStore>,
    seller: &Seller<MemoryStore>,
    seller_key: PublicKey,
) -> Result<Connection> {
    buyer.ready().await?;
    let buyer_key = buyer
        .key_pair()
        .ok_or_else(|| anyhow!("buyer has no identity"))?
        .public;

    let (buyer_end, seller_end) = MemoryTransport::pair(buyer_key, seller_key);
    let buyer = buyer.replicate(Arc::new(buyer_end))?;
    let seller = seller.replicate(Arc::new(seller_end))?;
    Ok(Connection { buyer, seller })
}

/// Wait for the first event matching `pred`, skipping others
pub async fn next_event<E, F>(rx: &flume::Receiver<E>, mut pred: F) -> Result<E>
where
    F: FnMut(&E) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = rx.recv_async().await?;
            if pred(&event) {
                return Ok::<E, anyhow::Error>(event);
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for event"))?
}
