//! Storage layout of a market
//!
//! ```text
//! master-key                              "<hex>"
//! config/<key>                            <any json>
//! buys/feeds/<seller>                     {seller, uniqueFeed}
//! sales/<feed>/key-pair                   {publicKey, secretKey}
//! sales/<feed>/feeds/<buyer>              {buyer, uniqueFeed: {publicKey, secretKey}}
//! ```

use serde::{Deserialize, Serialize};

use crate::crypto::{EncodedKeyPair, KeyPair, PublicKey};

pub const MASTER_KEY: &str = "master-key";
pub const BUYER_KEY_PAIR: &str = "buys/key-pair";
pub const BUYER_FEEDS: &str = "buys/feeds";
pub const SALES: &str = "sales";
pub const CONFIG: &str = "config";

pub fn config_key(key: &str) -> String {
    format!("{}/{}", CONFIG, key)
}

pub fn buyer_feed_cache(seller: &PublicKey) -> String {
    format!("{}/{}", BUYER_FEEDS, seller.to_hex())
}

pub fn sale_key_pair(feed: &PublicKey) -> String {
    format!("{}/{}/key-pair", SALES, feed.to_hex())
}

pub fn sale_buyer_feeds(feed: &PublicKey) -> String {
    format!("{}/{}/feeds", SALES, feed.to_hex())
}

pub fn sale_buyer_feed(feed: &PublicKey, buyer: &PublicKey) -> String {
    format!("{}/{}", sale_buyer_feeds(feed), buyer.to_hex())
}

/// Feed key of a `sales/<feed>/key-pair` path
pub fn parse_sale_key_pair_path(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("sales/")?;
    let feed = rest.strip_suffix("/key-pair")?;
    if feed.is_empty() || feed.contains('/') {
        return None;
    }
    Some(feed)
}

/// Stored once by a buyer when its re-keyed feed is first learned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerFeedRecord {
    pub seller: String,
    pub unique_feed: String,
}

/// Stored once by a seller per buyer it issued a view to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerReKeyRecord {
    pub buyer: String,
    pub unique_feed: EncodedKeyPair,
}

/// A seller this market buys from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyingRecord {
    pub seller: PublicKey,
    pub unique_feed: PublicKey,
}

/// A feed this market sells
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellingRecord {
    /// Identity buyers connect to
    pub seller: PublicKey,
    pub feed: PublicKey,
}

/// A buyer a seller issued a view to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyerRecord {
    pub buyer: PublicKey,
    pub unique_feed: KeyPair,
}
