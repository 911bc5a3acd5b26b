use async_trait::async_trait;

use crate::crypto::DiscoveryKey;

/// How to take part in a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Make ourselves findable under the topic
    pub announce: bool,
    /// Look for others under the topic
    pub lookup: bool,
}

impl JoinOptions {
    /// Sellers announce their discovery key
    pub const SELLER: JoinOptions = JoinOptions {
        announce: true,
        lookup: false,
    };
    /// Buyers look up the seller's discovery key
    pub const BUYER: JoinOptions = JoinOptions {
        announce: false,
        lookup: true,
    };
}

/// Peer discovery; connections it produces are handed to `replicate`
#[async_trait]
pub trait Swarm: Send + Sync + 'static {
    async fn join(&self, topic: DiscoveryKey, options: JoinOptions) -> anyhow::Result<()>;

    async fn leave(&self, topic: DiscoveryKey) -> anyhow::Result<()>;
}
