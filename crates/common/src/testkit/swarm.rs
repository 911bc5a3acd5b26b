use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::crypto::DiscoveryKey;
use crate::swarm::{JoinOptions, Swarm};

/// Swarm that only records which topics are joined
#[derive(Debug, Clone, Default)]
pub struct MemorySwarm {
    topics: Arc<Mutex<HashMap<DiscoveryKey, JoinOptions>>>,
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn joined(&self, topic: &DiscoveryKey) -> Option<JoinOptions> {
        self.topics.lock().get(topic).copied()
    }

    pub fn topics(&self) -> usize {
        self.topics.lock().len()
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    async fn join(&self, topic: DiscoveryKey, options: JoinOptions) -> anyhow::Result<()> {
        self.topics.lock().insert(topic, options);
        Ok(())
    }

    async fn leave(&self, topic: DiscoveryKey) -> anyhow::Result<()> {
        self.topics.lock().remove(&topic);
        Ok(())
    }
}
