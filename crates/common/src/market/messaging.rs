use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::crypto::PublicKey;
use crate::protocol::{Message, Peer};

/// Callback for a named user message
pub type MessageHandler = Arc<dyn Fn(Value, &Peer) + Send + Sync>;

/// Who a user message goes to
#[derive(Debug, Clone)]
pub enum Target {
    /// Every open session authenticated as this key
    Key(PublicKey),
    /// One specific session
    Session(Peer),
}

impl From<PublicKey> for Target {
    fn from(key: PublicKey) -> Self {
        Target::Key(key)
    }
}

impl From<&Peer> for Target {
    fn from(peer: &Peer) -> Self {
        Target::Session(peer.clone())
    }
}

impl Target {
    fn matches(&self, peer: &Peer) -> bool {
        match self {
            Target::Key(key) => peer.remote_public_key() == *key,
            Target::Session(session) => session == peer,
        }
    }
}

#[derive(Default)]
struct MessagingInner {
    receivers: HashMap<String, MessageHandler>,
    sendable: Vec<Peer>,
}

/// Named user messages shared by every session of one buyer or seller
#[derive(Clone, Default)]
pub struct Messaging {
    inner: Arc<Mutex<MessagingInner>>,
}

impl std::fmt::Debug for Messaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Messaging")
            .field("receivers", &inner.receivers.keys().collect::<Vec<_>>())
            .field("sendable", &inner.sendable)
            .finish()
    }
}

impl Messaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `name`, replacing any previous one
    pub fn receive<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, &Peer) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .receivers
            .insert(name.into(), Arc::new(handler));
    }

    /// Send to every open session matching `target`, returning how many were reached
    pub fn send(&self, name: &str, message: &Value, target: impl Into<Target>) -> usize {
        let target = target.into();
        let msg = Message::user(name, message);
        self.peers()
            .iter()
            .filter(|peer| target.matches(peer))
            .filter(|peer| peer.send(msg.clone()))
            .count()
    }

    /// Send to every open session
    pub fn broadcast(&self, name: &str, message: &Value) -> usize {
        let msg = Message::user(name, message);
        self.peers()
            .iter()
            .filter(|peer| peer.send(msg.clone()))
            .count()
    }

    /// Open sessions, in the order they were added
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.lock().sendable.clone()
    }

    pub(crate) fn add(&self, peer: Peer) {
        let mut inner = self.inner.lock();
        if !inner.sendable.contains(&peer) {
            inner.sendable.push(peer);
        }
    }

    pub(crate) fn remove(&self, peer: &Peer) {
        self.inner.lock().sendable.retain(|p| p != peer);
    }

    pub(crate) fn dispatch(&self, name: &str, message: Value, from: &Peer) {
        let handler = self.inner.lock().receivers.get(name).cloned();
        match handler {
            Some(handler) => handler(message, from),
            None => tracing::debug!(%name, "no receiver for user message"),
        }
    }
}
