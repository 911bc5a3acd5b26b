use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::crypto::PublicKey;
use crate::feed::Feed;
use crate::protocol::{Peer, SELLER_ID_SIZE};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct EventsInner<E> {
    callbacks: Vec<Callback<E>>,
    subscribers: Vec<flume::Sender<E>>,
}

/// Typed event fan-out: callbacks run inline, subscribers get a channel
pub struct Events<E> {
    inner: Arc<Mutex<EventsInner<E>>>,
}

impl<E> Clone for Events<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for Events<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventsInner {
                callbacks: Vec::new(),
                subscribers: Vec::new(),
            })),
        }
    }
}

impl<E> std::fmt::Debug for Events<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Events")
            .field("callbacks", &inner.callbacks.len())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl<E: Clone + Send + 'static> Events<E> {
    /// Register a callback invoked for every event
    ///
    /// Callbacks run on the emitting task and must not block.
    pub fn on<F>(&self, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.inner.lock().callbacks.push(Arc::new(callback));
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> flume::Receiver<E> {
        let (tx, rx) = flume::unbounded();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: E) {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner
                .subscribers
                .retain(|tx| tx.send(event.clone()).is_ok());
            inner.callbacks.clone()
        };
        for callback in callbacks {
            callback(&event);
        }
    }
}

/// Things that happen to a buyer
#[derive(Debug, Clone)]
pub enum BuyerEvent {
    /// Identity and cached feed are loaded
    Ready,
    /// Loading failed
    Error(String),
    /// The replica of the purchased feed exists
    Feed(Feed),
    /// The seller issued this buyer a feed over `peer`
    Validated { feed: PublicKey, peer: Peer },
    /// The seller reported a valid subscription
    Valid { info: Value, remote: PublicKey },
    /// The seller reported an invalid subscription, or the remote was not the seller
    Invalid { error: String, remote: PublicKey },
    SellerId {
        id: [u8; SELLER_ID_SIZE],
        peer: Peer,
    },
    /// Local check of the seller started
    SellerValidate(PublicKey),
    SellerValid {
        seller: PublicKey,
        info: Option<Value>,
    },
    SellerInvalid {
        seller: PublicKey,
        error: String,
    },
    PeerAdded(Peer),
    PeerRemoved(Peer),
}

/// Things that happen to a seller
#[derive(Debug, Clone)]
pub enum SellerEvent {
    Ready,
    Error(String),
    /// Validation of a buyer started
    BuyerValidate(PublicKey),
    BuyerValid {
        buyer: PublicKey,
        info: Option<Value>,
    },
    BuyerInvalid {
        buyer: PublicKey,
        error: String,
    },
    /// A re-keyed view was opened for a buyer
    BuyerFeed { buyer: PublicKey, feed: Feed },
    /// The buyer reported the seller valid
    Valid { info: Value, remote: PublicKey },
    /// The buyer reported the seller invalid
    Invalid { error: String, remote: PublicKey },
    PeerAdded(Peer),
    PeerRemoved(Peer),
}
