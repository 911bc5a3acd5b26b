use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Transport, TransportError};
use crate::crypto::PublicKey;

/// One end of an in-process duplex connection
#[derive(Debug)]
pub struct MemoryTransport {
    remote: PublicKey,
    tx: Mutex<Option<flume::Sender<Vec<u8>>>>,
    rx: flume::Receiver<Vec<u8>>,
    closed: watch::Sender<bool>,
}

impl MemoryTransport {
    /// Build a connected pair. The first end talks to `b_key`, the second to `a_key`.
    pub fn pair(a_key: PublicKey, b_key: PublicKey) -> (Self, Self) {
        let (a_tx, b_rx) = flume::unbounded();
        let (b_tx, a_rx) = flume::unbounded();
        let a = Self {
            remote: b_key,
            tx: Mutex::new(Some(a_tx)),
            rx: a_rx,
            closed: watch::channel(false).0,
        };
        let b = Self {
            remote: a_key,
            tx: Mutex::new(Some(b_tx)),
            rx: b_rx,
            closed: watch::channel(false).0,
        };
        (a, b)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn remote_public_key(&self) -> PublicKey {
        self.remote
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| TransportError::Closed("remote end dropped".to_string())),
            None => Err(TransportError::Closed("local end closed".to_string())),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        tokio::select! {
            frame = self.rx.recv_async() => Ok(frame.ok()),
            _ = closed.changed() => Ok(None),
        }
    }

    async fn close(&self, reason: Option<String>) {
        if self.tx.lock().take().is_some() {
            tracing::debug!(remote = %self.remote, ?reason, "closing memory transport");
        }
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    #[tokio::test]
    async fn test_pair_exchanges_frames() {
        let a_key = SecretKey::generate().public();
        let b_key = SecretKey::generate().public();
        let (a, b) = MemoryTransport::pair(a_key, b_key);

        assert_eq!(a.remote_public_key(), b_key);
        assert_eq!(b.remote_public_key(), a_key);

        a.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), b"ping".to_vec());

        a.close(Some("done".into())).await;
        assert!(b.recv().await.unwrap().is_none());
        assert!(a.recv().await.unwrap().is_none());
        assert!(a.send(vec![1]).await.is_err());
    }
}
