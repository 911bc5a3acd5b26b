//! Authenticated point-to-point frame transport
//!
//! A session never sees how a connection was established. It only needs the
//! remote's authenticated public key and a way to exchange whole frames.
//! The service crate adapts iroh QUIC connections to this trait; tests use
//! [`MemoryTransport`].

mod memory;

use async_trait::async_trait;

use crate::crypto::PublicKey;

pub use memory::MemoryTransport;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed: {0}")]
    Closed(String),
    #[error("transport io error: {0}")]
    Io(String),
    #[error("frame codec error: {0}")]
    Codec(String),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity the remote authenticated with
    fn remote_public_key(&self) -> PublicKey;

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Next frame, or `None` once the remote closed the connection
    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError>;

    async fn close(&self, reason: Option<String>);
}
