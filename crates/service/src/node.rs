//! iroh endpoints for sellers and buyers
//!
//! An endpoint authenticates with the owner's own keypair, so the node id a
//! buyer dials is exactly the seller key it pins, and the node id a seller
//! sees is the buyer identity it validates.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use futures::future::BoxFuture;
use iroh::discovery::pkarr::dht::DhtDiscovery;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::Endpoint;

use common::crypto::{KeyPair, PublicKey};
use common::market::{Buyer, MarketError, Seller};
use common::protocol::{SessionError, SessionHandle, ALPN};
use common::store::Store;
use common::transport::TransportError;

use crate::transport::IrohTransport;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to bind endpoint: {0}")]
    Bind(String),
    #[error("{0} has no identity yet")]
    NotReady(&'static str),
    #[error("connection failed: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Market(#[from] MarketError),
    #[error("router error: {0}")]
    Router(String),
}

/// Bind an endpoint that authenticates as `key_pair`
///
/// `port` of `None` picks an ephemeral port.
pub async fn bind_endpoint(
    key_pair: &KeyPair,
    port: Option<u16>,
    alpns: Vec<Vec<u8>>,
) -> Result<Endpoint, NodeError> {
    let secret = key_pair.secret.0.clone();
    let discovery = DhtDiscovery::builder()
        .secret_key(secret.clone())
        .build()
        .map_err(|e| NodeError::Bind(e.to_string()))?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port.unwrap_or(0));
    Endpoint::builder()
        .secret_key(secret)
        .discovery(discovery)
        .alpns(alpns)
        .bind_addr_v4(addr)
        .bind()
        .await
        .map_err(|e| NodeError::Bind(e.to_string()))
}

/// Feeds accepted connections to a seller
#[derive(Clone)]
struct SellerProtocol<S: Store> {
    seller: Seller<S>,
}

impl<S: Store> fmt::Debug for SellerProtocol<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SellerProtocol")
            .field("seller", &self.seller)
            .finish()
    }
}

impl<S: Store> ProtocolHandler for SellerProtocol<S> {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let seller = self.seller.clone();
        Box::pin(async move {
            let transport = IrohTransport::accept(conn).await.map_err(|e| {
                tracing::warn!("failed to accept session: {}", e);
                AcceptError::from(std::io::Error::other(e))
            })?;
            let handle = seller
                .replicate(Arc::new(transport))
                .map_err(|e| AcceptError::from(std::io::Error::other(e)))?;

            let remote = handle.peer().remote_public_key();
            match handle.join().await {
                Ok(()) => tracing::debug!(%remote, "buyer session ended"),
                Err(SessionError::Closed(reason)) | Err(SessionError::RemoteClosed(reason)) => {
                    tracing::debug!(%remote, %reason, "buyer session closed")
                }
                Err(e) => tracing::info!(%remote, "buyer session failed: {}", e),
            }
            Ok(())
        })
    }
}

/// A seller reachable under its own key
pub struct SellerNode {
    key: PublicKey,
    router: Router,
}

impl SellerNode {
    pub async fn spawn<S: Store>(seller: Seller<S>, port: Option<u16>) -> Result<Self, NodeError> {
        seller.ready().await?;
        let key_pair = seller.key_pair().ok_or(NodeError::NotReady("seller"))?;
        let endpoint = bind_endpoint(&key_pair, port, vec![ALPN.to_vec()]).await?;

        let router = Router::builder(endpoint)
            .accept(ALPN, SellerProtocol { seller })
            .spawn();
        tracing::info!(seller = %key_pair.public, "seller node listening");

        Ok(Self {
            key: key_pair.public,
            router,
        })
    }

    /// Key buyers dial, equal to the seller key
    pub fn key(&self) -> PublicKey {
        self.key
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.router.endpoint()
    }

    pub async fn shutdown(self) -> Result<(), NodeError> {
        self.router
            .shutdown()
            .await
            .map_err(|e| NodeError::Router(e.to_string()))
    }
}

/// A buyer's outgoing endpoint
pub struct BuyerNode<S: Store> {
    buyer: Buyer<S>,
    endpoint: Endpoint,
}

impl<S: Store> BuyerNode<S> {
    pub async fn bind(buyer: Buyer<S>, port: Option<u16>) -> Result<Self, NodeError> {
        buyer.ready().await?;
        let key_pair = buyer.key_pair().ok_or(NodeError::NotReady("buyer"))?;
        let endpoint = bind_endpoint(&key_pair, port, Vec::new()).await?;
        Ok(Self { buyer, endpoint })
    }

    pub fn buyer(&self) -> &Buyer<S> {
        &self.buyer
    }

    /// Dial the seller and start a session over the connection
    pub async fn connect(&self) -> Result<SessionHandle, NodeError> {
        let transport = IrohTransport::dial(&self.endpoint, self.buyer.key()).await?;
        Ok(self.buyer.replicate(Arc::new(transport))?)
    }

    pub async fn close(self) {
        self.endpoint.close().await;
    }
}
