/// Lightweight harness for in-process buyer/seller tests
///
/// Markets run over a [`MemoryStore`](crate::store::MemoryStore), connections
/// over a [`MemoryTransport`](crate::transport::MemoryTransport) pair, so a full
/// subscription can be exercised without any network.
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::{connect, TestMarket};
///
/// #[tokio::test]
/// async fn test_subscription() -> anyhow::Result<()> {
///     let alice = TestMarket::new("alice").await?;
///     let bob = TestMarket::new("bob").await?;
///
///     let seller = alice.sell_entries(&["hello"], Default::default()).await?;
///     let buyer = bob.market.buy(seller.key().unwrap(), Default::default());
///
///     let conn = connect(&buyer, &seller).await?;
///     conn.close().await;
///     Ok(())
/// }
/// ```
mod market;
mod swarm;

pub use market::{connect, connect_with_key, next_event, Connection, TestMarket};
pub use swarm::MemorySwarm;
