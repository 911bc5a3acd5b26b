//! Integration tests for seller pinning and per-buyer feed identities

mod common;

use std::collections::HashSet;

use ::common::crypto::SecretKey;
use ::common::market::{BuyerEvent, BuyerOptions, SellerOptions};
use ::common::protocol::SessionError;
use ::common::store::Store;
use ::common::testkit::{connect, connect_with_key, next_event, TestMarket};

use common::{init_tracing, setup};

#[tokio::test]
async fn test_buyer_rejects_unexpected_seller() {
    init_tracing();
    let alice = TestMarket::new("alice").await.unwrap();
    let bob = TestMarket::new("bob").await.unwrap();
    let seller = alice
        .sell_entries(&["hello"], SellerOptions::default())
        .await
        .unwrap();

    // bob wants to buy from someone else entirely
    let expected = SecretKey::generate().public();
    let buyer = bob.market.buy(expected, BuyerOptions::default());
    let events = buyer.events().subscribe();

    let conn = connect_with_key(&buyer, &seller, seller.key().unwrap())
        .await
        .unwrap();

    let result = conn.buyer.join().await;
    match result {
        Err(SessionError::AuthenticationMismatch { expected: e, actual }) => {
            assert_eq!(e, expected);
            assert_eq!(Some(actual), seller.key());
        }
        other => panic!("expected authentication mismatch, got {:?}", other),
    }

    let event = next_event(&events, |e| matches!(e, BuyerEvent::Invalid { .. }))
        .await
        .unwrap();
    let BuyerEvent::Invalid { error, .. } = event else {
        unreachable!()
    };
    assert_eq!(error, "Not connected to seller");
    assert!(buyer.feed().is_none());
    assert!(buyer.peers().is_empty());

    // the seller side ends once the buyer hangs up
    assert!(conn.seller.join().await.is_err());
}

#[tokio::test]
async fn test_each_buyer_gets_a_private_stable_feed() {
    let s = setup(&["hello"], SellerOptions::default(), BuyerOptions::default()).await;
    let carol = TestMarket::new("carol").await.unwrap();
    let carol_buyer = carol
        .market
        .buy(s.seller.key().unwrap(), BuyerOptions::default());
    carol_buyer.ready().await.unwrap();

    let bob_events = s.buyer.events().subscribe();
    let carol_events = carol_buyer.events().subscribe();

    let bob_conn = connect(&s.buyer, &s.seller).await.unwrap();
    let carol_conn = connect(&carol_buyer, &s.seller).await.unwrap();

    let issued = |event: BuyerEvent| match event {
        BuyerEvent::Validated { feed, .. } => feed,
        _ => unreachable!(),
    };
    let bob_feed = issued(
        next_event(&bob_events, |e| matches!(e, BuyerEvent::Validated { .. }))
            .await
            .unwrap(),
    );
    let carol_feed = issued(
        next_event(&carol_events, |e| matches!(e, BuyerEvent::Validated { .. }))
            .await
            .unwrap(),
    );

    let content = s.seller.feed().key();
    assert_ne!(bob_feed, carol_feed);
    assert_ne!(bob_feed, content);
    assert_ne!(carol_feed, content);

    // reconnecting yields the same identity
    bob_conn.close().await;
    let bob_conn = connect(&s.buyer, &s.seller).await.unwrap();
    let again = s
        .seller
        .unique_feed(&s.bob.buyer_key().unwrap())
        .await
        .unwrap();
    assert_eq!(again.key(), bob_feed);

    let buyers = s.seller.buyers().await.unwrap();
    let listed: HashSet<_> = buyers.iter().map(|b| b.unique_feed.public).collect();
    assert_eq!(listed, HashSet::from([bob_feed, carol_feed]));

    bob_conn.close().await;
    carol_conn.close().await;
}

#[tokio::test]
async fn test_concurrent_feed_issuance_agrees() {
    let s = setup(&["hello"], SellerOptions::default(), BuyerOptions::default()).await;
    let buyer = SecretKey::generate().public();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let seller = s.seller.clone();
            tokio::spawn(async move { seller.unique_feed(&buyer).await.unwrap().key() })
        })
        .collect();

    let mut keys = HashSet::new();
    for task in tasks {
        keys.insert(task.await.unwrap());
    }
    assert_eq!(keys.len(), 1);

    let path = format!("sales/{}/feeds", s.seller.feed().key().to_hex());
    let records = s.alice.store.list(&path, false).await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_identities_survive_restart() {
    let s = setup(&["hello"], SellerOptions::default(), BuyerOptions::default()).await;
    let buyer = SecretKey::generate().public();
    let view = s.seller.unique_feed(&buyer).await.unwrap();

    // same store, same feed: a new seller instance recovers both identities
    let restarted = s
        .alice
        .market
        .sell(s.seller.feed().clone(), SellerOptions::default());
    restarted.ready().await.unwrap();
    assert_eq!(restarted.key(), s.seller.key());
    assert_ne!(restarted.seller_id(), s.seller.seller_id());
    assert_eq!(
        restarted.unique_feed(&buyer).await.unwrap().key(),
        view.key()
    );
}
