//! Integration tests for user messages, swarm membership and teardown

mod common;

use std::sync::Arc;
use std::time::Duration;

use ::common::market::{BuyerEvent, BuyerOptions, MarketError, SellerEvent, SellerOptions, Target};
use ::common::protocol::SessionError;
use ::common::swarm::JoinOptions;
use ::common::testkit::{connect, next_event, MemorySwarm, TestMarket};
use ::common::transport::MemoryTransport;
use serde_json::{json, Value};

use common::setup;

#[tokio::test]
async fn test_send_reaches_only_the_target() {
    let s = setup(&[], SellerOptions::default(), BuyerOptions::default()).await;
    let carol = TestMarket::new("carol").await.unwrap();
    let carol_buyer = carol
        .market
        .buy(s.seller.key().unwrap(), BuyerOptions::default());

    let (bob_tx, bob_rx) = flume::unbounded::<Value>();
    s.buyer.receive("chat", move |msg, _| {
        let _ = bob_tx.send(msg);
    });
    let (carol_tx, carol_rx) = flume::unbounded::<Value>();
    carol_buyer.receive("chat", move |msg, _| {
        let _ = carol_tx.send(msg);
    });

    let seller_events = s.seller.events().subscribe();
    let bob_conn = connect(&s.buyer, &s.seller).await.unwrap();
    let carol_conn = connect(&carol_buyer, &s.seller).await.unwrap();
    for _ in 0..2 {
        next_event(&seller_events, |e| matches!(e, SellerEvent::PeerAdded(_)))
            .await
            .unwrap();
    }

    let bob_key = s.bob.buyer_key().unwrap();
    assert_eq!(s.seller.send("chat", &json!("hi bob"), bob_key), 1);
    let got = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, json!("hi bob"));

    assert_eq!(s.seller.broadcast("chat", &json!("hi all")), 2);
    let got = tokio::time::timeout(Duration::from_secs(5), carol_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, json!("hi all"));
    let got = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, json!("hi all"));

    // the direct message never reached carol
    assert!(carol_rx.try_recv().is_err());

    // unmatched targets are a silent no-op
    let stranger = ::common::crypto::SecretKey::generate().public();
    assert_eq!(s.seller.send("chat", &json!("nobody"), stranger), 0);

    bob_conn.close().await;
    carol_conn.close().await;
}

#[tokio::test]
async fn test_buyer_messages_identify_the_session() {
    let s = setup(&[], SellerOptions::default(), BuyerOptions::default()).await;

    let (tx, rx) = flume::unbounded();
    s.seller.receive("ping", |_, _| panic!("replaced handler must not run"));
    s.seller.receive("ping", move |msg, peer| {
        let _ = tx.send((msg, peer.remote_public_key(), peer.clone()));
    });

    let buyer_events = s.buyer.events().subscribe();
    let conn = connect(&s.buyer, &s.seller).await.unwrap();
    let BuyerEvent::PeerAdded(peer) =
        next_event(&buyer_events, |e| matches!(e, BuyerEvent::PeerAdded(_)))
            .await
            .unwrap()
    else {
        unreachable!()
    };

    assert_eq!(s.buyer.send("ping", &json!({ "n": 1 }), Target::from(&peer)), 1);
    let (msg, from, session) = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg, json!({ "n": 1 }));
    assert_eq!(from, s.bob.buyer_key().unwrap());

    // answer on exactly the session the message came in on
    let (reply_tx, reply_rx) = flume::unbounded();
    s.buyer.receive("pong", move |msg, _| {
        let _ = reply_tx.send(msg);
    });
    assert_eq!(s.seller.send("pong", &json!("back"), &session), 1);
    let got = tokio::time::timeout(Duration::from_secs(5), reply_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, json!("back"));

    conn.close().await;
}

#[tokio::test]
async fn test_handlers_only_see_their_own_name() {
    let s = setup(&[], SellerOptions::default(), BuyerOptions::default()).await;

    let (a_tx, a_rx) = flume::unbounded::<Value>();
    let (b_tx, b_rx) = flume::unbounded::<Value>();
    s.buyer.receive("A", move |msg, _| {
        let _ = a_tx.send(msg);
    });
    s.buyer.receive("B", move |msg, _| {
        let _ = b_tx.send(msg);
    });
    let (seller_a_tx, seller_a_rx) = flume::unbounded::<Value>();
    let (seller_b_tx, seller_b_rx) = flume::unbounded::<Value>();
    s.seller.receive("A", move |msg, _| {
        let _ = seller_a_tx.send(msg);
    });
    s.seller.receive("B", move |msg, _| {
        let _ = seller_b_tx.send(msg);
    });

    let events = s.seller.events().subscribe();
    let conn = connect(&s.buyer, &s.seller).await.unwrap();
    next_event(&events, |e| matches!(e, SellerEvent::PeerAdded(_)))
        .await
        .unwrap();

    assert_eq!(s.seller.broadcast("A", &json!({ "to": "buyer" })), 1);
    let got = tokio::time::timeout(Duration::from_secs(5), a_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, json!({ "to": "buyer" }));

    // wait for the buyer side to count the seller as a peer before answering
    while s.buyer.peers().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(s.buyer.broadcast("A", &json!({ "to": "seller" })), 1);
    let got = tokio::time::timeout(Duration::from_secs(5), seller_a_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, json!({ "to": "seller" }));

    // frames of one session are dispatched in order, so a misrouted copy would be here by now
    assert!(b_rx.try_recv().is_err());
    assert!(seller_b_rx.try_recv().is_err());

    // names nobody registered are dropped without disturbing the session
    assert_eq!(s.seller.broadcast("C", &json!(null)), 1);
    assert_eq!(s.seller.broadcast("A", &json!("after")), 1);
    let got = tokio::time::timeout(Duration::from_secs(5), a_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, json!("after"));
    assert!(b_rx.try_recv().is_err());

    conn.close().await;
}

#[tokio::test]
async fn test_buyer_destroy_is_idempotent() {
    let s = setup(&["hello"], SellerOptions::default(), BuyerOptions::default()).await;
    let swarm = MemorySwarm::new();
    s.buyer.join(Arc::new(swarm.clone())).await.unwrap();
    assert_eq!(
        swarm.joined(&s.buyer.discovery_key()),
        Some(JoinOptions::BUYER)
    );

    let events = s.buyer.events().subscribe();
    let conn = connect(&s.buyer, &s.seller).await.unwrap();
    next_event(&events, |e| matches!(e, BuyerEvent::Validated { .. }))
        .await
        .unwrap();

    s.buyer.destroy().await.unwrap();
    s.buyer.destroy().await.unwrap();

    let buyer_result = conn.buyer.join().await;
    assert!(
        matches!(&buyer_result, Err(SessionError::Closed(reason)) if reason == "Buyer is destroyed"),
        "unexpected buyer result: {:?}",
        buyer_result
    );
    // the seller end ends too, either on the close frame or the hang-up
    assert!(conn.seller.join().await.is_err());

    assert_eq!(swarm.topics(), 0);
    assert!(s.buyer.feed().unwrap().is_closed());
    assert!(s.buyer.peers().is_empty());

    let (end, _) = MemoryTransport::pair(
        s.bob.buyer_key().unwrap(),
        s.seller.key().unwrap(),
    );
    assert!(matches!(
        s.buyer.replicate(Arc::new(end)),
        Err(MarketError::Precondition(_))
    ));
}

#[tokio::test]
async fn test_seller_destroy_closes_every_session() {
    let s = setup(&["hello"], SellerOptions::default(), BuyerOptions::default()).await;
    let swarm = MemorySwarm::new();
    s.seller.join(Arc::new(swarm.clone())).await.unwrap();
    assert_eq!(
        swarm.joined(&s.seller.discovery_key().unwrap()),
        Some(JoinOptions::SELLER)
    );

    let events = s.seller.events().subscribe();
    let conn = connect(&s.buyer, &s.seller).await.unwrap();
    next_event(&events, |e| matches!(e, SellerEvent::BuyerValid { .. }))
        .await
        .unwrap();

    s.seller.destroy().await.unwrap();
    s.seller.destroy().await.unwrap();

    let seller_result = conn.seller.join().await;
    assert!(
        matches!(&seller_result, Err(SessionError::Closed(reason)) if reason == "Seller is destroyed"),
        "unexpected seller result: {:?}",
        seller_result
    );
    assert!(conn.buyer.join().await.is_err());
    next_event(&events, |e| matches!(e, SellerEvent::PeerRemoved(_)))
        .await
        .unwrap();

    assert_eq!(swarm.topics(), 0);
    assert!(s.seller.feed().is_closed());
    assert!(s.seller.connected_buyers().is_empty());
}

#[tokio::test]
async fn test_seller_destroyed_while_session_starts() {
    let s = setup(&["hello"], SellerOptions::default(), BuyerOptions::default()).await;

    // the seller session task has not authenticated yet when destroy runs
    let conn = connect(&s.buyer, &s.seller).await.unwrap();
    s.seller.destroy().await.unwrap();

    let seller_result = conn.seller.join().await;
    assert!(
        matches!(&seller_result, Err(SessionError::Closed(reason)) if reason == "Seller is destroyed"),
        "unexpected seller result: {:?}",
        seller_result
    );
    assert!(s.seller.peers().is_empty());
    assert!(conn.buyer.join().await.is_err());
}

#[tokio::test]
async fn test_buyer_destroyed_while_session_starts() {
    let s = setup(&["hello"], SellerOptions::default(), BuyerOptions::default()).await;

    let conn = connect(&s.buyer, &s.seller).await.unwrap();
    s.buyer.destroy().await.unwrap();

    let buyer_result = conn.buyer.join().await;
    assert!(
        matches!(&buyer_result, Err(SessionError::Closed(reason)) if reason == "Buyer is destroyed"),
        "unexpected buyer result: {:?}",
        buyer_result
    );
    assert!(s.buyer.peers().is_empty());
    assert!(conn.seller.join().await.is_err());
}
