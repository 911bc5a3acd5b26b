//! Shared test utilities for buyer/seller integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::market::{validator, Buyer, BuyerOptions, Seller, SellerOptions, Validator};
use common::store::MemoryStore;
use common::testkit::TestMarket;
use serde_json::{json, Value};

/// Short interval so revalidation tests finish quickly
pub const FAST: Duration = Duration::from_millis(25);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Accepts every remote, returning `info`
pub fn accept(info: Value) -> Validator {
    validator(move |_| {
        let info = info.clone();
        async move { Ok::<_, String>(Some(info)) }
    })
}

/// Rejects every remote with `error`
pub fn reject(error: &'static str) -> Validator {
    validator(move |_| async move { Err::<Option<Value>, _>(error.to_string()) })
}

/// Rejects on odd calls, accepts on even ones; also returns the call counter
pub fn alternating() -> (Validator, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let validate = validator(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n % 2 == 0 {
                Ok(Some(json!({ "check": n })))
            } else {
                Err("expired".to_string())
            }
        }
    });
    (validate, calls)
}

/// A seller market, a buyer market, a seller over `entries` and a buyer of it
pub struct Setup {
    pub alice: TestMarket,
    pub bob: TestMarket,
    pub seller: Seller<MemoryStore>,
    pub buyer: Buyer<MemoryStore>,
}

pub async fn setup(entries: &[&str], seller: SellerOptions, buyer: BuyerOptions) -> Setup {
    init_tracing();
    let alice = TestMarket::new("alice").await.unwrap();
    let bob = TestMarket::new("bob").await.unwrap();

    let seller = alice.sell_entries(entries, seller).await.unwrap();
    let buyer = bob.market.buy(seller.key().unwrap(), buyer);
    buyer.ready().await.unwrap();

    Setup {
        alice,
        bob,
        seller,
        buyer,
    }
}
