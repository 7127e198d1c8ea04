//! Concurrent evaluations for the same customer

mod common;

use chrono::Duration;
use common::*;
use fraud_risk_engine::device::fingerprint_hash;
use rust_decimal::Decimal;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_keep_profile_consistent() {
    let t = engine();
    let engine = Arc::new(t.engine);
    let customer = "race@example.com";

    let mut handles = Vec::new();
    for i in 0..24 {
        let engine = engine.clone();
        let amount = 100 + 50 * i;
        let event = home_purchase(customer, amount, monday_afternoon() + Duration::seconds(i));
        handles.push(tokio::spawn(async move { engine.evaluate(&event).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let profile = engine.get_profile(customer).await.unwrap().unwrap();
    assert_eq!(profile.transaction_count, 24);
    assert!(profile.invariants_hold());
    assert_eq!(profile.min_amount, Decimal::from(100));
    assert_eq!(profile.max_amount, Decimal::from(100 + 50 * 23));

    let snapshot = engine
        .velocity()
        .snapshot(customer, monday_afternoon() + Duration::seconds(30))
        .unwrap();
    assert_eq!(snapshot.day.count, 24);

    let fp = engine
        .devices()
        .get(&fingerprint_hash(&home_device()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fp.sighting_count, 24);
    assert_eq!(t.log.len(), 24);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_submission_is_applied_once() {
    let t = engine();
    let engine = Arc::new(t.engine);
    let event = home_purchase("dup@example.com", 990, monday_afternoon());

    let a = {
        let engine = engine.clone();
        let event = event.clone();
        tokio::spawn(async move { engine.evaluate(&event).await })
    };
    let b = {
        let engine = engine.clone();
        let event = event.clone();
        tokio::spawn(async move { engine.evaluate(&event).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let profile = engine.get_profile("dup@example.com").await.unwrap().unwrap();
    assert_eq!(profile.transaction_count, 1);

    let snapshot = engine
        .velocity()
        .snapshot("dup@example.com", monday_afternoon())
        .unwrap();
    assert_eq!(snapshot.day.count, 1);

    let fp = engine
        .devices()
        .get(&fingerprint_hash(&home_device()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fp.sighting_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_customers_do_not_interfere() {
    let t = engine();
    let engine = Arc::new(t.engine);

    let mut handles = Vec::new();
    for c in 0..16 {
        for i in 0..4 {
            let engine = engine.clone();
            let event = home_purchase(
                &format!("customer-{}@example.com", c),
                1_000,
                monday_afternoon() + Duration::seconds(i),
            );
            handles.push(tokio::spawn(async move { engine.evaluate(&event).await }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for c in 0..16 {
        let profile = engine
            .get_profile(&format!("customer-{}@example.com", c))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.transaction_count, 4);
        assert!(profile.invariants_hold());
    }
    assert_eq!(engine.velocity().tracked_customers(), 16);
}
