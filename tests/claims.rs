//! Work-claiming coordination against the in-memory store: claim
//! uniqueness, timeout recovery, and ownership checks.

use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use stratforge::adapters::MemoryStore;
use stratforge::config::ClaimsConfig;
use stratforge::coordination::ClaimCoordinator;
use stratforge::domain::{NewStrategy, StrategyStatus};
use stratforge::error::ForgeError;
use stratforge::storage::WorkQueueStore;

fn coordinator(store: &Arc<MemoryStore>, token: &str) -> ClaimCoordinator<MemoryStore> {
    ClaimCoordinator::with_token(store.clone(), ClaimsConfig::default(), token.to_string())
}

async fn seed(store: &Arc<MemoryStore>, count: usize) -> Vec<i64> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let id = store
            .insert_strategy(&NewStrategy::generated(
                format!("momentum-{i}"),
                json!({"fast": 12, "slow": 26}),
            ))
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

#[tokio::test]
async fn each_item_goes_to_exactly_one_worker() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, 5).await;

    let alice = coordinator(&store, "host-a:100:aaaa");
    let bob = coordinator(&store, "host-b:200:bbbb");

    let mut claimed = HashSet::new();
    loop {
        let a = alice.claim(StrategyStatus::Generated).await.unwrap();
        let b = bob.claim(StrategyStatus::Generated).await.unwrap();
        if a.is_none() && b.is_none() {
            break;
        }
        for item in [a, b].into_iter().flatten() {
            assert!(claimed.insert(item.id), "item {} claimed twice", item.id);
        }
    }

    assert_eq!(claimed, ids.into_iter().collect::<HashSet<_>>());
}

#[tokio::test]
async fn concurrent_claimants_never_share_an_item() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, 20).await;

    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let me = coordinator(&store, &format!("host:{worker}:t{worker}"));
            let mut mine = Vec::new();
            while let Some(item) = me.claim(StrategyStatus::Generated).await.unwrap() {
                mine.push(item.id);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let distinct: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 20, "every item claimed exactly once");
    assert_eq!(distinct, ids.into_iter().collect::<HashSet<_>>());
}

#[tokio::test]
async fn claim_misses_are_not_errors() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 1).await;

    let worker = coordinator(&store, "w:1:x");
    assert!(worker.claim(StrategyStatus::Backtested).await.unwrap().is_none());
    assert!(worker.claim(StrategyStatus::Generated).await.unwrap().is_some());
    // Queue for this status is now drained
    assert!(worker.claim(StrategyStatus::Generated).await.unwrap().is_none());
}

#[tokio::test]
async fn stale_claims_recover_only_past_the_timeout() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, 1).await;

    let crashed = coordinator(&store, "crashed:1:x");
    let survivor = coordinator(&store, "survivor:2:y");

    let item = crashed.claim(StrategyStatus::Generated).await.unwrap().unwrap();
    assert_eq!(item.id, ids[0]);

    // One second inside the 900s window: still owned
    store
        .backdate_claim(item.id, Utc::now() - Duration::seconds(899))
        .await;
    assert!(survivor.claim(StrategyStatus::Generated).await.unwrap().is_none());

    // One second past the window: recovered and reclaimable
    store
        .backdate_claim(item.id, Utc::now() - Duration::seconds(901))
        .await;
    let reclaimed = survivor.claim(StrategyStatus::Generated).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, item.id);
    assert_eq!(reclaimed.processing_by.as_deref(), Some("survivor:2:y"));
}

#[tokio::test]
async fn timed_out_owner_cannot_release_a_reclaimed_item() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, 1).await;

    let crashed = coordinator(&store, "crashed:1:x");
    let survivor = coordinator(&store, "survivor:2:y");

    crashed.claim(StrategyStatus::Generated).await.unwrap().unwrap();
    store
        .backdate_claim(ids[0], Utc::now() - Duration::seconds(1000))
        .await;
    survivor.claim(StrategyStatus::Generated).await.unwrap().unwrap();

    // The original owner's release must not clobber the new claim
    assert!(!crashed.release(ids[0], StrategyStatus::Validated).await.unwrap());
    assert!(survivor.release(ids[0], StrategyStatus::Validated).await.unwrap());

    let item = store.get_strategy(ids[0]).await.unwrap().unwrap();
    assert_eq!(item.status, StrategyStatus::Validated);
    assert!(item.is_available());
    assert!(item.processing_started_at.is_none());
}

#[tokio::test]
async fn release_rejects_transitions_the_status_machine_forbids() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, 1).await;

    let worker = coordinator(&store, "w:1:x");
    worker.claim(StrategyStatus::Generated).await.unwrap().unwrap();

    let err = worker.release(ids[0], StrategyStatus::Live).await.unwrap_err();
    assert!(matches!(err, ForgeError::InvalidStateTransition { .. }));

    // Nothing moved: still claimed, still GENERATED
    let item = store.get_strategy(ids[0]).await.unwrap().unwrap();
    assert_eq!(item.status, StrategyStatus::Generated);
    assert_eq!(item.processing_by.as_deref(), Some("w:1:x"));
}

#[tokio::test]
async fn fail_keeps_the_record_for_audit() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, 1).await;

    let worker = coordinator(&store, "w:1:x");
    worker.claim(StrategyStatus::Generated).await.unwrap().unwrap();
    assert!(worker.fail(ids[0], "backtest engine panic").await.unwrap());

    let item = store.get_strategy(ids[0]).await.unwrap().unwrap();
    assert_eq!(item.status, StrategyStatus::Failed);
    assert_eq!(item.last_error.as_deref(), Some("backtest engine panic"));
    assert!(item.is_available());
}

#[tokio::test]
async fn discard_removes_the_record() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, 1).await;

    let worker = coordinator(&store, "w:1:x");
    worker.claim(StrategyStatus::Generated).await.unwrap().unwrap();
    assert!(worker.discard(ids[0], "references unknown indicator").await.unwrap());
    assert!(store.get_strategy(ids[0]).await.unwrap().is_none());

    // Gone means gone: a second discard is a miss, not an error
    assert!(!worker.discard(ids[0], "again").await.unwrap());
}

#[tokio::test]
async fn shutdown_hands_back_every_claim_this_worker_holds() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 3).await;

    let leaving = coordinator(&store, "leaving:1:x");
    let staying = coordinator(&store, "staying:2:y");

    leaving.claim(StrategyStatus::Generated).await.unwrap().unwrap();
    leaving.claim(StrategyStatus::Generated).await.unwrap().unwrap();
    staying.claim(StrategyStatus::Generated).await.unwrap().unwrap();

    assert_eq!(leaving.release_all_owned().await.unwrap(), 2);

    let depths = staying.queue_depths().await.unwrap();
    assert_eq!(depths.get(&StrategyStatus::Generated), Some(&2));
}

#[tokio::test]
async fn queue_depths_count_only_available_items() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 4).await;

    let worker = coordinator(&store, "w:1:x");
    let held = worker.claim(StrategyStatus::Generated).await.unwrap().unwrap();
    worker.release(held.id, StrategyStatus::Validated).await.unwrap();
    worker.claim(StrategyStatus::Generated).await.unwrap().unwrap();

    let depths = worker.queue_depths().await.unwrap();
    assert_eq!(depths.get(&StrategyStatus::Generated), Some(&2));
    assert_eq!(depths.get(&StrategyStatus::Validated), Some(&1));
}

#[tokio::test]
async fn backpressure_uses_the_configured_curve() {
    let store = Arc::new(MemoryStore::new());
    let worker = coordinator(&store, "w:1:x");

    assert_eq!(worker.backpressure_cooldown(9, 10), 0);
    assert_eq!(worker.backpressure_cooldown(15, 10), 40);
    assert_eq!(worker.backpressure_cooldown(100, 10), 120);
}
