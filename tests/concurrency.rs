//! Concurrency guarantees of the store primitives: the quota claim and the
//! step claim must stay safe no matter how many callers race them.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;

use opsdesk::domain::{
    AgentId, ProposalMetadata, ProposalStatus, StepKind,
};
use opsdesk::mission::MissionBuilder;
use opsdesk::store::{JobStore, MemoryJobStore};
use opsdesk::Proposal;

async fn seed_single_step_mission(
    store: &Arc<MemoryJobStore>,
    kind: StepKind,
) -> uuid::Uuid {
    let mut proposal = Proposal::new(
        AgentId::Quant,
        "race fixture",
        vec![kind],
        ProposalMetadata::default(),
    );
    proposal.status = ProposalStatus::AutoApproved;
    store.insert_proposal(&proposal).await.unwrap();
    let (_, steps) = MissionBuilder::new(store.clone() as Arc<dyn JobStore>)
        .create_from_proposal(&proposal, ProposalStatus::AutoApproved)
        .await
        .unwrap();
    steps[0].id
}

#[tokio::test]
async fn quota_admits_exactly_limit_under_contention() {
    let store = Arc::new(MemoryJobStore::new());
    let today = Utc::now().date_naive();
    let limit = 5i64;

    let attempts = (0..20).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .try_claim_quota("daily_trades", today, limit)
                .await
                .unwrap()
        })
    });

    let admitted = join_all(attempts)
        .await
        .into_iter()
        .filter(|claim| claim.as_ref().unwrap().admitted)
        .count();

    assert_eq!(admitted as i64, limit);
    assert_eq!(
        store.quota_count("daily_trades", today).await.unwrap(),
        limit
    );
}

#[tokio::test]
async fn quota_admits_all_when_under_limit() {
    let store = Arc::new(MemoryJobStore::new());
    let today = Utc::now().date_naive();

    let attempts = (0..3).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            store.try_claim_quota("daily_trades", today, 10).await.unwrap()
        })
    });

    let claims: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|c| c.unwrap())
        .collect();

    assert!(claims.iter().all(|c| c.admitted));
    assert_eq!(store.quota_count("daily_trades", today).await.unwrap(), 3);
}

#[tokio::test]
async fn concurrent_step_claimers_exactly_one_wins() {
    let store = Arc::new(MemoryJobStore::new());
    let step_id = seed_single_step_mission(&store, StepKind::ExecuteTrade).await;

    // Two claimers in the same instant, as close to simultaneous as the
    // runtime allows.
    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.claim_step(step_id, "worker-a").await.unwrap() })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.claim_step(step_id, "worker-b").await.unwrap() })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(a ^ b, "exactly one claimer must win, got a={a} b={b}");

    let step = store.get_step(step_id).await.unwrap().unwrap();
    let winner = if a { "worker-a" } else { "worker-b" };
    assert_eq!(step.assigned_to.as_deref(), Some(winner));
    assert!(step.started_at.is_some());
}

#[tokio::test]
async fn many_concurrent_claimers_still_one_winner() {
    let store = Arc::new(MemoryJobStore::new());
    let step_id = seed_single_step_mission(&store, StepKind::AnalyzeSignal).await;

    let claims = (0..32).map(|i| {
        let store = store.clone();
        let worker = format!("worker-{i}");
        tokio::spawn(async move { store.claim_step(step_id, &worker).await.unwrap() })
    });

    let winners = join_all(claims)
        .await
        .into_iter()
        .filter(|won| *won.as_ref().unwrap())
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn completion_is_idempotent() {
    let store = Arc::new(MemoryJobStore::new());
    let step_id = seed_single_step_mission(&store, StepKind::AnalyzeSignal).await;

    assert!(store.claim_step(step_id, "w1").await.unwrap());
    assert!(store
        .complete_step(step_id, serde_json::json!({"ok": true}))
        .await
        .unwrap());

    // Duplicate signals against a terminal step are no-ops, never errors.
    assert!(!store
        .complete_step(step_id, serde_json::json!({"ok": false}))
        .await
        .unwrap());
    assert!(!store.fail_step(step_id, "late failure").await.unwrap());

    let step = store.get_step(step_id).await.unwrap().unwrap();
    assert_eq!(step.result, Some(serde_json::json!({"ok": true})));
    assert!(step.error.is_none());
}

#[tokio::test]
async fn release_quota_never_goes_negative() {
    let store = Arc::new(MemoryJobStore::new());
    let today = Utc::now().date_naive();

    store.try_claim_quota("daily_trades", today, 10).await.unwrap();
    store.release_quota("daily_trades", today).await.unwrap();
    // Extra release on an already-empty counter floors at zero.
    store.release_quota("daily_trades", today).await.unwrap();

    assert_eq!(store.quota_count("daily_trades", today).await.unwrap(), 0);
}
