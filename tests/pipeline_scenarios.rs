//! End-to-end pipeline scenarios against the in-memory store.

use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;

use opsdesk::admission::{AdmissionController, DAILY_TRADES_KEY};
use opsdesk::config::{AdmissionConfig, PipelineConfig};
use opsdesk::domain::{AgentId, MissionStatus, ProposalMetadata, ProposalStatus, StepKind};
use opsdesk::events::TracingEventSink;
use opsdesk::pipeline::{ProposalPipeline, ProposalRequest};
use opsdesk::policy::{PolicyEngine, StaticPolicy};
use opsdesk::store::{JobStore, MemoryJobStore};

fn pipeline(
    store: Arc<MemoryJobStore>,
    policy: Arc<dyn PolicyEngine>,
    admission: AdmissionConfig,
) -> ProposalPipeline {
    ProposalPipeline::new(
        store.clone(),
        AdmissionController::new(store, admission),
        policy,
        Arc::new(TracingEventSink),
        PipelineConfig::default(),
    )
}

fn desk_limits() -> AdmissionConfig {
    AdmissionConfig {
        max_daily_trades: 1,
        max_open_positions: 5,
        max_notional_exposure_usd: dec!(1000),
    }
}

/// An analysis proposal from the intel agent auto-approves straight into a
/// one-step mission.
#[tokio::test]
async fn analyze_signal_proposal_auto_approves() {
    let store = Arc::new(MemoryJobStore::new());
    let pipeline = pipeline(store.clone(), Arc::new(StaticPolicy::default()), desk_limits());

    let outcome = pipeline
        .submit(ProposalRequest {
            agent_id: AgentId::Intel,
            title: "BTC accumulation signal".to_string(),
            steps: vec![StepKind::AnalyzeSignal],
            metadata: ProposalMetadata {
                symbol: Some("BTC".to_string()),
                confidence: Some(0.75),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    assert!(outcome.success);
    assert!(outcome.auto_approved);
    assert_eq!(outcome.status, ProposalStatus::Accepted);

    let mission_id = outcome.mission_id.unwrap();
    let mission = store.get_mission(mission_id).await.unwrap().unwrap();
    assert_eq!(mission.status, MissionStatus::Approved);
    assert_eq!(mission.created_by, AgentId::Intel);

    let steps = store.mission_steps(mission_id).await.unwrap();
    assert_eq!(steps.len(), 1);

    let proposal = store.get_proposal(outcome.proposal_id).await.unwrap().unwrap();
    assert_eq!(proposal.status, ProposalStatus::Accepted);
}

/// A trade proposal at the daily limit is rejected, the counter does not
/// move past the limit, and no mission is created.
#[tokio::test]
async fn trade_at_daily_limit_is_rejected_without_side_effects() {
    let store = Arc::new(MemoryJobStore::new());
    let pipeline = pipeline(
        store.clone(),
        Arc::new(StaticPolicy::allow_all()),
        desk_limits(),
    );

    let trade_request = || ProposalRequest {
        agent_id: AgentId::Quant,
        title: "ETH momentum entry".to_string(),
        steps: vec![StepKind::ExecuteTrade],
        metadata: ProposalMetadata {
            symbol: Some("ETH".to_string()),
            notional_usd: Some(dec!(100)),
            ..Default::default()
        },
    };

    // First trade consumes the single daily slot.
    let first = pipeline.submit(trade_request()).await.unwrap();
    assert!(first.success);
    assert!(first.mission_id.is_some());

    let second = pipeline.submit(trade_request()).await.unwrap();
    assert!(!second.success);
    assert_eq!(second.status, ProposalStatus::Rejected);
    assert!(second.mission_id.is_none());
    assert!(second
        .rejection_reason
        .as_deref()
        .unwrap()
        .contains("daily trade limit"));

    // Counter stopped at the limit; the rejected submission claimed nothing.
    let today = Utc::now().date_naive();
    assert_eq!(store.quota_count(DAILY_TRADES_KEY, today).await.unwrap(), 1);

    // Only the first proposal produced a mission.
    let rejected = store
        .get_proposal(second.proposal_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rejected.status, ProposalStatus::Rejected);
}

/// The same request against the same desk state always lands on the same
/// decision, with the gate report in step order.
#[tokio::test]
async fn rejection_decision_is_deterministic() {
    for _ in 0..3 {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = pipeline(
            store.clone(),
            Arc::new(StaticPolicy::allow_all()),
            desk_limits(),
        );

        let outcome = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Scout,
                title: "close stale SOL position".to_string(),
                steps: vec![StepKind::AnalyzeSignal, StepKind::ClosePosition],
                metadata: ProposalMetadata {
                    symbol: Some("SOL".to_string()),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.gate_report.len(), 2);
        assert_eq!(outcome.gate_report[0].kind, StepKind::AnalyzeSignal);
        assert_eq!(outcome.gate_report[1].kind, StepKind::ClosePosition);
        assert!(outcome.gate_report[0].allowed);
        assert!(!outcome.gate_report[1].allowed);
        assert!(outcome
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("no open position"));
    }
}

/// Close/scale proposals pass their gate once the position exists.
#[tokio::test]
async fn close_position_admits_when_position_open() {
    let store = Arc::new(MemoryJobStore::new());
    store.upsert_open_position("SOL", dec!(200)).await.unwrap();
    let pipeline = pipeline(
        store.clone(),
        Arc::new(StaticPolicy::allow_all()),
        desk_limits(),
    );

    let outcome = pipeline
        .submit(ProposalRequest {
            agent_id: AgentId::Envoy,
            title: "take profit on SOL".to_string(),
            steps: vec![StepKind::ClosePosition],
            metadata: ProposalMetadata {
                symbol: Some("SOL".to_string()),
                target_price: Some(dec!(210)),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    assert!(outcome.success);
    assert!(outcome.auto_approved);
    assert!(outcome.mission_id.is_some());
}

/// Pending review queue: gates pass, policy declines auto-approval, and the
/// proposal shows up for reviewers.
#[tokio::test]
async fn gated_trade_waits_in_review_queue() {
    let store = Arc::new(MemoryJobStore::new());
    let pipeline = pipeline(store.clone(), Arc::new(StaticPolicy::default()), desk_limits());

    let outcome = pipeline
        .submit(ProposalRequest {
            agent_id: AgentId::Sage,
            title: "BTC swing entry".to_string(),
            steps: vec![StepKind::ExecuteTrade],
            metadata: ProposalMetadata {
                symbol: Some("BTC".to_string()),
                notional_usd: Some(dec!(50)),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    assert!(outcome.success);
    assert!(!outcome.auto_approved);
    assert_eq!(outcome.status, ProposalStatus::Pending);

    let queue = store.pending_proposals(10).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, outcome.proposal_id);
}

/// Store outage on the claim path fails the submission loudly instead of
/// silently admitting, and the proposal does not stay pending.
#[tokio::test]
async fn claim_path_outage_fails_submission() {
    let store = Arc::new(MemoryJobStore::new());
    let pipeline = pipeline(
        store.clone(),
        Arc::new(StaticPolicy::allow_all()),
        desk_limits(),
    );

    store.set_unavailable(true);
    let result = pipeline
        .submit(ProposalRequest {
            agent_id: AgentId::Quant,
            title: "entry during outage".to_string(),
            steps: vec![StepKind::ExecuteTrade],
            metadata: ProposalMetadata {
                symbol: Some("BTC".to_string()),
                notional_usd: Some(dec!(10)),
                ..Default::default()
            },
        })
        .await;

    assert!(result.is_err());
}
