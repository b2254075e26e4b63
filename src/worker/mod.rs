//! Step workers: claim queued steps, execute them, settle the mission.
//!
//! Claiming is delegated to the store's conditional update, so any number of
//! harnesses for the same step kind can poll concurrently without double
//! execution. Each kind carries a circuit breaker that pauses polling after
//! repeated executor failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::domain::{MissionStatus, MissionStep, StepKind};
use crate::error::Result;
use crate::store::JobStore;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, polling allowed
    Closed,
    /// Failure threshold exceeded, polling paused
    Open,
    /// Recovery window elapsed, one probe execution allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Per-worker-kind circuit breaker.
///
/// Trips open after `failure_threshold` consecutive failures, moves to
/// half-open once `reset_window_secs` has elapsed, and closes again on the
/// first successful probe. A half-open failure reopens immediately.
pub struct WorkerCircuitBreaker {
    failure_threshold: u32,
    reset_window: Duration,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<DateTime<Utc>>>,
    total_trips: AtomicU64,
}

impl WorkerCircuitBreaker {
    pub fn new(failure_threshold: u32, reset_window: Duration) -> Self {
        Self {
            failure_threshold,
            reset_window,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            total_trips: AtomicU64::new(0),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Whether a poll/execution attempt is allowed right now. Transitions
    /// open -> half-open when the reset window has elapsed.
    pub async fn should_allow(&self) -> bool {
        match self.state().await {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed_ok = {
                    let opened = self.opened_at.read().await;
                    opened
                        .map(|at| {
                            Utc::now().signed_duration_since(at).to_std().unwrap_or_default()
                                >= self.reset_window
                        })
                        .unwrap_or(false)
                };
                if elapsed_ok {
                    let mut state = self.state.write().await;
                    if *state == CircuitState::Open {
                        *state = CircuitState::HalfOpen;
                        info!("circuit half-open, allowing probe");
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let mut state = self.state.write().await;
        if *state != CircuitState::Closed {
            *state = CircuitState::Closed;
            *self.opened_at.write().await = None;
            info!("circuit closed after successful probe");
        }
    }

    pub async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.write().await;
        let should_trip = match *state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if should_trip {
            *state = CircuitState::Open;
            *self.opened_at.write().await = Some(Utc::now());
            self.total_trips.fetch_add(1, Ordering::SeqCst);
            warn!(failures, "circuit tripped open");
        }
    }

    pub fn total_trips(&self) -> u64 {
        self.total_trips.load(Ordering::SeqCst)
    }
}

/// Shared registry of breakers, one per step kind
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<StepKind, Arc<WorkerCircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_kind(&self, kind: StepKind, config: &WorkerConfig) -> Arc<WorkerCircuitBreaker> {
        self.breakers
            .entry(kind)
            .or_insert_with(|| {
                Arc::new(WorkerCircuitBreaker::new(
                    config.failure_threshold,
                    Duration::from_secs(config.reset_window_secs),
                ))
            })
            .clone()
    }
}

/// Executes one claimed step. Implementations are the seam to real trading,
/// analysis, or conversation backends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// The step kind this executor handles
    fn kind(&self) -> StepKind;

    /// Run the step to completion. The returned value is stored as the step
    /// result; an error marks the step failed with the error text.
    async fn execute(&self, step: &MissionStep) -> Result<serde_json::Value>;
}

/// Polls for queued steps of one kind and drives them through the executor
pub struct WorkerHarness {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn StepExecutor>,
    breaker: Arc<WorkerCircuitBreaker>,
    config: WorkerConfig,
    worker_id: String,
}

impl WorkerHarness {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn StepExecutor>,
        breaker: Arc<WorkerCircuitBreaker>,
        config: WorkerConfig,
    ) -> Self {
        let worker_id = format!("{}-{}", executor.kind(), Uuid::new_v4());
        Self {
            store,
            executor,
            breaker,
            config,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll until shutdown is signalled
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(worker_id = %self.worker_id, kind = %self.executor.kind(), "worker started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(worker_id = %self.worker_id, "poll cycle failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One poll cycle: fetch, claim, execute, settle. Returns the number of
    /// steps this worker actually executed.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll_once(&self) -> Result<usize> {
        if !self.breaker.should_allow().await {
            debug!("circuit open, skipping poll");
            return Ok(0);
        }

        let batch = self
            .store
            .fetch_queued_steps(self.executor.kind(), self.config.poll_batch_size)
            .await?;

        let mut executed = 0;
        for step in batch {
            // Another worker may have taken it between fetch and claim.
            if !self.store.claim_step(step.id, &self.worker_id).await? {
                continue;
            }
            self.execute_claimed(&step).await?;
            executed += 1;

            // Half-open allows a single probe per window.
            if self.breaker.state().await != CircuitState::Closed {
                break;
            }
        }
        Ok(executed)
    }

    async fn execute_claimed(&self, step: &MissionStep) -> Result<()> {
        // First claim moves the mission out of approved; losing this CAS just
        // means a sibling step got there first.
        self.store
            .update_mission_status(step.mission_id, MissionStatus::Approved, MissionStatus::Running)
            .await?;

        match self.executor.execute(step).await {
            Ok(result) => {
                self.store.complete_step(step.id, result).await?;
                self.breaker.record_success().await;
                debug!(step_id = %step.id, "step completed");
            }
            Err(e) => {
                self.store.fail_step(step.id, &e.to_string()).await?;
                self.breaker.record_failure().await;
                warn!(step_id = %step.id, "step failed: {}", e);
            }
        }

        self.settle_mission(step.mission_id).await
    }

    /// Derive the mission terminal state once no step is queued or running.
    /// Concurrent settlers race benignly; the status CAS admits exactly one.
    async fn settle_mission(&self, mission_id: Uuid) -> Result<()> {
        if self.store.pending_step_count(mission_id).await? > 0 {
            return Ok(());
        }
        let target = if self.store.failed_step_count(mission_id).await? > 0 {
            MissionStatus::Failed
        } else {
            MissionStatus::Succeeded
        };
        let settled = self
            .store
            .update_mission_status(mission_id, MissionStatus::Running, target)
            .await?;
        if settled {
            info!(mission_id = %mission_id, status = %target, "mission settled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AgentId, Mission, MissionType, Proposal, ProposalMetadata, ProposalStatus, StepPayload,
        StepStatus,
    };
    use crate::mission::MissionBuilder;
    use crate::store::MemoryJobStore;

    async fn seed_mission(
        store: &Arc<MemoryJobStore>,
        kinds: Vec<StepKind>,
    ) -> (Mission, Vec<MissionStep>) {
        let mut proposal = Proposal::new(
            AgentId::Quant,
            "seeded mission",
            kinds,
            ProposalMetadata {
                symbol: Some("BTC".to_string()),
                confidence: Some(0.6),
                ..Default::default()
            },
        );
        proposal.status = ProposalStatus::AutoApproved;
        store.insert_proposal(&proposal).await.unwrap();
        MissionBuilder::new(store.clone() as Arc<dyn JobStore>)
            .create_from_proposal(&proposal, ProposalStatus::AutoApproved)
            .await
            .unwrap()
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval_secs: 1,
            poll_batch_size: 5,
            failure_threshold: 2,
            reset_window_secs: 0,
        }
    }

    fn harness(
        store: Arc<MemoryJobStore>,
        executor: MockStepExecutor,
        config: WorkerConfig,
    ) -> WorkerHarness {
        let breaker = Arc::new(WorkerCircuitBreaker::new(
            config.failure_threshold,
            Duration::from_secs(config.reset_window_secs),
        ));
        WorkerHarness::new(store, Arc::new(executor), breaker, config)
    }

    #[tokio::test]
    async fn test_successful_step_settles_mission_succeeded() {
        let store = Arc::new(MemoryJobStore::new());
        let (mission, steps) = seed_mission(&store, vec![StepKind::AnalyzeSignal]).await;

        let mut executor = MockStepExecutor::new();
        executor.expect_kind().return_const(StepKind::AnalyzeSignal);
        executor
            .expect_execute()
            .returning(|_| Ok(serde_json::json!({"verdict": "bullish"})));

        let harness = harness(store.clone(), executor, test_config());
        assert_eq!(harness.poll_once().await.unwrap(), 1);

        let step = store.get_step(steps[0].id).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Succeeded);
        assert!(step.result.is_some());

        let mission = store.get_mission(mission.id).await.unwrap().unwrap();
        assert_eq!(mission.status, MissionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_step_settles_mission_failed() {
        let store = Arc::new(MemoryJobStore::new());
        let (mission, steps) = seed_mission(&store, vec![StepKind::AnalyzeSignal]).await;

        let mut executor = MockStepExecutor::new();
        executor.expect_kind().return_const(StepKind::AnalyzeSignal);
        executor
            .expect_execute()
            .returning(|_| Err(crate::error::OpsError::Internal("feed offline".to_string())));

        let harness = harness(store.clone(), executor, test_config());
        harness.poll_once().await.unwrap();

        let step = store.get_step(steps[0].id).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.as_deref().unwrap().contains("feed offline"));

        let mission = store.get_mission(mission.id).await.unwrap().unwrap();
        assert_eq!(mission.status, MissionStatus::Failed);
    }

    #[tokio::test]
    async fn test_mission_stays_running_until_last_step() {
        let store = Arc::new(MemoryJobStore::new());
        let (mission, _) =
            seed_mission(&store, vec![StepKind::AnalyzeSignal, StepKind::AnalyzeSignal]).await;

        let mut executor = MockStepExecutor::new();
        executor.expect_kind().return_const(StepKind::AnalyzeSignal);
        executor
            .expect_execute()
            .returning(|_| Ok(serde_json::json!({})));

        let config = WorkerConfig {
            poll_batch_size: 1,
            ..test_config()
        };
        let harness = harness(store.clone(), executor, config);

        harness.poll_once().await.unwrap();
        let mid = store.get_mission(mission.id).await.unwrap().unwrap();
        assert_eq!(mid.status, MissionStatus::Running);

        harness.poll_once().await.unwrap();
        let done = store.get_mission(mission.id).await.unwrap().unwrap();
        assert_eq!(done.status, MissionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_breaker_trips_and_pauses_polling() {
        let store = Arc::new(MemoryJobStore::new());
        seed_mission(&store, vec![StepKind::AnalyzeSignal]).await;
        seed_mission(&store, vec![StepKind::AnalyzeSignal]).await;
        seed_mission(&store, vec![StepKind::AnalyzeSignal]).await;

        let mut executor = MockStepExecutor::new();
        executor.expect_kind().return_const(StepKind::AnalyzeSignal);
        executor
            .expect_execute()
            .returning(|_| Err(crate::error::OpsError::Internal("boom".to_string())));

        let config = WorkerConfig {
            poll_batch_size: 1,
            failure_threshold: 2,
            reset_window_secs: 3600,
            ..test_config()
        };
        let breaker = Arc::new(WorkerCircuitBreaker::new(2, Duration::from_secs(3600)));
        let harness =
            WorkerHarness::new(store.clone(), Arc::new(executor), breaker.clone(), config);

        harness.poll_once().await.unwrap();
        harness.poll_once().await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(breaker.total_trips(), 1);

        // Open circuit: the third queued step is not touched.
        assert_eq!(harness.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_breaker_half_open_probe_closes_on_success() {
        let breaker = WorkerCircuitBreaker::new(1, Duration::from_secs(0));

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Zero reset window: next allowance check moves to half-open.
        assert!(breaker.should_allow().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_half_open_failure_reopens() {
        let breaker = WorkerCircuitBreaker::new(3, Duration::from_secs(0));

        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert!(breaker.should_allow().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        // One failure in half-open reopens regardless of threshold.
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(breaker.total_trips(), 2);
    }

    #[tokio::test]
    async fn test_registry_returns_one_breaker_per_kind() {
        let registry = CircuitBreakerRegistry::new();
        let config = test_config();

        let a = registry.for_kind(StepKind::ExecuteTrade, &config);
        let b = registry.for_kind(StepKind::ExecuteTrade, &config);
        let c = registry.for_kind(StepKind::AnalyzeSignal, &config);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_claim_race_executes_each_step_once() {
        let store = Arc::new(MemoryJobStore::new());
        let (_, steps) = seed_mission(&store, vec![StepKind::ExecuteTrade]).await;
        let step_id = steps[0].id;

        let mut claims = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let worker = format!("w{i}");
            claims.push(tokio::spawn(async move {
                store.claim_step(step_id, &worker).await.unwrap()
            }));
        }

        let mut won = 0;
        for claim in claims {
            if claim.await.unwrap() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
    }

    // Payload kind projection sanity: the seeded ExecuteTrade step carries a
    // typed trade payload.
    #[tokio::test]
    async fn test_seeded_step_payload_kind_matches() {
        let store = Arc::new(MemoryJobStore::new());
        let (_, steps) = seed_mission(&store, vec![StepKind::ExecuteTrade]).await;
        assert!(matches!(steps[0].payload, StepPayload::ExecuteTrade { .. }));
    }
}
