//! Heartbeat scheduler: periodic maintenance with isolation between ops.
//!
//! Each cycle runs a fixed, ordered list of maintenance operations. Every
//! operation gets its own wall-clock budget so one hung collaborator cannot
//! starve the rest, and a reentrancy guard keeps cycles from stacking when a
//! cycle overruns the interval.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::domain::{MissionStatus, StepKind};
use crate::error::Result;
use crate::store::JobStore;

/// One maintenance operation run by the heartbeat.
///
/// Implementations are treated as black boxes: the scheduler only sees a
/// name, a count, and success or failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MaintenanceOp: Send + Sync {
    fn name(&self) -> &'static str;

    /// Perform the operation, returning how many items it touched
    async fn run(&self) -> Result<u64>;
}

/// Outcome of one op within a cycle
#[derive(Debug, Clone)]
pub struct OpReport {
    pub name: &'static str,
    pub success: bool,
    pub count: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Aggregate outcome of one heartbeat cycle
#[derive(Debug, Clone)]
pub struct HeartbeatReport {
    pub started_at: DateTime<Utc>,
    pub ops: Vec<OpReport>,
    pub total_duration: Duration,
}

impl HeartbeatReport {
    pub fn failures(&self) -> impl Iterator<Item = &OpReport> {
        self.ops.iter().filter(|op| !op.success)
    }
}

/// Periodic maintenance driver
pub struct HeartbeatScheduler {
    config: SchedulerConfig,
    ops: Vec<Arc<dyn MaintenanceOp>>,
    in_progress: Mutex<Option<DateTime<Utc>>>,
}

impl HeartbeatScheduler {
    /// Scheduler over an explicit ordered op list
    pub fn new(config: SchedulerConfig, ops: Vec<Arc<dyn MaintenanceOp>>) -> Self {
        Self {
            config,
            ops,
            in_progress: Mutex::new(None),
        }
    }

    /// Standard op order: externally supplied ops (trigger evaluation,
    /// reaction queue, insight promotion, outcome learning) first, then the
    /// built-in recovery and cleanup ops.
    pub fn with_standard_ops(
        store: Arc<dyn JobStore>,
        config: SchedulerConfig,
        external: Vec<Arc<dyn MaintenanceOp>>,
    ) -> Self {
        let mut ops = external;
        ops.push(Arc::new(StaleStepRecovery {
            store: store.clone(),
            stale_after_minutes: config.stale_roundtable_minutes,
            kind: Some(StepKind::HoldRoundtable),
            name: "stale_roundtable_recovery",
        }));
        ops.push(Arc::new(StaleStepRecovery {
            store: store.clone(),
            stale_after_minutes: config.stale_step_minutes,
            kind: None,
            name: "stale_step_recovery",
        }));
        ops.push(Arc::new(RetentionCleanup {
            store: store.clone(),
            retention_days: config.retention_days,
        }));
        ops.push(Arc::new(StatsSnapshot { store }));
        Self::new(config, ops)
    }

    /// Run heartbeat cycles until shutdown is signalled
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = self.config.interval_secs, "heartbeat scheduler started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Some(report) = self.run_cycle().await {
                        for failed in report.failures() {
                            warn!(op = failed.name, error = ?failed.error, "heartbeat op failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Run one cycle. Returns `None` when a previous cycle is still in
    /// progress and has not yet crossed the deadlock threshold.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Option<HeartbeatReport> {
        let started_at = Utc::now();
        {
            let mut guard = self.in_progress.lock().await;
            if let Some(since) = *guard {
                let held_for = Utc::now().signed_duration_since(since);
                if held_for < ChronoDuration::seconds(self.config.deadlock_threshold_secs as i64) {
                    debug!(held_secs = held_for.num_seconds(), "cycle in progress, skipping");
                    return None;
                }
                warn!(
                    held_secs = held_for.num_seconds(),
                    "in-progress flag exceeded deadlock threshold, force-clearing"
                );
            }
            *guard = Some(started_at);
        }

        let cycle_start = Instant::now();
        let cycle_budget = Duration::from_millis(self.config.cycle_budget_ms);
        let op_budget = Duration::from_millis(self.config.op_budget_ms);
        let mut ops = Vec::with_capacity(self.ops.len());

        for op in &self.ops {
            if cycle_start.elapsed() >= cycle_budget {
                warn!(op = op.name(), "cycle budget exhausted, remaining ops skipped");
                break;
            }
            ops.push(Self::run_op(op.as_ref(), op_budget).await);
        }

        *self.in_progress.lock().await = None;

        let report = HeartbeatReport {
            started_at,
            ops,
            total_duration: cycle_start.elapsed(),
        };
        info!(
            ops = report.ops.len(),
            failed = report.failures().count(),
            total_ms = report.total_duration.as_millis() as u64,
            "heartbeat cycle complete"
        );
        Some(report)
    }

    async fn run_op(op: &dyn MaintenanceOp, budget: Duration) -> OpReport {
        let start = Instant::now();
        match tokio::time::timeout(budget, op.run()).await {
            Ok(Ok(count)) => {
                debug!(op = op.name(), count, "op complete");
                OpReport {
                    name: op.name(),
                    success: true,
                    count,
                    duration: start.elapsed(),
                    error: None,
                }
            }
            Ok(Err(e)) => OpReport {
                name: op.name(),
                success: false,
                count: 0,
                duration: start.elapsed(),
                error: Some(e.to_string()),
            },
            Err(_) => OpReport {
                name: op.name(),
                success: false,
                count: 0,
                duration: start.elapsed(),
                error: Some(format!("timed out after {}ms", budget.as_millis())),
            },
        }
    }
}

/// Force-fails running steps whose worker went silent, then settles their
/// missions. Safe to run concurrently with workers: the fail transition is a
/// CAS, so a step that finished in the meantime is left alone.
struct StaleStepRecovery {
    store: Arc<dyn JobStore>,
    stale_after_minutes: i64,
    kind: Option<StepKind>,
    name: &'static str,
}

#[async_trait]
impl MaintenanceOp for StaleStepRecovery {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::minutes(self.stale_after_minutes);
        let stale = self.store.find_stale_steps(cutoff, self.kind).await?;

        let mut recovered = 0;
        for step in stale {
            let failed = self
                .store
                .fail_step(
                    step.id,
                    &format!(
                        "abandoned: running since {} (worker {})",
                        step.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                        step.assigned_to.as_deref().unwrap_or("unknown"),
                    ),
                )
                .await?;
            if !failed {
                continue;
            }
            recovered += 1;
            warn!(step_id = %step.id, mission_id = %step.mission_id, "recovered stale step");

            if self.store.pending_step_count(step.mission_id).await? == 0 {
                let moved = self
                    .store
                    .update_mission_status(
                        step.mission_id,
                        MissionStatus::Running,
                        MissionStatus::Failed,
                    )
                    .await?;
                if !moved {
                    // A worker that died between claiming the step and
                    // advancing the mission leaves it in approved.
                    self.store
                        .update_mission_status(
                            step.mission_id,
                            MissionStatus::Approved,
                            MissionStatus::Failed,
                        )
                        .await?;
                }
            }
        }
        Ok(recovered)
    }
}

/// Deletes terminal steps older than the retention window
struct RetentionCleanup {
    store: Arc<dyn JobStore>,
    retention_days: i64,
}

#[async_trait]
impl MaintenanceOp for RetentionCleanup {
    fn name(&self) -> &'static str {
        "retention_cleanup"
    }

    async fn run(&self) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);
        self.store.purge_terminal_steps_before(cutoff).await
    }
}

/// Logs a 24h activity snapshot for operators
struct StatsSnapshot {
    store: Arc<dyn JobStore>,
}

#[async_trait]
impl MaintenanceOp for StatsSnapshot {
    fn name(&self) -> &'static str {
        "stats_snapshot"
    }

    async fn run(&self) -> Result<u64> {
        let stats = self.store.system_stats().await?;
        info!(
            proposals_pending = stats.proposals_pending,
            proposals_accepted = stats.proposals_accepted,
            proposals_rejected = stats.proposals_rejected,
            missions_running = stats.missions_running,
            steps_queued = stats.steps_queued,
            open_positions = stats.open_positions,
            "desk activity snapshot"
        );
        Ok(0)
    }
}
