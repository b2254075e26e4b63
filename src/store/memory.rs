//! In-memory job store for tests and dry-run mode.
//!
//! Every trait method takes the single inner mutex once, so each operation
//! is atomic with respect to concurrent callers, matching the guarantees the
//! Postgres implementation gets from conditional UPDATEs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    Mission, MissionStatus, MissionStep, Proposal, ProposalStatus, StepKind, StepStatus,
};
use crate::error::{OpsError, Result};

use super::{JobStore, QuotaClaim, SystemStats};

#[derive(Default)]
struct Inner {
    quotas: HashMap<(String, NaiveDate), i64>,
    proposals: HashMap<Uuid, Proposal>,
    missions: HashMap<Uuid, Mission>,
    steps: HashMap<Uuid, MissionStep>,
    positions: HashMap<String, Decimal>,
}

/// In-memory [`JobStore`] backed by a single mutex
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage. Used by tests and failover drills to
    /// exercise the fail-open/fail-loud gate paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OpsError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn try_claim_quota(
        &self,
        key: &str,
        period: NaiveDate,
        limit: i64,
    ) -> Result<QuotaClaim> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let counter = inner.quotas.entry((key.to_string(), period)).or_insert(0);
        if *counter + 1 > limit {
            return Ok(QuotaClaim {
                admitted: false,
                current: *counter,
            });
        }
        *counter += 1;
        Ok(QuotaClaim {
            admitted: true,
            current: *counter,
        })
    }

    async fn release_quota(&self, key: &str, period: NaiveDate) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if let Some(counter) = inner.quotas.get_mut(&(key.to_string(), period)) {
            *counter = (*counter - 1).max(0);
        }
        Ok(())
    }

    async fn quota_count(&self, key: &str, period: NaiveDate) -> Result<i64> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .quotas
            .get(&(key.to_string(), period))
            .copied()
            .unwrap_or(0))
    }

    async fn insert_proposal(&self, proposal: &Proposal) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.proposals.insert(proposal.id, proposal.clone());
        Ok(())
    }

    async fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.proposals.get(&id).cloned())
    }

    async fn update_proposal_status(
        &self,
        id: Uuid,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.proposals.get_mut(&id) {
            Some(proposal) if proposal.status == from => {
                proposal.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_proposals(&self, limit: i64) -> Result<Vec<Proposal>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut pending: Vec<Proposal> = inner
            .proposals
            .values()
            .filter(|p| p.status == ProposalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn insert_mission_with_steps(
        &self,
        mission: &Mission,
        steps: &[MissionStep],
    ) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        // One mission per proposal, same guarantee the Postgres unique index
        // on proposal_id gives.
        if let Some(proposal_id) = mission.proposal_id {
            if inner
                .missions
                .values()
                .any(|m| m.proposal_id == Some(proposal_id))
            {
                return Err(OpsError::Internal(format!(
                    "mission already exists for proposal {proposal_id}"
                )));
            }
        }
        // Steps land in the same lock scope as the mission, so no reader can
        // observe one without the other.
        for step in steps {
            inner.steps.insert(step.id, step.clone());
        }
        inner.missions.insert(mission.id, mission.clone());
        Ok(())
    }

    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.missions.get(&id).cloned())
    }

    async fn update_mission_status(
        &self,
        id: Uuid,
        from: MissionStatus,
        to: MissionStatus,
    ) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.missions.get_mut(&id) {
            Some(mission) if mission.status == from => {
                mission.status = to;
                if to.is_terminal() {
                    mission.completed_at = Some(Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mission_steps(&self, mission_id: Uuid) -> Result<Vec<MissionStep>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut steps: Vec<MissionStep> = inner
            .steps
            .values()
            .filter(|s| s.mission_id == mission_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.created_at);
        Ok(steps)
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<MissionStep>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.steps.get(&id).cloned())
    }

    async fn fetch_queued_steps(&self, kind: StepKind, limit: i64) -> Result<Vec<MissionStep>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut steps: Vec<MissionStep> = inner
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Queued && s.kind == kind)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.created_at);
        steps.truncate(limit.max(0) as usize);
        Ok(steps)
    }

    async fn claim_step(&self, step_id: Uuid, worker_id: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.steps.get_mut(&step_id) {
            Some(step) if step.status == StepStatus::Queued => {
                step.status = StepStatus::Running;
                step.assigned_to = Some(worker_id.to_string());
                step.started_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_step(&self, step_id: Uuid, result: serde_json::Value) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.steps.get_mut(&step_id) {
            Some(step) if step.status == StepStatus::Running => {
                step.status = StepStatus::Succeeded;
                step.result = Some(result);
                step.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_step(&self, step_id: Uuid, error: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.steps.get_mut(&step_id) {
            Some(step) if step.status == StepStatus::Running => {
                step.status = StepStatus::Failed;
                step.error = Some(error.to_string());
                step.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_step_count(&self, mission_id: Uuid) -> Result<i64> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .steps
            .values()
            .filter(|s| {
                s.mission_id == mission_id
                    && matches!(s.status, StepStatus::Queued | StepStatus::Running)
            })
            .count() as i64)
    }

    async fn failed_step_count(&self, mission_id: Uuid) -> Result<i64> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .steps
            .values()
            .filter(|s| s.mission_id == mission_id && s.status == StepStatus::Failed)
            .count() as i64)
    }

    async fn find_stale_steps(
        &self,
        older_than: DateTime<Utc>,
        kind: Option<StepKind>,
    ) -> Result<Vec<MissionStep>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut steps: Vec<MissionStep> = inner
            .steps
            .values()
            .filter(|s| {
                s.status == StepStatus::Running
                    && s.started_at.map(|t| t < older_than).unwrap_or(false)
                    && kind.map(|k| s.kind == k).unwrap_or(true)
            })
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.started_at);
        Ok(steps)
    }

    async fn open_position_count(&self) -> Result<i64> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.positions.len() as i64)
    }

    async fn open_notional_exposure(&self) -> Result<Decimal> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.positions.values().copied().sum())
    }

    async fn has_open_position(&self, symbol: &str) -> Result<bool> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.positions.contains_key(symbol))
    }

    async fn upsert_open_position(&self, symbol: &str, notional_usd: Decimal) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.positions.insert(symbol.to_string(), notional_usd);
        Ok(())
    }

    async fn close_position(&self, symbol: &str) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.positions.remove(symbol);
        Ok(())
    }

    async fn purge_terminal_steps_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let before = inner.steps.len();
        inner.steps.retain(|_, s| {
            !(s.status.is_terminal() && s.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - inner.steps.len()) as u64)
    }

    async fn system_stats(&self) -> Result<SystemStats> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut stats = SystemStats {
            open_positions: inner.positions.len() as i64,
            ..Default::default()
        };
        for p in inner.proposals.values() {
            match p.status {
                ProposalStatus::Pending => stats.proposals_pending += 1,
                ProposalStatus::Accepted => stats.proposals_accepted += 1,
                ProposalStatus::Rejected => stats.proposals_rejected += 1,
                _ => {}
            }
        }
        for m in inner.missions.values() {
            match m.status {
                MissionStatus::Running => stats.missions_running += 1,
                MissionStatus::Succeeded => stats.missions_succeeded += 1,
                MissionStatus::Failed => stats.missions_failed += 1,
                _ => {}
            }
        }
        for s in inner.steps.values() {
            match s.status {
                StepStatus::Queued => stats.steps_queued += 1,
                StepStatus::Running => stats.steps_running += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}
