//! Persistent records for proposals, missions, steps, and quota counters.
//!
//! Every mutation that matters for correctness is an atomic conditional
//! update: claim-if-status-matches for steps, increment-if-below-limit for
//! quota counters, compare-and-swap on status everywhere else. Blind
//! overwrites are not part of this interface.

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{
    Mission, MissionStatus, MissionStep, Proposal, ProposalStatus, StepKind,
};
use crate::error::Result;

/// Outcome of an atomic quota claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaClaim {
    /// Whether the increment was admitted (new value <= limit)
    pub admitted: bool,
    /// Counter value after the attempt (unchanged when not admitted)
    pub current: i64,
}

/// 24h activity snapshot for operator logging
#[derive(Debug, Clone, Default)]
pub struct SystemStats {
    pub proposals_pending: i64,
    pub proposals_accepted: i64,
    pub proposals_rejected: i64,
    pub missions_running: i64,
    pub missions_succeeded: i64,
    pub missions_failed: i64,
    pub steps_queued: i64,
    pub steps_running: i64,
    pub open_positions: i64,
}

/// Storage contract for the admission-control + job-scheduling pipeline.
///
/// Implementations must make each method atomic with respect to concurrent
/// callers; the pipeline and workers rely on that, not on any outer lock.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ==================== Quota counters ====================

    /// Increment the counter for (key, period) by one if and only if the new
    /// value would not exceed `limit`. One indivisible operation; never a
    /// read followed by a write.
    async fn try_claim_quota(&self, key: &str, period: NaiveDate, limit: i64)
        -> Result<QuotaClaim>;

    /// Compensation for a claim that was admitted but must be returned
    /// (a later gate in the same proposal failed). Floored at zero.
    async fn release_quota(&self, key: &str, period: NaiveDate) -> Result<()>;

    /// Read-only counter value, 0 when the counter does not exist
    async fn quota_count(&self, key: &str, period: NaiveDate) -> Result<i64>;

    // ==================== Proposals ====================

    async fn insert_proposal(&self, proposal: &Proposal) -> Result<()>;

    async fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>>;

    /// CAS on proposal status; returns false when the proposal is not in
    /// `from` (including when it is already terminal).
    async fn update_proposal_status(
        &self,
        id: Uuid,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<bool>;

    /// Pending proposals, newest first, for the external review queue
    async fn pending_proposals(&self, limit: i64) -> Result<Vec<Proposal>>;

    // ==================== Missions & steps ====================

    /// Persist a mission and all of its steps together. A reader must never
    /// observe the mission without its steps.
    async fn insert_mission_with_steps(
        &self,
        mission: &Mission,
        steps: &[MissionStep],
    ) -> Result<()>;

    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>>;

    /// CAS on mission status; monotonicity is enforced by always passing the
    /// expected prior status.
    async fn update_mission_status(
        &self,
        id: Uuid,
        from: MissionStatus,
        to: MissionStatus,
    ) -> Result<bool>;

    async fn mission_steps(&self, mission_id: Uuid) -> Result<Vec<MissionStep>>;

    async fn get_step(&self, id: Uuid) -> Result<Option<MissionStep>>;

    /// Queued steps of a kind, oldest first
    async fn fetch_queued_steps(&self, kind: StepKind, limit: i64) -> Result<Vec<MissionStep>>;

    /// Atomically claim a queued step: set running/assigned_to/started_at
    /// only when the step is still queued. Exactly one of N concurrent
    /// callers observes true.
    async fn claim_step(&self, step_id: Uuid, worker_id: &str) -> Result<bool>;

    /// Mark a running step succeeded. Returns false (never errors) when the
    /// step is not running, which makes retries idempotent.
    async fn complete_step(&self, step_id: Uuid, result: serde_json::Value) -> Result<bool>;

    /// Mark a running step failed. Same idempotency contract as
    /// [`complete_step`](JobStore::complete_step).
    async fn fail_step(&self, step_id: Uuid, error: &str) -> Result<bool>;

    /// Steps of the mission still queued or running
    async fn pending_step_count(&self, mission_id: Uuid) -> Result<i64>;

    async fn failed_step_count(&self, mission_id: Uuid) -> Result<i64>;

    /// Running steps whose started_at is older than the cutoff, optionally
    /// restricted to one kind
    async fn find_stale_steps(
        &self,
        older_than: DateTime<Utc>,
        kind: Option<StepKind>,
    ) -> Result<Vec<MissionStep>>;

    // ==================== Position aggregates (advisory gates) ====================

    async fn open_position_count(&self) -> Result<i64>;

    async fn open_notional_exposure(&self) -> Result<Decimal>;

    async fn has_open_position(&self, symbol: &str) -> Result<bool>;

    /// Record an opened position (called by execution adapters)
    async fn upsert_open_position(&self, symbol: &str, notional_usd: Decimal) -> Result<()>;

    /// Mark a position closed
    async fn close_position(&self, symbol: &str) -> Result<()>;

    // ==================== Maintenance ====================

    /// Delete terminal steps completed before the cutoff; returns rows removed
    async fn purge_terminal_steps_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn system_stats(&self) -> Result<SystemStats>;
}
