//! Approval policy collaborator.
//!
//! The pipeline treats the policy engine as a pure decision function: given
//! the step kinds of a proposal it answers whether the proposal may skip
//! human review. No side effects are assumed.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::StepKind;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Whether a proposal consisting of exactly these step kinds may be
    /// approved without human review
    async fn evaluate_auto_approve(&self, step_kinds: &[StepKind]) -> bool;

    /// Whether a step kind needs a roundtable conversation before execution
    fn requires_roundtable(&self, kind: StepKind) -> bool;

    /// Largest notional a proposal may carry and still skip review. Larger
    /// proposals fall to the pending queue even when their kinds qualify.
    fn max_auto_approve_notional(&self) -> Decimal;
}

/// Policy backed by a static allow-list from configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StaticPolicy {
    /// Step kinds that may be auto-approved; a proposal qualifies only when
    /// every one of its kinds is listed
    pub auto_approve_kinds: Vec<StepKind>,
    /// Step kinds that must go through a roundtable first
    #[serde(default)]
    pub roundtable_kinds: Vec<StepKind>,
    /// Notional ceiling for skipping review
    #[serde(default = "default_auto_approve_notional")]
    pub max_auto_approve_notional_usd: Decimal,
}

fn default_auto_approve_notional() -> Decimal {
    Decimal::from(250)
}

impl Default for StaticPolicy {
    fn default() -> Self {
        Self {
            // Analysis and conversations are safe to run unattended;
            // anything touching positions waits for review.
            auto_approve_kinds: vec![StepKind::AnalyzeSignal, StepKind::HoldRoundtable],
            roundtable_kinds: vec![StepKind::ExecuteTrade],
            max_auto_approve_notional_usd: default_auto_approve_notional(),
        }
    }
}

impl StaticPolicy {
    /// Policy that auto-approves every step kind (paper trading / tests)
    pub fn allow_all() -> Self {
        Self {
            auto_approve_kinds: vec![
                StepKind::ExecuteTrade,
                StepKind::ClosePosition,
                StepKind::ScalePosition,
                StepKind::HoldRoundtable,
                StepKind::AnalyzeSignal,
            ],
            roundtable_kinds: vec![],
            max_auto_approve_notional_usd: Decimal::from(1_000_000),
        }
    }
}

#[async_trait]
impl PolicyEngine for StaticPolicy {
    async fn evaluate_auto_approve(&self, step_kinds: &[StepKind]) -> bool {
        !step_kinds.is_empty()
            && step_kinds
                .iter()
                .all(|kind| self.auto_approve_kinds.contains(kind))
    }

    fn requires_roundtable(&self, kind: StepKind) -> bool {
        self.roundtable_kinds.contains(&kind)
    }

    fn max_auto_approve_notional(&self) -> Decimal {
        self.max_auto_approve_notional_usd
    }
}
