//! Cap gates: per-step-kind admission checks against shared capacity.
//!
//! Two families of gate exist. The atomic claim gate (daily trade count) is
//! the actual capacity enforcer: it issues a single conditional increment
//! against the store and must fail loud when the store is unreachable.
//! Derived-state gates (open positions, notional exposure, position
//! existence) are advisory reads; they fail open on store faults because
//! availability wins over strict admission for that family.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::AdmissionConfig;
use crate::domain::{Proposal, ProposalMetadata, StepKind};
use crate::error::{GateError, Result};
use crate::store::JobStore;

/// Quota key for the daily trade counter
pub const DAILY_TRADES_KEY: &str = "daily_trades";

/// Result of one gate check
#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub kind: StepKind,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<Decimal>,
    /// True when this outcome holds a quota slot that must be released if
    /// the proposal is later rejected
    #[serde(skip)]
    pub holds_claim: bool,
}

impl GateOutcome {
    fn allowed(kind: StepKind) -> Self {
        Self {
            kind,
            allowed: true,
            reason: None,
            limit: None,
            current: None,
            holds_claim: false,
        }
    }

    fn denied(kind: StepKind, reason: String, limit: Decimal, current: Decimal) -> Self {
        Self {
            kind,
            allowed: false,
            reason: Some(reason),
            limit: Some(limit),
            current: Some(current),
            holds_claim: false,
        }
    }
}

/// Per-step-kind admission controller
pub struct AdmissionController {
    store: Arc<dyn JobStore>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn JobStore>, config: AdmissionConfig) -> Self {
        Self { store, config }
    }

    /// Check the gate for one step kind. Kinds with no registered gate are
    /// vacuously allowed.
    ///
    /// Errors surface only from the atomic claim path; advisory reads
    /// degrade to allowed.
    pub async fn check_gate(
        &self,
        kind: StepKind,
        metadata: &ProposalMetadata,
    ) -> Result<GateOutcome> {
        match kind {
            StepKind::ExecuteTrade => self.check_trade_entry(metadata).await,
            StepKind::ClosePosition | StepKind::ScalePosition => {
                Ok(self.check_position_exists(kind, metadata).await)
            }
            StepKind::HoldRoundtable | StepKind::AnalyzeSignal => Ok(GateOutcome::allowed(kind)),
        }
    }

    /// Release the quota slot held by an admitted claim-type outcome.
    /// Invoked by the pipeline when a later gate in the same proposal fails.
    /// A release that itself fails is logged and dropped: the slot leaks
    /// conservatively until period rollover.
    pub async fn rollback(&self, outcome: &GateOutcome) {
        if !outcome.holds_claim {
            return;
        }
        let today = Utc::now().date_naive();
        if let Err(e) = self.store.release_quota(DAILY_TRADES_KEY, today).await {
            warn!(kind = %outcome.kind, "quota rollback failed, slot leaks until rollover: {}", e);
        } else {
            debug!(kind = %outcome.kind, "released quota claim");
        }
    }

    /// Return the quota slots a proposal claimed at submission time. Used
    /// when a reviewer rejects or an agent cancels a proposal that already
    /// passed its gates. Releases go against the period the claims were made
    /// in, not today.
    pub async fn release_trade_claims(&self, proposal: &Proposal) {
        let period = proposal.created_at.date_naive();
        for _ in proposal
            .proposed_steps
            .iter()
            .filter(|k| matches!(k, StepKind::ExecuteTrade))
        {
            if let Err(e) = self.store.release_quota(DAILY_TRADES_KEY, period).await {
                warn!(proposal_id = %proposal.id, "claim release failed, slot leaks until rollover: {}", e);
            }
        }
    }

    /// Trade entry: advisory position/exposure checks, then the atomic
    /// daily-trade claim. The claim is the enforcer; a store error on the
    /// claim path propagates instead of admitting.
    async fn check_trade_entry(&self, metadata: &ProposalMetadata) -> Result<GateOutcome> {
        // Advisory: open position count. Fail open on store faults.
        match self.store.open_position_count().await {
            Ok(open) if open >= self.config.max_open_positions => {
                let err = GateError::MaxOpenPositions {
                    current: open,
                    limit: self.config.max_open_positions,
                };
                return Ok(GateOutcome::denied(
                    StepKind::ExecuteTrade,
                    err.to_string(),
                    Decimal::from(self.config.max_open_positions),
                    Decimal::from(open),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("position count unavailable, gate fails open: {}", e);
            }
        }

        // Advisory: total notional exposure after this trade. Fail open.
        let notional = metadata.notional_usd.unwrap_or(Decimal::ZERO);
        match self.store.open_notional_exposure().await {
            Ok(exposure) if exposure + notional > self.config.max_notional_exposure_usd => {
                let err = GateError::MaxExposure {
                    current: exposure + notional,
                    limit: self.config.max_notional_exposure_usd,
                };
                return Ok(GateOutcome::denied(
                    StepKind::ExecuteTrade,
                    err.to_string(),
                    self.config.max_notional_exposure_usd,
                    exposure,
                ));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("exposure aggregate unavailable, gate fails open: {}", e);
            }
        }

        // Enforcer: one conditional increment. Over-limit is strictly
        // current > limit after the increment, so the claim that lands
        // exactly on the limit is admitted.
        let today = Utc::now().date_naive();
        let claim = self
            .store
            .try_claim_quota(DAILY_TRADES_KEY, today, self.config.max_daily_trades)
            .await?;

        if claim.admitted {
            let mut outcome = GateOutcome::allowed(StepKind::ExecuteTrade);
            outcome.limit = Some(Decimal::from(self.config.max_daily_trades));
            outcome.current = Some(Decimal::from(claim.current));
            outcome.holds_claim = true;
            Ok(outcome)
        } else {
            let err = GateError::DailyTradeLimit {
                current: claim.current,
                limit: self.config.max_daily_trades,
            };
            Ok(GateOutcome::denied(
                StepKind::ExecuteTrade,
                err.to_string(),
                Decimal::from(self.config.max_daily_trades),
                Decimal::from(claim.current),
            ))
        }
    }

    /// Exit/scale steps need an open position for the symbol. Advisory:
    /// fails open when the store cannot answer.
    async fn check_position_exists(
        &self,
        kind: StepKind,
        metadata: &ProposalMetadata,
    ) -> GateOutcome {
        let Some(symbol) = metadata.symbol.as_deref() else {
            return GateOutcome {
                kind,
                allowed: false,
                reason: Some("no symbol in proposal metadata".to_string()),
                limit: None,
                current: None,
                holds_claim: false,
            };
        };

        match self.store.has_open_position(symbol).await {
            Ok(true) => GateOutcome::allowed(kind),
            Ok(false) => GateOutcome {
                kind,
                allowed: false,
                reason: Some(
                    GateError::NoOpenPosition {
                        symbol: symbol.to_string(),
                    }
                    .to_string(),
                ),
                limit: None,
                current: None,
                holds_claim: false,
            },
            Err(e) => {
                warn!(symbol, "position lookup unavailable, gate fails open: {}", e);
                GateOutcome::allowed(kind)
            }
        }
    }
}
