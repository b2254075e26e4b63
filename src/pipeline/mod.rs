//! Proposal pipeline: validate, persist, gate, approve or reject.
//!
//! Admission correctness under concurrent submissions is enforced entirely
//! by the store's atomic claim primitive; the pipeline itself holds no lock.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::admission::{AdmissionController, GateOutcome};
use crate::config::PipelineConfig;
use crate::domain::{AgentId, Proposal, ProposalMetadata, ProposalStatus, StepKind};
use crate::error::{OpsError, Result};
use crate::events::{AgentEvent, EventSink};
use crate::mission::MissionBuilder;
use crate::policy::PolicyEngine;
use crate::store::JobStore;

/// An agent's submission
#[derive(Debug, Clone, Deserialize)]
pub struct ProposalRequest {
    pub agent_id: AgentId,
    pub title: String,
    pub steps: Vec<StepKind>,
    #[serde(default)]
    pub metadata: ProposalMetadata,
}

/// Structured per-submission result: the pipeline's only externally
/// visible contract
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub proposal_id: Uuid,
    pub success: bool,
    pub status: ProposalStatus,
    pub auto_approved: bool,
    pub mission_id: Option<Uuid>,
    /// Every gate result in caller order, pass or fail, for diagnostics
    pub gate_report: Vec<GateOutcome>,
    pub rejection_reason: Option<String>,
}

/// The proposal state machine
pub struct ProposalPipeline {
    store: Arc<dyn JobStore>,
    admission: AdmissionController,
    builder: MissionBuilder,
    policy: Arc<dyn PolicyEngine>,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
}

impl ProposalPipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        admission: AdmissionController,
        policy: Arc<dyn PolicyEngine>,
        events: Arc<dyn EventSink>,
        config: PipelineConfig,
    ) -> Self {
        let builder = MissionBuilder::new(store.clone());
        Self {
            store,
            admission,
            builder,
            policy,
            events,
            config,
        }
    }

    /// Submit a proposal. Validation failures error out before any store
    /// write; gate rejections come back as a structured outcome with
    /// `success = false`.
    pub async fn submit(&self, request: ProposalRequest) -> Result<SubmissionOutcome> {
        self.validate(&request)?;

        let proposal = Proposal::new(
            request.agent_id,
            request.title,
            request.steps,
            request.metadata,
        );
        self.store.insert_proposal(&proposal).await?;
        self.emit(
            &proposal,
            "proposal_created",
            format!("{} proposed {} step(s)", proposal.agent_id, proposal.proposed_steps.len()),
        )
        .await;

        // Evaluate every gate in caller order, no short-circuit: downstream
        // consumers want the full pass/fail report even though the first
        // failure decides rejection.
        let mut gate_report: Vec<GateOutcome> = Vec::with_capacity(proposal.proposed_steps.len());
        for &kind in &proposal.proposed_steps {
            match self.admission.check_gate(kind, &proposal.metadata).await {
                Ok(outcome) => gate_report.push(outcome),
                Err(e) => {
                    // The atomic claim path failed loud. Return capacity
                    // claimed so far and surface the fault; never silently
                    // admit.
                    self.rollback_claims(&gate_report).await;
                    let _ = self
                        .store
                        .update_proposal_status(
                            proposal.id,
                            ProposalStatus::Pending,
                            ProposalStatus::Rejected,
                        )
                        .await;
                    return Err(e);
                }
            }
        }

        if let Some(failed) = gate_report.iter().find(|g| !g.allowed) {
            let reason = failed
                .reason
                .clone()
                .unwrap_or_else(|| "admission denied".to_string());
            let failed_kind = failed.kind;

            // Explicit compensation: release every claim-type gate admitted
            // for this proposal before marking it rejected.
            self.rollback_claims(&gate_report).await;

            self.store
                .update_proposal_status(
                    proposal.id,
                    ProposalStatus::Pending,
                    ProposalStatus::Rejected,
                )
                .await?;

            self.emit(
                &proposal,
                "proposal_rejected",
                format!("{failed_kind}: {reason}"),
            )
            .await;

            info!(proposal_id = %proposal.id, kind = %failed_kind, reason, "proposal rejected");
            return Ok(SubmissionOutcome {
                proposal_id: proposal.id,
                success: false,
                status: ProposalStatus::Rejected,
                auto_approved: false,
                mission_id: None,
                gate_report,
                rejection_reason: Some(reason),
            });
        }

        // All gates passed; the policy engine decides review routing. Kinds
        // must qualify, the notional must sit under the policy ceiling, and
        // any kind that requires a roundtable must have one scheduled.
        let notional = proposal.metadata.notional_usd.unwrap_or(Decimal::ZERO);
        let missing_roundtable = proposal
            .proposed_steps
            .iter()
            .any(|&kind| self.policy.requires_roundtable(kind))
            && !proposal.proposed_steps.contains(&StepKind::HoldRoundtable);
        let auto_approve = self.policy.evaluate_auto_approve(&proposal.proposed_steps).await
            && notional <= self.policy.max_auto_approve_notional()
            && !missing_roundtable;
        if !auto_approve {
            self.emit(
                &proposal,
                "proposal_pending_review",
                "all gates passed, awaiting review".to_string(),
            )
            .await;
            return Ok(SubmissionOutcome {
                proposal_id: proposal.id,
                success: true,
                status: ProposalStatus::Pending,
                auto_approved: false,
                mission_id: None,
                gate_report,
                rejection_reason: None,
            });
        }

        let advanced = self
            .store
            .update_proposal_status(
                proposal.id,
                ProposalStatus::Pending,
                ProposalStatus::AutoApproved,
            )
            .await?;
        if !advanced {
            return Err(OpsError::InvalidStateTransition {
                from: ProposalStatus::Pending.to_string(),
                to: ProposalStatus::AutoApproved.to_string(),
            });
        }

        let (mission, steps) = self
            .builder
            .create_from_proposal(&proposal, ProposalStatus::AutoApproved)
            .await?;

        self.emit(
            &proposal,
            "mission_created",
            format!("mission {} with {} step(s)", mission.id, steps.len()),
        )
        .await;

        Ok(SubmissionOutcome {
            proposal_id: proposal.id,
            success: true,
            status: ProposalStatus::Accepted,
            auto_approved: true,
            mission_id: Some(mission.id),
            gate_report,
            rejection_reason: None,
        })
    }

    /// Resolve a pending proposal from the review queue. Approval builds the
    /// mission exactly as auto-approval does; rejection returns any quota
    /// slots claimed at submission time.
    pub async fn review(&self, proposal_id: Uuid, approve: bool) -> Result<SubmissionOutcome> {
        let proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or(OpsError::ProposalNotFound(proposal_id))?;
        if proposal.status != ProposalStatus::Pending {
            return Err(OpsError::InvalidStateTransition {
                from: proposal.status.to_string(),
                to: if approve { "accepted" } else { "rejected" }.to_string(),
            });
        }

        if approve {
            let (mission, steps) = self
                .builder
                .create_from_proposal(&proposal, ProposalStatus::Pending)
                .await?;
            self.emit(
                &proposal,
                "mission_created",
                format!("reviewer approved, mission {} with {} step(s)", mission.id, steps.len()),
            )
            .await;
            return Ok(SubmissionOutcome {
                proposal_id,
                success: true,
                status: ProposalStatus::Accepted,
                auto_approved: false,
                mission_id: Some(mission.id),
                gate_report: Vec::new(),
                rejection_reason: None,
            });
        }

        self.close_pending(&proposal, ProposalStatus::Rejected, "proposal_rejected")
            .await?;
        Ok(SubmissionOutcome {
            proposal_id,
            success: false,
            status: ProposalStatus::Rejected,
            auto_approved: false,
            mission_id: None,
            gate_report: Vec::new(),
            rejection_reason: Some("rejected by reviewer".to_string()),
        })
    }

    /// Withdraw a pending proposal (the submitting agent changed its mind).
    /// Claimed quota slots are returned.
    pub async fn cancel(&self, proposal_id: Uuid) -> Result<()> {
        let proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or(OpsError::ProposalNotFound(proposal_id))?;
        if proposal.status != ProposalStatus::Pending {
            return Err(OpsError::InvalidStateTransition {
                from: proposal.status.to_string(),
                to: ProposalStatus::Cancelled.to_string(),
            });
        }
        self.close_pending(&proposal, ProposalStatus::Cancelled, "proposal_cancelled")
            .await
    }

    /// Move a pending proposal to a terminal non-accepted status, returning
    /// its quota claims first.
    async fn close_pending(
        &self,
        proposal: &Proposal,
        to: ProposalStatus,
        event_kind: &str,
    ) -> Result<()> {
        let moved = self
            .store
            .update_proposal_status(proposal.id, ProposalStatus::Pending, to)
            .await?;
        if !moved {
            // Lost a race with another reviewer or canceller.
            return Err(OpsError::InvalidStateTransition {
                from: ProposalStatus::Pending.to_string(),
                to: to.to_string(),
            });
        }
        // Winning the CAS makes this the only closer, so the release below
        // runs exactly once per claim.
        self.admission.release_trade_claims(proposal).await;
        self.emit(proposal, event_kind, format!("proposal {to}")).await;
        info!(proposal_id = %proposal.id, status = %to, "pending proposal closed");
        Ok(())
    }

    /// Shape validation, before any side effect
    fn validate(&self, request: &ProposalRequest) -> Result<()> {
        if request.steps.is_empty() {
            return Err(OpsError::Validation(
                "proposal must contain at least one step".to_string(),
            ));
        }
        if request.steps.len() > self.config.max_steps_per_proposal {
            return Err(OpsError::Validation(format!(
                "proposal has {} steps, maximum is {}",
                request.steps.len(),
                self.config.max_steps_per_proposal
            )));
        }
        let title_len = request.title.trim().chars().count();
        if title_len < self.config.min_title_len {
            return Err(OpsError::Validation(format!(
                "title too short: {} chars, minimum {}",
                title_len, self.config.min_title_len
            )));
        }
        if title_len > self.config.max_title_len {
            return Err(OpsError::Validation(format!(
                "title too long: {} chars, maximum {}",
                title_len, self.config.max_title_len
            )));
        }
        Ok(())
    }

    async fn rollback_claims(&self, gate_report: &[GateOutcome]) {
        for outcome in gate_report.iter().filter(|g| g.holds_claim) {
            self.admission.rollback(outcome).await;
        }
    }

    async fn emit(&self, proposal: &Proposal, kind: &str, summary: String) {
        // Fire-and-forget; the sink logs its own failures.
        self.events
            .emit(AgentEvent {
                agent_id: proposal.agent_id,
                kind: kind.to_string(),
                title: proposal.title.clone(),
                summary,
                tags: vec!["proposal".to_string()],
                metadata: serde_json::json!({ "proposal_id": proposal.id }),
                at: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::DAILY_TRADES_KEY;
    use crate::config::AdmissionConfig;
    use crate::events::TracingEventSink;
    use crate::policy::StaticPolicy;
    use crate::store::MemoryJobStore;
    use rust_decimal_macros::dec;

    fn pipeline_with(
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

    fn default_admission() -> AdmissionConfig {
        AdmissionConfig {
            max_daily_trades: 2,
            max_open_positions: 5,
            max_notional_exposure_usd: dec!(1000),
        }
    }

    #[tokio::test]
    async fn test_validation_rejects_before_any_write() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(StaticPolicy::default()),
            default_admission(),
        );

        let result = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Intel,
                title: "valid title".to_string(),
                steps: vec![],
                metadata: ProposalMetadata::default(),
            })
            .await;
        assert!(matches!(result, Err(OpsError::Validation(_))));

        let result = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Intel,
                title: "x".to_string(),
                steps: vec![StepKind::AnalyzeSignal],
                metadata: ProposalMetadata::default(),
            })
            .await;
        assert!(matches!(result, Err(OpsError::Validation(_))));

        // Nothing persisted on either path.
        assert!(store.pending_proposals(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_rolls_back_earlier_claims() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(StaticPolicy::allow_all()),
            default_admission(),
        );

        // ExecuteTrade claims a quota slot; ClosePosition then fails because
        // there is no open position for the symbol. The claim must be
        // released on rejection.
        let outcome = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Quant,
                title: "enter then exit BTC".to_string(),
                steps: vec![StepKind::ExecuteTrade, StepKind::ClosePosition],
                metadata: ProposalMetadata {
                    symbol: Some("BTC".to_string()),
                    notional_usd: Some(dec!(50)),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.status, ProposalStatus::Rejected);
        assert_eq!(outcome.gate_report.len(), 2);
        assert!(outcome.gate_report[0].allowed);
        assert!(!outcome.gate_report[1].allowed);

        let today = Utc::now().date_naive();
        assert_eq!(store.quota_count(DAILY_TRADES_KEY, today).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gates_pass_but_policy_defers_to_review() {
        let store = Arc::new(MemoryJobStore::new());
        // Default policy does not auto-approve trades.
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(StaticPolicy::default()),
            default_admission(),
        );

        let outcome = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Scout,
                title: "ETH breakout entry".to_string(),
                steps: vec![StepKind::ExecuteTrade],
                metadata: ProposalMetadata {
                    symbol: Some("ETH".to_string()),
                    notional_usd: Some(dec!(25)),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(!outcome.auto_approved);
        assert_eq!(outcome.status, ProposalStatus::Pending);
        assert!(outcome.mission_id.is_none());

        // The quota slot stays claimed while the proposal awaits review.
        let today = Utc::now().date_naive();
        assert_eq!(store.quota_count(DAILY_TRADES_KEY, today).await.unwrap(), 1);
        assert_eq!(store.pending_proposals(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reviewer_approval_builds_mission() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(StaticPolicy::default()),
            default_admission(),
        );

        let submitted = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Quant,
                title: "BTC entry on pullback".to_string(),
                steps: vec![StepKind::ExecuteTrade],
                metadata: ProposalMetadata {
                    symbol: Some("BTC".to_string()),
                    notional_usd: Some(dec!(100)),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(submitted.status, ProposalStatus::Pending);

        let reviewed = pipeline.review(submitted.proposal_id, true).await.unwrap();
        assert!(reviewed.success);
        assert_eq!(reviewed.status, ProposalStatus::Accepted);
        let mission_id = reviewed.mission_id.unwrap();
        assert_eq!(store.mission_steps(mission_id).await.unwrap().len(), 1);

        // An accepted proposal cannot be reviewed again.
        let again = pipeline.review(submitted.proposal_id, false).await;
        assert!(matches!(
            again,
            Err(OpsError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_reviewer_rejection_returns_quota_claim() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(StaticPolicy::default()),
            default_admission(),
        );

        let submitted = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Scout,
                title: "speculative SOL entry".to_string(),
                steps: vec![StepKind::ExecuteTrade],
                metadata: ProposalMetadata {
                    symbol: Some("SOL".to_string()),
                    notional_usd: Some(dec!(25)),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let today = Utc::now().date_naive();
        assert_eq!(store.quota_count(DAILY_TRADES_KEY, today).await.unwrap(), 1);

        let rejected = pipeline.review(submitted.proposal_id, false).await.unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.status, ProposalStatus::Rejected);
        assert_eq!(store.quota_count(DAILY_TRADES_KEY, today).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_withdraws_pending_proposal() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(StaticPolicy::default()),
            default_admission(),
        );

        let submitted = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Sage,
                title: "ETH entry idea".to_string(),
                steps: vec![StepKind::ExecuteTrade],
                metadata: ProposalMetadata {
                    symbol: Some("ETH".to_string()),
                    notional_usd: Some(dec!(40)),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        pipeline.cancel(submitted.proposal_id).await.unwrap();

        let stored = store
            .get_proposal(submitted.proposal_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ProposalStatus::Cancelled);
        let today = Utc::now().date_naive();
        assert_eq!(store.quota_count(DAILY_TRADES_KEY, today).await.unwrap(), 0);

        let missing = pipeline.cancel(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(OpsError::ProposalNotFound(_))));
    }

    #[tokio::test]
    async fn test_roundtable_required_kind_defers_without_roundtable_step() {
        let store = Arc::new(MemoryJobStore::new());
        let policy = StaticPolicy {
            roundtable_kinds: vec![StepKind::ExecuteTrade],
            ..StaticPolicy::allow_all()
        };
        let pipeline = pipeline_with(store.clone(), Arc::new(policy), default_admission());

        let request = |title: &str, steps: Vec<StepKind>| ProposalRequest {
            agent_id: AgentId::Quant,
            title: title.to_string(),
            steps,
            metadata: ProposalMetadata {
                symbol: Some("BTC".to_string()),
                notional_usd: Some(dec!(50)),
                ..Default::default()
            },
        };

        // A bare trade must be discussed first: it waits for review.
        let bare = pipeline
            .submit(request("BTC entry", vec![StepKind::ExecuteTrade]))
            .await
            .unwrap();
        assert!(bare.success);
        assert!(!bare.auto_approved);
        assert_eq!(bare.status, ProposalStatus::Pending);

        // The same trade with a roundtable scheduled auto-approves.
        let discussed = pipeline
            .submit(request(
                "BTC entry with discussion",
                vec![StepKind::HoldRoundtable, StepKind::ExecuteTrade],
            ))
            .await
            .unwrap();
        assert!(discussed.auto_approved);
        assert_eq!(discussed.status, ProposalStatus::Accepted);
    }

    #[tokio::test]
    async fn test_notional_above_policy_ceiling_defers_to_review() {
        let store = Arc::new(MemoryJobStore::new());
        let policy = StaticPolicy {
            max_auto_approve_notional_usd: dec!(100),
            ..StaticPolicy::allow_all()
        };
        let pipeline = pipeline_with(store.clone(), Arc::new(policy), default_admission());

        let outcome = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Quant,
                title: "oversized BTC entry".to_string(),
                steps: vec![StepKind::ExecuteTrade],
                metadata: ProposalMetadata {
                    symbol: Some("BTC".to_string()),
                    notional_usd: Some(dec!(500)),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        // Kinds qualify but the size does not; the proposal waits for review.
        assert!(outcome.success);
        assert!(!outcome.auto_approved);
        assert_eq!(outcome.status, ProposalStatus::Pending);
    }

    #[tokio::test]
    async fn test_full_gate_report_is_returned_on_success() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = pipeline_with(
            store.clone(),
            Arc::new(StaticPolicy::default()),
            default_admission(),
        );

        let outcome = pipeline
            .submit(ProposalRequest {
                agent_id: AgentId::Sage,
                title: "macro review".to_string(),
                steps: vec![StepKind::AnalyzeSignal, StepKind::HoldRoundtable],
                metadata: ProposalMetadata::default(),
            })
            .await
            .unwrap();

        assert!(outcome.auto_approved);
        assert_eq!(outcome.gate_report.len(), 2);
        assert!(outcome.gate_report.iter().all(|g| g.allowed));
    }
}
