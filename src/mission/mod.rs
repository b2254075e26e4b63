//! Turns an accepted proposal into a mission with queued steps.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::{
    Mission, MissionStatus, MissionStep, MissionType, Proposal, ProposalMetadata, ProposalStatus,
    StepKind, StepPayload,
};
use crate::error::{OpsError, Result};
use crate::store::JobStore;

/// Builds missions from accepted proposals
pub struct MissionBuilder {
    store: Arc<dyn JobStore>,
}

impl MissionBuilder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Create a mission and its steps from a proposal, then advance the
    /// proposal to accepted. Steps are persisted in the same store operation
    /// as the mission, so a reader never sees a step-less mission.
    ///
    /// `expected_status` is the proposal status this call transitions from
    /// (auto_approved for the pipeline, pending for an external reviewer).
    pub async fn create_from_proposal(
        &self,
        proposal: &Proposal,
        expected_status: ProposalStatus,
    ) -> Result<(Mission, Vec<MissionStep>)> {
        let mission_type = MissionType::from_step_kinds(&proposal.proposed_steps);

        let mission = Mission {
            id: Uuid::new_v4(),
            title: proposal.title.clone(),
            status: MissionStatus::Approved,
            created_by: proposal.agent_id,
            mission_type,
            proposal_id: Some(proposal.id),
            priority: Self::priority_for(mission_type),
            created_at: Utc::now(),
            completed_at: None,
        };

        let steps: Vec<MissionStep> = proposal
            .proposed_steps
            .iter()
            .map(|&kind| {
                MissionStep::queued(mission.id, Self::project_payload(kind, proposal))
            })
            .collect();

        self.store.insert_mission_with_steps(&mission, &steps).await?;

        let advanced = self
            .store
            .update_proposal_status(proposal.id, expected_status, ProposalStatus::Accepted)
            .await?;
        if !advanced {
            return Err(OpsError::InvalidStateTransition {
                from: expected_status.to_string(),
                to: ProposalStatus::Accepted.to_string(),
            });
        }

        info!(
            mission_id = %mission.id,
            proposal_id = %proposal.id,
            mission_type = %mission.mission_type,
            steps = steps.len(),
            "created mission from proposal"
        );

        Ok((mission, steps))
    }

    /// Position-touching missions jump the worker queue
    fn priority_for(mission_type: MissionType) -> i32 {
        match mission_type {
            MissionType::Exit => 20,
            MissionType::TradeEntry => 10,
            MissionType::Scale => 5,
            MissionType::Conversation | MissionType::Analysis => 0,
        }
    }

    /// Project the proposal metadata into the typed payload for one step kind
    fn project_payload(kind: StepKind, proposal: &Proposal) -> StepPayload {
        let meta: &ProposalMetadata = &proposal.metadata;
        let symbol = meta.symbol.clone().unwrap_or_default();

        match kind {
            StepKind::ExecuteTrade => StepPayload::ExecuteTrade {
                symbol,
                entry_price: meta.entry_price,
                target_price: meta.target_price,
                stop_loss: meta.stop_loss,
                notional_usd: meta.notional_usd,
            },
            StepKind::ClosePosition => StepPayload::ClosePosition {
                symbol,
                target_price: meta.target_price,
            },
            StepKind::ScalePosition => StepPayload::ScalePosition {
                symbol,
                notional_usd: meta.notional_usd,
            },
            StepKind::HoldRoundtable => StepPayload::HoldRoundtable {
                topic: meta
                    .topic
                    .clone()
                    .unwrap_or_else(|| proposal.title.clone()),
                participants: vec![proposal.agent_id.as_str().to_string()],
            },
            StepKind::AnalyzeSignal => StepPayload::AnalyzeSignal {
                symbol: meta.symbol.clone(),
                confidence: meta.confidence,
            },
        }
    }
}
