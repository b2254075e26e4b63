use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::StepKind;

/// Identity of a desk agent allowed to submit proposals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    /// Signal research
    Intel,
    /// Long-horizon analysis
    Sage,
    /// Market scanning
    Scout,
    /// Sizing and execution math
    Quant,
    /// Cross-agent conversations
    Envoy,
}

impl AgentId {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::Intel => "intel",
            AgentId::Sage => "sage",
            AgentId::Scout => "scout",
            AgentId::Quant => "quant",
            AgentId::Envoy => "envoy",
        }
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for AgentId {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "intel" => Ok(AgentId::Intel),
            "sage" => Ok(AgentId::Sage),
            "scout" => Ok(AgentId::Scout),
            "quant" => Ok(AgentId::Quant),
            "envoy" => Ok(AgentId::Envoy),
            other => Err(format!("unknown agent id: {other}")),
        }
    }
}

/// Lifecycle of a proposal. Terminal statuses are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    AutoApproved,
    Accepted,
    Rejected,
    Cancelled,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::AutoApproved => "auto_approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Cancelled => "cancelled",
        }
    }

    /// Accepted/rejected/cancelled proposals never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Accepted | ProposalStatus::Rejected | ProposalStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ProposalStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "auto_approved" => Ok(ProposalStatus::AutoApproved),
            "accepted" => Ok(ProposalStatus::Accepted),
            "rejected" => Ok(ProposalStatus::Rejected),
            "cancelled" => Ok(ProposalStatus::Cancelled),
            other => Err(format!("unknown proposal status: {other}")),
        }
    }
}

/// Metadata an agent attaches to a proposal; projected into step payloads
/// by the mission builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalMetadata {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub entry_price: Option<rust_decimal::Decimal>,
    #[serde(default)]
    pub target_price: Option<rust_decimal::Decimal>,
    #[serde(default)]
    pub stop_loss: Option<rust_decimal::Decimal>,
    #[serde(default)]
    pub notional_usd: Option<rust_decimal::Decimal>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub topic: Option<String>,
}

/// An agent's request to perform one or more typed actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub title: String,
    pub proposed_steps: Vec<StepKind>,
    pub metadata: ProposalMetadata,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(
        agent_id: AgentId,
        title: impl Into<String>,
        proposed_steps: Vec<StepKind>,
        metadata: ProposalMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            title: title.into(),
            proposed_steps,
            metadata,
            status: ProposalStatus::Pending,
            created_at: Utc::now(),
        }
    }
}
