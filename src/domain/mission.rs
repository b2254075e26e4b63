use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::proposal::AgentId;
use super::step::StepKind;

/// Lifecycle of a mission. Transitions are monotonic: once terminal,
/// a mission never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Approved,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Approved => "approved",
            MissionStatus::Running => "running",
            MissionStatus::Succeeded => "succeeded",
            MissionStatus::Failed => "failed",
            MissionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionStatus::Succeeded | MissionStatus::Failed | MissionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for MissionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "approved" => Ok(MissionStatus::Approved),
            "running" => Ok(MissionStatus::Running),
            "succeeded" => Ok(MissionStatus::Succeeded),
            "failed" => Ok(MissionStatus::Failed),
            "cancelled" => Ok(MissionStatus::Cancelled),
            other => Err(format!("unknown mission status: {other}")),
        }
    }
}

/// Broad category of a mission, derived from its step kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionType {
    TradeEntry,
    Exit,
    Scale,
    Conversation,
    Analysis,
}

impl MissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionType::TradeEntry => "trade_entry",
            MissionType::Exit => "exit",
            MissionType::Scale => "scale",
            MissionType::Conversation => "conversation",
            MissionType::Analysis => "analysis",
        }
    }

    /// Derive the mission type from a step-kind set using a fixed
    /// precedence: trade entry > exit > scale > conversation > analysis.
    pub fn from_step_kinds(kinds: &[StepKind]) -> Self {
        if kinds.contains(&StepKind::ExecuteTrade) {
            MissionType::TradeEntry
        } else if kinds.contains(&StepKind::ClosePosition) {
            MissionType::Exit
        } else if kinds.contains(&StepKind::ScalePosition) {
            MissionType::Scale
        } else if kinds.contains(&StepKind::HoldRoundtable) {
            MissionType::Conversation
        } else {
            MissionType::Analysis
        }
    }
}

impl std::fmt::Display for MissionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for MissionType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "trade_entry" => Ok(MissionType::TradeEntry),
            "exit" => Ok(MissionType::Exit),
            "scale" => Ok(MissionType::Scale),
            "conversation" => Ok(MissionType::Conversation),
            "analysis" => Ok(MissionType::Analysis),
            other => Err(format!("unknown mission type: {other}")),
        }
    }
}

/// Executable unit created from exactly one accepted proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub title: String,
    pub status: MissionStatus,
    pub created_by: AgentId,
    pub mission_type: MissionType,
    pub proposal_id: Option<Uuid>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
