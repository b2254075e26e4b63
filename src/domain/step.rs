use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed unit of work a worker can claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ExecuteTrade,
    ClosePosition,
    ScalePosition,
    HoldRoundtable,
    AnalyzeSignal,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ExecuteTrade => "execute_trade",
            StepKind::ClosePosition => "close_position",
            StepKind::ScalePosition => "scale_position",
            StepKind::HoldRoundtable => "hold_roundtable",
            StepKind::AnalyzeSignal => "analyze_signal",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StepKind {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "execute_trade" => Ok(StepKind::ExecuteTrade),
            "close_position" => Ok(StepKind::ClosePosition),
            "scale_position" => Ok(StepKind::ScalePosition),
            "hold_roundtable" => Ok(StepKind::HoldRoundtable),
            "analyze_signal" => Ok(StepKind::AnalyzeSignal),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// Payload carried by a step, keyed by its kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepPayload {
    ExecuteTrade {
        symbol: String,
        entry_price: Option<Decimal>,
        target_price: Option<Decimal>,
        stop_loss: Option<Decimal>,
        notional_usd: Option<Decimal>,
    },
    ClosePosition {
        symbol: String,
        target_price: Option<Decimal>,
    },
    ScalePosition {
        symbol: String,
        notional_usd: Option<Decimal>,
    },
    HoldRoundtable {
        topic: String,
        participants: Vec<String>,
    },
    AnalyzeSignal {
        symbol: Option<String>,
        confidence: Option<f64>,
    },
}

impl StepPayload {
    pub fn kind(&self) -> StepKind {
        match self {
            StepPayload::ExecuteTrade { .. } => StepKind::ExecuteTrade,
            StepPayload::ClosePosition { .. } => StepKind::ClosePosition,
            StepPayload::ScalePosition { .. } => StepKind::ScalePosition,
            StepPayload::HoldRoundtable { .. } => StepKind::HoldRoundtable,
            StepPayload::AnalyzeSignal { .. } => StepKind::AnalyzeSignal,
        }
    }
}

/// Lifecycle of a mission step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StepStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "queued" => Ok(StepStatus::Queued),
            "running" => Ok(StepStatus::Running),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            "cancelled" => Ok(StepStatus::Cancelled),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// A single typed unit of work within a mission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionStep {
    pub id: Uuid,
    pub mission_id: Uuid,
    pub kind: StepKind,
    pub status: StepStatus,
    pub payload: StepPayload,
    pub assigned_to: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MissionStep {
    pub fn queued(mission_id: Uuid, payload: StepPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            mission_id,
            kind: payload.kind(),
            status: StepStatus::Queued,
            payload,
            assigned_to: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}
