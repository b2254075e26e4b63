use thiserror::Error;

/// Main error type for the scheduling core
#[derive(Error, Debug)]
pub enum OpsError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Store errors
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Proposal errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Admission denied for {kind}: {reason}")]
    AdmissionDenied { kind: String, reason: String },

    #[error("Proposal not found: {0}")]
    ProposalNotFound(uuid::Uuid),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for OpsError
pub type Result<T> = std::result::Result<T, OpsError>;

/// Specific error types for gate evaluation. Their rendered messages become
/// the `reason` field of denied gate outcomes.
#[derive(Error, Debug, Clone)]
pub enum GateError {
    #[error("daily trade limit reached: {current}/{limit}")]
    DailyTradeLimit { current: i64, limit: i64 },

    #[error("open position limit reached: {current}/{limit}")]
    MaxOpenPositions { current: i64, limit: i64 },

    #[error("notional exposure limit exceeded: ${current} > ${limit}")]
    MaxExposure {
        current: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("no open position for {symbol}")]
    NoOpenPosition { symbol: String },
}

impl From<GateError> for OpsError {
    fn from(err: GateError) -> Self {
        OpsError::AdmissionDenied {
            kind: "gate".to_string(),
            reason: err.to_string(),
        }
    }
}
