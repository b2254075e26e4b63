use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub admission: AdmissionConfig,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Capacity limits enforced by the admission controller
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum trades admitted per calendar day (atomic claim gate)
    pub max_daily_trades: i64,
    /// Maximum concurrent open positions
    pub max_open_positions: i64,
    /// Maximum total notional exposure in USD
    pub max_notional_exposure_usd: Decimal,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_daily_trades: 10,
            max_open_positions: 5,
            max_notional_exposure_usd: Decimal::from(1000),
        }
    }
}

/// Proposal validation bounds
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum steps a single proposal may carry
    #[serde(default = "default_max_steps")]
    pub max_steps_per_proposal: usize,
    /// Minimum title length
    #[serde(default = "default_min_title")]
    pub min_title_len: usize,
    /// Maximum title length
    #[serde(default = "default_max_title")]
    pub max_title_len: usize,
}

fn default_max_steps() -> usize {
    8
}

fn default_min_title() -> usize {
    3
}

fn default_max_title() -> usize {
    200
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_proposal: default_max_steps(),
            min_title_len: default_min_title(),
            max_title_len: default_max_title(),
        }
    }
}

/// Heartbeat scheduler timing
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between heartbeat cycles
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Hard wall-clock budget per cycle in milliseconds
    #[serde(default = "default_cycle_budget")]
    pub cycle_budget_ms: u64,
    /// Per-operation budget in milliseconds
    #[serde(default = "default_op_budget")]
    pub op_budget_ms: u64,
    /// Seconds after which a stuck in-progress flag is force-cleared
    #[serde(default = "default_deadlock_threshold")]
    pub deadlock_threshold_secs: u64,
    /// Minutes before a running step is considered abandoned
    #[serde(default = "default_stale_step")]
    pub stale_step_minutes: i64,
    /// Minutes before a running roundtable step is considered abandoned
    #[serde(default = "default_stale_roundtable")]
    pub stale_roundtable_minutes: i64,
    /// Days of terminal step/event history to retain
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_heartbeat_interval() -> u64 {
    300
}

fn default_cycle_budget() -> u64 {
    15_000
}

fn default_op_budget() -> u64 {
    2_000
}

fn default_deadlock_threshold() -> u64 {
    60
}

fn default_stale_step() -> i64 {
    30
}

fn default_stale_roundtable() -> i64 {
    15
}

fn default_retention_days() -> i64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            cycle_budget_ms: default_cycle_budget(),
            op_budget_ms: default_op_budget(),
            deadlock_threshold_secs: default_deadlock_threshold(),
            stale_step_minutes: default_stale_step(),
            stale_roundtable_minutes: default_stale_roundtable(),
            retention_days: default_retention_days(),
        }
    }
}

/// Worker polling and circuit breaker settings
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between polls for queued steps
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Steps fetched per poll
    #[serde(default = "default_poll_batch")]
    pub poll_batch_size: i64,
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before a half-open probe
    #[serde(default = "default_reset_window")]
    pub reset_window_secs: u64,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_poll_batch() -> i64 {
    5
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_window() -> u64 {
    300
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            poll_batch_size: default_poll_batch(),
            failure_threshold: default_failure_threshold(),
            reset_window_secs: default_reset_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// When set, also write daily-rolling log files into this directory
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("OPSDESK_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (OPSDESK_ADMISSION__MAX_DAILY_TRADES, etc.)
            .add_source(
                Environment::with_prefix("OPSDESK")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a default configuration for CLI and test usage
    pub fn default_config(database_url: &str) -> Self {
        Self {
            admission: AdmissionConfig::default(),
            pipeline: PipelineConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            database: DatabaseConfig {
                url: database_url.to_string(),
                max_connections: 5,
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.admission.max_daily_trades <= 0 {
            errors.push("max_daily_trades must be positive".to_string());
        }

        if self.admission.max_open_positions <= 0 {
            errors.push("max_open_positions must be positive".to_string());
        }

        if self.admission.max_notional_exposure_usd <= Decimal::ZERO {
            errors.push("max_notional_exposure_usd must be positive".to_string());
        }

        if self.pipeline.max_steps_per_proposal == 0 {
            errors.push("max_steps_per_proposal must be positive".to_string());
        }

        if self.pipeline.min_title_len >= self.pipeline.max_title_len {
            errors.push("min_title_len must be less than max_title_len".to_string());
        }

        if self.scheduler.op_budget_ms > self.scheduler.cycle_budget_ms {
            errors.push("op_budget_ms cannot exceed cycle_budget_ms".to_string());
        }

        if self.scheduler.stale_roundtable_minutes > self.scheduler.stale_step_minutes {
            errors.push(
                "stale_roundtable_minutes should not exceed stale_step_minutes".to_string(),
            );
        }

        if self.worker.failure_threshold == 0 {
            errors.push("failure_threshold must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config("postgres://localhost/opsdesk");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_budgets() {
        let mut config = AppConfig::default_config("postgres://localhost/opsdesk");
        config.scheduler.op_budget_ms = 30_000;
        config.scheduler.cycle_budget_ms = 15_000;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("op_budget_ms")));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = AppConfig::default_config("postgres://localhost/opsdesk");
        config.admission.max_daily_trades = 0;
        assert!(config.validate().is_err());
    }
}
