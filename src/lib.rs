pub mod admission;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod mission;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use admission::{AdmissionController, GateOutcome, DAILY_TRADES_KEY};
pub use config::AppConfig;
pub use domain::{
    AgentId, Mission, MissionStatus, MissionStep, MissionType, Proposal, ProposalMetadata,
    ProposalStatus, StepKind, StepPayload, StepStatus,
};
pub use error::{OpsError, Result};
pub use events::{AgentEvent, BroadcastEventSink, EventSink, TracingEventSink};
pub use mission::MissionBuilder;
pub use pipeline::{ProposalPipeline, ProposalRequest, SubmissionOutcome};
pub use policy::{PolicyEngine, StaticPolicy};
pub use scheduler::{HeartbeatReport, HeartbeatScheduler, MaintenanceOp, OpReport};
pub use store::{JobStore, MemoryJobStore, PostgresJobStore, QuotaClaim, SystemStats};
pub use worker::{
    CircuitBreakerRegistry, CircuitState, StepExecutor, WorkerCircuitBreaker, WorkerHarness,
};
