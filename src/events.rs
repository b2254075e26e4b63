//! Fire-and-forget event/notification sink.
//!
//! The pipeline emits lifecycle events (proposal created, rejected, mission
//! created) through this seam and never blocks on or retries a sink failure;
//! a failed emit is logged and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::AgentId;

/// A single desk event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent_id: AgentId,
    pub kind: String,
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event. Implementations must not block the caller on
    /// downstream retries; an error is informational only.
    async fn emit(&self, event: AgentEvent);
}

/// Default sink: structured log lines only
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: AgentEvent) {
        info!(
            agent = %event.agent_id,
            kind = %event.kind,
            tags = ?event.tags,
            "{}: {}",
            event.title,
            event.summary
        );
    }
}

/// Sink that fans events out to broadcast subscribers (dashboards, CLIs).
/// Lagging or absent subscribers never block the pipeline.
pub struct BroadcastEventSink {
    tx: tokio::sync::broadcast::Sender<AgentEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: AgentEvent) {
        if self.tx.send(event.clone()).is_err() {
            warn!(kind = %event.kind, "no event subscribers, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();

        sink.emit(AgentEvent {
            agent_id: AgentId::Intel,
            kind: "proposal_created".to_string(),
            title: "BTC signal".to_string(),
            summary: "accumulation detected".to_string(),
            tags: vec!["proposal".to_string()],
            metadata: serde_json::json!({}),
            at: Utc::now(),
        })
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "proposal_created");
    }

    #[tokio::test]
    async fn test_broadcast_sink_without_subscribers_is_silent() {
        let sink = BroadcastEventSink::new(8);
        // No subscriber; emit must not panic or block.
        sink.emit(AgentEvent {
            agent_id: AgentId::Scout,
            kind: "proposal_rejected".to_string(),
            title: "t".to_string(),
            summary: "s".to_string(),
            tags: vec![],
            metadata: serde_json::json!({}),
            at: Utc::now(),
        })
        .await;
    }
}
