//! Closed event taxonomy published by the rate limiter, queue, and
//! scheduler, plus a pluggable sink trait.
//!
//! Shaped after the teacher's `tasks::events::TaskEventKind` tagged-sum
//! (`#[serde(tag = ...)]`, a `new_correlation_id()` helper) but kept
//! payload-light: this taxonomy is consumed by external observers, not
//! replayed to reconstruct state, so each event carries a `kind`, a
//! `severity`, and a free-form JSON `data` bag rather than one bespoke
//! struct variant per kind.

use crate::store::model::now_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Wire identifiers are stable strings (`SCREAMING_SNAKE_CASE`) — external
/// observers match on these, so renaming a variant is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Throttled,
    Allowed,
    Queued,
    Deferred,
    Dropped,
    QueueFull,
    Retry,
    /// Not named in the taxonomy's summary list but required by the
    /// eviction behavior it describes: a `high` item displacing the oldest
    /// `low` item under backpressure.
    PriorityDropped,
    LimitConfigChanged,
    ProviderHealthDegrading,
    ProviderHealthRecovering,
    QueueUtilizationSpike,
    QueueUtilizationNormalized,
    RateLimitApproaching,
    RateLimitRecovery,
    /// Emitted but never consumed internally — part of the taxonomy for
    /// external observers only.
    PredictiveHealthAlert,
    TaskReserved,
    LeaseRenewed,
    LeaseLost,
    LeaseReclaimed,
    TaskCompleted,
    TaskFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub correlation_id: String,
    pub ts: i64,
    pub kind: EventKind,
    pub severity: Severity,
    pub task_id: Option<String>,
    pub provider: Option<String>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, severity: Severity) -> Self {
        Self {
            correlation_id: new_correlation_id(),
            ts: now_ms(),
            kind,
            severity,
            task_id: None,
            provider: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Pluggable event destination. The scheduler, queue, and rate limiter hold
/// an `Arc<dyn EventSink>` and never know the concrete implementation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Logs every event through `tracing` at a level matched to its severity.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: Event) {
        match event.severity {
            Severity::Info => tracing::info!(kind = ?event.kind, task_id = ?event.task_id, provider = ?event.provider, "event"),
            Severity::Warning => tracing::warn!(kind = ?event.kind, task_id = ?event.task_id, provider = ?event.provider, "event"),
            Severity::Error | Severity::Critical => tracing::error!(kind = ?event.kind, task_id = ?event.task_id, provider = ?event.provider, "event"),
        }
    }
}

/// Collects every emitted event in memory — used by tests and by the demo
/// binary to print a trailing summary.
#[derive(Default)]
pub struct InMemorySink {
    events: Mutex<Vec<Event>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for InMemorySink {
    async fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_identifiers_match_taxonomy() {
        let kind = serde_json::to_value(EventKind::ProviderHealthDegrading).unwrap();
        assert_eq!(kind, serde_json::json!("PROVIDER_HEALTH_DEGRADING"));
        let kind = serde_json::to_value(EventKind::QueueFull).unwrap();
        assert_eq!(kind, serde_json::json!("QUEUE_FULL"));
    }

    #[tokio::test]
    async fn in_memory_sink_collects_events() {
        let sink = InMemorySink::new();
        sink.emit(Event::new(EventKind::Queued, Severity::Info).with_task("t1"))
            .await;
        sink.emit(Event::new(EventKind::Dropped, Severity::Warning).with_task("t2"))
            .await;
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events()[0].task_id.as_deref(), Some("t1"));
    }
}
