//! Broadcast bus for structured `(agent, event, payload)` tuples.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{WorkerState, WorkerStatusPayload};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to an [`EventSink`].
pub type SharedEventSink = Arc<EventSink>;

/// A single emitted event.
///
/// `payload` is an opaque, pre-serialized JSON string. Consumers that need
/// ordering must sort by `timestamp`; delivery order across components is
/// not guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Unique event id.
    pub id: String,
    /// Emitting agent ("Coder", "Orchestrator", "Sandbox", ...).
    pub agent: String,
    /// Event name ("CodeOutput", "Heartbeat", "ModelSwitch", ...).
    pub event: String,
    /// Pre-serialized JSON payload (may be a bare string message).
    pub payload: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

/// Non-blocking sink for UI/telemetry events.
///
/// Replaces the global logging singleton pattern: an `EventSink` is passed
/// explicitly into every component that emits.
pub struct EventSink {
    sender: broadcast::Sender<LogEvent>,
}

impl EventSink {
    /// Create a new sink with no subscribers.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this sink.
    pub fn shared(self) -> SharedEventSink {
        Arc::new(self)
    }

    /// Emit an event. Never blocks, never fails the call site; dropped
    /// events (no subscribers, lagging receivers) are acceptable.
    pub fn emit(&self, agent: &str, event: &str, payload: impl Into<String>) {
        let log_event = LogEvent {
            id: uuid::Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            event: event.to_string(),
            payload: payload.into(),
            timestamp: Utc::now(),
        };
        match self.sender.send(log_event) {
            Ok(count) => debug!(agent, event, receivers = count, "event emitted"),
            Err(_) => debug!(agent, event, "event emitted (no receivers)"),
        }
    }

    /// Emit a worker status update for the dashboard.
    pub fn set_worker_status(&self, role: &str, state: WorkerState, message: &str, model: &str) {
        let payload = WorkerStatusPayload {
            role: role.to_string(),
            state,
            message: message.to_string(),
            model: model.to_string(),
        };
        self.emit(role, "WorkerStatus", payload.to_payload());
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();

        sink.emit("Coder", "Iteration", "1 / 3");

        let received = rx.recv().await.unwrap();
        assert_eq!(received.agent, "Coder");
        assert_eq!(received.event, "Iteration");
        assert_eq!(received.payload, "1 / 3");
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let sink = EventSink::new();
        // Must not panic or error with zero receivers.
        sink.emit("System", "Status", "no one is listening");
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let sink = EventSink::new().shared();
        let mut rx1 = sink.subscribe();
        let mut rx2 = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 2);

        sink.emit("Reviewer", "Feedback", "{}");

        assert_eq!(rx1.recv().await.unwrap().event, "Feedback");
        assert_eq!(rx2.recv().await.unwrap().event, "Feedback");
    }

    #[tokio::test]
    async fn test_worker_status_payload() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();

        sink.set_worker_status("coder", WorkerState::Working, "Iteration 1/3", "m1");

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, "WorkerStatus");
        let parsed: WorkerStatusPayload = serde_json::from_str(&received.payload).unwrap();
        assert_eq!(parsed.role, "coder");
        assert_eq!(parsed.state, WorkerState::Working);
        assert_eq!(parsed.model, "m1");
    }

    #[tokio::test]
    async fn test_log_event_serde_roundtrip() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.emit("Tester", "TestSummary", r#"{"overall_status":"PASS"}"#);

        let event = rx.recv().await.unwrap();
        let json = serde_json::to_string(&event).unwrap();
        let parsed: LogEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event, "TestSummary");
        assert_eq!(parsed.payload, r#"{"overall_status":"PASS"}"#);
    }
}
