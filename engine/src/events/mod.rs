//! Event log bus consumed by external UI/telemetry.
//!
//! Delivery is best-effort: emitting never blocks a call site and never
//! fails it. Payloads are pre-serialized JSON strings so the bus stays
//! decoupled from consumer schemas.

mod bus;
mod types;

pub use bus::{EventSink, LogEvent, SharedEventSink};
pub use types::{
    CodeOutputPayload, HeartbeatPayload, ModelSwitchPayload, PingPongPayload, ReviewOutputPayload,
    StagnationPayload, TestSummaryPayload, TokenMetricsPayload, UiTestResultPayload,
    ValidationDecisionPayload, WorkerState, WorkerStatusPayload,
};
