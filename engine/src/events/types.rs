//! Consumer-facing payload schemas.
//!
//! Field names follow the UI contract (camelCase where the dashboard
//! expects it). Every payload serializes itself to the opaque JSON string
//! carried by [`super::LogEvent`].

use serde::{Deserialize, Serialize};

fn to_json(value: &impl Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

/// Worker lifecycle state shown in the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Working,
    Blocked,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Working => write!(f, "working"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Payload for `WorkerStatus` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusPayload {
    pub role: String,
    pub state: WorkerState,
    pub message: String,
    pub model: String,
}

impl WorkerStatusPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `CodeOutput` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeOutputPayload {
    pub code: String,
    pub files: Vec<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub model: String,
}

impl CodeOutputPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `ReviewOutput` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutputPayload {
    pub verdict: String,
    #[serde(rename = "isApproved")]
    pub is_approved: bool,
    #[serde(rename = "humanSummary")]
    pub human_summary: String,
    pub feedback: String,
    pub model: String,
    pub iteration: u32,
    #[serde(rename = "sandboxStatus")]
    pub sandbox_status: String,
    #[serde(rename = "sandboxResult")]
    pub sandbox_result: String,
    #[serde(rename = "testSummary")]
    pub test_summary: String,
    #[serde(rename = "reviewOutput")]
    pub review_output: String,
}

impl ReviewOutputPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `UITestResult` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiTestResultPayload {
    pub status: String,
    pub issues: Vec<String>,
    pub screenshot: Option<String>,
    pub model: String,
}

impl UiTestResultPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `TestSummary` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummaryPayload {
    pub overall_status: String,
    pub unit_status: String,
    pub unit_passed: u32,
    pub ui_status: String,
    pub ui_issues_count: usize,
    pub iteration: u32,
}

impl TestSummaryPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `TokenMetrics` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetricsPayload {
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl TokenMetricsPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `Heartbeat` events emitted while an LLM call is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: String,
    pub task: String,
    pub elapsed_seconds: u64,
    pub heartbeat_count: u64,
}

impl HeartbeatPayload {
    /// The conventional in-flight heartbeat.
    pub fn working(task: &str, elapsed_seconds: u64, heartbeat_count: u64) -> Self {
        Self {
            status: "working".to_string(),
            task: task.to_string(),
            elapsed_seconds,
            heartbeat_count,
        }
    }

    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `ModelSwitch` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSwitchPayload {
    pub old_model: String,
    pub new_model: String,
    pub reason: String,
    pub models_used: Vec<String>,
    pub failed_attempts: usize,
}

impl ModelSwitchPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `ValidationDecision` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationDecisionPayload {
    pub action: String,
    pub target: String,
    pub model_switch: bool,
    pub root_cause: bool,
    pub error_hash: Option<String>,
}

impl ValidationDecisionPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `PingPongDetected` / `PingPongOverride` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPongPayload {
    pub files: Vec<String>,
    pub counts: std::collections::BTreeMap<String, u32>,
}

impl PingPongPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}

/// Payload for `StagnationDetected` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagnationPayload {
    pub signature: String,
    pub iterations: u32,
}

impl StagnationPayload {
    pub fn to_payload(&self) -> String {
        to_json(self)
    }
}
