//! Logging bootstrap and run metrics.
//!
//! Tracing goes through `tracing-subscriber` with `RUST_LOG` control;
//! per-run metrics are appended to a JSONL file so successive runs can be
//! compared without a metrics backend.

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Initialize tracing once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Snapshot of one completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub goal_preview: String,
    pub success: bool,
    pub iterations: u32,
    pub models_used: Vec<String>,
    pub elapsed_ms: u64,
    pub timestamp: String,
}

/// Accumulates timing over a run and writes the JSONL record at the end.
pub struct MetricsRecorder {
    run_id: String,
    goal_preview: String,
    started: Instant,
}

impl MetricsRecorder {
    pub fn start(goal: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            goal_preview: goal.chars().take(80).collect(),
            started: Instant::now(),
        }
    }

    /// Append the final record to `<dir>/.forge-telemetry.jsonl`.
    pub fn finish(self, dir: &Path, success: bool, iterations: u32, models_used: Vec<String>) {
        let metrics = RunMetrics {
            run_id: self.run_id,
            goal_preview: self.goal_preview,
            success,
            iterations,
            models_used,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let Ok(line) = serde_json::to_string(&metrics) else {
            return;
        };
        let path = dir.join(".forge-telemetry.jsonl");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                use std::io::Write;
                writeln!(file, "{line}")
            });
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "telemetry write failed");
        }
    }
}
