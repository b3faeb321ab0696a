//! LLM invoker: one call, one heartbeat task, one hard timeout.
//!
//! The work future and the heartbeat task cooperate under the same tokio
//! scheduler; the heartbeat wakes every `heartbeat_interval` seconds and
//! emits a status event until the call finishes or times out. The invoker
//! never retries — the controller owns retry policy so it can coordinate
//! model switching.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use forge_engine::events::{HeartbeatPayload, SharedEventSink};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::{CompletionProvider, LlmError};

static THINK_BLOCKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());
static STRAY_THINK_TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?think>").unwrap());

/// Words that mark a preamble as meaningful narration worth keeping.
const NARRATION_KEYWORDS: &[&str] = &["hier", "here", "following", "code"];

/// Strip provider-specific think tags and short non-code preambles.
pub fn clean_model_output(raw: &str) -> String {
    if raw.is_empty() {
        return raw.to_string();
    }

    let cleaned = THINK_BLOCKS.replace_all(raw, "");
    let cleaned = STRAY_THINK_TAGS.replace_all(&cleaned, "").to_string();

    if let Some(idx) = cleaned.find("### FILENAME:") {
        let prefix = cleaned[..idx].trim();
        if !prefix.is_empty() && !prefix.starts_with("```") {
            return cleaned[idx..].trim().to_string();
        }
    } else if let Some(idx) = cleaned.find("```") {
        let prefix = cleaned[..idx].trim();
        let lower = prefix.to_lowercase();
        if !prefix.is_empty()
            && prefix.len() < 50
            && !NARRATION_KEYWORDS.iter().any(|kw| lower.contains(kw))
        {
            return cleaned[idx..].trim().to_string();
        }
    }

    cleaned.trim().to_string()
}

/// Single-call abstraction with heartbeat emission and a hard timeout.
pub struct Invoker {
    provider: Arc<dyn CompletionProvider>,
    sink: SharedEventSink,
    heartbeat_interval: Duration,
}

impl Invoker {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        sink: SharedEventSink,
        heartbeat_interval_secs: u64,
    ) -> Self {
        Self {
            provider,
            sink,
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs.max(1)),
        }
    }

    /// Invoke `model` with `prompt`; heartbeats carry `agent_name` and
    /// `task_description`. Returns the cleaned output or the classified
    /// error.
    pub async fn invoke(
        &self,
        agent_name: &str,
        task_description: &str,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let token = CancellationToken::new();
        let heartbeat_token = token.clone();
        let heartbeat_sink = self.sink.clone();
        let heartbeat_interval = self.heartbeat_interval;
        let agent = agent_name.to_string();
        let task = task_description.to_string();
        let start = Instant::now();

        let heartbeat = tokio::spawn(async move {
            let mut count: u64 = 0;
            let mut ticker = tokio::time::interval(heartbeat_interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_token.cancelled() => break,
                    _ = ticker.tick() => {
                        count += 1;
                        let payload = HeartbeatPayload::working(
                            &task,
                            start.elapsed().as_secs(),
                            count,
                        );
                        heartbeat_sink.emit(&agent, "Heartbeat", payload.to_payload());
                    }
                }
            }
        });

        let outcome =
            tokio::time::timeout(timeout, self.provider.complete(model, prompt, timeout)).await;
        token.cancel();
        let _ = heartbeat.await;

        match outcome {
            Err(_) => {
                debug!(model, timeout_secs = timeout.as_secs(), "invocation timed out");
                Err(LlmError::Timeout(timeout.as_secs()))
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(raw)) => {
                let cleaned = clean_model_output(&raw);
                if cleaned.is_empty() {
                    return Err(LlmError::EmptyResponse);
                }
                Ok(cleaned)
            }
        }
    }
}
