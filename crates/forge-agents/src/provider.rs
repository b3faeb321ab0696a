//! LLM provider contract.
//!
//! One logical operation: `complete(model, prompt, timeout)` → text or a
//! classified error. The error surface is a tagged sum the controller
//! branches on — rotation and retries are the caller's job, never the
//! provider's.

use std::time::Duration;

use async_trait::async_trait;
use forge_engine::classifier::{self, ErrorClass};
use serde_json::json;
use tracing::debug;

/// Classified failure of a provider call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("rate limited (status {status:?}): {message}")]
    RateLimit { status: Option<u16>, message: String },

    #[error("server error (status {status:?}): {message}")]
    ServerError { status: Option<u16>, message: String },

    #[error("model unavailable: {message}")]
    Unavailable { message: String },

    #[error("model permanently unavailable: {message}")]
    PermanentlyUnavailable { message: String },

    #[error("empty or invalid response")]
    EmptyResponse,

    #[error("{message}")]
    Other { status: Option<u16>, message: String },
}

impl LlmError {
    /// Map a failed HTTP exchange onto the tagged sum using the pure
    /// classifier predicates.
    pub fn from_classified(status: Option<u16>, message: &str) -> Self {
        match classifier::classify(status, message) {
            ErrorClass::PermanentlyUnavailable => Self::PermanentlyUnavailable {
                message: message.to_string(),
            },
            ErrorClass::ModelUnavailable => Self::Unavailable {
                message: message.to_string(),
            },
            ErrorClass::ServerError => Self::ServerError {
                status,
                message: message.to_string(),
            },
            ErrorClass::RateLimit | ErrorClass::ProviderInternal => Self::RateLimit {
                status,
                message: message.to_string(),
            },
            // Provider-upstream failures rotate immediately, like a
            // server error.
            ErrorClass::ProviderUpstream => Self::ServerError {
                status,
                message: message.to_string(),
            },
            ErrorClass::EmptyResponse => Self::EmptyResponse,
            ErrorClass::Other => Self::Other {
                status,
                message: message.to_string(),
            },
        }
    }

    /// Transient errors pause the model and retry on a fallback; the
    /// iteration itself is not consumed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. } | Self::ServerError { .. } | Self::EmptyResponse | Self::Timeout(_)
        )
    }

    /// Errors that permanently exclude the model in this process.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentlyUnavailable { .. })
    }
}

/// Single logical provider operation.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, LlmError>;
}

/// OpenAI-compatible chat-completions client.
pub struct HttpProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let mut request = self.client.post(&url).timeout(timeout).json(&body);
        if !self.api_key.is_empty() && self.api_key != "not-needed" {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(timeout.as_secs())
            } else {
                LlmError::from_classified(e.status().map(|s| s.as_u16()), &e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            debug!(model, status, "provider returned error status");
            return Err(LlmError::from_classified(Some(status), &text));
        }

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::Other {
                status: Some(status),
                message: format!("malformed provider response: {e}"),
            })?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        if classifier::is_empty_or_invalid_response(&content) {
            return Err(LlmError::EmptyResponse);
        }
        Ok(content)
    }
}

/// Scripted provider used by tests and dry runs: returns queued results
/// in order and records every call.
pub struct ScriptedProvider {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, LlmError>>>,
    calls: std::sync::Mutex<Vec<ScriptedCall>>,
}

/// One recorded scripted call.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub model: String,
    pub prompt: String,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().expect("calls mutex").clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        _timeout: Duration,
    ) -> Result<String, LlmError> {
        self.calls.lock().expect("calls mutex").push(ScriptedCall {
            model: model.to_string(),
            prompt: prompt.to_string(),
        });
        self.responses
            .lock()
            .expect("responses mutex")
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classified_mapping() {
        assert!(matches!(
            LlmError::from_classified(Some(429), "rate limit exceeded"),
            LlmError::RateLimit { .. }
        ));
        assert!(matches!(
            LlmError::from_classified(Some(503), "service unavailable"),
            LlmError::ServerError { .. }
        ));
        assert!(matches!(
            LlmError::from_classified(Some(404), "no endpoints found"),
            LlmError::Unavailable { .. }
        ));
        assert!(matches!(
            LlmError::from_classified(None, "free period ended"),
            LlmError::PermanentlyUnavailable { .. }
        ));
        assert!(matches!(
            LlmError::from_classified(None, "'Exception' object has no attribute 'request'"),
            LlmError::RateLimit { .. }
        ));
    }

    #[test]
    fn test_transience() {
        assert!(LlmError::Timeout(750).is_transient());
        assert!(LlmError::EmptyResponse.is_transient());
        assert!(!LlmError::PermanentlyUnavailable {
            message: "free period ended".into()
        }
        .is_transient());
        assert!(LlmError::PermanentlyUnavailable {
            message: "x".into()
        }
        .is_permanent());
    }

    #[tokio::test]
    async fn test_scripted_provider_order_and_log() {
        let provider = ScriptedProvider::new(vec![
            Ok("first".to_string()),
            Err(LlmError::Timeout(1)),
        ]);
        let a = provider
            .complete("m1", "p1", Duration::from_secs(1))
            .await;
        assert_eq!(a.unwrap(), "first");
        let b = provider
            .complete("m2", "p2", Duration::from_secs(1))
            .await;
        assert!(matches!(b, Err(LlmError::Timeout(1))));
        // Exhausted queue yields EmptyResponse.
        let c = provider.complete("m3", "p3", Duration::from_secs(1)).await;
        assert!(matches!(c, Err(LlmError::EmptyResponse)));

        let calls = provider.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].model, "m1");
        assert_eq!(calls[1].prompt, "p2");
    }
}
