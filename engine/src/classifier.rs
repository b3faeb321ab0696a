//! Pure predicates over provider errors and subprocess output.
//!
//! Order matters: the more specific checks (server-5xx, permanent
//! unavailability) must run before the broader ones (rate limit, generic
//! unavailable). [`classify`] encodes that order; the individual predicates
//! stay public for call sites that only need one answer.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static RATE_LIMIT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\brate[_\s-]?limit\b").unwrap());

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// HTTP 5xx or an explicit server-error message. Not a rate limit.
    ServerError,
    /// HTTP 429/402 or an explicit rate-limit message.
    RateLimit,
    /// Provider-qualified upstream failure that warrants an immediate
    /// model switch.
    ProviderUpstream,
    /// 404 / "no endpoints found" — the model id cannot be served.
    ModelUnavailable,
    /// "free period ended" — never retry this model in this process.
    PermanentlyUnavailable,
    /// Known provider-library internal failure; treated like a rate limit
    /// for retry policy.
    ProviderInternal,
    /// Empty or placeholder response body.
    EmptyResponse,
    /// Anything else.
    Other,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerError => write!(f, "server_error"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::ProviderUpstream => write!(f, "provider_upstream"),
            Self::ModelUnavailable => write!(f, "model_unavailable"),
            Self::PermanentlyUnavailable => write!(f, "permanently_unavailable"),
            Self::ProviderInternal => write!(f, "provider_internal"),
            Self::EmptyResponse => write!(f, "empty_response"),
            Self::Other => write!(f, "other"),
        }
    }
}

const SERVER_ERROR_PATTERNS: &[&str] = &[
    "internal server error",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "500",
    "502",
    "503",
    "504",
];

const UPSTREAM_PATTERNS: &[&str] = &["openrouter", "upstream error from provider", "upstream error"];

const UNAVAILABLE_PATTERNS: &[&str] = &["not found", "no endpoints found"];

const PROVIDER_INTERNAL_PATTERN: &str = "'exception' object has no attribute 'request'";

const EMPTY_RESPONSE_PATTERNS: &[&str] = &[
    "(no response",
    "no response -",
    "indicating failure",
    "malfunctioning",
    "[empty]",
    "[no output]",
    "failed to generate",
    "unable to process",
];

/// HTTP 5xx status or a server-error message. Upstream 5xx is explicitly
/// NOT a rate limit.
pub fn is_server_error(status: Option<u16>, message: &str) -> bool {
    if matches!(status, Some(s) if (500..600).contains(&s)) {
        return true;
    }
    let lower = message.to_lowercase();
    SERVER_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// HTTP 429/402 or an explicit rate-limit message.
pub fn is_rate_limit(status: Option<u16>, message: &str) -> bool {
    if is_server_error(status, message) {
        return false;
    }
    matches!(status, Some(429) | Some(402)) || RATE_LIMIT_PATTERN.is_match(message)
}

/// Provider-qualified tokens that call for an immediate model switch.
pub fn is_provider_upstream(message: &str) -> bool {
    let lower = message.to_lowercase();
    UPSTREAM_PATTERNS.iter().any(|p| lower.contains(p))
}

/// 404 or "not found" / "no endpoints found".
pub fn is_model_unavailable(status: Option<u16>, message: &str) -> bool {
    if status == Some(404) {
        return true;
    }
    let lower = message.to_lowercase();
    UNAVAILABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// "free period ended" — irreversible within the process.
pub fn is_permanently_unavailable(message: &str) -> bool {
    message.to_lowercase().contains("free period ended")
}

/// Known provider-library internal error, retried like a rate limit.
pub fn is_provider_internal(message: &str) -> bool {
    message.to_lowercase().contains(PROVIDER_INTERNAL_PATTERN)
}

/// Empty/whitespace body or a known placeholder response.
pub fn is_empty_or_invalid_response(response: &str) -> bool {
    if response.trim().is_empty() {
        return true;
    }
    let lower = response.to_lowercase();
    EMPTY_RESPONSE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify a failed call; most specific first.
pub fn classify(status: Option<u16>, message: &str) -> ErrorClass {
    if is_permanently_unavailable(message) {
        return ErrorClass::PermanentlyUnavailable;
    }
    if is_model_unavailable(status, message) {
        return ErrorClass::ModelUnavailable;
    }
    if is_server_error(status, message) {
        return ErrorClass::ServerError;
    }
    if is_rate_limit(status, message) {
        return ErrorClass::RateLimit;
    }
    if is_provider_upstream(message) {
        return ErrorClass::ProviderUpstream;
    }
    if is_provider_internal(message) {
        return ErrorClass::ProviderInternal;
    }
    if is_empty_or_invalid_response(message) {
        return ErrorClass::EmptyResponse;
    }
    ErrorClass::Other
}

/// Harmless line patterns from pip/npm output.
const HARMLESS_SUBSTRINGS: &[&str] = &[
    "WARNING: Running pip as the 'root' user",
    "[notice] A new release of pip is available",
    "[notice] To update, run: pip install --upgrade pip",
    "npm WARN",
    "npm notice",
];

const HARMLESS_PREFIXES: &[&str] = &[
    "warning",
    "warn",
    "notice",
    "[notice]",
    "[warning]",
    "npm warn",
    "deprecated",
    "experimentalwarning",
    "punycode",
    "cleanup",
];

/// Real-error tokens that are never ignorable, regardless of line shape.
const REAL_ERROR_TOKENS: &[&str] = &[
    "Error:",
    "ERROR:",
    "error:",
    "Failed:",
    "FAILED:",
    "failed:",
    "Exception:",
    "exception:",
    "Traceback (most recent call last)",
    "ModuleNotFoundError",
    "ImportError",
    "SyntaxError",
    "NameError",
    "TypeError",
    "ValueError",
    "AttributeError",
    "FileNotFoundError",
    "ResolutionImpossible",
    "Could not find a version",
    "No matching distribution",
    "pytest: error",
    "= FAILURES =",
];

/// True when the combined output contains only known-harmless warning
/// lines and no real-error token. Used to let a non-zero exit code from
/// pip/npm pass the sandbox.
pub fn is_harmless_warning_only(stderr: &str, stdout: &str) -> bool {
    let combined = format!("{stderr}{stdout}");

    for token in REAL_ERROR_TOKENS {
        if combined.contains(token) {
            return false;
        }
    }

    for line in combined.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if HARMLESS_SUBSTRINGS.iter().any(|p| line.contains(p)) {
            continue;
        }
        let lower = trimmed.to_lowercase();
        if HARMLESS_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            continue;
        }
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_by_status() {
        assert!(is_rate_limit(Some(429), ""));
        assert!(is_rate_limit(Some(402), ""));
        assert!(!is_rate_limit(Some(200), "all fine"));
    }

    #[test]
    fn test_rate_limit_by_message() {
        assert!(is_rate_limit(None, "Rate limit exceeded, retry later"));
        assert!(is_rate_limit(None, "hit the rate_limit for this key"));
        assert!(!is_rate_limit(None, "the pirate limit was reached"));
    }

    #[test]
    fn test_server_error_is_not_rate_limit() {
        assert!(is_server_error(Some(503), ""));
        assert!(is_server_error(None, "Internal Server Error"));
        // Upstream 5xx must never be mistaken for a rate limit.
        assert!(!is_rate_limit(Some(503), "503 service unavailable rate limit"));
        assert_eq!(
            classify(Some(503), "service unavailable"),
            ErrorClass::ServerError
        );
    }

    #[test]
    fn test_permanent_beats_everything() {
        assert_eq!(
            classify(Some(429), "free period ended for this model"),
            ErrorClass::PermanentlyUnavailable
        );
    }

    #[test]
    fn test_model_unavailable() {
        assert!(is_model_unavailable(Some(404), ""));
        assert!(is_model_unavailable(None, "No endpoints found for model"));
        assert_eq!(
            classify(Some(404), "model not found"),
            ErrorClass::ModelUnavailable
        );
    }

    #[test]
    fn test_provider_upstream() {
        assert!(is_provider_upstream("OpenRouter returned garbage"));
        assert!(is_provider_upstream("Upstream error from provider xyz"));
        assert_eq!(
            classify(None, "upstream error from provider"),
            ErrorClass::ProviderUpstream
        );
    }

    #[test]
    fn test_provider_internal() {
        assert!(is_provider_internal(
            "'Exception' object has no attribute 'request'"
        ));
        assert_eq!(
            classify(None, "'Exception' object has no attribute 'request'"),
            ErrorClass::ProviderInternal
        );
    }

    #[test]
    fn test_empty_response() {
        assert!(is_empty_or_invalid_response(""));
        assert!(is_empty_or_invalid_response("   \n  "));
        assert!(is_empty_or_invalid_response("(no response from model)"));
        assert!(is_empty_or_invalid_response("[EMPTY]"));
        assert!(!is_empty_or_invalid_response("### FILENAME: app.py"));
    }

    #[test]
    fn test_harmless_pip_warnings() {
        let stderr = "WARNING: Running pip as the 'root' user can result in broken permissions\n\
                      [notice] A new release of pip is available: 23.0 -> 24.0\n";
        assert!(is_harmless_warning_only(stderr, ""));
    }

    #[test]
    fn test_harmless_npm_warnings() {
        let stderr = "npm WARN deprecated inflight@1.0.6\nnpm notice New minor version available\n";
        assert!(is_harmless_warning_only(stderr, ""));
    }

    #[test]
    fn test_real_error_not_harmless() {
        let stderr = "npm WARN deprecated something\nError: Cannot find module 'express'\n";
        assert!(!is_harmless_warning_only(stderr, ""));
    }

    #[test]
    fn test_real_error_in_stdout() {
        assert!(!is_harmless_warning_only(
            "",
            "Traceback (most recent call last)\n  ..."
        ));
    }

    #[test]
    fn test_unknown_line_not_harmless() {
        assert!(!is_harmless_warning_only("something unexpected happened", ""));
    }

    #[test]
    fn test_empty_output_is_harmless() {
        assert!(is_harmless_warning_only("", ""));
        assert!(is_harmless_warning_only("\n\n", "  "));
    }

    #[test]
    fn test_error_class_display() {
        assert_eq!(ErrorClass::RateLimit.to_string(), "rate_limit");
        assert_eq!(
            ErrorClass::PermanentlyUnavailable.to_string(),
            "permanently_unavailable"
        );
    }
}
