//! Error hashing and feedback signatures.
//!
//! The error hash keys the router's per-error tried-set; the feedback
//! signature drives stagnation detection. Both must be stable under the
//! noise that changes between iterations: line numbers, timestamps and
//! hex blobs are stripped before hashing so that the same kind of failure
//! collides to the same digest.

use std::sync::LazyLock;

use regex::Regex;

static LINE_NUMBERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:line|zeile|:)\s*\d+").unwrap());
static PAREN_NUMBERS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\d+\)").unwrap());
static TIMESTAMPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}").unwrap());
static HEX_BLOBS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9a-f]{8,}").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Recurring failure patterns matched against normalized feedback. The
/// sorted subset of matches becomes part of the signature so that two
/// differently-worded reports of the same failure still collide.
pub const WELL_KNOWN_ERROR_PATTERNS: &[&str] = &[
    "no such table",
    "module not found",
    "cannot read properties",
    "failed to compile",
    "syntaxerror",
    "referenceerror",
    "typeerror",
    "cannot find module",
    "unexpected token",
    "is not defined",
    "import error",
    "hydration",
    "missing required",
    "sqlite_error",
    "enoent",
    "permission denied",
    "timeout",
    "connection refused",
    "unhandled rejection",
    "cannot resolve",
];

/// Strip iteration noise and collapse the text to a stable lower-case form.
///
/// Timestamps go first: the line-number rule eats `:MM:SS` fragments and
/// would leave unmatchable timestamp remnants behind otherwise.
pub fn normalize_error_text(input: &str) -> String {
    let stripped = TIMESTAMPS.replace_all(input, "");
    let stripped = LINE_NUMBERS.replace_all(&stripped, "");
    let stripped = PAREN_NUMBERS.replace_all(&stripped, "");
    let stripped = HEX_BLOBS.replace_all(&stripped, "");
    WHITESPACE
        .replace_all(&stripped, " ")
        .trim()
        .to_lowercase()
}

/// 16-hex-char digest over the normalized error text.
pub fn hash_error(input: &str) -> String {
    let normalized = normalize_error_text(input);
    let digest = blake3::hash(normalized.as_bytes());
    digest.to_hex()[..16].to_string()
}

/// Stagnation signature over feedback + sandbox result.
///
/// Empty combined input yields an empty signature (no stagnation tracking
/// for clean iterations).
pub fn feedback_signature(feedback: &str, sandbox_result: &str) -> String {
    let combined = format!("{feedback}{sandbox_result}");
    if combined.trim().is_empty() {
        return String::new();
    }

    let normalized = normalize_error_text(&combined);

    let mut matched: Vec<&str> = WELL_KNOWN_ERROR_PATTERNS
        .iter()
        .copied()
        .filter(|p| normalized.contains(p))
        .collect();
    matched.sort_unstable();

    let prefix: String = normalized.chars().take(500).collect();
    let signature_input = format!("{}||{}", matched.join("|"), prefix);
    let digest = blake3::hash(signature_input.as_bytes());
    digest.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_16_hex_chars() {
        let hash = hash_error("TypeError: cannot read properties of undefined");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_stable_under_line_numbers() {
        let a = hash_error("sqlite3.OperationalError: no such table: todos (line 42)");
        let b = hash_error("sqlite3.OperationalError: no such table: todos (line 97)");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_stable_under_timestamps() {
        let a = hash_error("2026-02-20 10:15:30 Error: build failed");
        let b = hash_error("2026-02-21T23:59:59 Error: build failed");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_stable_under_hex_blobs() {
        let a = hash_error("Error at deadbeefcafe1234: crash");
        let b = hash_error("Error at 0123456789abcdef: crash");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_errors_differ() {
        let a = hash_error("ModuleNotFoundError: No module named 'flask'");
        let b = hash_error("SyntaxError: invalid syntax");
        assert_ne!(a, b);
    }

    #[test]
    fn test_signature_empty_for_empty_input() {
        assert_eq!(feedback_signature("", ""), "");
        assert_eq!(feedback_signature("  ", "\n"), "");
    }

    #[test]
    fn test_signature_constant_across_iterations() {
        // The stagnation scenario: same core error, shifting line numbers.
        let sigs: Vec<String> = [42, 57, 63, 71, 88]
            .iter()
            .map(|line| {
                feedback_signature(
                    &format!("sqlite3.OperationalError: no such table: todos (line {line})"),
                    "",
                )
            })
            .collect();
        assert!(sigs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_signature_differs_for_different_failures() {
        let a = feedback_signature("Module not found: 'express'", "");
        let b = feedback_signature("Hydration failed in layout.js", "");
        assert_ne!(a, b);
    }

    #[test]
    fn test_normalize_lowercases_and_collapses() {
        let norm = normalize_error_text("Error:   Something\n\nBroke  BADLY");
        assert_eq!(norm, "error: something broke badly");
    }
}
