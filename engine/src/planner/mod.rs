//! Patch planner: decides what the next coder call regenerates.
//!
//! The affected-files extractor is the single home of the feedback
//! filename regex set; the compressor and the parallel patch executor both
//! resolve file references through it.

mod missing;
mod status;

pub use missing::{detect_missing_files, render_creation_orders, MissingFile};
pub use status::{FileStatus, FileStatusDetector, StatusSummary};

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Cap on extracted affected-file basenames per feedback.
pub const MAX_AFFECTED_FILES: usize = 30;

/// Names that match the filename regexes but appear in prose ("the
/// Next.js environment"), never as project files.
pub const FALSE_POSITIVE_FILENAMES: &[&str] = &[
    "next.js",
    "node.js",
    "vue.js",
    "react.js",
    "express.js",
    "nuxt.js",
    "nest.js",
    "ember.js",
    "angular.js",
    "backbone.js",
    "three.js",
    "p5.js",
    "d3.js",
    "chart.js",
    "socket.js",
];

/// Path fragments that mark system libraries rather than project files.
const SYSTEM_PATH_FRAGMENTS: &[&str] = &["site-packages", "python3", "/usr/", "venv/"];

static FILE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // [DATEI:app/api/todos/[id]/route.js] — dynamic segments included
        r"\[DATEI:(.+?\.[a-z]{1,4})\]",
        r"\[(?:File|Datei):\s*(.+?\.[a-z]{1,4})\]",
        // Python traceback
        r#"File "([^"]+\.py)""#,
        r"in ([a-zA-Z_][a-zA-Z0-9_]*\.py)",
        r"([a-zA-Z_][a-zA-Z0-9_]*\.py):",
        r"tests/([^/\s]+\.py)",
        // JS/TS references
        r"([a-zA-Z_][a-zA-Z0-9_]*\.(?:js|jsx|ts|tsx))[\s:]",
        r#"(?:in|from)\s+["']([^"']+\.(?:js|jsx|ts|tsx))["']"#,
        r#"Module not found.*?["']([^"']+)["']"#,
        r"Error:\s*([a-zA-Z0-9_/.\\-]+\.(?:js|jsx|ts|tsx))",
        r"([a-zA-Z0-9_/.-]+\.(?:js|jsx|ts|tsx))\s+(?:hat|has|contains)",
        r#"(?:Datei|File|Syntax)\s+["']?([a-zA-Z0-9_/.-]+\.(?:js|jsx|ts|tsx))"#,
        // Reviewer markdown bullet formats
        r"-\s+`([a-zA-Z0-9_/.\[\]-]+\.(?:js|jsx|ts|tsx|py|json|css|bat))`",
        r"[→>]\s*(?:DATEI|BETROFFENE DATEIEN):\s*`?([a-zA-Z0-9_/.\[\]-]+\.[a-z]{1,4})`?",
        r"BETROFFENE\s+DATEIEN?:.*?`([a-zA-Z0-9_/.\[\]-]+\.[a-z]{1,4})`",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Extract up to [`MAX_AFFECTED_FILES`] file basenames referenced by the
/// feedback, filtering system paths and prose false positives.
pub fn affected_files_from_feedback(feedback: &str) -> Vec<String> {
    if feedback.is_empty() {
        return Vec::new();
    }

    let mut found: Vec<String> = Vec::new();
    for pattern in FILE_PATTERNS.iter() {
        for captures in pattern.captures_iter(feedback) {
            let Some(m) = captures.get(1) else { continue };
            let raw = m.as_str();
            let raw_lower = raw.to_lowercase();
            if SYSTEM_PATH_FRAGMENTS.iter().any(|s| raw_lower.contains(s)) {
                continue;
            }
            let name = basename(raw).to_string();
            if FALSE_POSITIVE_FILENAMES.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            if !found.contains(&name) {
                found.push(name);
            }
        }
    }

    found.truncate(MAX_AFFECTED_FILES);
    found
}

/// Error indicators that point at a targeted fix.
const FIX_INDICATORS: &[&str] = &[
    "typeerror:",
    "nameerror:",
    "syntaxerror:",
    "importerror:",
    "attributeerror:",
    "keyerror:",
    "valueerror:",
    "modulenotfounderror:",
    "expected",
    "got",
    "argument",
    "parameter",
    "takes",
    "missing",
    "undefined",
    "not defined",
    "cannot import",
    "syntaxfehler",
    "fehler:",
    "ungültig",
    "fehlgeschlagen",
    "nicht gefunden",
    "nicht definiert",
    "fehlerhaft",
    "formatierung",
];

/// Additive-change indicators (tests, docs, new features) that also favor
/// patch mode over full regeneration.
const ADDITIVE_INDICATORS: &[&str] = &[
    "unit-test",
    "test",
    "tests/",
    "test_",
    "_test.",
    "erstelle test",
    "add test",
    "create test",
    "dokumentation",
    "documentation",
    "docstring",
    "hinzufügen",
    "ergänzen",
    "add",
    "create",
    "new file",
    "pflicht:",
    "required:",
    "must:",
];

/// Whether the feedback points at a targeted fix or an additive change.
/// Empty feedback is never a targeted fix.
pub fn is_targeted_fix(feedback: &str) -> bool {
    if feedback.is_empty() {
        return false;
    }
    let lower = feedback.to_lowercase();
    FIX_INDICATORS.iter().any(|ind| lower.contains(ind))
        || ADDITIVE_INDICATORS.iter().any(|ind| lower.contains(ind))
}

/// Iteration mode for the next coder call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationMode {
    /// The coder rewrites the whole project.
    Full,
    /// Only targeted files are regenerated.
    Patch,
}

impl std::fmt::Display for IterationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Patch => write!(f, "patch"),
        }
    }
}

/// Inputs to the mode decision.
#[derive(Debug, Clone, Default)]
pub struct ModeContext<'a> {
    pub iteration: u32,
    pub feedback: &'a str,
    /// Files UTDS auto-fixed in the previous turn.
    pub utds_task_count: usize,
    /// Files the planner identified for patching.
    pub affected_file_count: usize,
}

/// Decide the iteration mode.
///
/// The first iteration is always full. Afterwards the default drifts to
/// patch: UTDS tasks, identified patch targets or the targeted-fix
/// heuristic all select patch; only empty feedback with no affected files
/// falls back to full regeneration.
pub fn decide_mode(context: &ModeContext<'_>) -> IterationMode {
    if context.iteration == 0 {
        return IterationMode::Full;
    }
    if context.utds_task_count > 0 || context.affected_file_count > 0 {
        return IterationMode::Patch;
    }
    if is_targeted_fix(context.feedback) {
        return IterationMode::Patch;
    }
    if context.feedback.is_empty() {
        return IterationMode::Full;
    }
    IterationMode::Patch
}

/// Resolve extracted basenames to full workspace paths, preserving order
/// and dropping unknown names.
pub fn resolve_affected_paths(
    basenames: &[String],
    files: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut resolved = Vec::new();
    for name in basenames {
        if let Some((path, _)) = crate::workspace::resolve_in_workspace(name, files) {
            if !resolved.contains(path) {
                resolved.push(path.clone());
            }
        }
    }
    resolved
}
