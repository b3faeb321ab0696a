//! Detection of referenced-but-absent files.
//!
//! Patch mode cannot invent new files on its own: a `fetch('/api/ideas')`
//! without `app/api/ideas/route.js` loops forever unless the planner turns
//! the missing target into an explicit creation order for the next prompt.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static FETCH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"fetch\s*\(\s*['"`](/api/[^'"`\s)]+)['"`]"#).unwrap());

static RELATIVE_IMPORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:import\s+[^;]*?from\s+|require\s*\(\s*)['"](\./[^'"]+)['"]"#).unwrap()
});

/// A file the workspace references but does not contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingFile {
    /// Path that must be created.
    pub file: String,
    /// Why the planner believes it is missing.
    pub reason: String,
    /// File containing the dangling reference.
    pub referenced_by: String,
}

fn posix_dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Normalize `a/b/../c` style joins.
fn normalize_join(dir: &str, relative: &str) -> String {
    let mut segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Scan the workspace for dangling references.
///
/// Two sources: `fetch('/api/...')` calls without a matching app-router
/// route file, and relative imports that resolve to no workspace file with
/// any of the usual extensions. Results are deduplicated by target path.
pub fn detect_missing_files(files: &BTreeMap<String, String>) -> Vec<MissingFile> {
    let mut missing = Vec::new();

    for (filepath, content) in files {
        // fetch('/api/xyz') → app/api/xyz/route.{js,ts} must exist.
        for captures in FETCH_PATTERN.captures_iter(content) {
            let api_path = captures[1]
                .split('?')
                .next()
                .unwrap_or("")
                .trim_end_matches('/');
            let segments: Vec<&str> = api_path.trim_matches('/').split('/').collect();
            // Dynamic ids (e.g. /api/bugs/123) and deep paths are skipped.
            if segments.len() > 3
                || !segments
                    .iter()
                    .all(|s| *s == "api" || s.chars().all(|c| c.is_ascii_alphabetic()))
            {
                continue;
            }
            let route_js = format!("app{api_path}/route.js");
            let route_ts = format!("app{api_path}/route.ts");
            if !files.contains_key(&route_js) && !files.contains_key(&route_ts) {
                missing.push(MissingFile {
                    file: route_js,
                    reason: format!("fetch('{api_path}') in {filepath} aber Route-Datei fehlt"),
                    referenced_by: filepath.clone(),
                });
            }
        }

        // Relative imports must resolve against the workspace.
        for captures in RELATIVE_IMPORT_PATTERN.captures_iter(content) {
            let import_path = &captures[1];
            let resolved = normalize_join(posix_dirname(filepath), import_path);
            let candidates = ["", ".js", ".jsx", ".ts", ".tsx", "/index.js", "/index.ts"];
            let found = candidates
                .iter()
                .any(|ext| files.contains_key(&format!("{resolved}{ext}")));
            if !found {
                missing.push(MissingFile {
                    file: format!("{resolved}.js"),
                    reason: format!("Import '{import_path}' in {filepath} aber Datei fehlt"),
                    referenced_by: filepath.clone(),
                });
            }
        }
    }

    // Deduplicate by target path, first reference wins.
    let mut seen = std::collections::HashSet::new();
    missing.retain(|m| seen.insert(m.file.clone()));
    missing
}

/// Render missing files as explicit creation orders appended verbatim to
/// the next coder prompt.
pub fn render_creation_orders(missing: &[MissingFile]) -> String {
    if missing.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nFEHLENDE DATEIEN (MUESSEN ERSTELLT WERDEN):\n");
    for entry in missing {
        out.push_str(&format!("- {}: {}\n", entry.file, entry.reason));
    }
    out.push_str(
        "\nWICHTIG: Diese Dateien muessen im NAECHSTEN Output als ### FILENAME: <pfad> enthalten sein!\n",
    );
    out
}
