//! Project workspace I/O.
//!
//! Files are addressed by POSIX-normalized relative paths. Multi-file LLM
//! output uses `### FILENAME: <path>` markers; the canonical in-memory
//! shape is a map of path → content, converted to the marker string only
//! at the LLM and disk boundaries.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::validators::completeness::validate_before_write;

/// Marker line that starts a file block in LLM output.
pub const FILENAME_MARKER: &str = "### FILENAME:";

/// Paths that are never generated, written, or diffed.
const FORBIDDEN_BASENAMES: &[&str] = &["package-lock.json", "yarn.lock", "pnpm-lock.yaml"];

/// Directory segments that are never generated and never read.
const FORBIDDEN_SEGMENTS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".next",
    "venv",
    ".venv",
    "dist",
    "build",
    ".cache",
];

/// Extensions included in workspace reads.
static DEFAULT_EXTENSIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "py", "js", "jsx", "ts", "tsx", "mjs", "vue", "svelte", "html", "css", "json", "bat",
        "sh", "yaml", "yml", "toml", "cfg", "ini", "md", "txt", "sql", "env", "xml", "proto",
        "graphql",
    ]
    .into_iter()
    .collect()
});

/// Errors from workspace I/O.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace I/O failed for {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Outcome of a multi-file write.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    /// Paths written to disk (POSIX-relative).
    pub written: Vec<String>,
    /// Paths skipped because they are forbidden.
    pub skipped_forbidden: Vec<String>,
    /// Paths rejected by the shrink/truncation guard, with the reason.
    pub rejected: Vec<(String, String)>,
}

/// Normalize a path from LLM output to POSIX-relative form: backslashes
/// become slashes, leading slashes and `./` segments drop out.
pub fn normalize_path(raw: &str) -> String {
    raw.trim()
        .replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a path is in the forbidden set.
pub fn is_forbidden_path(path: &str) -> bool {
    let normalized = normalize_path(path);
    let basename = normalized.rsplit('/').next().unwrap_or(&normalized);
    if FORBIDDEN_BASENAMES.contains(&basename) {
        return true;
    }
    normalized
        .split('/')
        .any(|segment| FORBIDDEN_SEGMENTS.contains(&segment))
}

/// Replace LLM-produced Unicode hyphen variants with ASCII minus so the
/// written sources do not drift in encoding.
pub fn sanitize_unicode(content: &str) -> String {
    content
        .chars()
        .map(|c| match c {
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => '-',
            other => other,
        })
        .collect()
}

/// Strip one wrapping markdown code fence from a file body, if present.
fn strip_code_fence(content: &str) -> String {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return content.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() >= 2 && lines.last().map(|l| l.trim() == "```").unwrap_or(false) {
        lines.pop();
        lines.remove(0);
        return lines.join("\n");
    }
    content.to_string()
}

/// Parse a `### FILENAME:` multi-file blob into a path → content map.
///
/// Lines before the first marker are ignored; each file's content runs
/// until the next marker or EOF. Trailing blank lines of each block are
/// trimmed so the rendered form round-trips.
pub fn parse_multi_file(blob: &str) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in blob.lines() {
        if let Some(rest) = line.trim_start().strip_prefix(FILENAME_MARKER) {
            if let Some((path, lines)) = current.take() {
                files.insert(path, finish_block(&lines));
            }
            let path = normalize_path(rest);
            if path.is_empty() {
                current = None;
            } else {
                current = Some((path, Vec::new()));
            }
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((path, lines)) = current.take() {
        files.insert(path, finish_block(&lines));
    }

    files
}

fn finish_block(lines: &[&str]) -> String {
    let joined = lines.join("\n");
    let trimmed = joined.trim_end_matches(['\n', ' ', '\t']).to_string();
    strip_code_fence(&trimmed)
}

/// Render a file map into the canonical multi-file string: blocks sorted
/// by path, joined with blank lines.
pub fn render_canonical(files: &BTreeMap<String, String>) -> String {
    files
        .iter()
        .map(|(path, content)| format!("{FILENAME_MARKER} {path}\n{content}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Write parsed files under `root`.
///
/// Forbidden paths are skipped. In patch mode every file is checked by the
/// shrink & truncation guard against its on-disk predecessor; rejected
/// files are left unchanged on disk.
pub fn write_files(
    root: &Path,
    files: &BTreeMap<String, String>,
    is_patch_mode: bool,
) -> Result<WriteReport, WorkspaceError> {
    let mut report = WriteReport::default();

    for (path, content) in files {
        if is_forbidden_path(path) {
            debug!(path, "skipping forbidden path");
            report.skipped_forbidden.push(path.clone());
            continue;
        }

        let sanitized = sanitize_unicode(content);
        let full_path = root.join(path);

        if is_patch_mode {
            let old_content = std::fs::read_to_string(&full_path).unwrap_or_default();
            if let Err(reason) = validate_before_write(path, &sanitized, &old_content) {
                warn!(path, reason, "write rejected by guard");
                report.rejected.push((path.clone(), reason));
                continue;
            }
        }

        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WorkspaceError::Io {
                path: path.clone(),
                source,
            })?;
        }
        std::fs::write(&full_path, &sanitized).map_err(|source| WorkspaceError::Io {
            path: path.clone(),
            source,
        })?;
        report.written.push(path.clone());
    }

    Ok(report)
}

/// Read the workspace into a path → content map.
///
/// Excluded directories are never entered; only files whose extension is
/// in the allowed set (default set when `include_exts` is `None`) are
/// returned. Non-UTF-8 files are skipped.
pub fn read_workspace(root: &Path, include_exts: Option<&HashSet<String>>) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    if !root.exists() {
        return files;
    }

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !FORBIDDEN_SEGMENTS.contains(&name.as_ref())
        })
        .build();

    for entry in walker.flatten() {
        let path: &Path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let extension = extension.to_lowercase();
        let allowed = match include_exts {
            Some(set) => set.contains(&extension),
            None => DEFAULT_EXTENSIONS.contains(extension.as_str()),
        };
        if !allowed {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let rel_posix = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        match std::fs::read_to_string(path) {
            Ok(content) => {
                files.insert(rel_posix, content);
            }
            Err(e) => debug!(path = rel_posix, error = %e, "skipping unreadable file"),
        }
    }

    files
}

/// Rebuild the canonical multi-file string from the on-disk workspace.
pub fn rebuild_canonical_from_disk(root: &Path) -> String {
    render_canonical(&read_workspace(root, None))
}

/// Resolve a feedback basename against workspace paths: exact path match
/// or basename match.
pub fn resolve_in_workspace<'a>(
    name: &str,
    files: &'a BTreeMap<String, String>,
) -> Option<(&'a String, &'a String)> {
    if let Some((path, content)) = files.get_key_value(name) {
        return Some((path, content));
    }
    files
        .iter()
        .find(|(path, _)| path.rsplit('/').next() == Some(name) || path.ends_with(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(" ./app/page.js"), "app/page.js");
        assert_eq!(normalize_path("app\\api\\route.js"), "app/api/route.js");
        assert_eq!(normalize_path("/abs/path.py"), "abs/path.py");
        assert_eq!(normalize_path("a/./b.js"), "a/b.js");
    }

    #[test]
    fn test_forbidden_paths() {
        assert!(is_forbidden_path("package-lock.json"));
        assert!(is_forbidden_path("node_modules/react/index.js"));
        assert!(is_forbidden_path(".next/build-manifest.json"));
        assert!(is_forbidden_path("app/__pycache__/x.pyc"));
        assert!(!is_forbidden_path("app/page.js"));
        assert!(!is_forbidden_path("package.json"));
    }

    #[test]
    fn test_parse_multi_file() {
        let blob = "Some preamble\n### FILENAME: app.py\nprint('hi')\n\n### FILENAME: lib/util.py\ndef f():\n    return 1";
        let files = parse_multi_file(blob);
        assert_eq!(files.len(), 2);
        assert_eq!(files["app.py"], "print('hi')");
        assert_eq!(files["lib/util.py"], "def f():\n    return 1");
    }

    #[test]
    fn test_parse_strips_code_fences() {
        let blob = "### FILENAME: a.js\n```js\nconst x = 1;\n```";
        let files = parse_multi_file(blob);
        assert_eq!(files["a.js"], "const x = 1;");
    }

    #[test]
    fn test_parse_render_roundtrip() {
        let mut files = BTreeMap::new();
        files.insert("app.py".to_string(), "print('hi')".to_string());
        files.insert(
            "lib/util.py".to_string(),
            "def f():\n    return 1".to_string(),
        );
        let rendered = render_canonical(&files);
        assert_eq!(parse_multi_file(&rendered), files);
    }

    #[test]
    fn test_render_is_sorted() {
        let mut files = BTreeMap::new();
        files.insert("z.py".to_string(), "z".to_string());
        files.insert("a.py".to_string(), "a".to_string());
        let rendered = render_canonical(&files);
        assert!(rendered.find("a.py").unwrap() < rendered.find("z.py").unwrap());
    }

    #[test]
    fn test_sanitize_unicode_hyphens() {
        assert_eq!(sanitize_unicode("a \u{2014} b \u{2212} c"), "a - b - c");
        assert_eq!(sanitize_unicode("plain - text"), "plain - text");
    }

    #[test]
    fn test_write_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = BTreeMap::new();
        files.insert("app.py".to_string(), "print('hi')".to_string());
        files.insert("templates/index.html".to_string(), "<div>x</div>".to_string());

        let report = write_files(dir.path(), &files, false).unwrap();
        assert_eq!(report.written.len(), 2);
        assert!(report.rejected.is_empty());

        let read_back = read_workspace(dir.path(), None);
        assert_eq!(read_back, files);
    }

    #[test]
    fn test_write_skips_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = BTreeMap::new();
        files.insert("package-lock.json".to_string(), "{}".to_string());
        files.insert("index.js".to_string(), "console.log(1)".to_string());

        let report = write_files(dir.path(), &files, false).unwrap();
        assert_eq!(report.written, vec!["index.js".to_string()]);
        assert_eq!(report.skipped_forbidden, vec!["package-lock.json".to_string()]);
        assert!(!dir.path().join("package-lock.json").exists());
    }

    #[test]
    fn test_patch_mode_rejects_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let old = "import { clamp } from './util';\nexport function main() {\n  return clamp(1);\n}\n";
        std::fs::write(dir.path().join("utils.js"), old).unwrap();

        let mut files = BTreeMap::new();
        files.insert("utils.js".to_string(), "import { cl;".to_string());

        let report = write_files(dir.path(), &files, true).unwrap();
        assert!(report.written.is_empty());
        assert_eq!(report.rejected.len(), 1);
        // The on-disk file is unchanged.
        assert_eq!(std::fs::read_to_string(dir.path().join("utils.js")).unwrap(), old);
    }

    #[test]
    fn test_read_workspace_skips_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
        std::fs::write(dir.path().join("node_modules/react/index.js"), "x").unwrap();
        std::fs::write(dir.path().join("app.js"), "y").unwrap();

        let files = read_workspace(dir.path(), None);
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("app.js"));
    }

    #[test]
    fn test_resolve_in_workspace_by_basename() {
        let mut files = BTreeMap::new();
        files.insert("app/api/items/route.js".to_string(), "content".to_string());
        let (path, _) = resolve_in_workspace("route.js", &files).unwrap();
        assert_eq!(path, "app/api/items/route.js");
        assert!(resolve_in_workspace("missing.js", &files).is_none());
    }
}
