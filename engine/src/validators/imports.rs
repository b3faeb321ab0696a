//! Bare-import dependency validation for JS/TS workspaces.
//!
//! Every bare import in source must be declared in package.json. Node
//! builtins, framework-provided modules and path aliases are excluded;
//! scoped packages are normalized to their `@scope/name` form.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use super::ValidationResult;

static IMPORT_SOURCES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"import\s+[^;'"]*?from\s+['"]([^'"]+)['"]"#,
        r#"import\s+['"]([^'"]+)['"]"#,
        r#"require\s*\(\s*['"]([^'"]+)['"]\s*\)"#,
        r#"import\s*\(\s*['"]([^'"]+)['"]\s*\)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "cluster", "crypto", "dgram", "dns", "events", "fs",
    "http", "http2", "https", "net", "os", "path", "perf_hooks", "process", "querystring",
    "readline", "stream", "string_decoder", "timers", "tls", "url", "util", "v8", "vm", "zlib",
];

const FRAMEWORK_MODULES: &[&str] = &[
    "react",
    "react-dom",
    "next",
    "next/image",
    "next/link",
    "next/router",
    "next/navigation",
    "next/server",
    "next/headers",
    "next/font",
];

fn is_source_file(path: &str) -> bool {
    [".js", ".jsx", ".ts", ".tsx", ".mjs"]
        .iter()
        .any(|ext| path.ends_with(ext))
}

/// Normalize an import specifier to its package name: `@scope/pkg/sub` →
/// `@scope/pkg`, `pkg/sub/path` → `pkg`. Returns `None` for specifiers
/// that need no declaration (relative, alias, builtin, framework).
pub fn package_name_of(specifier: &str) -> Option<String> {
    if specifier.starts_with('.') || specifier.starts_with('/') {
        return None;
    }
    // Path aliases configured in the bundler.
    if specifier.starts_with("@/") || specifier.starts_with("~/") {
        return None;
    }
    let name = if specifier.starts_with('@') {
        specifier.splitn(3, '/').take(2).collect::<Vec<_>>().join("/")
    } else {
        specifier.split('/').next().unwrap_or(specifier).to_string()
    };

    let bare = name.strip_prefix("node:").unwrap_or(&name);
    if NODE_BUILTINS.contains(&bare) {
        return None;
    }
    if FRAMEWORK_MODULES.contains(&specifier) || FRAMEWORK_MODULES.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}

fn declared_dependencies(files: &BTreeMap<String, String>) -> BTreeSet<String> {
    let mut declared = BTreeSet::new();
    let Some(package_json) = files.get("package.json") else {
        return declared;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(package_json) else {
        return declared;
    };
    for section in ["dependencies", "devDependencies", "peerDependencies"] {
        if let Some(deps) = value.get(section).and_then(|d| d.as_object()) {
            declared.extend(deps.keys().cloned());
        }
    }
    declared
}

/// Validate that every bare import is declared in package.json.
pub fn validate_import_dependencies(files: &BTreeMap<String, String>) -> ValidationResult {
    let mut result = ValidationResult::passed("import_dependencies");
    let has_sources = files.keys().any(|p| is_source_file(p));
    if !has_sources {
        return result;
    }
    let declared = declared_dependencies(files);

    let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (path, content) in files {
        if !is_source_file(path) {
            continue;
        }
        for pattern in IMPORT_SOURCES.iter() {
            for captures in pattern.captures_iter(content) {
                if let Some(package) = package_name_of(&captures[1]) {
                    if !declared.contains(&package) {
                        missing.entry(package).or_default().push(path.clone());
                    }
                }
            }
        }
    }

    for (package, users) in missing {
        let mut shown = users;
        shown.sort();
        shown.dedup();
        result.issue(format!(
            "'{package}' importiert aber nicht in package.json deklariert (in {})",
            shown.join(", ")
        ));
    }

    result
}
