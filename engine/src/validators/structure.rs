//! Template and framework structure validation.

use std::collections::BTreeMap;

use crate::config::TechBlueprint;

use super::ValidationResult;

/// When a project template is set, every file the template guarantees
/// must exist in the workspace.
pub fn validate_template_structure(
    files: &BTreeMap<String, String>,
    blueprint: &TechBlueprint,
) -> ValidationResult {
    let mut result = ValidationResult::passed("template_structure");
    if blueprint.source_template.is_none() {
        return result;
    }

    for required in &blueprint.template_required_files {
        if !files.contains_key(required) {
            result.issue(format!(
                "Template-Datei fehlt: {required} (Template: {})",
                blueprint.source_template.as_deref().unwrap_or("?")
            ));
        }
    }
    result
}

fn is_nextjs(blueprint: &TechBlueprint) -> bool {
    blueprint.stack_fingerprint().contains("next")
}

/// Next.js structure fallback when no template is set: root layout,
/// global stylesheet, react-dom alongside react, no @next/jest, and
/// pages-router API handlers export via `export default` instead of
/// `exports.METHOD`.
pub fn validate_nextjs_structure(
    files: &BTreeMap<String, String>,
    blueprint: &TechBlueprint,
) -> ValidationResult {
    let mut result = ValidationResult::passed("nextjs_structure");
    if blueprint.source_template.is_some() || !is_nextjs(blueprint) {
        return result;
    }

    let has_layout = files
        .keys()
        .any(|p| p.starts_with("app/layout.") || p.starts_with("app/_app."));
    if !has_layout {
        result.issue("app/layout.js (oder app/_app.*) fehlt".to_string());
    }

    if !files.contains_key("styles/globals.css") && !files.contains_key("app/globals.css") {
        result.issue("styles/globals.css fehlt".to_string());
    }

    if let Some(package_json) = files.get("package.json") {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(package_json) {
            let deps = value.get("dependencies").cloned().unwrap_or_default();
            let dev_deps = value.get("devDependencies").cloned().unwrap_or_default();
            let has = |name: &str| {
                deps.get(name).is_some() || dev_deps.get(name).is_some()
            };
            if has("react") && !has("react-dom") {
                result.issue("react deklariert aber react-dom fehlt in package.json".to_string());
            }
            if has("@next/jest") {
                result.issue(
                    "@next/jest ist nicht erlaubt - nutze jest + next/jest Konfiguration"
                        .to_string(),
                );
            }
        }
    }

    // pages/api handlers must use `export default`, not CommonJS exports.
    for (path, content) in files {
        if path.starts_with("pages/api/") && (path.ends_with(".js") || path.ends_with(".ts")) {
            let has_commonjs = content.contains("exports.GET")
                || content.contains("exports.POST")
                || content.contains("exports.PUT")
                || content.contains("exports.DELETE")
                || content.contains("module.exports");
            if has_commonjs && !content.contains("export default") {
                result.issue(format!(
                    "{path}: API-Handler nutzt exports.METHOD statt export default"
                ));
            }
        }
    }

    result
}

/// Inline SVG data URLs render inconsistently and blow up diffs; warn.
pub fn validate_no_inline_svg(files: &BTreeMap<String, String>) -> ValidationResult {
    let mut result = ValidationResult::passed("inline_svg");
    for (path, content) in files {
        if content.contains("data:image/svg+xml") {
            result.warn(format!("{path}: Inline-SVG data-URL gefunden"));
        }
    }
    result
}

/// A `pages/` directory coexisting with `app/` makes Next.js routing
/// ambiguous; warn.
pub fn validate_no_pages_router(files: &BTreeMap<String, String>) -> ValidationResult {
    let mut result = ValidationResult::passed("pages_router");
    let has_app = files.keys().any(|p| p.starts_with("app/"));
    let has_pages = files
        .keys()
        .any(|p| p.starts_with("pages/") && !p.starts_with("pages/api/"));
    if has_app && has_pages {
        result.warn("pages/ und app/ Router koexistieren - Routing-Konflikt moeglich".to_string());
    }
    result
}

/// Libraries known to break inside the containerized runtime.
const FORBIDDEN_LIBRARIES: &[&str] = &["better-sqlite3", "sharp", "canvas", "node-gyp"];

/// Warn when a dependency known to break under the container is declared.
pub fn validate_no_forbidden_libraries(files: &BTreeMap<String, String>) -> ValidationResult {
    let mut result = ValidationResult::passed("forbidden_libraries");
    let Some(package_json) = files.get("package.json") else {
        return result;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(package_json) else {
        return result;
    };
    for section in ["dependencies", "devDependencies"] {
        if let Some(deps) = value.get(section).and_then(|d| d.as_object()) {
            for name in deps.keys() {
                if FORBIDDEN_LIBRARIES.contains(&name.as_str()) {
                    result.warn(format!(
                        "{name} bricht im Container (native Build) - Alternative verwenden"
                    ));
                }
            }
        }
    }
    result
}
