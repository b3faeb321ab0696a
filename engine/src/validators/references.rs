//! HTML reference validation.
//!
//! Every `<script src>` / `<link href>` with a local relative target must
//! resolve to a workspace file; external URLs are ignored.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::ValidationResult;

static SCRIPT_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<script[^>]*\ssrc=["']([^"']+)["']"#).unwrap());
static LINK_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<link[^>]*\shref=["']([^"']+)["']"#).unwrap());

fn is_external(target: &str) -> bool {
    target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("//")
        || target.starts_with("data:")
}

fn resolve_target(html_path: &str, target: &str, files: &BTreeMap<String, String>) -> bool {
    let cleaned = target.split(['?', '#']).next().unwrap_or("").trim_start_matches("./");
    if cleaned.is_empty() {
        return true;
    }
    let rooted = cleaned.trim_start_matches('/');
    if files.contains_key(rooted) {
        return true;
    }
    // Relative to the HTML file's directory.
    let dir = match html_path.rfind('/') {
        Some(idx) => &html_path[..idx],
        None => "",
    };
    let joined = if dir.is_empty() {
        rooted.to_string()
    } else {
        format!("{dir}/{rooted}")
    };
    files.contains_key(&joined)
}

/// Validate local script/stylesheet references of every HTML file.
pub fn validate_references(files: &BTreeMap<String, String>) -> ValidationResult {
    let mut result = ValidationResult::passed("references");

    for (path, content) in files {
        if !path.ends_with(".html") {
            continue;
        }
        for pattern in [&*SCRIPT_SRC, &*LINK_HREF] {
            for captures in pattern.captures_iter(content) {
                let target = &captures[1];
                if is_external(target) {
                    continue;
                }
                if !resolve_target(path, target, files) {
                    result.issue(format!(
                        "{path}: referenzierte Datei '{target}' existiert nicht"
                    ));
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_local_script_is_issue() {
        let workspace = files(&[(
            "index.html",
            r#"<html><script src="app.js"></script></html>"#,
        )]);
        let result = validate_references(&workspace);
        assert!(!result.passed);
        assert!(result.issues[0].contains("app.js"));
    }

    #[test]
    fn test_present_script_passes() {
        let workspace = files(&[
            ("index.html", r#"<script src="./app.js"></script>"#),
            ("app.js", "console.log(1)"),
        ]);
        assert!(validate_references(&workspace).passed);
    }

    #[test]
    fn test_external_urls_ignored() {
        let workspace = files(&[(
            "index.html",
            r#"<script src="https://cdn.example.com/x.js"></script>
               <link href="//fonts.example.com/css" rel="stylesheet">"#,
        )]);
        assert!(validate_references(&workspace).passed);
    }

    #[test]
    fn test_link_stylesheet_checked() {
        let workspace = files(&[(
            "templates/index.html",
            r#"<link rel="stylesheet" href="styles.css">"#,
        ), ("templates/styles.css", "body {}")]);
        assert!(validate_references(&workspace).passed);
    }

    #[test]
    fn test_query_string_stripped() {
        let workspace = files(&[
            ("index.html", r#"<script src="app.js?v=3"></script>"#),
            ("app.js", "x"),
        ]);
        assert!(validate_references(&workspace).passed);
    }
}
