//! Lesson extraction and deduplication.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::TechBlueprint;

use super::store::Lesson;

/// Maximum length of an extracted pattern.
const MAX_PATTERN_LEN: usize = 200;

/// Priority-ordered extraction patterns; the first match wins.
static EXTRACTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Python error prefixes
        r"(?i)((?:TypeError|ValueError|NameError|SyntaxError|ImportError|ModuleNotFoundError|AttributeError|KeyError|IndexError|RuntimeError|FileNotFoundError):\s*[^\n]+)",
        // Sandbox failure marker
        r"❌\s*([^\n]+)",
        // JavaScript error prefixes
        r"(SyntaxError:\s*[^\n]+)",
        r"(ReferenceError:\s*[^\n]+)",
        // Generic error lines
        r"(?i)(Error:\s*[^\n]+)",
        r"(Fehler:\s*[^\n]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

/// Extract the core error pattern from raw error output.
///
/// Focuses on the key message line, not the whole traceback. Length-bounded
/// to 200 chars for any input.
pub fn extract_error_pattern(error_text: &str) -> String {
    if error_text.is_empty() {
        return String::new();
    }

    for pattern in EXTRACTION_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(error_text) {
            if let Some(m) = captures.get(1) {
                return truncate_chars(m.as_str().trim(), MAX_PATTERN_LEN);
            }
        }
    }

    // Fallback: first line that looks like an error.
    for line in error_text.lines() {
        if line.contains('❌') || line.to_lowercase().contains("error") {
            return truncate_chars(line.trim(), MAX_PATTERN_LEN);
        }
    }

    truncate_chars(error_text.trim(), MAX_PATTERN_LEN)
}

/// Generate tags for a lesson from the tech stack and the error context.
///
/// Always includes `global` so the lesson is visible across projects.
pub fn generate_tags(blueprint: &TechBlueprint, error_text: &str) -> Vec<String> {
    let mut tags = vec!["global".to_string()];

    let mut push_unique = |tags: &mut Vec<String>, tag: String| {
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    };

    push_unique(&mut tags, blueprint.language.to_lowercase());
    push_unique(&mut tags, blueprint.project_type.to_lowercase());
    if let Some(framework) = &blueprint.framework {
        push_unique(&mut tags, framework.to_lowercase());
    }

    let error_lower = error_text.to_lowercase();
    let framework_keywords: &[(&str, &[&str])] = &[
        ("flask", &["flask", "werkzeug", "jinja2"]),
        ("fastapi", &["fastapi", "starlette", "uvicorn"]),
        ("django", &["django"]),
        ("react", &["react", "jsx"]),
        ("node", &["node", "npm", "express"]),
        ("vue", &["vue"]),
        ("angular", &["angular"]),
    ];
    for (framework, keywords) in framework_keywords {
        if keywords.iter().any(|kw| error_lower.contains(kw)) {
            push_unique(&mut tags, framework.to_string());
        }
    }

    if error_lower.contains("syntax") {
        push_unique(&mut tags, "syntax".to_string());
    }
    if error_lower.contains("import") || error_lower.contains("module") {
        push_unique(&mut tags, "import".to_string());
    }
    if error_lower.contains("security")
        || error_lower.contains("csrf")
        || error_lower.contains("xss")
        || error_lower.contains("sql injection")
    {
        push_unique(&mut tags, "security".to_string());
    }

    tags
}

/// Word-overlap ratio between two patterns, 0.0..=1.0.
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let words_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let words_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let overlap = words_a.intersection(&words_b).count();
    overlap as f64 / words_a.len().max(words_b.len()) as f64
}

/// Whether a similar lesson already exists (substring match either way, or
/// word-overlap ratio at or above `threshold`).
pub fn is_duplicate_lesson(lessons: &[Lesson], pattern: &str, threshold: f64) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let pattern_lower = pattern.to_lowercase();

    for lesson in lessons {
        let existing = lesson.pattern.to_lowercase();
        if existing.is_empty() {
            continue;
        }
        if existing.contains(&pattern_lower) || pattern_lower.contains(&existing) {
            return true;
        }
        if word_overlap(&pattern_lower, &existing) >= threshold {
            return true;
        }
    }

    false
}

/// Known patterns with specific advice; first match wins.
const ACTION_TABLE: &[(&str, &str)] = &[
    (
        "sql injection",
        "NUTZE parametrisierte Queries (Platzhalter) statt String-Konkatenation fuer alle SQL-Statements.",
    ),
    (
        "xss",
        "ESCAPE alle Nutzereingaben vor dem Rendern; nutze die Template-Engine statt innerHTML/format-Strings.",
    ),
    (
        "before_first_request",
        "VERMEIDE 'before_first_request' (Flask Deprecated). Nutze stattdessen 'with app.app_context()' fuer Initialisierungen.",
    ),
    (
        "cannot import name 'markup' from 'flask'",
        "IMPORTIERE Markup von 'markupsafe' (from markupsafe import Markup), NICHT von flask.",
    ),
    (
        "modulenotfounderror",
        "Pruefe ob das Modul in requirements.txt/package.json enthalten ist und installiert wurde.",
    ),
    (
        "syntaxerror",
        "Pruefe Klammern, Einrueckungen und Anfuehrungszeichen im Code.",
    ),
    (
        "importerror",
        "Pruefe den Import-Pfad und ob das Modul installiert ist.",
    ),
    (
        "typeerror",
        "Pruefe die Datentypen der uebergebenen Argumente.",
    ),
    (
        "nameerror",
        "Pruefe ob die Variable/Funktion definiert ist bevor sie verwendet wird.",
    ),
    (
        "keyerror",
        "Pruefe ob der Schluessel im Dictionary existiert (nutze .get() mit Default).",
    ),
    (
        "attributeerror",
        "Pruefe ob das Objekt das angeforderte Attribut/Methode besitzt.",
    ),
];

/// Generate a helpful action text for an error pattern.
pub fn action_for_pattern(pattern: &str) -> String {
    if pattern.is_empty() {
        return "VERMEIDE: Unbekannter Fehler aufgetreten.".to_string();
    }
    let lower = pattern.to_lowercase();
    for (key, advice) in ACTION_TABLE {
        if lower.contains(key) {
            return (*advice).to_string();
        }
    }
    format!("VERMEIDE: {}...", truncate_chars(pattern, 180))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn lesson(pattern: &str) -> Lesson {
        Lesson {
            pattern: pattern.to_string(),
            category: "error".to_string(),
            action: String::new(),
            tags: vec!["global".to_string()],
            count: 1,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            suggested_fix: None,
        }
    }

    #[test]
    fn test_extract_python_error() {
        let text = "Traceback (most recent call last):\n  File \"app.py\", line 3\nModuleNotFoundError: No module named 'flask'";
        let pattern = extract_error_pattern(text);
        assert_eq!(pattern, "ModuleNotFoundError: No module named 'flask'");
    }

    #[test]
    fn test_extract_sandbox_marker() {
        let pattern = extract_error_pattern("some output\n❌ Syntax check failed in utils.js\nmore");
        assert_eq!(pattern, "Syntax check failed in utils.js");
    }

    #[test]
    fn test_extract_is_length_bounded() {
        let long = format!("Error: {}", "x".repeat(1000));
        assert!(extract_error_pattern(&long).chars().count() <= MAX_PATTERN_LEN);
        let no_error = "y".repeat(1000);
        assert!(extract_error_pattern(&no_error).chars().count() <= MAX_PATTERN_LEN);
    }

    #[test]
    fn test_extract_fallback_error_line() {
        let text = "starting\nsomething about an error happened here\ndone";
        assert_eq!(
            extract_error_pattern(text),
            "something about an error happened here"
        );
    }

    #[test]
    fn test_generate_tags_includes_global_and_stack() {
        let blueprint = TechBlueprint {
            language: "Python".to_string(),
            project_type: "webapp".to_string(),
            framework: Some("Flask".to_string()),
            ..TechBlueprint::default()
        };
        let tags = generate_tags(&blueprint, "jinja2.exceptions.UndefinedError");
        assert!(tags.contains(&"global".to_string()));
        assert!(tags.contains(&"python".to_string()));
        assert!(tags.contains(&"webapp".to_string()));
        assert!(tags.contains(&"flask".to_string()));
    }

    #[test]
    fn test_generate_tags_category_detection() {
        let blueprint = TechBlueprint::default();
        let tags = generate_tags(&blueprint, "SyntaxError near import of module");
        assert!(tags.contains(&"syntax".to_string()));
        assert!(tags.contains(&"import".to_string()));
    }

    #[test]
    fn test_word_overlap() {
        assert_eq!(word_overlap("a b c", "a b c"), 1.0);
        assert_eq!(word_overlap("a b c d", "a b"), 0.5);
        assert_eq!(word_overlap("", "a"), 0.0);
    }

    #[test]
    fn test_duplicate_by_substring() {
        let lessons = vec![lesson("ModuleNotFoundError: No module named 'flask'")];
        assert!(is_duplicate_lesson(
            &lessons,
            "No module named 'flask'",
            0.6
        ));
    }

    #[test]
    fn test_duplicate_by_overlap() {
        let lessons = vec![lesson("TypeError: cannot read properties of undefined")];
        assert!(is_duplicate_lesson(
            &lessons,
            "TypeError: cannot read properties of null",
            0.6
        ));
        assert!(!is_duplicate_lesson(&lessons, "SyntaxError: bad indent", 0.6));
    }

    #[test]
    fn test_action_table() {
        assert!(action_for_pattern("SQL Injection in query builder").contains("parametrisierte"));
        assert!(action_for_pattern("ModuleNotFoundError: no module named x")
            .contains("requirements.txt"));
        let generic = action_for_pattern("some exotic failure");
        assert!(generic.starts_with("VERMEIDE: some exotic failure"));
    }
}
