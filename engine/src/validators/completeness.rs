//! Completeness and truncation detection.
//!
//! LLM output gets cut off at token limits; a truncated file must never
//! reach the workspace. Python files are checked for suspicious endings
//! and bracket balance, JS-family files for balanced braces and quotes
//! with template literals and both comment kinds respected.

use std::collections::BTreeMap;

/// Python line endings that indicate an interrupted statement.
const PY_SUSPICIOUS_ENDINGS: &[char] = &['(', '[', '{', ':', ','];

/// Python keywords a complete file never ends on.
const PY_SUSPICIOUS_KEYWORDS: &[&str] = &[
    "def", "class", "if", "for", "while", "return", "yield", "raise", "import", "from",
];

/// Minimum shrink (in chars) before the shrink guard fires.
const SHRINK_GUARD_MIN_DELTA: usize = 200;

/// Check a Python file for completeness. Returns `Err(reason)` when the
/// file looks truncated.
pub fn check_python_complete(content: &str) -> Result<(), String> {
    let Some(last_line) = content.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Err("file is empty".to_string());
    };
    let trimmed = last_line.trim_end();

    if let Some(last_char) = trimmed.chars().last() {
        if PY_SUSPICIOUS_ENDINGS.contains(&last_char) {
            return Err(format!("last line ends with '{last_char}'"));
        }
    }

    let last_word = trimmed.rsplit(char::is_whitespace).next().unwrap_or("");
    if PY_SUSPICIOUS_KEYWORDS.contains(&last_word) {
        return Err(format!("last line ends with keyword '{last_word}'"));
    }

    let mut paren = 0i32;
    let mut bracket = 0i32;
    let mut brace = 0i32;
    let mut in_string: Option<char> = None;
    let mut in_comment = false;
    let mut escaped = false;
    for c in content.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }
        match in_string {
            Some(quote) => match c {
                '\\' => escaped = true,
                _ if c == quote => in_string = None,
                _ => {}
            },
            None => match c {
                '#' => in_comment = true,
                '\'' | '"' => in_string = Some(c),
                '(' => paren += 1,
                ')' => paren -= 1,
                '[' => bracket += 1,
                ']' => bracket -= 1,
                '{' => brace += 1,
                '}' => brace -= 1,
                _ => {}
            },
        }
    }
    if paren != 0 || bracket != 0 || brace != 0 {
        return Err(format!(
            "unbalanced brackets (paren {paren:+}, bracket {bracket:+}, brace {brace:+})"
        ));
    }

    Ok(())
}

/// Check a JS/JSX/TS/TSX file for completeness: balanced braces, brackets
/// and parens outside strings/comments, closed quotes and template
/// literals, no tag left open at EOF.
pub fn check_js_complete(content: &str) -> Result<(), String> {
    #[derive(PartialEq)]
    enum State {
        Code,
        SingleQuote,
        DoubleQuote,
        Template,
        LineComment,
        BlockComment,
    }

    let mut state = State::Code;
    let mut escaped = false;
    let mut brace = 0i32;
    let mut bracket = 0i32;
    let mut paren = 0i32;
    let mut last_open_angle: Option<usize> = None;
    let mut last_close_angle: Option<usize> = None;

    let chars: Vec<char> = content.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match state {
            State::Code => match c {
                '\'' => state = State::SingleQuote,
                '"' => state = State::DoubleQuote,
                '`' => state = State::Template,
                '/' if next == Some('/') => {
                    state = State::LineComment;
                    i += 1;
                }
                '/' if next == Some('*') => {
                    state = State::BlockComment;
                    i += 1;
                }
                '{' => brace += 1,
                '}' => brace -= 1,
                '[' => bracket += 1,
                ']' => bracket -= 1,
                '(' => paren += 1,
                ')' => paren -= 1,
                // Tag-like only: `<div`, `</div`, `<Component`. Comparison
                // operators (`i < n`) are followed by whitespace.
                '<' if matches!(next, Some(c2) if c2.is_ascii_alphabetic() || c2 == '/') => {
                    last_open_angle = Some(i)
                }
                '>' => last_close_angle = Some(i),
                _ => {}
            },
            State::SingleQuote => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '\'' || c == '\n' {
                    state = State::Code;
                }
            }
            State::DoubleQuote => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' || c == '\n' {
                    state = State::Code;
                }
            }
            State::Template => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '`' {
                    state = State::Code;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = State::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    match state {
        State::Template => return Err("unterminated template literal".to_string()),
        State::SingleQuote | State::DoubleQuote => {
            return Err("unterminated string literal".to_string())
        }
        State::BlockComment => return Err("unterminated block comment".to_string()),
        _ => {}
    }

    if brace != 0 || bracket != 0 || paren != 0 {
        return Err(format!(
            "unbalanced delimiters (brace {brace:+}, bracket {bracket:+}, paren {paren:+})"
        ));
    }

    // A '<' after the last '>' means the file ends inside a tag.
    if let Some(open) = last_open_angle {
        if last_close_angle.map(|close| close < open).unwrap_or(true) {
            return Err("file ends inside an open tag".to_string())
        }
    }

    Ok(())
}

/// Completeness by extension; files without a checker pass.
pub fn check_file_complete(path: &str, content: &str) -> Result<(), String> {
    let extension = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match extension.as_str() {
        "py" => check_python_complete(content),
        "js" | "jsx" | "ts" | "tsx" | "mjs" => check_js_complete(content),
        _ => Ok(()),
    }
}

/// Truncation check over a parsed file map; returns `(path, reason)` per
/// truncated file.
pub fn check_for_truncation(files: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut truncated = Vec::new();
    for (path, content) in files {
        if let Err(reason) = check_file_complete(path, content) {
            truncated.push((path.clone(), reason));
        }
    }
    truncated
}

/// Shrink & truncation guard applied before a patch-mode write.
///
/// A replacement that is less than half the previous version (and smaller
/// by a real margin) is rejected as a bad patch; truncated content is
/// rejected outright. The previous on-disk content stays untouched.
pub fn validate_before_write(path: &str, new_content: &str, old_content: &str) -> Result<(), String> {
    if new_content.trim().is_empty() {
        return Err("empty content".to_string());
    }

    if !old_content.is_empty() {
        let old_len = old_content.len();
        let new_len = new_content.len();
        if new_len < old_len / 2 && old_len - new_len > SHRINK_GUARD_MIN_DELTA {
            return Err(format!(
                "shrink guard: {new_len} chars replaces {old_len} chars"
            ));
        }
    }

    check_file_complete(path, new_content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_complete() {
        assert!(check_python_complete("def f():\n    return 1\n").is_ok());
    }

    #[test]
    fn test_python_trailing_colon() {
        assert!(check_python_complete("def f():").is_err());
    }

    #[test]
    fn test_python_trailing_keyword() {
        assert!(check_python_complete("x = 1\nimport").is_err());
        assert!(check_python_complete("result = compute()\nreturn").is_err());
    }

    #[test]
    fn test_python_unbalanced_brackets() {
        assert!(check_python_complete("x = [1, 2\ny = 3").is_err());
        assert!(check_python_complete("x = f(1, 2)\ny = [3]").is_ok());
    }

    #[test]
    fn test_python_brackets_in_strings_ignored() {
        assert!(check_python_complete("x = \"(unclosed in string\"\ny = 1").is_ok());
    }

    #[test]
    fn test_js_complete() {
        let content = "export function f() {\n  return [1, 2].map((x) => x + 1);\n}\n";
        assert!(check_js_complete(content).is_ok());
    }

    #[test]
    fn test_js_unbalanced_brace() {
        assert!(check_js_complete("function f() {\n  return 1;\n").is_err());
    }

    #[test]
    fn test_js_truncated_import() {
        // The canonical truncation artifact.
        assert!(check_js_complete("import { cl;").is_err());
    }

    #[test]
    fn test_js_braces_in_strings_and_comments_ignored() {
        assert!(check_js_complete("const s = \"{ not a brace\";\n// also { not\n/* { */\n").is_ok());
    }

    #[test]
    fn test_js_template_literal() {
        assert!(check_js_complete("const t = `hello {world}`;\n").is_ok());
        assert!(check_js_complete("const t = `unterminated").is_err());
    }

    #[test]
    fn test_js_template_with_braces_inside() {
        assert!(check_js_complete("const t = `a ${1 + 1} b`;\nconst x = 1;\n").is_ok());
    }

    #[test]
    fn test_js_jsx_balanced() {
        let content = "export default function App() {\n  return <div className=\"x\">hi</div>;\n}\n";
        assert!(check_js_complete(content).is_ok());
    }

    #[test]
    fn test_js_ends_inside_tag() {
        assert!(check_js_complete("const x = 1;\nexport default () => <div").is_err());
    }

    #[test]
    fn test_check_for_truncation_map() {
        let mut files = BTreeMap::new();
        files.insert("good.js".to_string(), "const x = 1;\n".to_string());
        files.insert("bad.js".to_string(), "import { cl;".to_string());
        let truncated = check_for_truncation(&files);
        assert_eq!(truncated.len(), 1);
        assert_eq!(truncated[0].0, "bad.js");
    }

    #[test]
    fn test_shrink_guard() {
        let old = "x".repeat(1000);
        let new = "const x = 1;";
        let result = validate_before_write("a.js", new, &old);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("shrink guard"));
    }

    #[test]
    fn test_shrink_guard_allows_small_files() {
        // Old content small: halving it is fine (delta below threshold).
        assert!(validate_before_write("a.js", "const x = 1;", "const xyz = 12345;\nconst y = 2;").is_ok());
    }

    #[test]
    fn test_empty_content_rejected() {
        assert!(validate_before_write("a.js", "  \n", "old").is_err());
    }

    #[test]
    fn test_new_file_without_predecessor() {
        assert!(validate_before_write("a.js", "const x = 1;\n", "").is_ok());
    }

    #[test]
    fn test_unknown_extension_passes() {
        assert!(check_file_complete("README.md", "# unfinished [").is_ok());
    }
}
