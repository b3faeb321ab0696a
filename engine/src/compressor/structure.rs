//! Per-language structural summaries.
//!
//! Each extractor turns a full source file into a short structural sketch
//! (imports, exports, functions, selectors, top-level keys). Extractors
//! are registered per extension at construction; unknown extensions fall
//! back to a generic preview.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

/// Capability implemented once per language family.
pub trait StructureExtractor: Send + Sync {
    /// Extensions (lower-case, no dot) this extractor handles.
    fn extensions(&self) -> &'static [&'static str];

    /// Produce the structural summary.
    fn summarize(&self, path: &str, content: &str) -> String;
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

// -- JavaScript / TypeScript ------------------------------------------------

static JS_FUNCTIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:export\s+)?(?:async\s+)?function\s+(\w+)").unwrap());
static JS_ARROW_FUNCTIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:export\s+(?:default\s+)?)?const\s+(\w+)\s*=\s*(?:async\s*)?\(").unwrap()
});
static JS_HTTP_METHODS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"export\s+(?:async\s+)?function\s+(GET|POST|PUT|DELETE|PATCH)").unwrap()
});
static JS_HOOKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(use(?:State|Effect|Ref|Memo|Callback|Context|Router|Params))\s*\(").unwrap()
});
static JS_STATE_VARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"const\s+\[(\w+),\s*set\w+\]\s*=\s*useState").unwrap());

pub struct JsStructure;

impl StructureExtractor for JsStructure {
    fn extensions(&self) -> &'static [&'static str] {
        &["js", "jsx", "ts", "tsx", "mjs"]
    }

    fn summarize(&self, path: &str, content: &str) -> String {
        let lines: Vec<&str> = content.lines().collect();
        let mut sections = Vec::new();

        let imports: Vec<&str> = lines
            .iter()
            .filter(|l| l.trim_start().starts_with("import ") || l.contains("require("))
            .map(|l| l.trim())
            .take(10)
            .collect();
        if !imports.is_empty() {
            sections.push(format!("IMPORTS:\n{}", imports.join("\n")));
        }

        let exports: Vec<String> = lines
            .iter()
            .filter(|l| l.trim_start().starts_with("export "))
            .map(|l| l.trim().chars().take(100).collect())
            .take(5)
            .collect();
        if !exports.is_empty() {
            sections.push(format!("EXPORTS:\n{}", exports.join("\n")));
        }

        let mut functions: Vec<String> = JS_FUNCTIONS
            .captures_iter(content)
            .map(|c| c[1].to_string())
            .collect();
        functions.extend(JS_ARROW_FUNCTIONS.captures_iter(content).map(|c| c[1].to_string()));
        let functions = dedup_preserving_order(functions);
        if !functions.is_empty() {
            sections.push(format!("FUNKTIONEN: {}", functions.join(", ")));
        }

        if path.contains("/api/") {
            let methods: Vec<String> = JS_HTTP_METHODS
                .captures_iter(content)
                .map(|c| c[1].to_string())
                .collect();
            if !methods.is_empty() {
                sections.push(format!("HTTP-METHODEN: {}", methods.join(", ")));
            }
        }

        let hooks = dedup_preserving_order(
            JS_HOOKS.captures_iter(content).map(|c| c[1].to_string()).collect(),
        );
        if !hooks.is_empty() {
            sections.push(format!("HOOKS: {}", hooks.join(", ")));
        }

        let state_vars: Vec<String> = JS_STATE_VARS
            .captures_iter(content)
            .map(|c| c[1].to_string())
            .collect();
        if !state_vars.is_empty() {
            sections.push(format!("STATE: {}", state_vars.join(", ")));
        }

        sections.push(format!("ZEILEN: {}", lines.len()));
        sections.join("\n")
    }
}

// -- Python -----------------------------------------------------------------

static PY_CLASSES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"class\s+(\w+)").unwrap());
static PY_FUNCTIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:async\s+)?def\s+(\w+)").unwrap());
static PY_CONSTANTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([A-Z][A-Z0-9_]+)\s*=").unwrap());

pub struct PythonStructure;

impl StructureExtractor for PythonStructure {
    fn extensions(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn summarize(&self, _path: &str, content: &str) -> String {
        let lines: Vec<&str> = content.lines().collect();
        let mut sections = Vec::new();

        let imports: Vec<&str> = lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| {
                (l.starts_with("import ") || l.starts_with("from ")) && !l.starts_with('#')
            })
            .take(10)
            .collect();
        if !imports.is_empty() {
            sections.push(format!("IMPORTS:\n{}", imports.join("\n")));
        }

        let classes: Vec<String> = PY_CLASSES.captures_iter(content).map(|c| c[1].to_string()).collect();
        if !classes.is_empty() {
            sections.push(format!("KLASSEN: {}", classes.join(", ")));
        }

        let functions: Vec<String> = PY_FUNCTIONS
            .captures_iter(content)
            .map(|c| c[1].to_string())
            .take(15)
            .collect();
        if !functions.is_empty() {
            sections.push(format!("FUNKTIONEN: {}", functions.join(", ")));
        }

        let constants: Vec<String> = PY_CONSTANTS
            .captures_iter(content)
            .map(|c| c[1].to_string())
            .take(10)
            .collect();
        if !constants.is_empty() {
            sections.push(format!("KONSTANTEN: {}", constants.join(", ")));
        }

        sections.push(format!("ZEILEN: {}", lines.len()));
        sections.join("\n")
    }
}

// -- CSS --------------------------------------------------------------------

static CSS_SELECTORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([.#][a-zA-Z][a-zA-Z0-9_-]*)\s*\{").unwrap());
static CSS_VARIABLES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(--[a-zA-Z][a-zA-Z0-9_-]*)\s*:").unwrap());
static CSS_MEDIA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@media\s*\(([^)]+)\)").unwrap());

pub struct CssStructure;

impl StructureExtractor for CssStructure {
    fn extensions(&self) -> &'static [&'static str] {
        &["css"]
    }

    fn summarize(&self, _path: &str, content: &str) -> String {
        let line_count = content.lines().count();
        let mut sections = Vec::new();

        let selectors: Vec<String> = CSS_SELECTORS
            .captures_iter(content)
            .map(|c| c[1].to_string())
            .take(20)
            .collect();
        if !selectors.is_empty() {
            sections.push(format!("SELEKTOREN: {}", selectors.join(", ")));
        }

        let variables = dedup_preserving_order(
            CSS_VARIABLES.captures_iter(content).map(|c| c[1].to_string()).collect(),
        );
        if !variables.is_empty() {
            let shown: Vec<String> = variables.into_iter().take(10).collect();
            sections.push(format!("CSS-VARIABLEN: {}", shown.join(", ")));
        }

        let media: Vec<String> = CSS_MEDIA
            .captures_iter(content)
            .map(|c| c[1].to_string())
            .take(5)
            .collect();
        if !media.is_empty() {
            sections.push(format!("MEDIA-QUERIES: {}", media.join(", ")));
        }

        sections.push(format!("ZEILEN: {line_count}"));
        sections.join("\n")
    }
}

// -- JSON -------------------------------------------------------------------

pub struct JsonStructure;

impl StructureExtractor for JsonStructure {
    fn extensions(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn summarize(&self, path: &str, content: &str) -> String {
        let line_count = content.lines().count();
        let mut sections = Vec::new();

        if path.ends_with("package.json") {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(content) {
                if let Some(name) = value.get("name").and_then(|n| n.as_str()) {
                    sections.push(format!("NAME: {name}"));
                }
                for (key, label, cap) in [
                    ("dependencies", "DEPENDENCIES", 15usize),
                    ("devDependencies", "DEV-DEPENDENCIES", 10),
                    ("scripts", "SCRIPTS", 10),
                ] {
                    if let Some(object) = value.get(key).and_then(|d| d.as_object()) {
                        let keys: Vec<&str> = object.keys().map(String::as_str).take(cap).collect();
                        if !keys.is_empty() {
                            sections.push(format!("{label}: {}", keys.join(", ")));
                        }
                    }
                }
            }
        }

        if sections.is_empty() {
            if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(content) {
                let keys: Vec<&str> = map.keys().map(String::as_str).take(15).collect();
                if !keys.is_empty() {
                    sections.push(format!("TOP-KEYS: {}", keys.join(", ")));
                }
            }
        }

        sections.push(format!("ZEILEN: {line_count}"));
        sections.join("\n")
    }
}

// -- Fallback ---------------------------------------------------------------

pub struct GenericPreview;

impl StructureExtractor for GenericPreview {
    fn extensions(&self) -> &'static [&'static str] {
        &[]
    }

    fn summarize(&self, _path: &str, content: &str) -> String {
        let lines: Vec<&str> = content.lines().collect();
        let preview: Vec<&str> = lines.iter().copied().take(20).collect();
        format!("VORSCHAU:\n{}\n\nZEILEN: {}", preview.join("\n"), lines.len())
    }
}

/// Extension-keyed registry of structure extractors.
pub struct ExtractorRegistry {
    by_extension: HashMap<&'static str, std::sync::Arc<dyn StructureExtractor>>,
    fallback: std::sync::Arc<dyn StructureExtractor>,
}

impl ExtractorRegistry {
    /// Registry with the built-in language set.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            by_extension: HashMap::new(),
            fallback: std::sync::Arc::new(GenericPreview),
        };
        registry.register(std::sync::Arc::new(JsStructure));
        registry.register(std::sync::Arc::new(PythonStructure));
        registry.register(std::sync::Arc::new(CssStructure));
        registry.register(std::sync::Arc::new(JsonStructure));
        registry
    }

    /// Register an extractor for all of its extensions.
    pub fn register(&mut self, extractor: std::sync::Arc<dyn StructureExtractor>) {
        for extension in extractor.extensions() {
            self.by_extension
                .insert(extension, std::sync::Arc::clone(&extractor));
        }
    }

    /// Summarize a file by its extension.
    pub fn summarize(&self, path: &str, content: &str) -> String {
        let extension = path.rsplit('.').next().unwrap_or("").to_lowercase();
        match self.by_extension.get(extension.as_str()) {
            Some(extractor) => extractor.summarize(path, content),
            None => self.fallback.summarize(path, content),
        }
    }
}
