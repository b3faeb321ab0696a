//! Context compressor: shrinks a file-set to FULL / SUMMARY.
//!
//! Three categories per compression:
//! - A: files referenced by the feedback — full content,
//! - B: relative-import dependencies of A — full content,
//! - C: everything else — structural summary, cached by content hash.
//!
//! The output keeps every input key; the cache is a first-class value the
//! caller owns and passes back each iteration.

mod structure;

pub use structure::{
    CssStructure, ExtractorRegistry, GenericPreview, JsStructure, JsonStructure, PythonStructure,
    StructureExtractor,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::planner::affected_files_from_feedback;

static RELATIVE_IMPORTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"from\s+['"](\.\.?/[^'"]+)['"]"#,
        r#"require\s*\(\s*['"](\.\.?/[^'"]+)['"]\s*\)"#,
        r#"import\s*\(\s*['"](\.\.?/[^'"]+)['"]\s*\)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static LEADING_PARENT_SEGMENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\.\./)+").unwrap());

/// One cached summary, keyed by a short content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryCacheEntry {
    pub hash: String,
    pub summary: String,
}

/// Summary cache persisting across the iterations of one run. Grows
/// monotonically: entries are only inserted or refreshed, never evicted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressorCache {
    entries: HashMap<String, SummaryCacheEntry>,
}

impl CompressorCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A file in compressed context: either full source or a flagged summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedFile {
    pub content: String,
    pub is_summary: bool,
}

/// Counters for one compression pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub full: usize,
    pub summaries: usize,
    pub cache_hits: usize,
}

fn short_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex()[..8].to_string()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Shrinks prompt context by category (A feedback / B imports / C rest).
pub struct ContextCompressor {
    registry: ExtractorRegistry,
}

impl ContextCompressor {
    pub fn new() -> Self {
        Self {
            registry: ExtractorRegistry::with_defaults(),
        }
    }

    /// Compressor with a custom extractor registry.
    pub fn with_registry(registry: ExtractorRegistry) -> Self {
        Self { registry }
    }

    /// Compress `files` against `feedback`.
    ///
    /// `pinned` basenames (used by the parallel patch executor for group
    /// files) are kept at full content regardless of category. Every input
    /// key appears in the output.
    pub fn compress(
        &self,
        files: &BTreeMap<String, String>,
        feedback: &str,
        pinned: &[String],
        cache: &mut CompressorCache,
    ) -> (BTreeMap<String, CompressedFile>, CompressionStats) {
        let mut stats = CompressionStats::default();
        if files.is_empty() {
            return (BTreeMap::new(), stats);
        }

        // Category A: feedback-referenced basenames.
        let feedback_files = affected_files_from_feedback(feedback);
        let feedback_basenames: HashSet<&str> =
            feedback_files.iter().map(|f| basename(f)).collect();

        // Category B: import dependencies of A.
        let dep_paths = find_import_deps(&feedback_files, files);
        let dep_basenames: HashSet<&str> = dep_paths.iter().map(|p| basename(p)).collect();

        let pinned_basenames: HashSet<&str> = pinned.iter().map(|p| basename(p)).collect();

        let mut compressed = BTreeMap::new();
        for (path, content) in files {
            let name = basename(path);
            let keep_full = feedback_basenames.contains(name)
                || dep_paths.contains(path)
                || dep_basenames.contains(name)
                || pinned_basenames.contains(name);

            if keep_full {
                stats.full += 1;
                compressed.insert(
                    path.clone(),
                    CompressedFile {
                        content: content.clone(),
                        is_summary: false,
                    },
                );
                continue;
            }

            // Category C: summary, short-circuited by the content hash.
            let hash = short_hash(content);
            let summary = match cache.entries.get(path) {
                Some(entry) if entry.hash == hash => {
                    stats.cache_hits += 1;
                    entry.summary.clone()
                }
                _ => {
                    let summary = self.registry.summarize(path, content);
                    cache.entries.insert(
                        path.clone(),
                        SummaryCacheEntry {
                            hash,
                            summary: summary.clone(),
                        },
                    );
                    summary
                }
            };
            stats.summaries += 1;
            compressed.insert(
                path.clone(),
                CompressedFile {
                    content: summary,
                    is_summary: true,
                },
            );
        }

        debug!(
            full = stats.full,
            summaries = stats.summaries,
            cache_hits = stats.cache_hits,
            "context compressed"
        );
        (compressed, stats)
    }
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Relative-import dependencies of the feedback files, resolved against
/// the workspace by trying the usual extension candidates.
pub fn find_import_deps(
    feedback_files: &[String],
    files: &BTreeMap<String, String>,
) -> HashSet<String> {
    let mut deps = HashSet::new();
    let feedback_set: HashSet<&str> = feedback_files.iter().map(String::as_str).collect();

    for name in feedback_files {
        let Some((_, content)) = crate::workspace::resolve_in_workspace(name, files) else {
            continue;
        };

        for pattern in RELATIVE_IMPORTS.iter() {
            for captures in pattern.captures_iter(content) {
                let import = captures[1].trim_start_matches("./");
                let clean = LEADING_PARENT_SEGMENTS.replace(import, "").to_string();

                for (candidate, _) in files {
                    let candidate_base = basename(candidate);
                    let matches = candidate.contains(&clean)
                        || candidate.ends_with(&format!("{clean}.js"))
                        || candidate.ends_with(&format!("{clean}.jsx"))
                        || candidate.ends_with(&format!("{clean}.ts"))
                        || candidate.ends_with(&format!("{clean}.tsx"))
                        || candidate.ends_with(&format!("{clean}.py"))
                        || candidate.ends_with(&format!("{clean}/__init__.py"))
                        || candidate.ends_with(&format!("{clean}/index.js"))
                        || candidate.ends_with(&format!("{clean}/index.ts"))
                        || candidate_base == clean
                        || candidate_base.starts_with(&format!("{clean}."));
                    if matches && !feedback_set.contains(candidate_base) {
                        deps.insert(candidate.clone());
                    }
                }
            }
        }
    }

    deps
}
