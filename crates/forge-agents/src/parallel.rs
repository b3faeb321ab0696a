//! Parallel patch executor.
//!
//! One coder call for every affected file overflows the output token
//! limit and produces truncated files. Instead, affected files are
//! grouped by import dependency (union-find) under size caps, each group
//! gets its own compressed prompt and its own concurrent coder call, and
//! the results are merged through the patch-mode write guard.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use forge_engine::compressor::{CompressorCache, ContextCompressor};
use forge_engine::config::{ParallelPatchConfig, TechBlueprint};
use forge_engine::events::SharedEventSink;
use forge_engine::router::{ModelRouter, Role};
use forge_engine::workspace;
use petgraph::unionfind::UnionFind;
use regex::Regex;
use tracing::{info, warn};

use crate::invoker::Invoker;
use crate::prompts;

static JS_IMPORTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"import\s+.*?from\s+['"]\.{1,2}/([^'"]+)['"]"#,
        r#"require\s*\(\s*['"]\.{1,2}/([^'"]+)['"]\s*\)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static PY_IMPORTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"from\s+\.(\w+)\s+import", r"from\s+(\w+)\s+import"]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
});

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Imported basenames (with extension candidates for extensionless JS
/// imports) referenced by `content`.
fn extract_import_basenames(content: &str) -> Vec<String> {
    let mut imports = Vec::new();
    for pattern in JS_IMPORTS.iter() {
        for captures in pattern.captures_iter(content) {
            let name = basename(&captures[1]).to_string();
            if name.contains('.') {
                imports.push(name);
            } else {
                for ext in [".js", ".jsx", ".ts", ".tsx"] {
                    imports.push(format!("{name}{ext}"));
                }
            }
        }
    }
    for pattern in PY_IMPORTS.iter() {
        for captures in pattern.captures_iter(content) {
            imports.push(format!("{}.py", &captures[1]));
        }
    }
    imports
}

fn file_chars(name: &str, code_dict: &BTreeMap<String, String>) -> usize {
    workspace::resolve_in_workspace(name, code_dict)
        .map(|(_, content)| content.len())
        .unwrap_or(0)
}

/// Activation predicate: enough files OR enough bytes.
pub fn should_use_parallel_patch(
    affected_files: &[String],
    code_dict: &BTreeMap<String, String>,
    config: &ParallelPatchConfig,
) -> bool {
    if !config.enabled || affected_files.is_empty() {
        return false;
    }
    if affected_files.len() >= config.min_files_for_parallel {
        return true;
    }
    let total_chars: usize = affected_files
        .iter()
        .map(|name| file_chars(name, code_dict))
        .sum();
    total_chars >= config.min_chars_for_parallel
}

/// Group affected files for parallel processing: union-find over the
/// intra-affected import graph, then a size-capped split per component.
/// Oversized single files occupy their own group.
pub fn group_files_by_dependency(
    affected_files: &[String],
    code_dict: &BTreeMap<String, String>,
    max_per_group: usize,
    max_chars_per_group: usize,
) -> Vec<Vec<String>> {
    if affected_files.is_empty() {
        return Vec::new();
    }
    if affected_files.len() <= max_per_group {
        let total: usize = affected_files
            .iter()
            .map(|f| file_chars(f, code_dict))
            .sum();
        if total <= max_chars_per_group {
            return vec![affected_files.to_vec()];
        }
    }

    let index_of: BTreeMap<&str, usize> = affected_files
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut union_find: UnionFind<usize> = UnionFind::new(affected_files.len());
    for (name, &index) in &index_of {
        let Some((_, content)) = workspace::resolve_in_workspace(name, code_dict) else {
            continue;
        };
        for imported in extract_import_basenames(content) {
            if let Some(&other) = index_of.get(imported.as_str()) {
                if other != index {
                    union_find.union(index, other);
                }
            }
        }
    }

    // Collect components in first-seen order.
    let mut components: Vec<(usize, Vec<String>)> = Vec::new();
    for (i, name) in affected_files.iter().enumerate() {
        let root = union_find.find(i);
        match components.iter_mut().find(|(r, _)| *r == root) {
            Some((_, members)) => members.push(name.clone()),
            None => components.push((root, vec![name.clone()])),
        }
    }

    // Connected components stay together (split only by the size caps);
    // isolated files are packed into shared groups under the same caps.
    let mut groups = Vec::new();
    let mut singles: Vec<String> = Vec::new();
    for (_, members) in components {
        if members.len() == 1 {
            singles.extend(members);
            continue;
        }
        groups.extend(split_by_caps(members, code_dict, max_per_group, max_chars_per_group));
    }
    groups.extend(split_by_caps(singles, code_dict, max_per_group, max_chars_per_group));

    groups
}

/// Split an ordered file list into sub-groups honoring both caps; an
/// oversized single file occupies its own group.
fn split_by_caps(
    members: Vec<String>,
    code_dict: &BTreeMap<String, String>,
    max_per_group: usize,
    max_chars_per_group: usize,
) -> Vec<Vec<String>> {
    let mut groups = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_chars = 0usize;
    for name in members {
        let chars = file_chars(&name, code_dict);
        if chars > max_chars_per_group {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            groups.push(vec![name]);
            continue;
        }
        if current.len() >= max_per_group || current_chars + chars > max_chars_per_group {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            current_chars = 0;
        }
        current_chars += chars;
        current.push(name);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Outcome of one parallel patch pass.
#[derive(Debug, Clone)]
pub struct ParallelPatchOutcome {
    /// Canonical multi-file string rebuilt from disk after the merge.
    pub current_code: String,
    /// Files written (accepted by the guard).
    pub written_files: Vec<String>,
    /// Files rejected by the truncation/shrink guard, with reasons.
    pub rejected_files: Vec<(String, String)>,
    pub group_count: usize,
}

/// Fans grouped patch prompts out to concurrent coder calls.
pub struct ParallelPatchExecutor {
    invoker: Arc<Invoker>,
    router: Arc<ModelRouter>,
    sink: SharedEventSink,
    config: ParallelPatchConfig,
    coder_timeout: Duration,
}

impl ParallelPatchExecutor {
    pub fn new(
        invoker: Arc<Invoker>,
        router: Arc<ModelRouter>,
        sink: SharedEventSink,
        config: ParallelPatchConfig,
        coder_timeout_secs: u64,
    ) -> Self {
        Self {
            invoker,
            router,
            sink,
            config,
            coder_timeout: Duration::from_secs(coder_timeout_secs),
        }
    }

    /// Run the full parallel patch flow: group → prompt → fan out →
    /// guard → merge → rebuild from disk.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        project_root: &Path,
        affected_files: &[String],
        code_dict: &BTreeMap<String, String>,
        feedback: &str,
        user_goal: &str,
        blueprint: &TechBlueprint,
        iteration: u32,
        protected_files: &[String],
        cache: &mut CompressorCache,
        max_prompt_chars: usize,
    ) -> ParallelPatchOutcome {
        let groups = group_files_by_dependency(
            affected_files,
            code_dict,
            self.config.max_files_per_group,
            self.config.max_chars_per_group,
        );
        self.sink.emit(
            "ParallelPatch",
            "Grouping",
            format!("{} Dateien -> {} Gruppe(n): {groups:?}", affected_files.len(), groups.len()),
        );

        // Prompts are built sequentially (the summary cache is shared);
        // only the LLM calls fan out.
        let compressor = ContextCompressor::new();
        let mut prompts_by_group = Vec::new();
        for group in &groups {
            let filtered_feedback = prompts::filter_feedback_for_files(feedback, group);
            let (compressed, _) = compressor.compress(code_dict, &filtered_feedback, group, cache);
            let mut prompt = prompts::build_coder_prompt(
                user_goal,
                blueprint,
                &compressed,
                &filtered_feedback,
                "",
                "",
                protected_files,
                &[],
                iteration,
                true,
                max_prompt_chars,
            );
            prompt.push_str(&format!(
                "\n\n--- PARALLEL PATCH MODUS ---\n\
                 Du bist fuer diese {} Datei(en) verantwortlich: {}\n\
                 Gib NUR diese Dateien im ### FILENAME: Format aus.\n\
                 Die anderen Dateien sind als Kontext-Zusammenfassung enthalten.\n\
                 --- ENDE PARALLEL PATCH ---",
                group.len(),
                group.join(", ")
            ));
            prompts_by_group.push(prompt);
        }

        // Fan out with a per-group timeout and a concurrency cap.
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.max_concurrent_groups.max(1),
        ));
        let group_timeout = self.coder_timeout * 2 + Duration::from_secs(60);

        let mut tasks = Vec::new();
        for (index, (group, prompt)) in groups.iter().zip(prompts_by_group).enumerate() {
            let group = group.clone();
            let invoker = Arc::clone(&self.invoker);
            let router = Arc::clone(&self.router);
            let sink = self.sink.clone();
            let semaphore = Arc::clone(&semaphore);
            let coder_timeout = self.coder_timeout;

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                let label = format!("Gruppe {} ({})", index + 1, group.join(", "));
                sink.emit("ParallelPatch", "GroupStart", label.clone());

                let work = async {
                    let model = router.get(Role::Coder).model;
                    let first = invoker
                        .invoke("ParallelPatch", &label, &model, &prompt, coder_timeout)
                        .await;
                    match first {
                        Ok(output) => Some(output),
                        Err(e) => {
                            sink.emit(
                                "ParallelPatch",
                                "GroupRetry",
                                format!("{label}: Erster Versuch fehlgeschlagen ({e}) - alternatives Modell"),
                            );
                            // Rotate: pause the failing model, take the
                            // next one, retry once.
                            router.mark_rate_limited(&model, None);
                            let retry_model = router.get(Role::Coder).model;
                            invoker
                                .invoke("ParallelPatch", &label, &retry_model, &prompt, coder_timeout)
                                .await
                                .ok()
                        }
                    }
                };

                let output = tokio::time::timeout(group_timeout, work).await.ok()??;
                let parsed = workspace::parse_multi_file(&output);
                if parsed.is_empty() {
                    sink.emit("ParallelPatch", "GroupEmpty", format!("{label}: Keine Dateien im Output"));
                    return None;
                }
                sink.emit(
                    "ParallelPatch",
                    "GroupDone",
                    format!("{label}: {} Datei(en) geliefert", parsed.len()),
                );
                Some(parsed)
            }));
        }

        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        for task in tasks {
            match task.await {
                Ok(Some(files)) => merged.extend(files),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "parallel patch worker panicked"),
            }
        }

        // Patch-mode write applies the shrink/truncation guard per file;
        // rejected files stay untouched on disk.
        let report = match workspace::write_files(project_root, &merged, true) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "parallel patch write failed");
                Default::default()
            }
        };
        for (name, reason) in &report.rejected {
            self.sink.emit(
                "ParallelPatch",
                "TruncationBlocked",
                format!("{name} nicht akzeptiert - {reason}"),
            );
        }

        let current_code = workspace::rebuild_canonical_from_disk(project_root);
        info!(
            written = report.written.len(),
            rejected = report.rejected.len(),
            groups = groups.len(),
            "parallel patch complete"
        );
        self.sink.emit(
            "ParallelPatch",
            "Complete",
            format!(
                "Parallel PatchMode abgeschlossen: {} Dateien geschrieben, {} abgelehnt",
                report.written.len(),
                report.rejected.len()
            ),
        );

        ParallelPatchOutcome {
            current_code,
            written_files: report.written,
            rejected_files: report.rejected,
            group_count: groups.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{LlmError, ScriptedProvider};
    use forge_engine::events::EventSink;
    use forge_engine::router::ModelPool;
    use std::collections::HashMap;

    fn code_dict(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config() -> ParallelPatchConfig {
        ParallelPatchConfig::default()
    }

    #[test]
    fn test_activation_by_file_count() {
        let dict = code_dict(&[("a.js", "x"), ("b.js", "y")]);
        let affected = vec!["a.js".to_string(), "b.js".to_string()];
        assert!(should_use_parallel_patch(&affected, &dict, &config()));
    }

    #[test]
    fn test_activation_by_byte_size() {
        let big = "x".repeat(9000);
        let dict = code_dict(&[("a.js", &big)]);
        let affected = vec!["a.js".to_string()];
        assert!(should_use_parallel_patch(&affected, &dict, &config()));
    }

    #[test]
    fn test_no_activation_small_single() {
        let dict = code_dict(&[("a.js", "small")]);
        let affected = vec!["a.js".to_string()];
        assert!(!should_use_parallel_patch(&affected, &dict, &config()));
    }

    #[test]
    fn test_disabled_config() {
        let dict = code_dict(&[("a.js", "x"), ("b.js", "y")]);
        let affected = vec!["a.js".to_string(), "b.js".to_string()];
        let disabled = ParallelPatchConfig {
            enabled: false,
            ..config()
        };
        assert!(!should_use_parallel_patch(&affected, &dict, &disabled));
    }

    #[test]
    fn test_grouping_scenario_components_and_caps() {
        // A↔B and C↔D import each other; each file 3 KB; caps 3 files /
        // 15000 chars ⇒ groups [{A,B}, {C,D}, {E,F,G}].
        let filler = "x".repeat(3000 - 40);
        let dict = code_dict(&[
            ("A.js", &format!("import a from './B';\n{filler}")),
            ("B.js", &format!("import b from './A';\n{filler}")),
            ("C.js", &format!("import c from './D';\n{filler}")),
            ("D.js", &format!("import d from './C';\n{filler}")),
            ("E.js", &filler),
            ("F.js", &filler),
            ("G.js", &filler),
        ]);
        let affected: Vec<String> = ["A.js", "B.js", "C.js", "D.js", "E.js", "F.js", "G.js"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let groups = group_files_by_dependency(&affected, &dict, 3, 15_000);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec!["A.js", "B.js"]);
        assert_eq!(groups[1], vec!["C.js", "D.js"]);
        assert_eq!(groups[2], vec!["E.js", "F.js", "G.js"]);
    }

    #[test]
    fn test_small_set_single_group() {
        let dict = code_dict(&[("a.js", "1"), ("b.js", "2")]);
        let affected = vec!["a.js".to_string(), "b.js".to_string()];
        let groups = group_files_by_dependency(&affected, &dict, 3, 15_000);
        assert_eq!(groups, vec![vec!["a.js".to_string(), "b.js".to_string()]]);
    }

    #[test]
    fn test_oversized_file_own_group() {
        let huge = "x".repeat(20_000);
        let dict = code_dict(&[("big.js", &huge), ("a.js", "1"), ("b.js", "2"), ("c.js", "3")]);
        let affected: Vec<String> = ["big.js", "a.js", "b.js", "c.js"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let groups = group_files_by_dependency(&affected, &dict, 3, 15_000);
        assert!(groups.contains(&vec!["big.js".to_string()]));
    }

    #[test]
    fn test_char_cap_splits_group() {
        let chunk = "x".repeat(8000);
        let dict = code_dict(&[("a.js", &chunk), ("b.js", &chunk), ("c.js", &chunk)]);
        let affected: Vec<String> = ["a.js", "b.js", "c.js"].iter().map(|s| s.to_string()).collect();
        let groups = group_files_by_dependency(&affected, &dict, 3, 15_000);
        // 3 × 8000 > 15000 ⇒ must split.
        assert!(groups.len() >= 2);
        for group in &groups {
            let total: usize = group.iter().map(|f| file_chars(f, &dict)).sum();
            assert!(total <= 15_000);
        }
    }

    #[test]
    fn test_extract_import_basenames() {
        let content = "import x from './lib/helper';\nconst y = require('../util.js');";
        let imports = extract_import_basenames(content);
        assert!(imports.contains(&"helper.js".to_string()));
        assert!(imports.contains(&"helper.tsx".to_string()));
        assert!(imports.contains(&"util.js".to_string()));
    }

    #[tokio::test]
    async fn test_executor_writes_accepted_rejects_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let old_a = "export function a() {\n  return 1;\n}\n";
        let old_b = "export function b() {\n  return 2;\n}\n";
        std::fs::write(dir.path().join("a.js"), old_a).unwrap();
        std::fs::write(dir.path().join("b.js"), old_b).unwrap();

        // One group (a.js, b.js): the scripted coder returns a valid a.js
        // and a truncated b.js; only a.js may land on disk.
        let blob = "### FILENAME: a.js\nexport function a() {\n  return 42;\n}\n\n### FILENAME: b.js\nexport function b() {";
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(blob.to_string())]));
        let sink = EventSink::new().shared();
        let invoker = Arc::new(Invoker::new(provider, sink.clone(), 15));
        let mut pools = HashMap::new();
        pools.insert(Role::Coder, ModelPool::new("m1", &["m2"]));
        let router = Arc::new(ModelRouter::new(pools));

        let executor = ParallelPatchExecutor::new(invoker, router, sink, config(), 5);
        let code_dict = code_dict(&[("a.js", old_a), ("b.js", old_b)]);
        let mut cache = CompressorCache::default();

        let outcome = executor
            .run(
                dir.path(),
                &["a.js".to_string(), "b.js".to_string()],
                &code_dict,
                "Error: a.js and b.js broken",
                "Ziel",
                &TechBlueprint::default(),
                1,
                &[],
                &mut cache,
                240_000,
            )
            .await;

        assert_eq!(outcome.written_files, vec!["a.js".to_string()]);
        assert_eq!(outcome.rejected_files.len(), 1);
        assert_eq!(outcome.rejected_files[0].0, "b.js");
        // Disk state: a.js updated, b.js untouched.
        assert!(std::fs::read_to_string(dir.path().join("a.js"))
            .unwrap()
            .contains("return 42"));
        assert_eq!(std::fs::read_to_string(dir.path().join("b.js")).unwrap(), old_b);
        // Canonical merge equals the on-disk workspace.
        assert_eq!(
            outcome.current_code,
            workspace::rebuild_canonical_from_disk(dir.path())
        );
    }

    #[tokio::test]
    async fn test_executor_rotates_model_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), "export const a = 1;\n").unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(LlmError::Timeout(1)),
            Ok("### FILENAME: a.js\nexport const a = 2;\n".to_string()),
        ]));
        let sink = EventSink::new().shared();
        let invoker = Arc::new(Invoker::new(provider.clone(), sink.clone(), 15));
        let mut pools = HashMap::new();
        pools.insert(Role::Coder, ModelPool::new("m1", &["m2"]));
        let router = Arc::new(ModelRouter::new(pools));

        let executor = ParallelPatchExecutor::new(invoker, router.clone(), sink, config(), 5);
        let code_dict = code_dict(&[("a.js", "export const a = 1;\n")]);
        let mut cache = CompressorCache::default();

        let outcome = executor
            .run(
                dir.path(),
                &["a.js".to_string()],
                &code_dict,
                "Error: a.js broken",
                "Ziel",
                &TechBlueprint::default(),
                1,
                &[],
                &mut cache,
                240_000,
            )
            .await;

        assert_eq!(outcome.written_files, vec!["a.js".to_string()]);
        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].model, "m1");
        // After rotation the retry used the fallback model.
        assert_eq!(calls[1].model, "m2");
    }
}
