//! Cross-module engine scenarios: workspace I/O through validators and
//! sandbox classification, compression invariants over a real directory.

use std::collections::BTreeMap;

use forge_engine::compressor::{CompressorCache, ContextCompressor};
use forge_engine::config::TechBlueprint;
use forge_engine::validators::run_pre_sandbox_validators;
use forge_engine::{feedback, workspace};

fn blueprint() -> TechBlueprint {
    TechBlueprint {
        language: "javascript".to_string(),
        project_type: "webapp".to_string(),
        requires_server: false,
        ..TechBlueprint::default()
    }
}

#[test]
fn test_truncated_coder_output_never_reaches_disk() {
    // A coder output with one valid and one truncated file: the guard
    // rejects the bad write, the workspace keeps the old version, and the
    // validators on the resulting workspace pass.
    let dir = tempfile::tempdir().unwrap();
    let old_utils = "export function clamp(x) {\n  return Math.max(0, x);\n}\n";
    std::fs::write(dir.path().join("utils.js"), old_utils).unwrap();

    let blob = "### FILENAME: utils.js\nimport { cl;\n\n### FILENAME: extra.js\nexport const ok = 1;\n";
    let parsed = workspace::parse_multi_file(blob);
    let report = workspace::write_files(dir.path(), &parsed, true).unwrap();

    assert_eq!(report.written, vec!["extra.js".to_string()]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, "utils.js");

    let files = workspace::read_workspace(dir.path(), None);
    assert_eq!(files["utils.js"], old_utils);

    let validation = run_pre_sandbox_validators(&files, &blueprint());
    assert!(validation.passed, "issues: {:?}", validation.issues());
}

#[test]
fn test_workspace_roundtrip_and_canonical_form() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = BTreeMap::new();
    files.insert("app/page.js".to_string(), "export default function P() {\n  return null;\n}".to_string());
    files.insert("lib/db.js".to_string(), "export const db = 1;".to_string());
    files.insert("styles.css".to_string(), ".a {\n  color: red;\n}".to_string());

    workspace::write_files(dir.path(), &files, false).unwrap();
    let read_back = workspace::read_workspace(dir.path(), None);
    assert_eq!(read_back, files);

    // Canonical form: sorted "### FILENAME:" blocks joined by blank lines.
    let canonical = workspace::rebuild_canonical_from_disk(dir.path());
    let expected: Vec<String> = files
        .iter()
        .map(|(path, content)| format!("### FILENAME: {path}\n{content}"))
        .collect();
    assert_eq!(canonical, expected.join("\n\n"));
}

#[test]
fn test_compression_keeps_affected_closure_intact() {
    // Invariant: output keys == input keys; affected files and their
    // transitive import deps keep full content.
    let mut files = BTreeMap::new();
    files.insert(
        "app/page.js".to_string(),
        "import { load } from './lib/db';\nexport default function Page() {}".to_string(),
    );
    files.insert("app/lib/db.js".to_string(), "export function load() {}".to_string());
    files.insert(
        "app/unrelated.js".to_string(),
        "export const nothing = true;".to_string(),
    );

    let compressor = ContextCompressor::new();
    let mut cache = CompressorCache::default();
    let (compressed, _) =
        compressor.compress(&files, "Error: page.js wirft beim Laden", &[], &mut cache);

    assert_eq!(compressed.len(), files.len());
    assert_eq!(compressed["app/page.js"].content, files["app/page.js"]);
    assert!(!compressed["app/page.js"].is_summary);
    assert_eq!(compressed["app/lib/db.js"].content, files["app/lib/db.js"]);
    assert!(!compressed["app/lib/db.js"].is_summary);
    assert!(compressed["app/unrelated.js"].is_summary);
}

#[test]
fn test_error_hash_drives_stagnation_signature() {
    // The §8 stagnation scenario end to end: five differently-numbered
    // occurrences of the same failure produce one signature and one hash.
    let variants: Vec<String> = [42, 51, 60, 77, 91]
        .iter()
        .map(|line| format!("sqlite3.OperationalError: no such table: todos (line {line})"))
        .collect();

    let signatures: Vec<String> = variants
        .iter()
        .map(|v| feedback::feedback_signature(v, ""))
        .collect();
    let hashes: Vec<String> = variants.iter().map(|v| feedback::hash_error(v)).collect();

    assert!(signatures.windows(2).all(|w| w[0] == w[1]));
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(hashes[0].len(), 16);
}

#[test]
fn test_validators_catch_cross_file_defects() {
    let blueprint = blueprint();
    let mut files = BTreeMap::new();
    files.insert(
        "index.html".to_string(),
        r#"<html><script src="missing.js"></script></html>"#.to_string(),
    );
    files.insert(
        "app.js".to_string(),
        "import axios from 'axios';\nexport const x = 1;\n".to_string(),
    );
    files.insert(
        "package.json".to_string(),
        r#"{"dependencies":{"react":"18","react-dom":"18"}}"#.to_string(),
    );

    let report = run_pre_sandbox_validators(&files, &blueprint);
    assert!(!report.passed);
    let feedback_text = report.feedback_for_coder();
    // Both the dangling HTML reference and the undeclared import surface.
    assert!(feedback_text.contains("missing.js"));
    assert!(feedback_text.contains("axios"));
}
