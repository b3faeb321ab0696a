//! Unified Task Derivation Set: deterministic auto-fixes for known
//! failure patterns, applied without a coder round-trip.
//!
//! Every file a derivation touches is reported back to the controller and
//! protected in the next iteration, so the coder does not immediately
//! overwrite the fix (the classic ping-pong).

use std::collections::BTreeMap;
use std::path::Path;

use forge_engine::events::SharedEventSink;
use forge_engine::workspace;
use tracing::info;

/// One applied derivation.
#[derive(Debug, Clone)]
pub struct UtdsFix {
    pub file: String,
    pub description: String,
}

/// Apply the derivation set against the workspace.
///
/// Current derivations:
/// - strip `pause` lines from run scripts (deadlocks non-interactive
///   launchers),
/// - add `react-dom` to package.json when `react` is declared alone,
/// - drop blacklisted front-end assets from requirements.txt,
/// - normalize Unicode hyphen variants in source files named by the
///   feedback.
pub fn apply_derivations(
    project_root: &Path,
    files: &BTreeMap<String, String>,
    feedback: &str,
    sink: &SharedEventSink,
) -> Vec<UtdsFix> {
    let mut fixes = Vec::new();
    let mut updates: BTreeMap<String, String> = BTreeMap::new();

    for (path, content) in files {
        // run scripts: `pause` removal.
        if path.ends_with(".bat") || path.ends_with(".sh") {
            let without_pause: Vec<&str> = content
                .lines()
                .filter(|l| !l.trim().eq_ignore_ascii_case("pause"))
                .collect();
            if without_pause.len() != content.lines().count() {
                updates.insert(path.clone(), without_pause.join("\n"));
                fixes.push(UtdsFix {
                    file: path.clone(),
                    description: "'pause' aus Run-Script entfernt".to_string(),
                });
            }
        }

        // package.json: react without react-dom.
        if path == "package.json" {
            if let Ok(mut value) = serde_json::from_str::<serde_json::Value>(content) {
                let needs_react_dom = value
                    .get("dependencies")
                    .and_then(|d| d.as_object())
                    .map(|deps| deps.contains_key("react") && !deps.contains_key("react-dom"))
                    .unwrap_or(false);
                if needs_react_dom {
                    let react_version = value["dependencies"]["react"]
                        .as_str()
                        .unwrap_or("latest")
                        .to_string();
                    value["dependencies"]["react-dom"] =
                        serde_json::Value::String(react_version);
                    if let Ok(rendered) = serde_json::to_string_pretty(&value) {
                        updates.insert(path.clone(), rendered);
                        fixes.push(UtdsFix {
                            file: path.clone(),
                            description: "react-dom zu dependencies ergaenzt".to_string(),
                        });
                    }
                }
            }
        }

        // requirements.txt: front-end assets are not PyPI packages.
        if path == "requirements.txt" {
            let blacklist = ["bootstrap", "jquery", "react", "vue", "angular", "tailwind"];
            let kept: Vec<&str> = content
                .lines()
                .filter(|line| {
                    let name = line
                        .trim()
                        .split(['=', '<', '>', '~'])
                        .next()
                        .unwrap_or("")
                        .to_lowercase();
                    !blacklist.contains(&name.as_str())
                })
                .collect();
            if kept.len() != content.lines().count() {
                updates.insert(path.clone(), kept.join("\n"));
                fixes.push(UtdsFix {
                    file: path.clone(),
                    description: "Frontend-Assets aus requirements.txt entfernt".to_string(),
                });
            }
        }

        // Unicode hyphens in files the feedback points at.
        let name = path.rsplit('/').next().unwrap_or(path);
        if feedback.contains(name) {
            let sanitized = workspace::sanitize_unicode(content);
            if sanitized != *content {
                updates.insert(path.clone(), sanitized);
                fixes.push(UtdsFix {
                    file: path.clone(),
                    description: "Unicode-Bindestriche normalisiert".to_string(),
                });
            }
        }
    }

    if !updates.is_empty() {
        // Derivation writes bypass the patch guard: they are derived from
        // the current content and never shrink it structurally.
        if let Err(e) = workspace::write_files(project_root, &updates, false) {
            sink.emit("UTDS", "Error", format!("Derivation-Schreibfehler: {e}"));
            return Vec::new();
        }
        for fix in &fixes {
            sink.emit("UTDS", "AutoFix", format!("{}: {}", fix.file, fix.description));
        }
        info!(count = fixes.len(), "utds derivations applied");
    }

    fixes
}
