//! Prompt assembly for the agent roles.
//!
//! Prompts are built from named parts so the token-budget trimming can
//! degrade them in stages instead of blindly cutting characters:
//! 1. drop the lessons block,
//! 2. truncate the feedback window,
//! 3. keep only the head of every file body,
//! 4. replace file bodies with the removal marker.

use std::collections::BTreeMap;

use forge_engine::compressor::CompressedFile;
use forge_engine::config::TechBlueprint;
use forge_engine::planner::MissingFile;

/// Marker replacing file bodies in the last trimming stage.
pub const CONTENT_REMOVED_MARKER: &str = "[Inhalt entfernt wegen Token-Limit]";

/// Feedback window after trimming stage 2.
const FEEDBACK_TRIM_CHARS: usize = 4000;
/// Per-file head kept in trimming stage 3.
const FILE_HEAD_LINES: usize = 60;

fn truncate_chars(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        input.to_string()
    } else {
        let head: String = input.chars().take(max).collect();
        format!("{head}\n[... gekuerzt ...]")
    }
}

/// The assembled parts of a coder prompt.
#[derive(Debug, Clone, Default)]
pub struct CoderPromptParts {
    pub user_goal: String,
    pub blueprint_summary: String,
    pub lessons: String,
    pub constraints: String,
    pub feedback: String,
    /// `(path, content, is_summary)` per workspace file.
    pub files: Vec<(String, String, bool)>,
    /// Files just auto-fixed; the coder must not regenerate them.
    pub protected_files: Vec<String>,
    /// Explicit creation orders for referenced-but-absent files.
    pub missing_files: Vec<MissingFile>,
    pub iteration: u32,
    pub is_patch_mode: bool,
}

impl CoderPromptParts {
    /// Collect the file section from a compression result.
    pub fn with_compressed_files(mut self, compressed: &BTreeMap<String, CompressedFile>) -> Self {
        self.files = compressed
            .iter()
            .map(|(path, file)| (path.clone(), file.content.clone(), file.is_summary))
            .collect();
        self
    }

    fn render(&self, stage: u8) -> String {
        let mut sections = Vec::new();

        sections.push(format!("AUFGABE:\n{}", self.user_goal));
        if !self.blueprint_summary.is_empty() {
            sections.push(format!("TECH-STACK:\n{}", self.blueprint_summary));
        }

        if stage < 1 && !self.lessons.is_empty() {
            sections.push(self.lessons.clone());
        }
        // Constraints are binding and survive every stage.
        if !self.constraints.is_empty() {
            sections.push(self.constraints.clone());
        }

        if !self.feedback.is_empty() {
            let feedback = if stage < 2 {
                self.feedback.clone()
            } else {
                truncate_chars(&self.feedback, FEEDBACK_TRIM_CHARS)
            };
            sections.push(format!("FEEDBACK ZUR LETZTEN ITERATION:\n{feedback}"));
        }

        if !self.protected_files.is_empty() {
            sections.push(format!(
                "GESCHUETZTE DATEIEN (gerade automatisch gefixt - NICHT neu generieren):\n{}",
                self.protected_files.join(", ")
            ));
        }

        if !self.missing_files.is_empty() {
            sections.push(
                forge_engine::planner::render_creation_orders(&self.missing_files)
                    .trim()
                    .to_string(),
            );
        }

        if !self.files.is_empty() {
            let mut file_section = vec!["AKTUELLER PROJEKT-STAND:".to_string()];
            for (path, content, is_summary) in &self.files {
                let marker = if *is_summary { " (SUMMARY)" } else { "" };
                let body = match stage {
                    0 | 1 | 2 => content.clone(),
                    3 => {
                        let lines: Vec<&str> = content.lines().collect();
                        if lines.len() > FILE_HEAD_LINES {
                            format!(
                                "{}\n[... {} weitere Zeilen ...]",
                                lines[..FILE_HEAD_LINES].join("\n"),
                                lines.len() - FILE_HEAD_LINES
                            )
                        } else {
                            content.clone()
                        }
                    }
                    _ => CONTENT_REMOVED_MARKER.to_string(),
                };
                file_section.push(format!("### FILENAME: {path}{marker}\n{body}"));
            }
            sections.push(file_section.join("\n\n"));
        }

        let mode = if self.is_patch_mode {
            "PATCH-MODUS: Gib NUR die geaenderten/neuen Dateien im ### FILENAME: Format aus."
        } else {
            "Gib ALLE Projekt-Dateien im ### FILENAME: Format aus."
        };
        sections.push(format!(
            "AUSGABEFORMAT (Iteration {}):\n{mode}\nPfade POSIX-relativ, UTF-8, keine Erklaertexte zwischen den Dateien.",
            self.iteration + 1
        ));

        sections.join("\n\n")
    }

    /// Render within the character budget, degrading stage by stage.
    pub fn render_within(&self, max_chars: usize) -> String {
        let mut rendered = String::new();
        for stage in 0..=4u8 {
            rendered = self.render(stage);
            if rendered.chars().count() <= max_chars {
                break;
            }
        }
        rendered
    }
}

fn blueprint_summary(blueprint: &TechBlueprint) -> String {
    let mut lines = vec![
        format!("Sprache: {}", blueprint.language),
        format!("Projekt-Typ: {}", blueprint.project_type),
    ];
    if let Some(framework) = &blueprint.framework {
        lines.push(format!("Framework: {framework}"));
    }
    if blueprint.requires_server {
        lines.push("Server erforderlich: ja".to_string());
    }
    if !blueprint.pinned_versions.is_empty() {
        let pins: Vec<String> = blueprint
            .pinned_versions
            .iter()
            .map(|(name, version)| format!("{name}=={version}"))
            .collect();
        lines.push(format!("Gepinnte Versionen: {}", pins.join(", ")));
    }
    lines.join("\n")
}

/// Assemble a coder prompt.
#[allow(clippy::too_many_arguments)]
pub fn build_coder_prompt(
    user_goal: &str,
    blueprint: &TechBlueprint,
    compressed: &BTreeMap<String, CompressedFile>,
    feedback: &str,
    lessons: &str,
    constraints: &str,
    protected_files: &[String],
    missing_files: &[MissingFile],
    iteration: u32,
    is_patch_mode: bool,
    max_chars: usize,
) -> String {
    let parts = CoderPromptParts {
        user_goal: user_goal.to_string(),
        blueprint_summary: blueprint_summary(blueprint),
        lessons: lessons.to_string(),
        constraints: constraints.to_string(),
        feedback: feedback.to_string(),
        protected_files: protected_files.to_vec(),
        missing_files: missing_files.to_vec(),
        iteration,
        is_patch_mode,
        ..CoderPromptParts::default()
    }
    .with_compressed_files(compressed);
    parts.render_within(max_chars)
}

/// Reviewer prompt over the current code and sandbox evidence.
pub fn build_reviewer_prompt(
    current_code: &str,
    sandbox_result: &str,
    test_summary: &str,
    sandbox_failed: bool,
    max_chars: usize,
) -> String {
    let code_budget = max_chars.saturating_sub(6000).max(10_000);
    format!(
        "Du bist ein strenger Code-Reviewer.\n\
         Pruefe den folgenden Projekt-Stand auf Korrektheit, Vollstaendigkeit und Konsistenz.\n\
         Antworte mit \"OK\" NUR wenn der Code fehlerfrei ist und die Sandbox bestanden wurde.\n\
         Sonst: Nenne URSACHE, BETROFFENE DATEIEN (als [DATEI:pfad]) und LÖSUNG.\n\n\
         === CODE ===\n{}\n\n\
         === SANDBOX ({}) ===\n{}\n\n\
         === TESTS ===\n{}",
        truncate_chars(current_code, code_budget),
        if sandbox_failed { "FEHLGESCHLAGEN" } else { "OK" },
        truncate_chars(sandbox_result, 4000),
        truncate_chars(test_summary, 2000),
    )
}

/// Security rescan prompt; findings use the parseable wire format.
pub fn build_security_prompt(current_code: &str, max_chars: usize) -> String {
    format!(
        "Du bist ein Security-Auditor. Pruefe den Code auf Schwachstellen\n\
         (SQL Injection, XSS, CSRF, unsichere Defaults, fehlende Validierung).\n\
         Melde jede Schwachstelle in genau diesem Format:\n\
         VULNERABILITY: <beschreibung> | FIX: <loesungsvorschlag> | SEVERITY: <critical|high|medium|low>\n\
         Wenn keine Schwachstellen vorliegen, antworte mit \"KEINE\".\n\n\
         === CODE ===\n{}",
        truncate_chars(current_code, max_chars.saturating_sub(1000).max(10_000)),
    )
}

/// Second-opinion (Vier-Augen) prompt with fixed input windows.
pub fn build_second_opinion_prompt(
    current_code: &str,
    sandbox_result: &str,
    test_summary: &str,
    sandbox_failed: bool,
) -> String {
    format!(
        "Du bist ein unabhaengiger Code-Reviewer (Vier-Augen-Prinzip).\n\
         Ein anderer Reviewer hat diesen Code bereits als \"OK\" bewertet.\n\
         Deine Aufgabe: Pruefe den Code UNABHAENGIG und kritisch.\n\n\
         WICHTIG: Antworte NUR mit \"OK\" wenn der Code WIRKLICH fehlerfrei ist.\n\
         Bei JEDEM Problem antworte mit konkretem Feedback.\n\n\
         === CODE ===\n{}\n\n\
         === SANDBOX-ERGEBNIS ===\n{}\n{}\n\n\
         === TEST-ZUSAMMENFASSUNG ===\n{}\n\n\
         Pruefe besonders:\n\
         1. Logik-Fehler und Edge-Cases\n\
         2. Sicherheitsprobleme (SQL Injection, XSS, etc.)\n\
         3. Fehlende Fehlerbehandlung\n\
         4. Import-Fehler und fehlende Abhaengigkeiten\n\
         5. Inkonsistenzen zwischen Dateien",
        truncate_chars(current_code, 8000),
        if sandbox_failed { "FEHLGESCHLAGEN" } else { "ERFOLGREICH" },
        truncate_chars(sandbox_result, 2000),
        truncate_chars(test_summary, 1000),
    )
}

/// Filter feedback to the paragraphs that mention any of the given file
/// basenames. Falls back to the full feedback when nothing matches, so a
/// group never works blind.
pub fn filter_feedback_for_files(feedback: &str, basenames: &[String]) -> String {
    if feedback.is_empty() || basenames.is_empty() {
        return feedback.to_string();
    }
    let paragraphs: Vec<&str> = feedback.split("\n\n").collect();
    let matching: Vec<&str> = paragraphs
        .iter()
        .copied()
        .filter(|p| basenames.iter().any(|name| p.contains(name.as_str())))
        .collect();
    if matching.is_empty() {
        feedback.to_string()
    } else {
        matching.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_engine::compressor::{CompressorCache, ContextCompressor};

    fn compressed_fixture() -> BTreeMap<String, CompressedFile> {
        let mut files = BTreeMap::new();
        files.insert(
            "app/page.js".to_string(),
            "export default function Page() { return null; }".to_string(),
        );
        files.insert("lib/db.js".to_string(), "export const db = 1;".to_string());
        let compressor = ContextCompressor::new();
        let mut cache = CompressorCache::default();
        let (compressed, _) = compressor.compress(&files, "Error: page.js broken", &[], &mut cache);
        compressed
    }

    #[test]
    fn test_summary_marker_rendered() {
        let prompt = build_coder_prompt(
            "Baue eine Todo-App",
            &TechBlueprint::default(),
            &compressed_fixture(),
            "Error: page.js broken",
            "",
            "",
            &[],
            &[],
            1,
            true,
            240_000,
        );
        assert!(prompt.contains("### FILENAME: app/page.js\n"));
        assert!(prompt.contains("### FILENAME: lib/db.js (SUMMARY)"));
        assert!(prompt.contains("PATCH-MODUS"));
    }

    #[test]
    fn test_lessons_and_constraints_included() {
        let prompt = build_coder_prompt(
            "Ziel",
            &TechBlueprint::default(),
            &BTreeMap::new(),
            "",
            "GELERNTE LEKTIONEN:\n- [CRITICAL] x",
            "UMGEBUNGS-CONSTRAINTS:\n- VERBOTEN: y",
            &[],
            &[],
            0,
            false,
            240_000,
        );
        assert!(prompt.contains("GELERNTE LEKTIONEN"));
        assert!(prompt.contains("UMGEBUNGS-CONSTRAINTS"));
        assert!(prompt.contains("ALLE Projekt-Dateien"));
    }

    #[test]
    fn test_stage1_drops_lessons_first() {
        let parts = CoderPromptParts {
            user_goal: "Ziel".to_string(),
            lessons: format!("LEKTIONEN:\n{}", "l".repeat(5000)),
            feedback: "kurz".to_string(),
            files: vec![("a.js".to_string(), "x".repeat(500), false)],
            iteration: 0,
            ..CoderPromptParts::default()
        };

        let full = parts.render_within(1_000_000);
        assert!(full.contains("LEKTIONEN"));

        // Budget forces stage 1: lessons gone, file content intact.
        let trimmed = parts.render_within(3000);
        assert!(!trimmed.contains("LEKTIONEN"));
        assert!(trimmed.contains(&"x".repeat(500)));
    }

    #[test]
    fn test_stage4_replaces_file_bodies() {
        let parts = CoderPromptParts {
            user_goal: "Ziel".to_string(),
            files: vec![
                ("a.js".to_string(), "a".repeat(20_000), false),
                ("b.js".to_string(), "b".repeat(20_000), false),
            ],
            iteration: 0,
            ..CoderPromptParts::default()
        };
        let trimmed = parts.render_within(2000);
        assert!(trimmed.contains(CONTENT_REMOVED_MARKER));
        assert!(!trimmed.contains(&"a".repeat(100)));
        // Paths survive even when bodies are removed.
        assert!(trimmed.contains("### FILENAME: a.js"));
    }

    #[test]
    fn test_protected_and_missing_sections() {
        let missing = vec![MissingFile {
            file: "app/api/items/route.js".to_string(),
            reason: "fetch('/api/items') in app/page.js aber Route-Datei fehlt".to_string(),
            referenced_by: "app/page.js".to_string(),
        }];
        let prompt = build_coder_prompt(
            "Ziel",
            &TechBlueprint::default(),
            &BTreeMap::new(),
            "fix it",
            "",
            "",
            &["layout.js".to_string()],
            &missing,
            2,
            true,
            240_000,
        );
        assert!(prompt.contains("GESCHUETZTE DATEIEN"));
        assert!(prompt.contains("layout.js"));
        assert!(prompt.contains("FEHLENDE DATEIEN"));
        assert!(prompt.contains("app/api/items/route.js"));
    }

    #[test]
    fn test_second_opinion_windows() {
        let code = "c".repeat(20_000);
        let sandbox = "s".repeat(5000);
        let tests = "t".repeat(3000);
        let prompt = build_second_opinion_prompt(&code, &sandbox, &tests, false);
        // Windows: 8k code, 2k sandbox, 1k tests (plus markers).
        assert!(prompt.contains("Vier-Augen-Prinzip"));
        assert!(prompt.len() < 13_000);
        assert!(prompt.contains("ERFOLGREICH"));
    }

    #[test]
    fn test_filter_feedback_for_files() {
        let feedback = "Fehler in layout.js:\nZeile 3 kaputt\n\nAnderes Thema ohne Datei\n\npage.js braucht fixes";
        let filtered = filter_feedback_for_files(feedback, &["layout.js".to_string()]);
        assert!(filtered.contains("layout.js"));
        assert!(!filtered.contains("Anderes Thema"));
        assert!(!filtered.contains("page.js"));
    }

    #[test]
    fn test_filter_feedback_fallback_to_full() {
        let feedback = "Allgemeines Feedback ohne Dateinamen";
        let filtered = filter_feedback_for_files(feedback, &["missing.js".to_string()]);
        assert_eq!(filtered, feedback);
    }

    #[test]
    fn test_reviewer_prompt_mentions_sandbox_state() {
        let prompt = build_reviewer_prompt("code", "❌ failed", "0 tests", true, 400_000);
        assert!(prompt.contains("FEHLGESCHLAGEN"));
        assert!(prompt.contains("[DATEI:pfad]"));
    }

    #[test]
    fn test_security_prompt_wire_format() {
        let prompt = build_security_prompt("code", 240_000);
        assert!(prompt.contains("VULNERABILITY:"));
        assert!(prompt.contains("| FIX:"));
        assert!(prompt.contains("| SEVERITY:"));
    }
}
