//! Run-script validation for server projects.
//!
//! The generated launcher must work when double-clicked on Windows: no
//! required CLI arguments, no `pause` (deadlocks non-interactive
//! launchers), and it should contain the declared install and run
//! commands in some recognizable form.

use std::collections::BTreeMap;

use crate::config::TechBlueprint;

use super::ValidationResult;

/// Candidate launcher names, checked in order.
const RUN_SCRIPT_NAMES: &[&str] = &["run.bat", "run.sh", "start.bat", "start.sh"];

/// Lines that are pure boilerplate and do not count as content.
fn is_boilerplate(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("@echo off")
        || trimmed.starts_with("#!")
        || trimmed.starts_with("::")
        || trimmed.starts_with("rem ")
        || trimmed.starts_with("REM ")
        || trimmed.starts_with('#')
        || trimmed.eq_ignore_ascii_case("setlocal")
        || trimmed.eq_ignore_ascii_case("endlocal")
}

/// Whether a configured command appears in the script, matched flexibly:
/// interpreter prefixes (`python`, `python3`, `py -3`, `npx`, `call`) and
/// source subfolders (`src/app.py` for `app.py`) all count.
fn command_present(command: &str, script: &str) -> bool {
    let script_lower = script.to_lowercase();
    let command_lower = command.trim().to_lowercase();
    if command_lower.is_empty() || script_lower.contains(&command_lower) {
        return true;
    }
    // Match on the command's meaningful tail (e.g. "app.py" out of
    // "python app.py", "dev" out of "npm run dev").
    let parts: Vec<&str> = command_lower.split_whitespace().collect();
    if let Some(tail) = parts.last() {
        if script_lower.contains(tail) {
            return true;
        }
        // Source-subfolder variant: "app.py" also matches "src/app.py".
        if script_lower.contains(&format!("src/{tail}")) || script_lower.contains(&format!("src\\{tail}")) {
            return true;
        }
    }
    false
}

/// Validate the run script when the blueprint requires a server.
pub fn validate_run_script(
    files: &BTreeMap<String, String>,
    blueprint: &TechBlueprint,
) -> ValidationResult {
    let mut result = ValidationResult::passed("run_script");
    if !blueprint.requires_server {
        return result;
    }

    let Some((name, content)) = RUN_SCRIPT_NAMES
        .iter()
        .find_map(|n| files.get(*n).map(|c| (*n, c)))
    else {
        result.issue("Kein Run-Script gefunden (run.bat/run.sh erwartet)".to_string());
        return result;
    };

    let content_lines: Vec<&str> = content
        .lines()
        .filter(|l| !is_boilerplate(l))
        .collect();
    if content_lines.is_empty() {
        result.issue(format!("{name} enthaelt nur Boilerplate"));
        return result;
    }

    // %1/%2 or $1/$2 mean the script needs CLI arguments; double-click
    // launches provide none.
    if content.contains("%1") || content.contains("$1") {
        result.issue(format!(
            "{name} erwartet CLI-Argumente - Doppelklick-Start schlaegt fehl"
        ));
    }

    let has_pause = content
        .lines()
        .any(|l| l.trim().eq_ignore_ascii_case("pause"));
    if has_pause {
        result.issue(format!(
            "{name} enthaelt 'pause' - blockiert nicht-interaktive Starts"
        ));
    }

    if let Some(install) = &blueprint.install_command {
        if !command_present(install, content) {
            result.warn(format!("{name}: Install-Kommando '{install}' fehlt"));
        }
    }
    if let Some(run) = &blueprint.run_command {
        if !command_present(run, content) {
            result.issue(format!("{name}: Run-Kommando '{run}' fehlt"));
        }
    }

    result
}
