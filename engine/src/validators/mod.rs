//! Pre-sandbox validators.
//!
//! Every validator returns `{passed, issues, warnings}`. The pipeline runs
//! all of them and ANDs the results; issues are promoted to a sandbox
//! failure with structured feedback, warnings are surfaced but never
//! block.

pub mod completeness;
pub mod imports;
pub mod python;
pub mod references;
pub mod runscript;
pub mod structure;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::TechBlueprint;

/// Result of one validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Which validator produced this result.
    pub validator: String,
    pub passed: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// A passing result for `validator`.
    pub fn passed(validator: &str) -> Self {
        Self {
            validator: validator.to_string(),
            passed: true,
            issues: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Record an issue; the result now fails.
    pub fn issue(&mut self, message: String) {
        self.issues.push(message);
        self.passed = false;
    }

    /// Record a warning; the result still passes.
    pub fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }
}

/// Combined report of one pre-sandbox pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreSandboxReport {
    pub results: Vec<ValidationResult>,
    pub passed: bool,
}

impl PreSandboxReport {
    /// All issues across validators.
    pub fn issues(&self) -> Vec<&str> {
        self.results
            .iter()
            .flat_map(|r| r.issues.iter().map(String::as_str))
            .collect()
    }

    /// All warnings across validators.
    pub fn warnings(&self) -> Vec<&str> {
        self.results
            .iter()
            .flat_map(|r| r.warnings.iter().map(String::as_str))
            .collect()
    }

    /// Structured feedback for the coder: issues grouped by validator,
    /// empty string when everything passed.
    pub fn feedback_for_coder(&self) -> String {
        if self.passed {
            return String::new();
        }
        let mut lines = vec!["❌ CODE-VALIDIERUNG FEHLGESCHLAGEN:".to_string()];
        for result in &self.results {
            if result.issues.is_empty() {
                continue;
            }
            lines.push(format!("[{}]", result.validator));
            for issue in &result.issues {
                lines.push(format!("  - {issue}"));
            }
        }
        lines.push("Behebe diese Fehler bevor der Code erneut getestet wird.".to_string());
        lines.join("\n")
    }
}

/// Run the synchronous validator set over the workspace.
///
/// Completeness runs first: a truncated file invalidates most downstream
/// findings. The async PyPI check ([`python::validate_pypi_versions`]) is
/// invoked separately by the sandbox orchestrator.
pub fn run_pre_sandbox_validators(
    files: &BTreeMap<String, String>,
    blueprint: &TechBlueprint,
) -> PreSandboxReport {
    let mut results = Vec::new();

    let mut completeness_result = ValidationResult::passed("completeness");
    for (path, reason) in completeness::check_for_truncation(files) {
        completeness_result.issue(format!("{path}: abgeschnitten ({reason})"));
    }
    results.push(completeness_result);

    results.push(references::validate_references(files));
    results.push(runscript::validate_run_script(files, blueprint));
    results.push(structure::validate_template_structure(files, blueprint));
    results.push(structure::validate_nextjs_structure(files, blueprint));
    results.push(structure::validate_no_inline_svg(files));
    results.push(structure::validate_no_pages_router(files));
    results.push(structure::validate_no_forbidden_libraries(files));

    if blueprint.is_node_family() {
        results.push(imports::validate_import_dependencies(files));
    }
    if blueprint.is_python() {
        results.push(python::validate_circular_imports(files));
        results.push(python::validate_requirements(files));
    }

    let passed = results.iter().all(|r| r.passed);
    PreSandboxReport { results, passed }
}
