//! Sandbox orchestrator: dependency install + unit tests, containerized
//! when possible, on the host otherwise.
//!
//! Output classification distinguishes harmless warning noise (pip root
//! user, npm WARN) from real errors so a non-zero exit code alone never
//! fails an iteration.

pub mod docker;

pub use docker::{ContainerHandle, DockerExecutor, ExecResult, NamedContainer, SandboxError};

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classifier::is_harmless_warning_only;
use crate::config::{DockerConfig, TechBlueprint};
use crate::events::SharedEventSink;
use crate::validators::{run_pre_sandbox_validators, PreSandboxReport};

/// Unit-test section of a sandbox outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitTestSection {
    pub status: String,
    pub passed: u32,
    pub failed_count: u32,
    pub summary: String,
    pub details: String,
}

impl UnitTestSection {
    pub fn skip(reason: &str) -> Self {
        Self {
            status: "SKIP".to_string(),
            passed: 0,
            failed_count: 0,
            summary: reason.to_string(),
            details: String::new(),
        }
    }
}

/// UI-test section, filled by the smoke gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiTestSection {
    pub status: String,
    pub issues: Vec<String>,
    pub screenshot: Option<String>,
    pub has_visible_content: bool,
}

impl UiTestSection {
    pub fn skip() -> Self {
        Self {
            status: "SKIP".to_string(),
            issues: Vec::new(),
            screenshot: None,
            has_visible_content: true,
        }
    }
}

/// Result shape consumed by the controller and the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutcome {
    pub unit_tests: UnitTestSection,
    pub ui_tests: UiTestSection,
    pub overall_status: String,
    pub raw_output: String,
}

/// What the controller receives after one sandbox pass.
#[derive(Debug, Clone)]
pub struct SandboxRun {
    /// Human-readable result, fed into review prompts and feedback.
    pub sandbox_result: String,
    pub sandbox_failed: bool,
    pub outcome: SandboxOutcome,
    /// The pre-sandbox validation report that gated execution.
    pub validation: PreSandboxReport,
}

fn default_install_command(blueprint: &TechBlueprint) -> String {
    blueprint.install_command.clone().unwrap_or_else(|| {
        if blueprint.is_python() {
            "pip install -r requirements.txt".to_string()
        } else {
            "npm install".to_string()
        }
    })
}

fn default_test_command(blueprint: &TechBlueprint) -> String {
    if let Some(test_command) = &blueprint.test_command {
        return test_command.clone();
    }
    if blueprint.is_python() {
        "python -m pytest -x -q".to_string()
    } else {
        "npm test --silent -- --watchAll=false".to_string()
    }
}

/// Chooses host vs. containerized execution and classifies the output.
pub struct SandboxOrchestrator {
    config: DockerConfig,
    sink: SharedEventSink,
}

impl SandboxOrchestrator {
    pub fn new(config: DockerConfig, sink: SharedEventSink) -> Self {
        Self { config, sink }
    }

    fn image_for(&self, blueprint: &TechBlueprint) -> String {
        let key = if blueprint.is_python() { "python" } else { "node" };
        self.config
            .images
            .get(key)
            .cloned()
            .unwrap_or_else(|| format!("{key}:latest"))
    }

    /// Run pre-sandbox validators, then install + tests.
    ///
    /// Validation issues short-circuit: they become the sandbox failure
    /// without spending a container run on code that cannot work.
    pub async fn run(
        &self,
        project_path: &Path,
        files: &BTreeMap<String, String>,
        blueprint: &TechBlueprint,
        container: Option<&dyn ContainerHandle>,
    ) -> SandboxRun {
        let validation = run_pre_sandbox_validators(files, blueprint);
        for warning in validation.warnings() {
            self.sink.emit("Sandbox", "Warning", warning);
        }
        if !validation.passed {
            let feedback = validation.feedback_for_coder();
            self.sink.emit("Sandbox", "PreCheckFailed", feedback.clone());
            let outcome = SandboxOutcome {
                unit_tests: UnitTestSection {
                    status: "FAIL".to_string(),
                    passed: 0,
                    failed_count: validation.issues().len() as u32,
                    summary: feedback.clone(),
                    details: "Code-Validierung vor Sandbox fehlgeschlagen".to_string(),
                },
                ui_tests: UiTestSection::skip(),
                overall_status: "FAIL".to_string(),
                raw_output: String::new(),
            };
            return SandboxRun {
                sandbox_result: feedback,
                sandbox_failed: true,
                outcome,
                validation,
            };
        }

        let pypi = crate::validators::python::validate_pypi_versions(files).await;
        if !pypi.passed {
            let feedback = pypi.issues.join("\n");
            self.sink.emit("Sandbox", "PyPiCheck", feedback.clone());
            let outcome = SandboxOutcome {
                unit_tests: UnitTestSection {
                    status: "FAIL".to_string(),
                    passed: 0,
                    failed_count: pypi.issues.len() as u32,
                    summary: feedback.clone(),
                    details: String::new(),
                },
                ui_tests: UiTestSection::skip(),
                overall_status: "FAIL".to_string(),
                raw_output: String::new(),
            };
            return SandboxRun {
                sandbox_result: format!("❌ PYPI-VERSIONEN UNGUELTIG:\n{feedback}"),
                sandbox_failed: true,
                outcome,
                validation,
            };
        }

        let install = default_install_command(blueprint);
        let test = default_test_command(blueprint);
        let exec_result = self
            .execute(project_path, blueprint, container, &install, &test)
            .await;

        self.classify(exec_result, validation)
    }

    async fn execute(
        &self,
        project_path: &Path,
        blueprint: &TechBlueprint,
        container: Option<&dyn ContainerHandle>,
        install: &str,
        test: &str,
    ) -> Result<ExecResult, SandboxError> {
        let timeout = Duration::from_secs(self.config.timeout_install + self.config.timeout_test);
        let combined = format!("{install} && {test}");

        // Persistent container first.
        if let Some(handle) = container {
            if handle.is_healthy().await {
                self.sink
                    .emit("Docker", "Status", "Persistenter Container aktiv");
                return handle.exec(&combined, timeout).await;
            }
            warn!("persistent container unhealthy - falling back");
        }

        if self.config.enabled {
            let executor =
                DockerExecutor::new(project_path, &self.image_for(blueprint), self.config.clone());
            if executor.is_docker_available().await {
                self.sink
                    .emit("Docker", "Status", "Docker-Isolation aktiviert (Einmal-Container)");
                return executor.install_and_test(install, test).await;
            }
            if !self.config.fallback_to_host {
                return Err(SandboxError::DockerUnavailable(
                    "Docker nicht verfuegbar und fallback_to_host deaktiviert".to_string(),
                ));
            }
            self.sink
                .emit("Docker", "Warning", "Docker nicht verfuegbar - Host-Modus");
        }

        docker::run_on_host(project_path, &combined, timeout).await
    }

    fn classify(
        &self,
        exec_result: Result<ExecResult, SandboxError>,
        validation: PreSandboxReport,
    ) -> SandboxRun {
        match exec_result {
            Ok(result) => {
                let harmless = is_harmless_warning_only(&result.stderr, &result.stdout);
                let passed = result.success || (!result.timed_out && harmless);
                let raw_output = format!("{}\n{}", result.stdout, result.stderr);

                if passed {
                    info!(duration_secs = result.duration.as_secs(), "sandbox passed");
                    let summary = if result.success {
                        "Install + Tests erfolgreich".to_string()
                    } else {
                        "Install + Tests OK (nur Warnungen)".to_string()
                    };
                    self.sink.emit("Sandbox", "Result", summary.clone());
                    SandboxRun {
                        sandbox_result: format!("✅ {summary}"),
                        sandbox_failed: false,
                        outcome: SandboxOutcome {
                            unit_tests: UnitTestSection {
                                status: "OK".to_string(),
                                passed: 0,
                                failed_count: 0,
                                summary,
                                details: truncate(&raw_output, 1500),
                            },
                            ui_tests: UiTestSection::skip(),
                            overall_status: "PASS".to_string(),
                            raw_output,
                        },
                        validation,
                    }
                } else {
                    let summary = truncate(&compose_failure_summary(&result), 1500);
                    self.sink.emit("Sandbox", "Result", summary.clone());
                    SandboxRun {
                        sandbox_result: format!("❌ SANDBOX FEHLGESCHLAGEN:\n{summary}"),
                        sandbox_failed: true,
                        outcome: SandboxOutcome {
                            unit_tests: UnitTestSection {
                                status: "FAIL".to_string(),
                                passed: 0,
                                failed_count: 0,
                                summary,
                                details: truncate(&raw_output, 3000),
                            },
                            ui_tests: UiTestSection::skip(),
                            overall_status: "FAIL".to_string(),
                            raw_output,
                        },
                        validation,
                    }
                }
            }
            Err(e) => {
                let message = format!("Sandbox-Infrastruktur fehlgeschlagen: {e}");
                self.sink.emit("Sandbox", "Error", message.clone());
                SandboxRun {
                    sandbox_result: format!("❌ {message}"),
                    sandbox_failed: true,
                    outcome: SandboxOutcome {
                        unit_tests: UnitTestSection {
                            status: "FAIL".to_string(),
                            passed: 0,
                            failed_count: 0,
                            summary: message.clone(),
                            details: String::new(),
                        },
                        ui_tests: UiTestSection::skip(),
                        overall_status: "FAIL".to_string(),
                        raw_output: message,
                    },
                    validation,
                }
            }
        }
    }
}

/// Pull the informative section out of failed install/test output: the
/// test-runner summary when present, the tail of stdout/stderr otherwise.
fn compose_failure_summary(result: &ExecResult) -> String {
    let mut parts = Vec::new();

    let markers = [
        "= FAILURES =",
        "= ERRORS =",
        "= short test summary",
        "FAILED",
        "ERROR",
    ];
    let stdout_lines: Vec<&str> = result.stdout.lines().collect();
    if let Some(start) = stdout_lines
        .iter()
        .position(|line| markers.iter().any(|m| line.contains(m)))
    {
        let section: Vec<&str> = stdout_lines[start..].to_vec();
        parts.push(format!(
            "=== TEST-ERGEBNISSE ===\n{}",
            truncate(&section.join("\n"), 1000)
        ));
    } else if !result.stdout.trim().is_empty() {
        parts.push(format!(
            "=== STDOUT ===\n{}",
            truncate(result.stdout.trim(), 500)
        ));
    }

    if !result.stderr.trim().is_empty() {
        parts.push(format!(
            "=== STDERR ===\n{}",
            truncate(result.stderr.trim(), 500)
        ));
    }

    if parts.is_empty() {
        "Keine Output-Details verfuegbar".to_string()
    } else {
        parts.join("\n\n")
    }
}

fn truncate(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;

    fn orchestrator(enabled: bool) -> SandboxOrchestrator {
        let config = DockerConfig {
            enabled,
            timeout_install: 10,
            timeout_test: 10,
            ..DockerConfig::default()
        };
        SandboxOrchestrator::new(config, EventSink::new().shared())
    }

    fn blueprint_no_server() -> TechBlueprint {
        TechBlueprint {
            requires_server: false,
            language: "python".to_string(),
            project_type: "cli".to_string(),
            install_command: Some("true".to_string()),
            ..TechBlueprint::default()
        }
    }

    #[tokio::test]
    async fn test_validation_failure_short_circuits() {
        let orchestrator = orchestrator(false);
        let dir = tempfile::tempdir().unwrap();
        let mut files = BTreeMap::new();
        files.insert("broken.py".to_string(), "def f(:".to_string());

        let run = orchestrator
            .run(dir.path(), &files, &blueprint_no_server(), None)
            .await;
        assert!(run.sandbox_failed);
        assert_eq!(run.outcome.overall_status, "FAIL");
        assert!(run.sandbox_result.contains("broken.py"));
    }

    #[test]
    fn test_failure_summary_prefers_test_section() {
        let result = ExecResult {
            success: false,
            stdout: "installing...\ncollecting...\n= FAILURES =\ntest_x failed\n".to_string(),
            stderr: "some warning".to_string(),
            duration: Duration::from_secs(1),
            timed_out: false,
        };
        let summary = compose_failure_summary(&result);
        assert!(summary.contains("TEST-ERGEBNISSE"));
        assert!(summary.contains("test_x failed"));
        assert!(summary.contains("STDERR"));
    }

    #[test]
    fn test_failure_summary_empty_output() {
        let result = ExecResult {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            timed_out: false,
        };
        assert_eq!(
            compose_failure_summary(&result),
            "Keine Output-Details verfuegbar"
        );
    }

    #[tokio::test]
    async fn test_harmless_warnings_pass() {
        // Host mode; install "true", test command for python is pytest which
        // is unavailable here, so exercise classify() directly instead.
        let orchestrator = orchestrator(false);
        let result = ExecResult {
            success: false,
            stdout: String::new(),
            stderr: "WARNING: Running pip as the 'root' user can break things\n[notice] A new release of pip is available\n".to_string(),
            duration: Duration::from_secs(1),
            timed_out: false,
        };
        let validation = run_pre_sandbox_validators(&BTreeMap::new(), &blueprint_no_server());
        let run = orchestrator.classify(Ok(result), validation);
        assert!(!run.sandbox_failed);
        assert_eq!(run.outcome.overall_status, "PASS");
        assert!(run.outcome.unit_tests.summary.contains("Warnungen"));
    }

    #[tokio::test]
    async fn test_real_error_fails() {
        let orchestrator = orchestrator(false);
        let result = ExecResult {
            success: false,
            stdout: String::new(),
            stderr: "ModuleNotFoundError: No module named 'flask'".to_string(),
            duration: Duration::from_secs(1),
            timed_out: false,
        };
        let validation = run_pre_sandbox_validators(&BTreeMap::new(), &blueprint_no_server());
        let run = orchestrator.classify(Ok(result), validation);
        assert!(run.sandbox_failed);
        assert!(run.sandbox_result.contains("ModuleNotFoundError"));
    }

    #[tokio::test]
    async fn test_timeout_fails_even_when_quiet() {
        let orchestrator = orchestrator(false);
        let result = ExecResult {
            success: false,
            stdout: String::new(),
            stderr: "Timeout nach 600s".to_string(),
            duration: Duration::from_secs(600),
            timed_out: true,
        };
        let validation = run_pre_sandbox_validators(&BTreeMap::new(), &blueprint_no_server());
        let run = orchestrator.classify(Ok(result), validation);
        assert!(run.sandbox_failed);
    }
}
