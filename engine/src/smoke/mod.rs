//! Smoke-test gate: the blocking success condition.
//!
//! Pass iff the server started AND the page loaded AND zero compile
//! errors were seen (console errors optionally block too). Infrastructure
//! faults (no browser) degrade to a visible warning instead of failing
//! the run.

pub mod browser;
pub mod server;

pub use browser::{BrowserDriver, BrowserError, NullBrowser, PageProbe};
pub use server::{
    detect_server_port, resolve_run_command, start_server, startup_timeout, wait_for_app_ready,
    wait_for_port, ServerError, ServerInfo,
};

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{SmokeTestConfig, TechBlueprint};
use crate::events::SharedEventSink;

/// Compile-error patterns matched against server stdout/stderr.
const COMPILE_ERROR_PATTERNS: &[&str] = &[
    "Module not found",
    "ModuleNotFoundError",
    "Cannot find module",
    "Cannot resolve",
    "Failed to compile",
    "Build error",
    "SyntaxError",
    "TypeError:",
    "ReferenceError:",
    "ENOENT",
    "EPERM",
    "Cannot read properties of",
    "is not a function",
    "Unexpected token",
    "Error: Cannot find",
];

/// Line prefixes that never count as compile errors.
const HARMLESS_PREFIXES: &[&str] = &[
    "warn",
    "notice",
    "npm warn",
    "[notice]",
    "deprecated",
    "experimentalwarning",
    "punycode",
    "cleanup",
];

/// Extract compile errors from server output, filtering harmless noise.
pub fn extract_compile_errors(output: &str) -> Vec<String> {
    let mut errors = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.len() < 5 {
            continue;
        }
        let lower = trimmed.to_lowercase();
        if HARMLESS_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            continue;
        }
        if COMPILE_ERROR_PATTERNS.iter().any(|p| trimmed.contains(p)) {
            errors.push(trimmed.chars().take(300).collect());
        }
    }
    errors
}

/// Outcome of one smoke test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmokeTestResult {
    pub passed: bool,
    pub server_started: bool,
    pub page_loaded: bool,
    pub compile_errors: Vec<String>,
    pub console_errors: Vec<String>,
    pub issues: Vec<String>,
    pub screenshot: Option<String>,
    pub server_output: String,
    pub duration_seconds: f64,
}

impl SmokeTestResult {
    fn skipped(reason: &str) -> Self {
        Self {
            passed: true,
            issues: vec![reason.to_string()],
            ..Self::default()
        }
    }

    /// Structured feedback for the coder; empty when passed.
    pub fn feedback_for_coder(&self) -> String {
        if self.passed {
            return String::new();
        }
        let mut parts = vec!["SMOKE-TEST FEHLGESCHLAGEN:".to_string()];
        if !self.compile_errors.is_empty() {
            parts.push("\nKOMPILIERUNGS-FEHLER:".to_string());
            for error in self.compile_errors.iter().take(10) {
                parts.push(format!("  - {error}"));
            }
        }
        if !self.server_started {
            parts.push("\nSERVER KONNTE NICHT GESTARTET WERDEN:".to_string());
            if !self.server_output.is_empty() {
                let tail: String = self.server_output.chars().take(2000).collect();
                parts.push(format!("  Server-Output:\n{tail}"));
            }
        }
        if self.server_started && !self.page_loaded {
            parts.push("\nSEITE KONNTE NICHT GELADEN WERDEN:".to_string());
            parts.push("  Die App antwortet nicht mit sichtbarem Inhalt.".to_string());
        }
        if !self.console_errors.is_empty() {
            parts.push(format!(
                "\nBROWSER CONSOLE-FEHLER ({}):",
                self.console_errors.len()
            ));
            for error in self.console_errors.iter().take(5) {
                parts.push(format!("  - {error}"));
            }
        }
        if !self.issues.is_empty() {
            parts.push("\nWEITERE PROBLEME:".to_string());
            for issue in &self.issues {
                parts.push(format!("  - {issue}"));
            }
        }
        parts.join("\n")
    }
}

/// Run the smoke test: install → start server → wait for readiness →
/// browser probe → compile-error extraction → teardown.
pub async fn run_smoke_test(
    project_path: &Path,
    blueprint: &TechBlueprint,
    config: &SmokeTestConfig,
    driver: &dyn BrowserDriver,
    sink: &SharedEventSink,
) -> SmokeTestResult {
    if !config.enabled {
        return SmokeTestResult::skipped("Smoke-Test deaktiviert");
    }
    if !blueprint.requires_server {
        return SmokeTestResult::skipped("Kein Server noetig");
    }

    let start = Instant::now();
    let mut result = SmokeTestResult::default();

    install_dependencies_if_needed(project_path, blueprint, sink).await;

    let mut server = match start_server(project_path, blueprint, config.server_timeout).await {
        Ok(server) => server,
        Err(e) => {
            let message = format!("Server-Start fehlgeschlagen: {e}");
            sink.emit("SmokeTest", "ServerFailed", message.clone());
            result.issues.push(message);
            result.duration_seconds = start.elapsed().as_secs_f64();
            return result;
        }
    };
    result.server_started = true;
    info!(url = server.url, "smoke test server up");

    // Early compile errors show up right after startup.
    let early_output = server.capture_output(Duration::from_secs(3)).await;
    result.server_output = early_output.clone();
    result.compile_errors = extract_compile_errors(&early_output);

    if result.compile_errors.is_empty() {
        let ready = wait_for_app_ready(&server.url, Duration::from_secs(15)).await;

        let probe_timeout = Duration::from_millis(config.playwright_timeout);
        match driver.probe(&server.url, probe_timeout).await {
            Ok(probe) => {
                result.page_loaded = ready || probe.body_html_len > 0;
                result.console_errors = probe.console_errors.clone();
                result.screenshot = probe.screenshot.clone();
                if probe.is_empty_page() {
                    result
                        .issues
                        .push("Leere Seite erkannt - App rendert keinen sichtbaren Inhalt".to_string());
                    result.page_loaded = false;
                }
                if probe.error_overlay {
                    result
                        .issues
                        .push("Framework Error-Overlay erkannt - Build-Fehler".to_string());
                    result.page_loaded = false;
                }
            }
            Err(BrowserError::Unavailable) => {
                // Infra fault: never fail the run silently, never block it.
                warn!("browser driver unavailable - HTTP readiness only");
                sink.emit(
                    "SmokeTest",
                    "Warning",
                    "Kein Browser verfuegbar - nur HTTP-Check durchgefuehrt",
                );
                result.page_loaded = ready;
            }
            Err(e) => {
                result.issues.push(format!("Browser-Fehler: {e}"));
                result.page_loaded = ready;
            }
        }

        // Compile errors can arrive late (lazy compilation on first hit).
        let late_output = server.capture_output(Duration::from_secs(2)).await;
        if !late_output.is_empty() {
            result.server_output.push_str(&late_output);
            result
                .compile_errors
                .extend(extract_compile_errors(&late_output));
        }
    } else {
        result
            .issues
            .push(format!("{} Kompilierungsfehler erkannt", result.compile_errors.len()));
    }

    server.terminate().await;

    let mut blocking = !result.server_started
        || !result.page_loaded
        || !result.compile_errors.is_empty();
    if config.block_on_console_errors && !result.console_errors.is_empty() {
        blocking = true;
    }
    result.passed = !blocking;
    result.duration_seconds = start.elapsed().as_secs_f64();

    sink.emit(
        "SmokeTest",
        "Result",
        format!(
            "passed={} server={} page={} compile_errors={}",
            result.passed,
            result.server_started,
            result.page_loaded,
            result.compile_errors.len()
        ),
    );
    result
}

/// Install dependencies when a manifest exists and no install marker is
/// present yet.
async fn install_dependencies_if_needed(
    project_path: &Path,
    blueprint: &TechBlueprint,
    sink: &SharedEventSink,
) {
    let (manifest, marker, command) = if blueprint.is_python() {
        ("requirements.txt", ".deps_installed", "pip install -r requirements.txt")
    } else {
        ("package.json", "node_modules", "npm install")
    };

    if !project_path.join(manifest).exists() || project_path.join(marker).exists() {
        return;
    }

    sink.emit("SmokeTest", "Install", format!("Installiere Dependencies: {command}"));
    let install = blueprint.install_command.as_deref().unwrap_or(command);
    match crate::sandbox::docker::run_on_host(project_path, install, Duration::from_secs(300)).await
    {
        Ok(result) if result.success => {
            if blueprint.is_python() {
                let _ = std::fs::write(project_path.join(".deps_installed"), "");
            }
        }
        Ok(result) => warn!(stderr = %result.stderr, "dependency install failed"),
        Err(e) => warn!(error = %e, "dependency install could not run"),
    }
}
