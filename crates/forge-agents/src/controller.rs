//! The iteration controller: drives coder → validators → sandbox →
//! reviewer → security → decision until success or the retry budget is
//! exhausted.
//!
//! The controller exclusively owns the per-run iteration state. Router
//! state persists for the process lifetime; memory persists on disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use forge_engine::compressor::{CompressorCache, ContextCompressor};
use forge_engine::config::{RunConfig, TechBlueprint};
use forge_engine::events::{
    CodeOutputPayload, ModelSwitchPayload, PingPongPayload, ReviewOutputPayload, SharedEventSink,
    StagnationPayload, ValidationDecisionPayload, WorkerState,
};
use forge_engine::feedback::{feedback_signature, hash_error};
use forge_engine::memory::{self, MemoryStore};
use forge_engine::planner;
use forge_engine::router::{ModelRouter, Role, TierEscalation};
use forge_engine::sandbox::{SandboxOrchestrator, SandboxRun};
use forge_engine::smoke::{self, BrowserDriver};
use forge_engine::workspace;
use tracing::{info, warn};

use crate::invoker::Invoker;
use crate::parallel::{should_use_parallel_patch, ParallelPatchExecutor};
use crate::prompts;
use crate::provider::{CompletionProvider, LlmError};
use crate::review::{run_external_review, run_second_opinion, ExternalReviewer};
use crate::utds;
use crate::validator::{extract_vulnerabilities, OrchestratorValidator, ValidatorAction};

/// Consecutive identical feedback signatures that force a model switch.
const STAGNATION_THRESHOLD: u32 = 4;
/// Consecutive empty-page iterations that force a model switch.
const EMPTY_PAGE_THRESHOLD: u32 = 3;
/// Feedback appearances before a file counts as ping-ponging.
const PING_PONG_WARN: u32 = 3;
/// Ping-pong count at which the sandbox override may fire.
const PING_PONG_OVERRIDE: u32 = 5;
/// Ping-pong count for researcher-tier escalation.
const PING_PONG_RESEARCHER: u32 = 6;

/// Inputs for one run.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub user_goal: String,
    pub blueprint: TechBlueprint,
    pub project_path: PathBuf,
    /// Files already produced by an up-front file-by-file generator; a
    /// non-empty list skips the coder in iteration 0.
    pub pre_generated_files: Vec<String>,
}

/// Result of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub iterations_used: u32,
    pub final_feedback: String,
    pub models_used: Vec<String>,
}

#[derive(Debug, Clone)]
struct FailedAttempt {
    model: String,
    iteration: u32,
    feedback_snippet: String,
}

#[derive(Debug, Clone)]
struct IterationRecord {
    iteration: u32,
    feedback_files: Vec<String>,
    utds_fixed: Vec<String>,
    verdict: String,
}

/// Per-run mutable state, created at run start and dropped at the end.
#[derive(Default)]
struct IterationState {
    feedback: String,
    model_attempt: u32,
    models_used: Vec<String>,
    failed_attempts: Vec<FailedAttempt>,
    iteration_history: Vec<IterationRecord>,
    utds_protected_files: Vec<String>,
    utds_modified_files: Vec<String>,
    file_feedback_counter: HashMap<String, u32>,
    last_feedback_signature: String,
    stagnation_counter: u32,
    empty_page_counter: u32,
    security_retry_count: u32,
    ping_pong_override_used: bool,
    truncation_recoveries: u32,
    compressor_cache: CompressorCache,
}

/// Human-readable review summary for the UI.
pub fn human_readable_verdict(verdict: &str, sandbox_failed: bool, review_output: &str) -> String {
    if verdict == "OK" && !sandbox_failed {
        return "✅ REVIEW BESTANDEN: Code erfuellt alle Anforderungen.".to_string();
    }
    if sandbox_failed {
        return "❌ REVIEW FEHLGESCHLAGEN: Sandbox/Test hat Fehler gemeldet.".to_string();
    }
    if !review_output.is_empty() {
        let first_sentence: String = review_output
            .split('.')
            .next()
            .unwrap_or("")
            .chars()
            .take(100)
            .collect();
        return format!("⚠️ AENDERUNGEN NOETIG: {first_sentence}");
    }
    "⚠️ AENDERUNGEN NOETIG: Bitte Feedback beachten.".to_string()
}

fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

/// Structured test-failure feedback for the coder.
fn format_test_feedback(run: &SandboxRun) -> String {
    let mut lines = Vec::new();
    let unit = &run.outcome.unit_tests;
    if unit.status == "FAIL" {
        lines.push("🧪 UNIT-TEST FEHLER:".to_string());
        if unit.failed_count > 0 {
            lines.push(format!("   {} Test(s) fehlgeschlagen", unit.failed_count));
        }
        if !unit.summary.is_empty() {
            lines.push(format!("   Zusammenfassung: {}", truncate_chars(&unit.summary, 800)));
        }
        if !unit.details.is_empty() {
            lines.push(format!("   Details:\n{}", truncate_chars(&unit.details, 1500)));
        }
        lines.push(String::new());
    }
    let ui = &run.outcome.ui_tests;
    if ui.status == "FAIL" || ui.status == "ERROR" {
        lines.push("🖥️ UI-TEST FEHLER:".to_string());
        for issue in ui.issues.iter().take(5) {
            lines.push(format!("   - {issue}"));
        }
        if !ui.has_visible_content {
            lines.push("   ⚠️ LEERE SEITE ERKANNT - kein sichtbarer Inhalt!".to_string());
        }
        lines.push(String::new());
    }
    if lines.is_empty() {
        "✅ Alle Tests bestanden".to_string()
    } else {
        lines.push("🔄 RE-TEST ERFORDERLICH: Nach den Fixes laufen die Tests automatisch erneut.".to_string());
        lines.join("\n")
    }
}

/// Assemble coder feedback when no root-cause analysis took over:
/// security first, then error-kind-specific guidance, sandbox details,
/// reviewer analysis and empty-page diagnostics.
#[allow(clippy::too_many_arguments)]
fn build_feedback(
    blueprint: &TechBlueprint,
    review_output: &str,
    sandbox_failed: bool,
    sandbox_result: &str,
    run: &SandboxRun,
    security_passed: bool,
    security_feedback: &str,
) -> String {
    if !security_passed && !security_feedback.is_empty() {
        return security_feedback.to_string();
    }

    if !sandbox_failed {
        return review_output.to_string();
    }

    let sandbox_lower = sandbox_result.to_lowercase();
    let mut feedback = if ["syntaxerror", "indentationerror", "invalid syntax", "unexpected indent"]
        .iter()
        .any(|e| sandbox_lower.contains(e))
    {
        "SYNTAX-FEHLER: Der Code enthaelt Syntaxfehler.\nBitte pruefe die Einrueckung und Syntax sorgfaeltig:\n\n".to_string()
    } else if ["nameerror", "attributeerror", "typeerror", "importerror", "modulenotfounderror"]
        .iter()
        .any(|e| sandbox_lower.contains(e))
    {
        "LAUFZEIT-FEHLER: Der Code hat Referenz- oder Typfehler.\nBitte pruefe Variablennamen, Importe und Typen:\n\n".to_string()
    } else if run.outcome.unit_tests.status == "FAIL" {
        "UNIT-TEST-FEHLER: Die Unit-Tests sind fehlgeschlagen.\nBitte analysiere die Testausgabe und behebe die Fehler:\n\n".to_string()
    } else if run.outcome.ui_tests.status == "FAIL" || run.outcome.ui_tests.status == "ERROR" {
        "UI-TEST-FEHLER: Die UI-Tests haben Probleme erkannt.\nBitte pruefe die Benutzeroberflaeche und das Rendering:\n\n".to_string()
    } else {
        "FEHLER: Die Sandbox oder der Tester hat Probleme gemeldet.\nBitte analysiere die Fehlermeldungen und behebe sie:\n\n".to_string()
    };

    feedback.push_str(&format!("SANDBOX:\n{}\n\n", truncate_chars(sandbox_result, 3000)));

    if review_output.trim().len() > 50 {
        feedback.push_str(&format!(
            "REVIEWER-ANALYSE:\n{}\n\n",
            truncate_chars(review_output, 2000)
        ));
    }

    let test_feedback = format_test_feedback(run);
    if !test_feedback.contains('✅') {
        feedback.push_str(&format!("\n{test_feedback}\n"));
    }

    let combined_lower = format!("{sandbox_lower} {}", run.outcome.ui_tests.issues.join(" ").to_lowercase());
    if combined_lower.contains("leere seite")
        || combined_lower.contains("kein sichtbar")
        || combined_lower.contains("empty page")
    {
        feedback.push_str("\nDIAGNOSE - LEERE SEITE ERKANNT:\n");
        let fingerprint = blueprint.stack_fingerprint();
        if ["react", "next", "vue"].iter().any(|k| fingerprint.contains(k))
            || blueprint.language.eq_ignore_ascii_case("javascript")
        {
            feedback.push_str("- Pruefe ob die Root-Komponente exportiert und gerendert wird\n");
            feedback.push_str("- Pruefe ob das Layout ein sichtbares Element im <body> rendert\n");
            feedback.push_str("- Pruefe ob <script>-Tags korrekte Pfade haben\n");
        } else if ["flask", "fastapi", "django"].iter().any(|k| fingerprint.contains(k)) {
            feedback.push_str("- Pruefe ob die Route '/' definiert ist und HTML zurueckgibt\n");
            feedback.push_str("- Pruefe ob Templates im Ordner 'templates/' liegen\n");
            feedback.push_str("- Pruefe ob render_template() den korrekten Dateinamen verwendet\n");
        } else {
            feedback.push_str("- Pruefe ob index.html sichtbare HTML-Elemente im <body> hat\n");
            feedback.push_str("- Pruefe ob alle <script src> und <link href> Pfade korrekt sind\n");
        }
    }

    feedback
}

/// The top-level develop–review–test loop.
pub struct DevLoop {
    config: RunConfig,
    invoker: Arc<Invoker>,
    router: Arc<ModelRouter>,
    sink: SharedEventSink,
    memory: MemoryStore,
    sandbox: SandboxOrchestrator,
    browser: Arc<dyn BrowserDriver>,
    external: Option<Arc<dyn ExternalReviewer>>,
    validator: OrchestratorValidator,
    parallel: ParallelPatchExecutor,
    compressor: ContextCompressor,
}

impl DevLoop {
    pub fn new(
        config: RunConfig,
        provider: Arc<dyn CompletionProvider>,
        router: Arc<ModelRouter>,
        sink: SharedEventSink,
        memory: MemoryStore,
        browser: Arc<dyn BrowserDriver>,
        external: Option<Arc<dyn ExternalReviewer>>,
    ) -> Self {
        let invoker = Arc::new(Invoker::new(provider, sink.clone(), config.heartbeat_interval));
        let sandbox = SandboxOrchestrator::new(config.docker.clone(), sink.clone());
        let validator = OrchestratorValidator::new(sink.clone());
        let parallel = ParallelPatchExecutor::new(
            Arc::clone(&invoker),
            Arc::clone(&router),
            sink.clone(),
            config.parallel_patch.clone(),
            config.agent_timeouts.coder,
        );
        Self {
            config,
            invoker,
            router,
            sink,
            memory,
            sandbox,
            browser,
            external,
            validator,
            parallel,
            compressor: ContextCompressor::new(),
        }
    }

    /// Invoke a role with transient-error rotation: pause the failing
    /// model, take the next one, up to `max_model_attempts` tries. These
    /// retries never consume an iteration.
    async fn call_with_rotation(
        &self,
        role: Role,
        agent_name: &str,
        task: &str,
        prompt: &str,
    ) -> Result<(String, String), LlmError> {
        let timeout = Duration::from_secs(self.config.agent_timeouts.for_role(role));
        let mut last_error = LlmError::EmptyResponse;

        for _ in 0..self.config.max_model_attempts.max(1) {
            let model = self.router.get(role).model;
            match self
                .invoker
                .invoke(agent_name, task, &model, prompt, timeout)
                .await
            {
                Ok(output) => {
                    self.router.mark_success(&model);
                    return Ok((model, output));
                }
                Err(e) if e.is_permanent() => {
                    self.router.mark_permanently_unavailable(&model);
                    last_error = e;
                }
                Err(e) => {
                    self.router.mark_rate_limited(&model, None);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Run the loop to success or budget exhaustion.
    pub async fn run(&self, input: &RunInput) -> anyhow::Result<RunOutcome> {
        let max_retries = self.config.max_retries;
        let mut state = IterationState {
            models_used: vec![self.router.get(Role::Coder).model],
            ..IterationState::default()
        };
        let mut iteration: u32 = 0;
        let mut success = false;

        while iteration < max_retries {
            self.sink.emit(
                "Coder",
                "Iteration",
                format!("{} / {max_retries}", iteration + 1),
            );
            let current_model = self.router.get(Role::Coder).model;
            self.sink.set_worker_status(
                "coder",
                WorkerState::Working,
                &format!("Iteration {}/{max_retries}", iteration + 1),
                &current_model,
            );

            // 1. Files UTDS fixed last turn are protected this turn.
            state.utds_protected_files = std::mem::take(&mut state.utds_modified_files);
            state.utds_protected_files.dedup();

            // 2–4. Coder phase: skip / parallel patch / single call.
            let coder_phase = self.coder_phase(input, &mut state, iteration).await;
            self.sink.set_worker_status("coder", WorkerState::Idle, "", "");
            let (created_files, rejected_files) = match coder_phase {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "coder phase failed - iteration consumed");
                    state.feedback = format!(
                        "Der Coder-Aufruf ist fehlgeschlagen ({e}). Bitte erneut generieren."
                    );
                    iteration += 1;
                    continue;
                }
            };

            // 5. Canonical state comes from disk.
            let workspace_files = workspace::read_workspace(&input.project_path, None);
            let current_code = workspace::render_canonical(&workspace_files);

            // 6. Sandbox + tests, with truncation treated as failure.
            let mut run = self
                .sandbox
                .run(&input.project_path, &workspace_files, &input.blueprint, None)
                .await;
            let mut sandbox_result = run.sandbox_result.clone();
            let mut sandbox_failed = run.sandbox_failed;

            if !rejected_files.is_empty() {
                let names: Vec<&str> = rejected_files.iter().map(|(n, _)| n.as_str()).collect();
                let message = format!(
                    "TRUNCATION: Dateien abgeschnitten durch Token-Limit: {}",
                    names.join(", ")
                );
                self.sink.emit("Coder", "TruncationError", message.clone());
                sandbox_failed = true;
                sandbox_result = format!("{sandbox_result}\n{message}");
                state.truncation_recoveries += 1;

                if let Ok(recovered) = self
                    .truncation_repair(input, &mut state, iteration, &rejected_files)
                    .await
                {
                    if recovered {
                        // Repair wrote the files; re-run the gate once.
                        let repaired_files = workspace::read_workspace(&input.project_path, None);
                        run = self
                            .sandbox
                            .run(&input.project_path, &repaired_files, &input.blueprint, None)
                            .await;
                        sandbox_result = run.sandbox_result.clone();
                        sandbox_failed = run.sandbox_failed;
                    }
                }
            }

            let test_summary = run.outcome.unit_tests.summary.clone();

            // 7. Review.
            self.sink.set_worker_status(
                "reviewer",
                WorkerState::Working,
                "Review laeuft...",
                &self.router.get(Role::Reviewer).model,
            );
            let review_prompt = prompts::build_reviewer_prompt(
                &current_code,
                &sandbox_result,
                &test_summary,
                sandbox_failed,
                self.config.max_reviewer_prompt_chars,
            );
            let (review_model, review_output) = match self
                .call_with_rotation(Role::Reviewer, "Reviewer", "Code-Review", &review_prompt)
                .await
            {
                Ok((model, output)) => (model, output),
                Err(e) => {
                    warn!(error = %e, "review failed - treating as feedback");
                    (String::new(), format!("Review nicht verfuegbar: {e}"))
                }
            };
            self.sink.set_worker_status("reviewer", WorkerState::Idle, "", "");
            let review_verdict = if review_output.trim().to_uppercase().starts_with("OK") {
                "OK"
            } else {
                "FEEDBACK"
            };

            self.sink.emit(
                "Reviewer",
                "ReviewOutput",
                ReviewOutputPayload {
                    verdict: review_verdict.to_string(),
                    is_approved: review_verdict == "OK" && !sandbox_failed,
                    human_summary: human_readable_verdict(
                        review_verdict,
                        sandbox_failed,
                        &review_output,
                    ),
                    feedback: state.feedback.clone(),
                    model: review_model,
                    iteration: iteration + 1,
                    sandbox_status: (if sandbox_failed { "FAIL" } else { "PASS" }).to_string(),
                    sandbox_result: truncate_chars(&sandbox_result, 2000),
                    test_summary: truncate_chars(&test_summary, 1000),
                    review_output: truncate_chars(&review_output, 2000),
                }
                .to_payload(),
            );

            // 8. Security rescan.
            let security_prompt =
                prompts::build_security_prompt(&current_code, self.config.max_prompt_chars());
            let vulnerabilities = match self
                .call_with_rotation(Role::Security, "Security", "Security-Rescan", &security_prompt)
                .await
            {
                Ok((_, output)) => extract_vulnerabilities(&output),
                Err(e) => {
                    warn!(error = %e, "security rescan failed - skipped with warning");
                    self.sink.emit(
                        "Security",
                        "Warning",
                        format!("Security-Scan nicht verfuegbar ({e}) - uebersprungen"),
                    );
                    Vec::new()
                }
            };
            let security_decision = self
                .validator
                .validate_security_output(&vulnerabilities, &current_model);
            let mut security_passed = security_decision.action == ValidatorAction::Proceed;
            let security_feedback = security_decision.feedback.clone();
            if !security_passed {
                state.security_retry_count += 1;
                if state.security_retry_count >= self.config.max_security_retries {
                    self.sink.emit(
                        "Security",
                        "Warning",
                        format!(
                            "Security-Issues nach {} Versuchen nicht behoben - fahre mit Warnung fort",
                            state.security_retry_count
                        ),
                    );
                    security_passed = true;
                }
            }

            // 9. Decision.
            let review_ok = review_verdict == "OK";
            let file_count = workspace_files.len().max(created_files.len());
            let has_minimum_files = file_count >= 3;

            // Ping-pong override may clear a stale sandbox failure before
            // the gate is evaluated.
            if sandbox_failed {
                sandbox_failed =
                    !self.ping_pong_sandbox_override(&mut state, &sandbox_result);
            }

            if review_ok && !sandbox_failed && security_passed && has_minimum_files {
                match self
                    .finalization_gates(input, &state, &current_code, &sandbox_result, &test_summary)
                    .await
                {
                    FinalizationResult::Success => {
                        success = true;
                        self.sink.emit(
                            "Orchestrator",
                            "Success",
                            format!("Projekt nach {} Iteration(en) abgeschlossen", iteration + 1),
                        );
                        if let Err(e) = self.memory.record_history(
                            forge_engine::memory::HistoryKind::SandboxOutcome,
                            &format!("✅ Erfolg nach {} Iteration(en)", iteration + 1),
                        ) {
                            warn!(error = %e, "success history entry failed");
                        }
                        break;
                    }
                    FinalizationResult::Dissent(feedback) => {
                        state.feedback = feedback;
                        iteration += 1;
                        continue;
                    }
                }
            }

            if review_ok && !has_minimum_files {
                self.sink.emit(
                    "Orchestrator",
                    "Status",
                    format!("Nur {file_count} Dateien erstellt - generiere weitere..."),
                );
                state.feedback = format!(
                    "Bitte weitere Dateien generieren. Bisher nur {file_count} Datei(en). \
                     Ein vollstaendiges Projekt braucht mindestens Backend, Config/Requirements und README oder Tests."
                );
                iteration += 1;
                continue;
            }

            // Validator decision with root-cause extraction.
            let decision = self.validator.validate_review_output(
                &review_output,
                review_verdict,
                &sandbox_result,
                sandbox_failed,
                &workspace_files,
                &current_model,
            );
            self.sink.emit(
                "Orchestrator",
                "ValidationDecision",
                ValidationDecisionPayload {
                    action: decision.action.to_string(),
                    target: decision.target_agent.clone(),
                    model_switch: decision.model_switch_recommended,
                    root_cause: decision.root_cause.is_some(),
                    error_hash: decision
                        .error_hash
                        .as_ref()
                        .map(|h| truncate_chars(h, 8)),
                }
                .to_payload(),
            );

            state.feedback = if decision.root_cause.is_some() {
                self.sink
                    .emit("Orchestrator", "RootCauseEnhanced", "Root Cause Analyse im Feedback");
                decision.feedback.clone()
            } else {
                build_feedback(
                    &input.blueprint,
                    &review_output,
                    sandbox_failed,
                    &sandbox_result,
                    &run,
                    security_passed,
                    &security_feedback,
                )
            };
            self.sink
                .emit("Reviewer", "Feedback", state.feedback.clone());

            // 10a. Memory learns from the error, off the hot path.
            if sandbox_failed {
                let store = self.memory.clone();
                let raw_error = sandbox_result.clone();
                let tags = memory::generate_tags(&input.blueprint, &sandbox_result);
                tokio::spawn(memory::learn_from_error_nonblocking(store, raw_error, tags));
            }
            if let Some(root_cause) = &decision.root_cause {
                let _ = self.memory.record_history(
                    forge_engine::memory::HistoryKind::RootCause,
                    &format!("Iter {}: {}", iteration + 1, truncate_chars(root_cause, 400)),
                );
            }

            // 10b. UTDS derivations on known patterns.
            let utds_fixes = utds::apply_derivations(
                &input.project_path,
                &workspace_files,
                &state.feedback,
                &self.sink,
            );
            if !utds_fixes.is_empty() {
                state.feedback.push_str(&format!(
                    "\n\nHINWEIS: {} Datei(en) wurden automatisch korrigiert: {}\n",
                    utds_fixes.len(),
                    utds_fixes
                        .iter()
                        .map(|f| f.file.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
            state
                .utds_modified_files
                .extend(utds_fixes.iter().map(|f| f.file.clone()));

            // 10c. Missing-file creation orders.
            let missing = planner::detect_missing_files(&workspace_files);
            if !missing.is_empty() {
                state
                    .feedback
                    .push_str(&planner::render_creation_orders(&missing));
                self.sink.emit(
                    "Orchestrator",
                    "MissingFiles",
                    format!(
                        "{} fehlende Dateien erkannt: {:?}",
                        missing.len(),
                        missing.iter().take(5).map(|m| &m.file).collect::<Vec<_>>()
                    ),
                );
            }

            // 11/12. History, ping-pong and tier escalation.
            let feedback_files = planner::affected_files_from_feedback(&state.feedback);
            state.iteration_history.push(IterationRecord {
                iteration: iteration + 1,
                feedback_files: feedback_files.clone(),
                utds_fixed: utds_fixes.iter().map(|f| f.file.clone()).collect(),
                verdict: review_verdict.to_string(),
            });
            self.update_ping_pong(&mut state, &feedback_files);

            // Symptom escalation: persistent empty page.
            let combined = format!(
                "{} {}",
                sandbox_result.to_lowercase(),
                run.outcome.ui_tests.issues.join(" ").to_lowercase()
            );
            if combined.contains("leere seite")
                || combined.contains("__next")
                || combined.contains("kein sichtbarer inhalt")
                || combined.contains("empty page")
            {
                state.empty_page_counter += 1;
                if state.empty_page_counter >= EMPTY_PAGE_THRESHOLD {
                    self.sink.emit(
                        "Orchestrator",
                        "SymptomEscalation",
                        format!(
                            "Leere Seite seit {} Iterationen - erzwinge Modellwechsel",
                            state.empty_page_counter
                        ),
                    );
                    state.model_attempt = self.config.max_model_attempts;
                    state.empty_page_counter = 0;
                }
            } else {
                state.empty_page_counter = 0;
            }

            // Stagnation by normalized feedback signature.
            let signature = feedback_signature(&state.feedback, &sandbox_result);
            if !signature.is_empty() && signature == state.last_feedback_signature {
                state.stagnation_counter += 1;
                if state.stagnation_counter >= STAGNATION_THRESHOLD {
                    self.sink.emit(
                        "Orchestrator",
                        "StagnationDetected",
                        StagnationPayload {
                            signature: signature.clone(),
                            iterations: state.stagnation_counter + 1,
                        }
                        .to_payload(),
                    );
                    state.model_attempt = self.config.max_model_attempts;
                    state.stagnation_counter = 0;
                }
            } else {
                state.stagnation_counter = 0;
                state.last_feedback_signature = signature;
            }

            // 13. Model switch bookkeeping.
            state.model_attempt += 1;
            state.failed_attempts.push(FailedAttempt {
                model: current_model.clone(),
                iteration: iteration + 1,
                feedback_snippet: truncate_chars(&state.feedback, 500),
            });

            if decision.model_switch_recommended {
                if let Some(hash) = &decision.error_hash {
                    self.router.mark_error_tried(hash, &current_model);
                    self.sink.emit(
                        "Orchestrator",
                        "ForceModelSwitch",
                        format!("Erzwingt Modellwechsel fuer Fehler {}", truncate_chars(hash, 8)),
                    );
                }
                state.model_attempt = self.config.max_model_attempts;
            }

            self.handle_model_switch(&mut state, &current_model, sandbox_failed, &sandbox_result);

            iteration += 1;
        }

        self.sink.set_worker_status("coder", WorkerState::Idle, "", "");
        for record in &state.iteration_history {
            tracing::debug!(
                iteration = record.iteration,
                verdict = %record.verdict,
                utds_fixed = record.utds_fixed.len(),
                files = ?record.feedback_files,
                "iteration history"
            );
        }
        Ok(RunOutcome {
            success,
            iterations_used: iteration + u32::from(success),
            final_feedback: state.feedback,
            models_used: state.models_used,
        })
    }

    /// Steps 2–4: produce code for this iteration and write it.
    /// Returns `(created_files, rejected_files)`.
    async fn coder_phase(
        &self,
        input: &RunInput,
        state: &mut IterationState,
        iteration: u32,
    ) -> anyhow::Result<(Vec<String>, Vec<(String, String)>)> {
        // Skip-coder gate after an up-front file-by-file generation.
        if iteration == 0 && !input.pre_generated_files.is_empty() {
            self.sink.emit(
                "Coder",
                "SkipAfterFBF",
                format!(
                    "File-by-File hat {} Dateien generiert - ueberspringe Coder",
                    input.pre_generated_files.len()
                ),
            );
            return Ok((input.pre_generated_files.clone(), Vec::new()));
        }

        let workspace_files = workspace::read_workspace(&input.project_path, None);
        let mode = planner::decide_mode(&planner::ModeContext {
            iteration,
            feedback: &state.feedback,
            utds_task_count: state.utds_protected_files.len(),
            affected_file_count: planner::affected_files_from_feedback(&state.feedback).len(),
        });
        let is_patch = mode == planner::IterationMode::Patch;

        // Parallel patch when the affected set is large enough.
        if is_patch && !state.feedback.is_empty() {
            let mut affected = planner::affected_files_from_feedback(&state.feedback);
            affected.retain(|f| !state.utds_protected_files.contains(f));
            if should_use_parallel_patch(&affected, &workspace_files, &self.config.parallel_patch) {
                self.sink.emit(
                    "Coder",
                    "ParallelPatchMode",
                    format!("Paralleler Patch fuer {} Dateien", affected.len()),
                );
                let outcome = self
                    .parallel
                    .run(
                        &input.project_path,
                        &affected,
                        &workspace_files,
                        &state.feedback,
                        &input.user_goal,
                        &input.blueprint,
                        iteration,
                        &state.utds_protected_files,
                        &mut state.compressor_cache,
                        self.config.max_prompt_chars(),
                    )
                    .await;
                return Ok((outcome.written_files, outcome.rejected_files));
            }
        }

        // Single coder call.
        let lessons = self
            .memory
            .get_lessons_for_prompt(&input.blueprint.language, 15)
            .unwrap_or_default();
        let constraints = self.memory.get_constraints_for_prompt().unwrap_or_default();
        let missing = planner::detect_missing_files(&workspace_files);
        let (compressed, _) = self.compressor.compress(
            &workspace_files,
            &state.feedback,
            &[],
            &mut state.compressor_cache,
        );
        let prompt = prompts::build_coder_prompt(
            &input.user_goal,
            &input.blueprint,
            &compressed,
            &state.feedback,
            &lessons,
            &constraints,
            &state.utds_protected_files,
            &missing,
            iteration,
            is_patch,
            self.config.max_prompt_chars(),
        );

        let (model, output) = self
            .call_with_rotation(Role::Coder, "Coder", "Code-Generierung", &prompt)
            .await
            .map_err(|e| anyhow::anyhow!("coder call failed: {e}"))?;

        let parsed = workspace::parse_multi_file(&output);
        let coder_decision =
            self.validator
                .validate_coder_output(&output, &parsed, None);
        if coder_decision.action == ValidatorAction::Fix {
            anyhow::bail!("coder output invalid: {}", coder_decision.feedback);
        }

        let report = workspace::write_files(&input.project_path, &parsed, is_patch)?;
        self.sink.emit(
            "Coder",
            "CodeOutput",
            CodeOutputPayload {
                code: truncate_chars(&output, 4000),
                files: report.written.clone(),
                iteration: iteration + 1,
                max_iterations: self.config.max_retries,
                model,
            }
            .to_payload(),
        );
        Ok((report.written, report.rejected))
    }

    /// One-shot repair call aimed only at the truncated files.
    async fn truncation_repair(
        &self,
        input: &RunInput,
        state: &mut IterationState,
        iteration: u32,
        rejected: &[(String, String)],
    ) -> anyhow::Result<bool> {
        let names: Vec<String> = rejected.iter().map(|(n, _)| n.clone()).collect();
        self.sink.emit(
            "Coder",
            "TruncationRecovery",
            format!(
                "Repair-Versuch #{} fuer: {}",
                state.truncation_recoveries,
                names.join(", ")
            ),
        );

        let workspace_files = workspace::read_workspace(&input.project_path, None);
        let (compressed, _) = self.compressor.compress(
            &workspace_files,
            &state.feedback,
            &names,
            &mut state.compressor_cache,
        );
        let repair_feedback = format!(
            "Die folgenden Dateien waren abgeschnitten und muessen VOLLSTAENDIG neu generiert werden: {}",
            names.join(", ")
        );
        let prompt = prompts::build_coder_prompt(
            &input.user_goal,
            &input.blueprint,
            &compressed,
            &repair_feedback,
            "",
            "",
            &[],
            &[],
            iteration,
            true,
            self.config.max_prompt_chars(),
        );

        let (_, output) = self
            .call_with_rotation(Role::Coder, "Coder", "Truncation-Repair", &prompt)
            .await
            .map_err(|e| anyhow::anyhow!("repair call failed: {e}"))?;
        let parsed = workspace::parse_multi_file(&output);
        let report = workspace::write_files(&input.project_path, &parsed, true)?;
        let repaired_all = names
            .iter()
            .all(|name| report.written.iter().any(|w| w == name));
        Ok(repaired_all)
    }

    /// Success-path gates: smoke test, second opinion, external review.
    async fn finalization_gates(
        &self,
        input: &RunInput,
        state: &IterationState,
        current_code: &str,
        sandbox_result: &str,
        test_summary: &str,
    ) -> FinalizationResult {
        // Blocking smoke test.
        let smoke_result = smoke::run_smoke_test(
            &input.project_path,
            &input.blueprint,
            &self.config.smoke_test,
            self.browser.as_ref(),
            &self.sink,
        )
        .await;
        if !smoke_result.passed {
            return FinalizationResult::Dissent(smoke_result.feedback_for_coder());
        }

        // Second opinion by a different model.
        if self.config.vier_augen.enabled {
            let primary = self.router.get(Role::Reviewer).model;
            let opinion = run_second_opinion(
                &self.invoker,
                &self.router,
                &self.config.vier_augen,
                self.config.agent_timeouts.reviewer,
                current_code,
                sandbox_result,
                test_summary,
                false,
                &primary,
                &self.sink,
            )
            .await;
            if !opinion.agrees {
                return FinalizationResult::Dissent(format!(
                    "[VIER-AUGEN FEEDBACK ({})]\n{}",
                    opinion.model, opinion.feedback
                ));
            }
        }

        // External specialist, after the second opinion.
        let changed: Vec<String> = state
            .iteration_history
            .last()
            .map(|record| record.feedback_files.clone())
            .unwrap_or_default();
        let external = run_external_review(
            self.external.as_deref(),
            &self.config.external_specialists,
            &changed,
            &self.sink,
        )
        .await;
        if !external.passed {
            return FinalizationResult::Dissent(external.feedback);
        }

        FinalizationResult::Success
    }

    /// Update ping-pong counters; emit warnings and drive tier
    /// escalation. Returns nothing — the sandbox override is handled
    /// separately so it can run before the success gate.
    fn update_ping_pong(&self, state: &mut IterationState, feedback_files: &[String]) {
        for name in feedback_files {
            *state.file_feedback_counter.entry(name.clone()).or_insert(0) += 1;
        }
        for (name, count) in state.file_feedback_counter.iter_mut() {
            if !feedback_files.contains(name) {
                *count = 0;
            }
        }

        let ping_pong: Vec<(String, u32)> = state
            .file_feedback_counter
            .iter()
            .filter(|(_, c)| **c >= PING_PONG_WARN)
            .map(|(n, c)| (n.clone(), *c))
            .collect();

        if ping_pong.is_empty() {
            if self.router.tier_escalation() != TierEscalation::None {
                self.sink.emit(
                    "Orchestrator",
                    "TierReset",
                    "PingPong aufgeloest - Tier-Eskalation zurueckgesetzt",
                );
                self.router.set_tier_escalation(TierEscalation::None);
            }
            return;
        }

        let counts: std::collections::BTreeMap<String, u32> =
            ping_pong.iter().cloned().collect();
        self.sink.emit(
            "Orchestrator",
            "PingPongDetected",
            PingPongPayload {
                files: ping_pong.iter().map(|(n, _)| n.clone()).collect(),
                counts,
            }
            .to_payload(),
        );

        let max_count = ping_pong.iter().map(|(_, c)| *c).max().unwrap_or(0);
        if max_count >= PING_PONG_RESEARCHER {
            if self.router.tier_escalation() != TierEscalation::Researcher {
                self.router.set_tier_escalation(TierEscalation::Researcher);
                self.sink.emit(
                    "Orchestrator",
                    "TierEscalation",
                    format!("PingPong >= {PING_PONG_RESEARCHER} Iterationen ({max_count}x) - eskaliere auf researcher"),
                );
            }
        } else if self.router.tier_escalation() == TierEscalation::None {
            self.router.set_tier_escalation(TierEscalation::Coder);
            self.sink.emit(
                "Orchestrator",
                "TierEscalation",
                format!("PingPong >= {PING_PONG_WARN} Iterationen ({max_count}x) - eskaliere auf coder"),
            );
        }
    }

    /// One-time override: when every sandbox error line references only
    /// severely ping-ponging files, the stale failure is suppressed so
    /// the outer gates can make progress.
    fn ping_pong_sandbox_override(
        &self,
        state: &mut IterationState,
        sandbox_result: &str,
    ) -> bool {
        if state.ping_pong_override_used {
            return false;
        }
        let severe: Vec<&String> = state
            .file_feedback_counter
            .iter()
            .filter(|(_, c)| **c >= PING_PONG_OVERRIDE)
            .map(|(n, _)| n)
            .collect();
        if severe.is_empty() {
            return false;
        }

        // Per-file failure lines carry the `[filename]` prefix; summary
        // headers do not count.
        let error_lines: Vec<&str> = sandbox_result
            .lines()
            .filter(|l| {
                let t = l.trim();
                t.starts_with('[') && t.contains(']')
            })
            .collect();
        if error_lines.is_empty() {
            return false;
        }
        let all_ping_pong = error_lines
            .iter()
            .all(|line| severe.iter().any(|name| line.contains(name.as_str())));
        if !all_ping_pong {
            return false;
        }

        state.ping_pong_override_used = true;
        self.sink.emit(
            "Orchestrator",
            "PingPongOverride",
            PingPongPayload {
                files: severe.iter().map(|s| s.to_string()).collect(),
                counts: state
                    .file_feedback_counter
                    .iter()
                    .filter(|(_, c)| **c >= PING_PONG_OVERRIDE)
                    .map(|(n, c)| (n.clone(), *c))
                    .collect(),
            }
            .to_payload(),
        );
        true
    }

    /// Rotate the coder model once the per-model attempt budget is spent.
    /// The switch notice is PREPENDED so the original error indicators
    /// survive the targeted-fix detector.
    fn handle_model_switch(
        &self,
        state: &mut IterationState,
        current_model: &str,
        sandbox_failed: bool,
        sandbox_result: &str,
    ) {
        if state.model_attempt < self.config.max_model_attempts {
            return;
        }

        let error_hash = if sandbox_failed && !sandbox_result.is_empty() {
            hash_error(&format!("{}{}", state.feedback, sandbox_result))
        } else {
            String::new()
        };

        let new_model = if error_hash.is_empty() {
            self.router.mark_rate_limited(current_model, None);
            self.router.get(Role::Coder).model
        } else {
            self.router.mark_error_tried(&error_hash, current_model);
            self.router.get_for_error(Role::Coder, &error_hash)
        };

        if new_model == current_model {
            self.sink.emit(
                "Coder",
                "Warning",
                format!("Kein weiteres Modell verfuegbar - fahre mit {current_model} fort"),
            );
            return;
        }

        state.models_used.push(new_model.clone());
        state.model_attempt = 0;

        let history_summary: String = state
            .failed_attempts
            .iter()
            .rev()
            .take(3)
            .map(|attempt| {
                format!(
                    "- Modell '{}' (Iteration {}): {}",
                    attempt.model,
                    attempt.iteration,
                    truncate_chars(&attempt.feedback_snippet, 200)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let notice = format!(
            "🔄 MODELLWECHSEL: {current_model} -> {new_model}\n\
             HINWEIS: Bisherige Ansaetze haben nicht funktioniert. \
             Versuche einen anderen Ansatz fuer die folgenden Fehler.\n\
             BISHERIGE VERSUCHE:\n{history_summary}\n\n"
        );
        state.feedback = format!("{notice}{}", state.feedback);

        self.sink.emit(
            "Coder",
            "ModelSwitch",
            ModelSwitchPayload {
                old_model: current_model.to_string(),
                new_model,
                reason: if error_hash.is_empty() {
                    "max_attempts_reached".to_string()
                } else {
                    format!("error_history:{}", truncate_chars(&error_hash, 8))
                },
                models_used: state.models_used.clone(),
                failed_attempts: state.failed_attempts.len(),
            }
            .to_payload(),
        );

        info!("model switched");
    }
}

enum FinalizationResult {
    Success,
    Dissent(String),
}
