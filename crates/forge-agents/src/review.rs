//! Second-opinion and external review coordination.
//!
//! Both run only under success conditions, after the primary review said
//! OK: first the Vier-Augen check with a *different* model, then the
//! optional external specialist. Any dissent restarts the iteration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forge_engine::classifier::is_empty_or_invalid_response;
use forge_engine::config::{ExternalReviewMode, ExternalSpecialistsConfig, VierAugenConfig};
use forge_engine::events::SharedEventSink;
use forge_engine::router::{ModelRouter, Role};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::invoker::Invoker;
use crate::prompts::build_second_opinion_prompt;

/// Outcome of the Vier-Augen review.
#[derive(Debug, Clone)]
pub struct SecondOpinionOutcome {
    /// Whether the second opinion agrees with the primary OK.
    pub agrees: bool,
    pub verdict: String,
    /// Model that produced the second opinion ("keiner" when skipped).
    pub model: String,
    /// Dissent feedback, empty on agreement.
    pub feedback: String,
}

impl SecondOpinionOutcome {
    fn agreement(model: &str) -> Self {
        Self {
            agrees: true,
            verdict: "OK".to_string(),
            model: model.to_string(),
            feedback: String::new(),
        }
    }
}

/// Run the second-opinion review.
///
/// The primary model is paused via a rate-limit window so the router
/// yields a different reviewer, and restored afterwards via
/// `mark_success` — success or failure.
#[allow(clippy::too_many_arguments)]
pub async fn run_second_opinion(
    invoker: &Invoker,
    router: &Arc<ModelRouter>,
    config: &VierAugenConfig,
    reviewer_timeout_secs: u64,
    current_code: &str,
    sandbox_result: &str,
    test_summary: &str,
    sandbox_failed: bool,
    primary_model: &str,
    sink: &SharedEventSink,
) -> SecondOpinionOutcome {
    sink.emit(
        "SecondOpinion",
        "Start",
        format!("Vier-Augen-Prinzip: Hole zweite Meinung (Primary: {primary_model})"),
    );

    // Pause the primary so the router picks an alternative.
    router.mark_rate_limited(primary_model, None);
    let second_model = router.get(Role::Reviewer).model;

    if second_model == primary_model {
        sink.emit(
            "SecondOpinion",
            "Skip",
            "Kein alternatives Modell verfuegbar - Primary-Verdict gilt",
        );
        router.mark_success(primary_model);
        return SecondOpinionOutcome::agreement(primary_model);
    }

    let timeout_secs = ((reviewer_timeout_secs as f64 * config.timeout_factor) as u64).max(120);
    let prompt =
        build_second_opinion_prompt(current_code, sandbox_result, test_summary, sandbox_failed);

    let outcome = invoker
        .invoke(
            "SecondOpinion",
            &format!("Vier-Augen Review ({second_model})"),
            &second_model,
            &prompt,
            Duration::from_secs(timeout_secs),
        )
        .await;

    // Restore the primary regardless of how the call went.
    router.mark_success(primary_model);

    match outcome {
        Ok(review_output) => {
            if is_empty_or_invalid_response(&review_output) {
                sink.emit(
                    "SecondOpinion",
                    "NoResponse",
                    format!("Modell {second_model} lieferte keine Antwort - Primary-Verdict gilt"),
                );
                return SecondOpinionOutcome::agreement(&second_model);
            }

            let agrees = review_output.to_uppercase().contains("OK") && !sandbox_failed;
            if agrees {
                info!(model = second_model, "second opinion agrees");
                SecondOpinionOutcome::agreement(&second_model)
            } else {
                let preview: String = review_output.chars().take(300).collect();
                sink.emit(
                    "SecondOpinion",
                    "Dissent",
                    format!("Zweite Meinung ({second_model}) widerspricht: {preview}"),
                );
                SecondOpinionOutcome {
                    agrees: false,
                    verdict: "FEEDBACK".to_string(),
                    model: second_model,
                    feedback: review_output,
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "second opinion failed");
            if config.skip_on_error {
                sink.emit(
                    "SecondOpinion",
                    "Error",
                    format!("Second Opinion fehlgeschlagen ({e}) - Primary-Verdict gilt"),
                );
                SecondOpinionOutcome::agreement("fehler")
            } else {
                sink.emit(
                    "SecondOpinion",
                    "Error",
                    format!("Second Opinion fehlgeschlagen ({e}) - Iteration wird wiederholt"),
                );
                SecondOpinionOutcome {
                    agrees: false,
                    verdict: "FEEDBACK".to_string(),
                    model: "fehler".to_string(),
                    feedback: format!("Second-Opinion-Review fehlgeschlagen: {e}"),
                }
            }
        }
    }
}

/// Severity bucket of an external finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl FindingSeverity {
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            _ => Self::Info,
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

/// One finding from the external specialist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalFinding {
    pub severity: FindingSeverity,
    pub message: String,
    pub file: Option<String>,
}

/// External review specialist (CodeRabbit-style). Implementations live
/// outside this workspace; the coordinator only needs the call surface.
#[async_trait]
pub trait ExternalReviewer: Send + Sync {
    async fn review(&self, files: &[String]) -> Result<Vec<ExternalFinding>, String>;
}

/// Outcome of the external review step.
#[derive(Debug, Clone)]
pub struct ExternalReviewOutcome {
    pub passed: bool,
    pub feedback: String,
    pub findings: Vec<ExternalFinding>,
}

impl ExternalReviewOutcome {
    fn passed_with(findings: Vec<ExternalFinding>) -> Self {
        Self {
            passed: true,
            feedback: String::new(),
            findings,
        }
    }
}

/// Run the external review when configured.
///
/// In `blocking` mode CRITICAL/HIGH findings restart the iteration; in
/// `advisory` mode everything is logged but nothing blocks. Errors and
/// timeouts skip the gate with a visible warning.
pub async fn run_external_review(
    reviewer: Option<&dyn ExternalReviewer>,
    config: &ExternalSpecialistsConfig,
    changed_files: &[String],
    sink: &SharedEventSink,
) -> ExternalReviewOutcome {
    if !config.enabled {
        return ExternalReviewOutcome::passed_with(Vec::new());
    }
    let Some(reviewer) = reviewer else {
        sink.emit(
            "ExternalReview",
            "Warning",
            "External Review aktiviert aber kein Spezialist angebunden - uebersprungen",
        );
        return ExternalReviewOutcome::passed_with(Vec::new());
    };

    let timeout = Duration::from_secs(config.timeout.unwrap_or(120));
    let result = tokio::time::timeout(timeout, reviewer.review(changed_files)).await;

    let findings = match result {
        Ok(Ok(findings)) => findings,
        Ok(Err(e)) => {
            sink.emit(
                "ExternalReview",
                "Warning",
                format!("External Review fehlgeschlagen ({e}) - uebersprungen"),
            );
            return ExternalReviewOutcome::passed_with(Vec::new());
        }
        Err(_) => {
            sink.emit(
                "ExternalReview",
                "Warning",
                format!("External Review Timeout nach {}s - uebersprungen", timeout.as_secs()),
            );
            return ExternalReviewOutcome::passed_with(Vec::new());
        }
    };

    let blocking: Vec<&ExternalFinding> = findings
        .iter()
        .filter(|f| f.severity.is_blocking())
        .collect();

    if blocking.is_empty() || config.mode == ExternalReviewMode::Advisory {
        if !blocking.is_empty() {
            sink.emit(
                "ExternalReview",
                "Advisory",
                format!("{} kritische Findings (advisory - nicht blockierend)", blocking.len()),
            );
        } else {
            sink.emit(
                "ExternalReview",
                "OK",
                format!("External Review bestanden ({} Info-Findings)", findings.len()),
            );
        }
        return ExternalReviewOutcome::passed_with(findings);
    }

    let mut lines = vec!["EXTERNE REVIEW-FINDINGS (blockierend):".to_string()];
    for finding in &blocking {
        let location = finding
            .file
            .as_deref()
            .map(|f| format!(" [DATEI:{f}]"))
            .unwrap_or_default();
        lines.push(format!("- [{:?}]{location} {}", finding.severity, finding.message));
    }
    let feedback = lines.join("\n");
    sink.emit(
        "ExternalReview",
        "Findings",
        format!("External Review: {} blockierende Issue(s)", blocking.len()),
    );

    ExternalReviewOutcome {
        passed: false,
        feedback,
        findings,
    }
}
