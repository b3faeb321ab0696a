//! Orchestrator validator: checks every role's output before it moves on.
//!
//! The validator is the central decision point of the hierarchy: each
//! agent result is inspected, a root cause is extracted (or synthesized
//! from templates when the reviewer only described symptoms), and the
//! outcome is one of PROCEED / FIX / MODEL_SWITCH / ESCALATE. Repeated
//! failures of the same `(model, error hash)` pair force a model switch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{LazyLock, Mutex};

use forge_engine::events::SharedEventSink;
use forge_engine::feedback::hash_error;
use forge_engine::validators::completeness::check_for_truncation;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Same-error attempts per model before a switch is recommended.
const MAX_SAME_ERROR: u32 = 3;

/// Possible actions after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorAction {
    /// Output OK, forward to the next agent.
    Proceed,
    /// Defect found, back to correction.
    Fix,
    /// Same model failed the same error too often.
    ModelSwitch,
    /// Out of options; surface to the operator.
    Escalate,
}

impl std::fmt::Display for ValidatorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed => write!(f, "proceed"),
            Self::Fix => write!(f, "fix"),
            Self::ModelSwitch => write!(f, "model_switch"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

/// Decision for one validated output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationDecision {
    pub action: ValidatorAction,
    /// Next agent, or "coder" on a fix.
    pub target_agent: String,
    /// Structured feedback for the next agent.
    pub feedback: String,
    /// Synthesized or reviewer-provided cause, when a defect was found.
    pub root_cause: Option<String>,
    pub affected_files: Vec<String>,
    pub model_switch_recommended: bool,
    /// Hash keying the model-rotation bookkeeping.
    pub error_hash: Option<String>,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationDecision {
    fn proceed(target_agent: &str) -> Self {
        Self {
            action: ValidatorAction::Proceed,
            target_agent: target_agent.to_string(),
            feedback: String::new(),
            root_cause: None,
            affected_files: Vec::new(),
            model_switch_recommended: false,
            error_hash: None,
            issues: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn fix(feedback: String, issues: Vec<String>) -> Self {
        Self {
            action: ValidatorAction::Fix,
            target_agent: "coder".to_string(),
            feedback,
            root_cause: None,
            affected_files: Vec::new(),
            model_switch_recommended: false,
            error_hash: None,
            issues,
            warnings: Vec::new(),
        }
    }
}

/// One extracted security finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    pub severity: String,
    pub description: String,
    pub fix: String,
    pub affected_file: Option<String>,
}

impl Vulnerability {
    pub fn is_blocking(&self) -> bool {
        matches!(self.severity.as_str(), "critical" | "high")
    }
}

static VULN_FULL_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)VULNERABILITY:\s*(.+?)\s*\|\s*FIX:\s*(.+?)\s*\|\s*SEVERITY:\s*(\w+)").unwrap()
});
static VULN_FILE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:in|file|datei)\s+["']?([a-zA-Z0-9_./\\-]+\.[a-z]{2,4})["']?"#).unwrap()
});

fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

/// Extract vulnerabilities and fix suggestions from the security role's
/// raw output. Primary wire format `VULNERABILITY: … | FIX: … |
/// SEVERITY: …`; severity falls back to keyword inference. Capped at 10.
pub fn extract_vulnerabilities(security_output: &str) -> Vec<Vulnerability> {
    let mut vulnerabilities = Vec::new();
    if security_output.is_empty() {
        return vulnerabilities;
    }

    for captures in VULN_FULL_FORMAT.captures_iter(security_output) {
        let description = captures[1].trim().to_string();
        let fix = captures[2].trim().to_string();
        let severity_raw = captures[3].trim().to_lowercase();
        let severity = if ["critical", "high", "medium", "low"].contains(&severity_raw.as_str()) {
            severity_raw
        } else {
            "medium".to_string()
        };
        let affected_file = VULN_FILE_HINT
            .captures(&description)
            .map(|c| c[1].to_string());
        vulnerabilities.push(Vulnerability {
            severity,
            description: truncate_chars(&description, 2000),
            fix: truncate_chars(&fix, 5000),
            affected_file,
        });
    }

    // Lenient fallback: VULNERABILITY: lines without the full wire format.
    if vulnerabilities.is_empty() {
        for line in security_output.lines() {
            let Some(rest) = line.trim().strip_prefix("VULNERABILITY:") else {
                continue;
            };
            let (description, fix) = match rest.split_once('|') {
                Some((d, f)) => (
                    d.trim().to_string(),
                    f.trim()
                        .trim_start_matches("FIX:")
                        .trim_start_matches("fix:")
                        .trim()
                        .to_string(),
                ),
                None => (rest.trim().to_string(), String::new()),
            };
            let lower = description.to_lowercase();
            let severity = if ["critical", "kritisch", "sql injection", "rce", "remote code"]
                .iter()
                .any(|kw| lower.contains(kw))
            {
                "critical"
            } else if ["high", "hoch", "xss", "csrf", "injection"]
                .iter()
                .any(|kw| lower.contains(kw))
            {
                "high"
            } else if ["low", "niedrig", "info", "informational", "minimal"]
                .iter()
                .any(|kw| lower.contains(kw))
            {
                "low"
            } else {
                "medium"
            };
            let affected_file = VULN_FILE_HINT
                .captures(&description)
                .map(|c| c[1].to_string());
            vulnerabilities.push(Vulnerability {
                severity: severity.to_string(),
                description: truncate_chars(&description, 2000),
                fix: truncate_chars(&fix, 5000),
                affected_file,
            });
        }
    }

    vulnerabilities.truncate(10);
    vulnerabilities
}

/// Error patterns for root-cause recognition, checked in order.
static ERROR_PATTERNS: LazyLock<Vec<(&'static str, Vec<Regex>)>> = LazyLock::new(|| {
    vec![
        (
            "circular_import",
            vec![
                Regex::new(r"ImportError.*circular").unwrap(),
                Regex::new(r"cannot import name.*from partially initialized module").unwrap(),
                Regex::new(r"most likely due to a circular import").unwrap(),
                Regex::new(r"Zirkulaerer Import").unwrap(),
            ],
        ),
        (
            "module_not_found",
            vec![
                Regex::new(r"ModuleNotFoundError: No module named").unwrap(),
                Regex::new(r"ImportError: No module named").unwrap(),
                Regex::new(r"Cannot find module").unwrap(),
            ],
        ),
        (
            "syntax_error",
            vec![
                Regex::new(r"SyntaxError:").unwrap(),
                Regex::new(r"IndentationError:").unwrap(),
                Regex::new(r"TabError:").unwrap(),
            ],
        ),
        (
            "name_error",
            vec![Regex::new(r"NameError: name '(\w+)' is not defined").unwrap()],
        ),
    ]
});

/// Root-cause templates, keyed by error kind. Intentionally prose so the
/// coder LLM can act on them.
fn root_cause_template(kind: &str, symptom: &str, files: &str) -> String {
    match kind {
        "circular_import" => format!(
            "SYMPTOM: {symptom}\n\n\
             URSACHE: Zirkulaerer Import zwischen Modulen.\n\
             Module importieren sich gegenseitig, was zu einem Import-Deadlock fuehrt.\n\n\
             BETROFFENE DATEIEN: {files}\n\n\
             LÖSUNG:\n\
             1. Identifiziere die zirkulaere Abhaengigkeit (A importiert B, B importiert A)\n\
             2. Extrahiere gemeinsame Abhaengigkeiten in ein separates Modul\n\
             3. Oder: Verwende Lazy Imports (Import innerhalb der Funktion)\n\
             4. Pruefe ob alle Imports wirklich benoetigt werden"
        ),
        "module_not_found" => format!(
            "SYMPTOM: {symptom}\n\n\
             URSACHE: Ein importiertes Modul existiert nicht oder ist nicht installiert.\n\n\
             BETROFFENE DATEIEN: {files}\n\n\
             LÖSUNG:\n\
             1. Pruefe ob das Modul korrekt geschrieben ist (Tippfehler?)\n\
             2. Pruefe ob die Datei existiert und am richtigen Ort liegt\n\
             3. Bei externen Modulen: In requirements.txt/package.json aufnehmen\n\
             4. Bei eigenen Modulen: Relativen Import verwenden"
        ),
        "syntax_error" => format!(
            "SYMPTOM: {symptom}\n\n\
             URSACHE: Der Code enthaelt ungueltige Syntax.\n\n\
             BETROFFENE DATEIEN: {files}\n\n\
             LÖSUNG:\n\
             1. Pruefe die angegebene Zeile und die Zeilen davor\n\
             2. Haeufige Ursachen: Fehlende Klammern, Doppelpunkte, Einrueckung\n\
             3. Strings muessen korrekt geschlossen sein\n\
             4. Pruefe auf versteckte Unicode-Zeichen"
        ),
        "name_error" => format!(
            "SYMPTOM: {symptom}\n\n\
             URSACHE: Eine Variable oder Funktion wird verwendet, bevor sie definiert wurde.\n\n\
             BETROFFENE DATEIEN: {files}\n\n\
             LÖSUNG:\n\
             1. Pruefe ob der Name korrekt geschrieben ist (Gross-/Kleinschreibung)\n\
             2. Pruefe ob die Definition VOR der Verwendung steht\n\
             3. Pruefe ob der Import korrekt ist\n\
             4. Bei Klassenmethoden: 'self.' nicht vergessen"
        ),
        _ => format!(
            "SYMPTOM: {symptom}\n\n\
             URSACHE: Ein Laufzeitfehler ist aufgetreten.\n\n\
             BETROFFENE DATEIEN: {files}\n\n\
             LÖSUNG:\n\
             1. Analysiere die Fehlermeldung und den Traceback\n\
             2. Pruefe die betroffene Codezeile\n\
             3. Validiere die Eingabedaten und Variablentypen\n\
             4. Fuege bei Bedarf Error-Handling hinzu"
        ),
    }
}

/// Indicators of an existing root-cause analysis in a review.
const ROOT_CAUSE_INDICATORS: &[&str] = &[
    "ursache:",
    "root cause:",
    "grund:",
    "das problem ist",
    "das liegt daran",
    "weil",
    "verursacht durch",
    "betroffene dateien",
    "lösung:",
];

/// Validates agent outputs and tracks repeated errors per model.
pub struct OrchestratorValidator {
    sink: SharedEventSink,
    max_same_error: u32,
    /// agent role → "model:error_hash" → attempts.
    error_counts: Mutex<HashMap<String, HashMap<String, u32>>>,
}

impl OrchestratorValidator {
    pub fn new(sink: SharedEventSink) -> Self {
        Self {
            sink,
            max_same_error: MAX_SAME_ERROR,
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Check coder output before it goes to the reviewer.
    pub fn validate_coder_output(
        &self,
        code_output: &str,
        created_files: &BTreeMap<String, String>,
        expected_files: Option<&[String]>,
    ) -> ValidationDecision {
        self.sink.emit(
            "Orchestrator",
            "Analysis",
            format!("Pruefe Coder-Output ({} Dateien)...", created_files.len()),
        );

        if code_output.trim().len() < 50 {
            return ValidationDecision::fix(
                "Der generierte Code ist leer oder unvollstaendig. Bitte generiere den kompletten Code."
                    .to_string(),
                vec!["Coder hat keinen oder zu wenig Code geliefert".to_string()],
            );
        }

        if created_files.is_empty() {
            return ValidationDecision::fix(
                "Es wurden keine Dateien erkannt. Verwende das Format: ### FILENAME: dateiname.py"
                    .to_string(),
                vec!["Keine Dateien im Output erkannt".to_string()],
            );
        }

        let truncated = check_for_truncation(created_files);
        if !truncated.is_empty() {
            let names: Vec<String> = truncated.iter().map(|(name, _)| name.clone()).collect();
            return ValidationDecision {
                action: ValidatorAction::ModelSwitch,
                target_agent: "coder".to_string(),
                feedback: format!(
                    "Die folgenden Dateien wurden abgeschnitten: {}. Bitte vollstaendig generieren.",
                    names.join(", ")
                ),
                root_cause: None,
                affected_files: names.clone(),
                model_switch_recommended: true,
                error_hash: None,
                issues: vec![format!("Truncation erkannt in: {}", names.join(", "))],
                warnings: Vec::new(),
            };
        }

        let mut decision = ValidationDecision::proceed("reviewer");
        if let Some(expected) = expected_files {
            let missing: Vec<&String> = expected
                .iter()
                .filter(|f| !created_files.contains_key(*f))
                .collect();
            if !missing.is_empty() {
                decision.warnings.push(format!(
                    "Fehlende Dateien: {}",
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
        }
        if created_files.len() < 3 {
            decision.warnings.push(format!(
                "Nur {} Dateien erstellt (Minimum: 3)",
                created_files.len()
            ));
        }
        decision
    }

    /// Check review output; synthesize a root cause when the reviewer
    /// only reported symptoms, and decide on a model switch.
    #[allow(clippy::too_many_arguments)]
    pub fn validate_review_output(
        &self,
        review_output: &str,
        review_verdict: &str,
        sandbox_result: &str,
        sandbox_failed: bool,
        current_files: &BTreeMap<String, String>,
        current_model: &str,
    ) -> ValidationDecision {
        self.sink.emit(
            "Orchestrator",
            "Analysis",
            "Pruefe Review-Output und Sandbox-Ergebnis...",
        );

        if review_verdict == "OK" && !sandbox_failed {
            return ValidationDecision::proceed("tester");
        }

        let error_content = if sandbox_failed {
            sandbox_result
        } else {
            review_output
        };
        let error_hash = hash_error(error_content);

        let root_cause = if has_root_cause(review_output) {
            review_output.to_string()
        } else {
            self.sink.emit(
                "Orchestrator",
                "Working",
                "Reviewer lieferte keine Ursachenanalyse - fuehre eigene Analyse durch...",
            );
            analyze_root_cause(error_content, current_files)
        };

        self.record_error_attempt("coder", &error_hash, current_model);
        let model_switch = self.should_switch_model("coder", &error_hash, current_model);

        let feedback =
            build_structured_feedback(&root_cause, sandbox_result, review_output, sandbox_failed);
        let affected_files = find_affected_files(error_content, current_files);

        ValidationDecision {
            action: if model_switch {
                ValidatorAction::ModelSwitch
            } else {
                ValidatorAction::Fix
            },
            target_agent: "coder".to_string(),
            feedback,
            root_cause: Some(root_cause),
            affected_files,
            model_switch_recommended: model_switch,
            error_hash: Some(error_hash),
            issues: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Check security findings; only critical/high block.
    pub fn validate_security_output(
        &self,
        vulnerabilities: &[Vulnerability],
        current_model: &str,
    ) -> ValidationDecision {
        self.sink.emit(
            "Orchestrator",
            "Analysis",
            format!("Pruefe Security-Scan ({} Findings)...", vulnerabilities.len()),
        );

        let critical: Vec<&Vulnerability> =
            vulnerabilities.iter().filter(|v| v.is_blocking()).collect();
        if critical.is_empty() {
            return ValidationDecision::proceed("final");
        }

        let summary: String = critical
            .iter()
            .take(3)
            .map(|v| v.description.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let error_hash = hash_error(&format!("security:{summary}"));

        self.record_error_attempt("security", &error_hash, current_model);
        let model_switch = self.should_switch_model("security", &error_hash, current_model);

        let mut lines = vec!["⚠️ KRITISCHE SECURITY-VULNERABILITIES GEFUNDEN\n".to_string()];
        for (i, vulnerability) in critical.iter().take(5).enumerate() {
            lines.push(format!(
                "{}. [{}] {}",
                i + 1,
                vulnerability.severity.to_uppercase(),
                vulnerability.description
            ));
            if !vulnerability.fix.is_empty() {
                lines.push(format!("   → LÖSUNG: {}", vulnerability.fix));
            }
            lines.push(String::new());
        }
        lines.push(
            "WICHTIG: Alle Security-Issues muessen behoben werden bevor das Projekt akzeptiert wird."
                .to_string(),
        );

        ValidationDecision {
            action: if model_switch {
                ValidatorAction::ModelSwitch
            } else {
                ValidatorAction::Fix
            },
            target_agent: "coder".to_string(),
            feedback: lines.join("\n"),
            root_cause: None,
            affected_files: critical
                .iter()
                .filter_map(|v| v.affected_file.clone())
                .collect(),
            model_switch_recommended: model_switch,
            error_hash: Some(error_hash),
            issues: vec![format!("{} kritische Security-Issues", critical.len())],
            warnings: Vec::new(),
        }
    }

    fn record_error_attempt(&self, agent_role: &str, error_hash: &str, current_model: &str) {
        if error_hash.is_empty() {
            return;
        }
        let mut counts = self.error_counts.lock().expect("error counts mutex");
        let key = format!("{current_model}:{error_hash}");
        let entry = counts
            .entry(agent_role.to_string())
            .or_default()
            .entry(key)
            .or_insert(0);
        *entry += 1;
        if *entry >= self.max_same_error {
            self.sink.emit(
                "Orchestrator",
                "ModelSwitchDecision",
                format!(
                    "Modell {current_model} hat Fehler {} {}x versucht - Wechsel empfohlen",
                    &error_hash[..8.min(error_hash.len())],
                    entry
                ),
            );
        }
    }

    fn should_switch_model(&self, agent_role: &str, error_hash: &str, current_model: &str) -> bool {
        if error_hash.is_empty() {
            return false;
        }
        let counts = self.error_counts.lock().expect("error counts mutex");
        let key = format!("{current_model}:{error_hash}");
        counts
            .get(agent_role)
            .and_then(|agent| agent.get(&key))
            .map(|n| *n >= self.max_same_error)
            .unwrap_or(false)
    }

    /// Reset the counters for a resolved error.
    pub fn mark_error_resolved(&self, agent_role: &str, error_hash: &str) {
        let mut counts = self.error_counts.lock().expect("error counts mutex");
        if let Some(agent) = counts.get_mut(agent_role) {
            agent.retain(|key, _| !key.contains(error_hash));
        }
    }
}

/// Whether the review already contains a root-cause analysis (two or more
/// indicator phrases).
pub fn has_root_cause(review_output: &str) -> bool {
    if review_output.is_empty() {
        return false;
    }
    let lower = review_output.to_lowercase();
    ROOT_CAUSE_INDICATORS
        .iter()
        .filter(|ind| lower.contains(*ind))
        .count()
        >= 2
}

/// Files whose name (with or without extension) appears in the error
/// output.
pub fn find_affected_files(
    error_output: &str,
    code_files: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut affected = Vec::new();
    for filename in code_files.keys() {
        if error_output.contains(filename.as_str()) {
            affected.push(filename.clone());
            continue;
        }
        let without_ext = filename.rsplit_once('.').map(|(n, _)| n).unwrap_or(filename);
        if !without_ext.is_empty() && error_output.contains(without_ext) {
            affected.push(filename.clone());
        }
    }
    affected
}

/// Synthesize a root-cause analysis from the templates table.
pub fn analyze_root_cause(error_output: &str, code_files: &BTreeMap<String, String>) -> String {
    if error_output.is_empty() {
        return String::new();
    }

    let mut kind = "generic";
    let mut symptom = truncate_chars(error_output, 500);
    'outer: for (error_kind, patterns) in ERROR_PATTERNS.iter() {
        for pattern in patterns {
            if let Some(m) = pattern.find(error_output) {
                kind = error_kind;
                symptom = m.as_str().to_string();
                break 'outer;
            }
        }
    }

    let affected = find_affected_files(error_output, code_files);
    let files = if affected.is_empty() {
        "Nicht identifiziert".to_string()
    } else {
        affected.join(", ")
    };

    root_cause_template(kind, &symptom, &files)
}

/// Structured feedback for the coder: root cause first, truncated sandbox
/// and reviewer details after.
pub fn build_structured_feedback(
    root_cause: &str,
    sandbox_result: &str,
    review_output: &str,
    sandbox_failed: bool,
) -> String {
    let mut parts = Vec::new();
    if sandbox_failed {
        parts.push("⚠️ FEHLER ERKANNT - KORREKTUR ERFORDERLICH\n".to_string());
    } else {
        parts.push("📝 REVIEW-FEEDBACK\n".to_string());
    }

    if !root_cause.is_empty() {
        parts.push(root_cause.to_string());
    }
    if sandbox_failed && !sandbox_result.is_empty() {
        parts.push("\n--- SANDBOX-OUTPUT (Details) ---".to_string());
        parts.push(truncate_chars(sandbox_result, 1000));
    }
    if !review_output.is_empty() && !root_cause.contains(review_output) {
        parts.push("\n--- REVIEWER-KOMMENTAR ---".to_string());
        parts.push(truncate_chars(review_output, 500));
    }
    parts.join("\n")
}
