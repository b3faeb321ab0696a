//! Run configuration and the technology blueprint.
//!
//! Loaded from TOML with every field defaulted, so a partial file (or none
//! at all) yields a working configuration. Environment variables override
//! the secrets that must not live in files.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::router::{ModelPool, Role};

/// Per-role LLM call timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentTimeouts {
    pub coder: u64,
    pub reviewer: u64,
    pub security: u64,
    pub tester: u64,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self {
            coder: 750,
            reviewer: 1200,
            security: 750,
            tester: 750,
        }
    }
}

impl AgentTimeouts {
    pub fn for_role(&self, role: Role) -> u64 {
        match role {
            Role::Coder => self.coder,
            Role::Reviewer => self.reviewer,
            Role::Security => self.security,
            Role::Tester => self.tester,
        }
    }
}

/// Parallel patch executor knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelPatchConfig {
    pub enabled: bool,
    pub min_files_for_parallel: usize,
    pub min_chars_for_parallel: usize,
    pub max_files_per_group: usize,
    pub max_chars_per_group: usize,
    pub max_concurrent_groups: usize,
}

impl Default for ParallelPatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_files_for_parallel: 2,
            min_chars_for_parallel: 8000,
            max_files_per_group: 3,
            max_chars_per_group: 15_000,
            max_concurrent_groups: 8,
        }
    }
}

/// Smoke-test gate knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmokeTestConfig {
    pub enabled: bool,
    /// Server startup timeout in seconds (framework floors may raise it).
    pub server_timeout: u64,
    /// Browser step timeout in milliseconds.
    pub playwright_timeout: u64,
    pub block_on_console_errors: bool,
}

impl Default for SmokeTestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_timeout: 90,
            playwright_timeout: 15_000,
            block_on_console_errors: false,
        }
    }
}

/// Second-opinion (Vier-Augen) review knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VierAugenConfig {
    pub enabled: bool,
    /// Treat a failed second opinion as agreement (true) or dissent.
    pub skip_on_error: bool,
    /// Fraction of the reviewer timeout granted to the second opinion.
    pub timeout_factor: f64,
}

impl Default for VierAugenConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            skip_on_error: true,
            timeout_factor: 0.5,
        }
    }
}

/// External specialist review mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalReviewMode {
    /// CRITICAL/HIGH findings restart the iteration.
    #[default]
    Blocking,
    /// Findings are logged but never block.
    Advisory,
}

/// External specialist (review bureau) knobs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExternalSpecialistsConfig {
    pub enabled: bool,
    pub mode: ExternalReviewMode,
    /// Seconds to wait for the external call before skipping it.
    pub timeout: Option<u64>,
}

/// Container runtime knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub enabled: bool,
    pub fallback_to_host: bool,
    pub memory_limit: String,
    pub cpu_limit: String,
    /// Install step timeout in seconds.
    pub timeout_install: u64,
    /// Test step timeout in seconds.
    pub timeout_test: u64,
    /// Image per project type ("node", "python", ...).
    pub images: HashMap<String, String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        let mut images = HashMap::new();
        images.insert("node".to_string(), "node:20-slim".to_string());
        images.insert("python".to_string(), "python:3.12-slim".to_string());
        Self {
            enabled: false,
            fallback_to_host: true,
            memory_limit: "2g".to_string(),
            cpu_limit: "2".to_string(),
            timeout_install: 300,
            timeout_test: 300,
            images,
        }
    }
}

/// Memory store location and optional encryption key (base64, 32 bytes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub path: String,
    pub encryption_enabled: bool,
    /// Resolved from `MEMORY_ENCRYPTION_KEY` when not set here.
    pub encryption_key_base64: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: "memory/global_memory.json".to_string(),
            encryption_enabled: false,
            encryption_key_base64: None,
        }
    }
}

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub agent_timeouts: AgentTimeouts,
    pub max_retries: u32,
    pub max_security_retries: u32,
    pub max_model_attempts: u32,
    pub max_reviewer_prompt_chars: usize,
    /// Prompt budget in tokens; chars ≈ tokens × 3.
    pub max_prompt_tokens: usize,
    /// Seconds between heartbeat emissions during an LLM call.
    pub heartbeat_interval: u64,
    pub parallel_patch: ParallelPatchConfig,
    pub smoke_test: SmokeTestConfig,
    pub vier_augen: VierAugenConfig,
    pub external_specialists: ExternalSpecialistsConfig,
    pub docker: DockerConfig,
    pub memory: MemoryConfig,
    /// Per-role model pools.
    pub models: HashMap<Role, ModelPool>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            agent_timeouts: AgentTimeouts::default(),
            max_retries: 3,
            max_security_retries: 3,
            max_model_attempts: 3,
            max_reviewer_prompt_chars: 400_000,
            max_prompt_tokens: 80_000,
            heartbeat_interval: 15,
            parallel_patch: ParallelPatchConfig::default(),
            smoke_test: SmokeTestConfig::default(),
            vier_augen: VierAugenConfig::default(),
            external_specialists: ExternalSpecialistsConfig::default(),
            docker: DockerConfig::default(),
            memory: MemoryConfig::default(),
            models: HashMap::new(),
        }
    }
}

impl RunConfig {
    /// Load from a TOML file; every missing field falls back to defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config: RunConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment overrides for secrets and ops toggles.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("MEMORY_ENCRYPTION_KEY") {
            if !key.is_empty() {
                self.memory.encryption_key_base64 = Some(key);
                self.memory.encryption_enabled = true;
            }
        }
        if let Ok(value) = std::env::var("FORGE_DOCKER_ENABLED") {
            self.docker.enabled = value == "1" || value.eq_ignore_ascii_case("true");
        }
    }

    /// Prompt character budget derived from the token budget.
    pub fn max_prompt_chars(&self) -> usize {
        self.max_prompt_tokens * 3
    }
}

/// The technology blueprint: a bag of options describing the target
/// project. Field names with a leading underscore keep the external JSON
/// contract of the planning layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TechBlueprint {
    pub language: String,
    pub project_type: String,
    pub framework: Option<String>,
    /// "web", "desktop" or "cli".
    pub app_type: String,
    pub requires_server: bool,
    pub server_port: Option<u16>,
    pub server_startup_time_ms: Option<u64>,
    pub install_command: Option<String>,
    pub run_command: Option<String>,
    pub test_command: Option<String>,
    #[serde(rename = "_source_template")]
    pub source_template: Option<String>,
    #[serde(rename = "_pinned_versions")]
    pub pinned_versions: HashMap<String, String>,
    /// Files the selected template guarantees; checked by the template
    /// structure validator when `source_template` is set.
    pub template_required_files: Vec<String>,
}

impl Default for TechBlueprint {
    fn default() -> Self {
        Self {
            language: "javascript".to_string(),
            project_type: "webapp".to_string(),
            framework: None,
            app_type: "web".to_string(),
            requires_server: true,
            server_port: None,
            server_startup_time_ms: None,
            install_command: None,
            run_command: None,
            test_command: None,
            source_template: None,
            pinned_versions: HashMap::new(),
            template_required_files: Vec::new(),
        }
    }
}

impl TechBlueprint {
    /// Load a blueprint from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Lower-cased view of the fields framework heuristics match on.
    pub fn stack_fingerprint(&self) -> String {
        format!(
            "{} {} {}",
            self.language.to_lowercase(),
            self.project_type.to_lowercase(),
            self.framework.as_deref().unwrap_or("").to_lowercase()
        )
    }

    /// Whether this looks like a Node-family project.
    pub fn is_node_family(&self) -> bool {
        let fp = self.stack_fingerprint();
        ["javascript", "typescript", "node", "next", "react", "vue"]
            .iter()
            .any(|kw| fp.contains(kw))
    }

    /// Whether this looks like a Python project.
    pub fn is_python(&self) -> bool {
        let fp = self.stack_fingerprint();
        ["python", "flask", "fastapi", "django"]
            .iter()
            .any(|kw| fp.contains(kw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = RunConfig::default();
        assert_eq!(config.agent_timeouts.coder, 750);
        assert_eq!(config.agent_timeouts.reviewer, 1200);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_model_attempts, 3);
        assert_eq!(config.max_reviewer_prompt_chars, 400_000);
        assert_eq!(config.max_prompt_tokens, 80_000);
        assert_eq!(config.max_prompt_chars(), 240_000);
        assert_eq!(config.parallel_patch.max_files_per_group, 3);
        assert_eq!(config.parallel_patch.max_chars_per_group, 15_000);
        assert!(config.docker.fallback_to_host);
    }

    #[test]
    fn test_partial_toml_loads() {
        let parsed: RunConfig = toml::from_str(
            r#"
            max_retries = 5

            [smoke_test]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(parsed.max_retries, 5);
        assert!(!parsed.smoke_test.enabled);
        // Untouched sections keep their defaults.
        assert_eq!(parsed.agent_timeouts.security, 750);
    }

    #[test]
    fn test_model_pools_from_toml() {
        let parsed: RunConfig = toml::from_str(
            r#"
            [models.coder]
            primary = "vendor/model-a"
            fallbacks = ["vendor/model-b"]
            tier_researcher = ["vendor/model-big"]
            "#,
        )
        .unwrap();
        let pool = parsed.models.get(&Role::Coder).unwrap();
        assert_eq!(pool.primary, "vendor/model-a");
        assert_eq!(pool.fallbacks, vec!["vendor/model-b".to_string()]);
        assert_eq!(pool.tier_researcher, vec!["vendor/model-big".to_string()]);
    }

    #[test]
    fn test_blueprint_underscore_fields() {
        let blueprint: TechBlueprint = serde_json::from_str(
            r#"{
                "language": "javascript",
                "project_type": "nextjs-app",
                "requires_server": true,
                "_source_template": "nextjs-base",
                "_pinned_versions": {"next": "14.2.3"}
            }"#,
        )
        .unwrap();
        assert_eq!(blueprint.source_template.as_deref(), Some("nextjs-base"));
        assert_eq!(
            blueprint.pinned_versions.get("next").map(String::as_str),
            Some("14.2.3")
        );
    }

    #[test]
    fn test_stack_detection() {
        let blueprint = TechBlueprint {
            language: "Python".to_string(),
            project_type: "flask-app".to_string(),
            ..TechBlueprint::default()
        };
        assert!(blueprint.is_python());
        assert!(!blueprint.is_node_family());

        let node = TechBlueprint::default();
        assert!(node.is_node_family());
    }
}
