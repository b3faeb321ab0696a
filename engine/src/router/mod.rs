//! Model router: per-role model selection with fallback queues.
//!
//! Tracks three kinds of exclusion:
//! - rate-limit windows (`not_before` per model, default 60 s backoff),
//! - permanent unavailability (irreversible within the process),
//! - per-error-hash tried-sets, so the same normalized failure rotates
//!   through the pool instead of ping-ponging between two models.
//!
//! The router is the only component whose state is mutated from both the
//! main loop and parallel patch workers; all access goes through one mutex.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default rate-limit backoff when the provider gave no duration.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

/// Agent roles the router selects models for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coder,
    Reviewer,
    Security,
    Tester,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Security => "security",
            Self::Tester => "tester",
        }
    }

    pub const ALL: [Role; 4] = [Role::Coder, Role::Reviewer, Role::Security, Role::Tester];
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tier-escalation hint set by the controller on unresolved ping-pong.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierEscalation {
    #[default]
    None,
    Coder,
    Researcher,
}

impl std::fmt::Display for TierEscalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Coder => write!(f, "coder"),
            Self::Researcher => write!(f, "researcher"),
        }
    }
}

/// Ordered model queue for one role, with optional higher-capability pools
/// used under tier escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPool {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// Pool used when the escalation hint is `coder`.
    #[serde(default)]
    pub tier_coder: Vec<String>,
    /// Pool used when the escalation hint is `researcher`.
    #[serde(default)]
    pub tier_researcher: Vec<String>,
}

impl ModelPool {
    pub fn new(primary: &str, fallbacks: &[&str]) -> Self {
        Self {
            primary: primary.to_string(),
            fallbacks: fallbacks.iter().map(|s| s.to_string()).collect(),
            tier_coder: Vec::new(),
            tier_researcher: Vec::new(),
        }
    }

    /// Ordered candidates for the given escalation hint: escalated pool
    /// first (when configured), then primary, then fallbacks.
    fn candidates(&self, tier: TierEscalation) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let escalated = match tier {
            TierEscalation::None => &[] as &[String],
            TierEscalation::Coder => &self.tier_coder,
            TierEscalation::Researcher => &self.tier_researcher,
        };
        for model in escalated {
            out.push(model.as_str());
        }
        if !out.contains(&self.primary.as_str()) {
            out.push(self.primary.as_str());
        }
        for model in &self.fallbacks {
            if !out.contains(&model.as_str()) {
                out.push(model.as_str());
            }
        }
        out
    }
}

/// A routed model plus whether the choice was degraded (every candidate was
/// excluded and the router fell back to the last resort).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub model: String,
    pub degraded: bool,
}

#[derive(Debug, Default)]
struct RouterState {
    rate_limited: HashMap<String, Instant>,
    permanently_unavailable: HashSet<String>,
    error_model_history: HashMap<String, HashSet<String>>,
    tier: TierEscalation,
}

/// Per-role model selection with rate-limit and error bookkeeping.
pub struct ModelRouter {
    pools: HashMap<Role, ModelPool>,
    default_backoff: Duration,
    state: Mutex<RouterState>,
}

impl ModelRouter {
    /// Create a router over per-role pools.
    pub fn new(pools: HashMap<Role, ModelPool>) -> Self {
        Self {
            pools,
            default_backoff: DEFAULT_BACKOFF,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Override the default rate-limit backoff (mainly for tests).
    pub fn with_default_backoff(mut self, backoff: Duration) -> Self {
        self.default_backoff = backoff;
        self
    }

    fn pool(&self, role: Role) -> &ModelPool {
        self.pools
            .get(&role)
            .unwrap_or_else(|| panic!("no model pool configured for role {role}"))
    }

    /// Current primary for `role`, skipping rate-limited (window not yet
    /// expired) and permanently-unavailable models. When every candidate is
    /// excluded, returns the role's primary marked `degraded`.
    pub fn get(&self, role: Role) -> ModelChoice {
        let state = self.state.lock().expect("router mutex poisoned");
        let now = Instant::now();
        let pool = self.pool(role);

        for model in pool.candidates(state.tier) {
            if state.permanently_unavailable.contains(model) {
                continue;
            }
            if let Some(not_before) = state.rate_limited.get(model) {
                if *not_before > now {
                    continue;
                }
            }
            return ModelChoice {
                model: model.to_string(),
                degraded: false,
            };
        }

        warn!(role = %role, "all models excluded - degraded last-resort choice");
        ModelChoice {
            model: pool.primary.clone(),
            degraded: true,
        }
    }

    /// A model for `role` that has not yet been tried for `error_hash`,
    /// preferring the current primary. When the whole pool has been tried,
    /// the tried-set is cleared and the primary is returned.
    pub fn get_for_error(&self, role: Role, error_hash: &str) -> String {
        let mut state = self.state.lock().expect("router mutex poisoned");
        let pool = self.pool(role);
        let tier = state.tier;

        let tried = state
            .error_model_history
            .get(error_hash)
            .cloned()
            .unwrap_or_default();

        for model in pool.candidates(tier) {
            if state.permanently_unavailable.contains(model) {
                continue;
            }
            if !tried.contains(model) {
                debug!(role = %role, error_hash, model, "untried model selected for error");
                return model.to_string();
            }
        }

        info!(role = %role, error_hash, "model pool exhausted for error - clearing tried-set");
        state.error_model_history.remove(error_hash);
        pool.primary.clone()
    }

    /// Pause a model for `duration` (default backoff when `None`).
    pub fn mark_rate_limited(&self, model: &str, duration: Option<Duration>) {
        let mut state = self.state.lock().expect("router mutex poisoned");
        let backoff = duration.unwrap_or(self.default_backoff);
        state
            .rate_limited
            .insert(model.to_string(), Instant::now() + backoff);
        debug!(model, backoff_secs = backoff.as_secs(), "model rate-limited");
    }

    /// Irreversibly exclude a model for the rest of the process. Used on
    /// explicit provider signals (free period ended, no endpoints found).
    pub fn mark_permanently_unavailable(&self, model: &str) {
        let mut state = self.state.lock().expect("router mutex poisoned");
        state.permanently_unavailable.insert(model.to_string());
        warn!(model, "model marked permanently unavailable");
    }

    /// Record that `model` attempted and failed on `error_hash`.
    pub fn mark_error_tried(&self, error_hash: &str, model: &str) {
        if error_hash.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("router mutex poisoned");
        state
            .error_model_history
            .entry(error_hash.to_string())
            .or_default()
            .insert(model.to_string());
    }

    /// Clear any transient rate-limit entry after a successful call.
    pub fn mark_success(&self, model: &str) {
        let mut state = self.state.lock().expect("router mutex poisoned");
        state.rate_limited.remove(model);
    }

    /// Whether the model is currently inside a rate-limit window.
    pub fn is_rate_limited(&self, model: &str) -> bool {
        let state = self.state.lock().expect("router mutex poisoned");
        state
            .rate_limited
            .get(model)
            .map(|not_before| *not_before > Instant::now())
            .unwrap_or(false)
    }

    /// Models already tried for an error hash.
    pub fn models_tried_for(&self, error_hash: &str) -> Vec<String> {
        let state = self.state.lock().expect("router mutex poisoned");
        let mut models: Vec<String> = state
            .error_model_history
            .get(error_hash)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        models.sort();
        models
    }

    /// Set the controller's tier-escalation hint.
    pub fn set_tier_escalation(&self, tier: TierEscalation) {
        let mut state = self.state.lock().expect("router mutex poisoned");
        if state.tier != tier {
            info!(tier = %tier, "tier escalation hint updated");
        }
        state.tier = tier;
    }

    /// Current tier-escalation hint.
    pub fn tier_escalation(&self) -> TierEscalation {
        self.state.lock().expect("router mutex poisoned").tier
    }
}
