//! LLM-backed agent orchestration for the autonomous dev loop.
//!
//! Built on top of `forge-engine`:
//! - [`provider`]: the LLM provider contract and HTTP client
//! - [`invoker`]: single-call abstraction with heartbeat + hard timeout
//! - [`prompts`]: role prompt assembly with staged token-budget trimming
//! - [`validator`]: the orchestrator validator (PROCEED / FIX /
//!   MODEL_SWITCH / ESCALATE)
//! - [`parallel`]: the parallel patch executor
//! - [`review`]: second-opinion and external review coordination
//! - [`utds`]: deterministic auto-fixes for known failure patterns
//! - [`controller`]: the iteration loop itself
//! - [`telemetry`]: tracing bootstrap and run metrics

pub mod controller;
pub mod invoker;
pub mod parallel;
pub mod prompts;
pub mod provider;
pub mod review;
pub mod telemetry;
pub mod utds;
pub mod validator;

// Re-export the run surface
pub use controller::{human_readable_verdict, DevLoop, RunInput, RunOutcome};

// Re-export provider types
pub use provider::{CompletionProvider, HttpProvider, LlmError, ScriptedProvider};

// Re-export invoker types
pub use invoker::{clean_model_output, Invoker};

// Re-export validator types
pub use validator::{
    extract_vulnerabilities, OrchestratorValidator, ValidationDecision, ValidatorAction,
    Vulnerability,
};

// Re-export review types
pub use review::{
    run_external_review, run_second_opinion, ExternalFinding, ExternalReviewer, FindingSeverity,
    SecondOpinionOutcome,
};

// Re-export parallel patch types
pub use parallel::{group_files_by_dependency, should_use_parallel_patch, ParallelPatchExecutor};
