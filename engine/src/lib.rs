//! Iteration engine substrate for the autonomous dev loop.
//!
//! This crate holds the non-LLM half of the orchestrator:
//! - Event log bus for UI/telemetry consumers
//! - Persistent memory (lessons, constraints, history) with optional
//!   at-rest encryption
//! - Model router with rate-limit windows and per-error rotation
//! - Error classifier (pure predicates over provider errors and
//!   subprocess output)
//! - Context compressor (FULL / SUMMARY categorization with a summary
//!   cache)
//! - Patch planner (affected files, file status, missing files, mode
//!   decision)
//! - Pre-sandbox validators (truncation, references, structure, imports,
//!   circular imports)
//! - Sandbox orchestrator (container or host install + tests)
//! - Smoke-test gate (server start, readiness polling, browser probe)
//! - Project workspace I/O (`### FILENAME:` blobs, forbidden paths)
//!
//! The LLM-facing half — provider clients, the invoker, prompts and the
//! iteration controller — lives in the `forge-agents` crate on top of
//! these pieces.

pub mod classifier;
pub mod compressor;
pub mod config;
pub mod events;
pub mod feedback;
pub mod memory;
pub mod planner;
pub mod router;
pub mod sandbox;
pub mod smoke;
pub mod validators;
pub mod workspace;

// Re-export key event types
pub use events::{EventSink, LogEvent, SharedEventSink, WorkerState};

// Re-export classification types
pub use classifier::{classify, is_harmless_warning_only, ErrorClass};

// Re-export hashing helpers
pub use feedback::{feedback_signature, hash_error, normalize_error_text};

// Re-export memory types
pub use memory::{EncryptionKey, Lesson, MemoryDocument, MemoryError, MemoryStore};

// Re-export router types
pub use router::{ModelChoice, ModelPool, ModelRouter, Role, TierEscalation};

// Re-export configuration types
pub use config::{RunConfig, TechBlueprint};

// Re-export compressor types
pub use compressor::{CompressedFile, CompressorCache, ContextCompressor};

// Re-export planner types
pub use planner::{
    affected_files_from_feedback, decide_mode, detect_missing_files, is_targeted_fix, FileStatus,
    FileStatusDetector, IterationMode, MissingFile, ModeContext,
};

// Re-export validator types
pub use validators::{run_pre_sandbox_validators, PreSandboxReport, ValidationResult};

// Re-export sandbox types
pub use sandbox::{ContainerHandle, SandboxOrchestrator, SandboxOutcome, SandboxRun};

// Re-export smoke-test types
pub use smoke::{run_smoke_test, BrowserDriver, NullBrowser, PageProbe, SmokeTestResult};
