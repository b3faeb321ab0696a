//! CLI entry point for the dev loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use forge_agents::controller::{DevLoop, RunInput};
use forge_agents::provider::HttpProvider;
use forge_agents::telemetry::{init_tracing, MetricsRecorder};
use forge_engine::config::{RunConfig, TechBlueprint};
use forge_engine::events::EventSink;
use forge_engine::memory::{EncryptionKey, MemoryStore};
use forge_engine::router::{ModelPool, ModelRouter, Role};
use forge_engine::smoke::NullBrowser;

#[derive(Parser)]
#[command(
    name = "forge-agents",
    about = "Iterative multi-agent code generation: develop, review, test, repeat"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dev loop for a goal against a project workspace.
    Run {
        /// Natural-language goal for the project.
        #[arg(long)]
        goal: String,
        /// Path to the tech blueprint JSON.
        #[arg(long)]
        blueprint: PathBuf,
        /// Project workspace directory (created if missing).
        #[arg(long)]
        project: PathBuf,
        /// Optional TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Inspect the persistent memory.
    Memory {
        /// Filter lessons by tech tag.
        #[arg(long, default_value = "global")]
        tag: String,
        /// Optional TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let mut config = RunConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

fn memory_store(config: &RunConfig) -> Result<MemoryStore> {
    let path = PathBuf::from(&config.memory.path);
    if config.memory.encryption_enabled {
        let encoded = config
            .memory
            .encryption_key_base64
            .as_deref()
            .context("memory encryption enabled but no key configured")?;
        let key = EncryptionKey::from_base64(encoded).context("invalid memory encryption key")?;
        Ok(MemoryStore::with_encryption(path, key))
    } else {
        Ok(MemoryStore::new(path))
    }
}

/// Per-role pools from the config; roles without a pool share the coder's
/// (or an env-provided default model).
fn build_router(config: &RunConfig) -> Result<Arc<ModelRouter>> {
    let fallback_pool = config
        .models
        .get(&Role::Coder)
        .cloned()
        .or_else(|| {
            std::env::var("FORGE_MODEL")
                .ok()
                .map(|model| ModelPool::new(&model, &[]))
        })
        .context("no coder model pool configured (set [models.coder] or FORGE_MODEL)")?;

    let mut pools = HashMap::new();
    for role in Role::ALL {
        let pool = config
            .models
            .get(&role)
            .cloned()
            .unwrap_or_else(|| fallback_pool.clone());
        pools.insert(role, pool);
    }
    Ok(Arc::new(ModelRouter::new(pools)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            goal,
            blueprint,
            project,
            config,
        } => {
            let config = load_config(config.as_ref())?;
            let blueprint = TechBlueprint::load(&blueprint)
                .with_context(|| format!("failed to load blueprint {}", blueprint.display()))?;
            std::fs::create_dir_all(&project)
                .with_context(|| format!("cannot create workspace {}", project.display()))?;

            let base_url = std::env::var("FORGE_PROVIDER_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string());
            let api_key = std::env::var("FORGE_API_KEY").unwrap_or_default();
            let provider = Arc::new(HttpProvider::new(&base_url, &api_key));

            let router = build_router(&config)?;
            let sink = EventSink::new().shared();
            let memory = memory_store(&config)?;

            let recorder = MetricsRecorder::start(&goal);
            let dev_loop = DevLoop::new(
                config,
                provider,
                router,
                sink,
                memory,
                Arc::new(NullBrowser),
                None,
            );
            let input = RunInput {
                user_goal: goal,
                blueprint,
                project_path: project.clone(),
                pre_generated_files: Vec::new(),
            };
            let outcome = dev_loop.run(&input).await?;
            recorder.finish(
                &project,
                outcome.success,
                outcome.iterations_used,
                outcome.models_used.clone(),
            );

            if outcome.success {
                info!(
                    iterations = outcome.iterations_used,
                    "run finished successfully"
                );
                println!("✅ Erfolg nach {} Iteration(en)", outcome.iterations_used);
            } else {
                println!(
                    "❌ Kein Erfolg nach {} Iteration(en).\nLetztes Feedback:\n{}",
                    outcome.iterations_used, outcome.final_feedback
                );
                std::process::exit(1);
            }
        }
        Command::Memory { tag, config } => {
            let config = load_config(config.as_ref())?;
            let store = memory_store(&config)?;
            let lessons = store.get_lessons_for_prompt(&tag, 15)?;
            if lessons.is_empty() {
                println!("Keine Lektionen fuer Tag '{tag}'.");
            } else {
                println!("{lessons}");
            }
        }
    }

    Ok(())
}
