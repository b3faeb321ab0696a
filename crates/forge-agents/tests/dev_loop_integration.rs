//! End-to-end dev-loop scenarios against a scripted provider.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use forge_agents::controller::{DevLoop, RunInput};
use forge_agents::provider::ScriptedProvider;
use forge_engine::config::{RunConfig, TechBlueprint};
use forge_engine::events::EventSink;
use forge_engine::memory::MemoryStore;
use forge_engine::router::{ModelPool, ModelRouter, Role};
use forge_engine::smoke::NullBrowser;

fn test_config(max_retries: u32) -> RunConfig {
    let mut config = RunConfig::default();
    config.max_retries = max_retries;
    config.smoke_test.enabled = false;
    config.docker.enabled = false;
    config.docker.timeout_install = 10;
    config.docker.timeout_test = 10;
    config
}

fn node_blueprint() -> TechBlueprint {
    TechBlueprint {
        language: "javascript".to_string(),
        project_type: "webapp".to_string(),
        requires_server: false,
        install_command: Some("true".to_string()),
        test_command: Some("true".to_string()),
        ..TechBlueprint::default()
    }
}

fn router() -> Arc<ModelRouter> {
    let mut pools = HashMap::new();
    pools.insert(Role::Coder, ModelPool::new("coder-a", &["coder-b"]));
    pools.insert(Role::Reviewer, ModelPool::new("rev-a", &["rev-b"]));
    pools.insert(Role::Security, ModelPool::new("sec-a", &[]));
    pools.insert(Role::Tester, ModelPool::new("test-a", &[]));
    Arc::new(ModelRouter::new(pools))
}

fn dev_loop(
    config: RunConfig,
    provider: Arc<ScriptedProvider>,
    memory_dir: &Path,
) -> DevLoop {
    DevLoop::new(
        config,
        provider,
        router(),
        EventSink::new().shared(),
        MemoryStore::new(memory_dir.join("memory.json")),
        Arc::new(NullBrowser),
        None,
    )
}

const INITIAL_APP: &str = "### FILENAME: app/page.js\n\
export default async function Page() {\n  const res = await fetch('/api/items');\n  return null;\n}\n\n\
### FILENAME: app/layout.js\n\
export default function Layout({ children }) {\n  return children;\n}\n\n\
### FILENAME: package.json\n\
{\"name\":\"demo\",\"dependencies\":{\"react\":\"18\",\"react-dom\":\"18\"}}\n";

const ROUTE_FIX: &str = "### FILENAME: app/api/items/route.js\n\
export async function GET() {\n  return Response.json([]);\n}\n";

#[tokio::test]
async fn test_missing_route_becomes_creation_order_and_gets_fixed() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(&project).unwrap();

    let provider = Arc::new(ScriptedProvider::new(vec![
        // Iteration 1
        Ok(INITIAL_APP.to_string()),
        Ok("FEEDBACK: Die Items-Liste laedt nicht, fetch('/api/items') liefert 404.".to_string()),
        Ok("KEINE".to_string()),
        // Iteration 2
        Ok(ROUTE_FIX.to_string()),
        Ok("OK".to_string()),
        Ok("KEINE".to_string()),
    ]));

    let dev_loop = dev_loop(test_config(3), provider.clone(), dir.path());
    let input = RunInput {
        user_goal: "Items-Liste anzeigen".to_string(),
        blueprint: node_blueprint(),
        project_path: project.clone(),
        pre_generated_files: Vec::new(),
    };

    let outcome = dev_loop.run(&input).await.unwrap();
    assert!(outcome.success, "feedback: {}", outcome.final_feedback);
    assert_eq!(outcome.iterations_used, 2);

    // The missing route was turned into an explicit creation order for
    // the second coder prompt, and the fix landed on disk.
    let calls = provider.calls();
    let second_coder_prompt = &calls[3].prompt;
    assert!(second_coder_prompt.contains("FEHLENDE DATEIEN"));
    assert!(second_coder_prompt.contains("app/api/items/route.js"));
    assert!(project.join("app/api/items/route.js").exists());
}

#[tokio::test]
async fn test_loop_bounded_by_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(&project).unwrap();

    // The reviewer never approves.
    let mut responses = Vec::new();
    for _ in 0..8 {
        responses.push(Ok(INITIAL_APP.to_string()));
        responses.push(Ok("FEEDBACK: TypeError in page.js bleibt bestehen".to_string()));
        responses.push(Ok("KEINE".to_string()));
    }
    let provider = Arc::new(ScriptedProvider::new(responses));

    let dev_loop = dev_loop(test_config(3), provider, dir.path());
    let input = RunInput {
        user_goal: "Ziel".to_string(),
        blueprint: node_blueprint(),
        project_path: project,
        pre_generated_files: Vec::new(),
    };

    let outcome = dev_loop.run(&input).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.iterations_used <= 3);
    assert!(!outcome.final_feedback.is_empty());
}

#[tokio::test]
async fn test_feedback_flows_into_next_coder_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(&project).unwrap();

    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(INITIAL_APP.to_string()),
        Ok("FEEDBACK: Die Sortierung in page.js ist verkehrt herum".to_string()),
        Ok("KEINE".to_string()),
        Ok(ROUTE_FIX.to_string()),
        Ok("OK".to_string()),
        Ok("KEINE".to_string()),
    ]));

    let dev_loop = dev_loop(test_config(2), provider.clone(), dir.path());
    let input = RunInput {
        user_goal: "Sortierte Liste".to_string(),
        blueprint: node_blueprint(),
        project_path: project,
        pre_generated_files: Vec::new(),
    };

    let outcome = dev_loop.run(&input).await.unwrap();
    assert!(outcome.success);

    let calls = provider.calls();
    // Call order: coder, reviewer, security, coder, reviewer, security.
    assert_eq!(calls.len(), 6);
    let second_coder_prompt = &calls[3].prompt;
    assert!(second_coder_prompt.contains("FEEDBACK ZUR LETZTEN ITERATION"));
    assert!(second_coder_prompt.contains("Sortierung"));
    // Patch mode after the first iteration.
    assert!(second_coder_prompt.contains("PATCH-MODUS"));
}

#[tokio::test]
async fn test_run_uses_configured_primary_models() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(&project).unwrap();

    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(INITIAL_APP.to_string()),
        Ok("OK".to_string()),
        Ok("KEINE".to_string()),
    ]));
    let dev_loop = dev_loop(test_config(2), provider.clone(), dir.path());
    let input = RunInput {
        user_goal: "Demo".to_string(),
        blueprint: node_blueprint(),
        project_path: project,
        pre_generated_files: Vec::new(),
    };
    let outcome = dev_loop.run(&input).await.unwrap();
    assert!(outcome.success);

    let calls = provider.calls();
    assert_eq!(calls[0].model, "coder-a");
    assert_eq!(calls[1].model, "rev-a");
    assert_eq!(calls[2].model, "sec-a");
    assert_eq!(outcome.models_used, vec!["coder-a".to_string()]);
}
