//! Python-specific validation: circular imports, requirements sanity,
//! optional PyPI version existence checks.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use tracing::debug;

use super::ValidationResult;

static ABSOLUTE_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*import\s+([\w.]+)").unwrap());
static FROM_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*from\s+(\.*[\w.]*)\s+import\s").unwrap());

/// Front-end assets that are not Python packages but keep showing up in
/// LLM-generated requirements files.
const INVALID_PYPI_PACKAGES: &[&str] = &[
    "bootstrap",
    "jquery",
    "react",
    "react-dom",
    "vue",
    "angular",
    "tailwind",
    "tailwindcss",
    "node",
    "npm",
    "express",
    "webpack",
];

fn module_name(path: &str) -> String {
    path.trim_end_matches(".py")
        .trim_end_matches("/__init__")
        .replace('/', ".")
}

/// Resolve an imported dotted name against the workspace's modules.
fn resolve_import(import: &str, from_module: &str, modules: &HashMap<String, String>) -> Option<String> {
    if let Some(relative) = import.strip_prefix('.') {
        // `from .x import y` resolves against the importing package.
        let package = from_module.rsplit_once('.').map(|(p, _)| p).unwrap_or("");
        let candidate = if relative.is_empty() {
            package.to_string()
        } else if package.is_empty() {
            relative.to_string()
        } else {
            format!("{package}.{relative}")
        };
        return modules.contains_key(&candidate).then_some(candidate);
    }
    if modules.contains_key(import) {
        return Some(import.to_string());
    }
    // `import a.b` also matches module `a`.
    let root = import.split('.').next().unwrap_or(import);
    modules.contains_key(root).then(|| root.to_string())
}

/// DFS over the intra-project import graph; the first cycle found is
/// reported as an issue.
pub fn validate_circular_imports(files: &BTreeMap<String, String>) -> ValidationResult {
    let mut result = ValidationResult::passed("circular_imports");

    let modules: HashMap<String, String> = files
        .iter()
        .filter(|(path, _)| path.ends_with(".py"))
        .map(|(path, content)| (module_name(path), content.clone()))
        .collect();
    if modules.is_empty() {
        return result;
    }

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    for name in modules.keys() {
        nodes.insert(name.clone(), graph.add_node(name.clone()));
    }

    for (name, content) in &modules {
        let mut targets = Vec::new();
        for captures in ABSOLUTE_IMPORT.captures_iter(content) {
            targets.push(captures[1].to_string());
        }
        for captures in FROM_IMPORT.captures_iter(content) {
            targets.push(captures[1].to_string());
        }
        for target in targets {
            if let Some(resolved) = resolve_import(&target, name, &modules) {
                if resolved != *name {
                    graph.add_edge(nodes[name], nodes[&resolved], ());
                }
            }
        }
    }

    for component in kosaraju_scc(&graph) {
        if component.len() > 1 {
            let mut names: Vec<&str> = component.iter().map(|idx| graph[*idx].as_str()).collect();
            names.sort();
            result.issue(format!(
                "Zirkulaerer Import zwischen Modulen: {}",
                names.join(" -> ")
            ));
            break;
        }
    }

    result
}

/// Hardcoded blacklist check over requirements.txt.
pub fn validate_requirements(files: &BTreeMap<String, String>) -> ValidationResult {
    let mut result = ValidationResult::passed("requirements");
    let Some(requirements) = files.get("requirements.txt") else {
        return result;
    };

    for line in requirements.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let name = trimmed
            .split(['=', '<', '>', '~', '!', '['])
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        if INVALID_PYPI_PACKAGES.contains(&name.as_str()) {
            result.issue(format!(
                "'{name}' ist kein PyPI-Paket (Frontend-Asset) - aus requirements.txt entfernen"
            ));
        }
    }
    result
}

/// Pinned `package==version` lines from requirements.txt.
fn pinned_requirements(requirements: &str) -> Vec<(String, String)> {
    requirements
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            let (name, version) = trimmed.split_once("==")?;
            Some((name.trim().to_string(), version.trim().to_string()))
        })
        .collect()
}

/// Check pinned versions against the PyPI JSON endpoint.
///
/// A definite 404 is an issue (the pin does not exist); any transport
/// failure passes — the network must never block an offline run.
pub async fn validate_pypi_versions(files: &BTreeMap<String, String>) -> ValidationResult {
    let mut result = ValidationResult::passed("pypi_versions");
    let Some(requirements) = files.get("requirements.txt") else {
        return result;
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(_) => return result,
    };

    for (package, version) in pinned_requirements(requirements) {
        let url = format!("https://pypi.org/pypi/{package}/{version}/json");
        match client.head(&url).send().await {
            Ok(response) if response.status().as_u16() == 404 => {
                result.issue(format!(
                    "{package}=={version} existiert nicht auf PyPI (404)"
                ));
            }
            Ok(_) => {}
            Err(e) => {
                // Fail-open: network trouble is not a code defect.
                debug!(package, version, error = %e, "pypi check skipped");
            }
        }
    }

    result
}
