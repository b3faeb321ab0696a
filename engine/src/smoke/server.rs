//! Server subprocess management for the smoke test.
//!
//! The server runs in its own process group so the whole tree can be
//! terminated: SIGTERM to the group, SIGKILL after a grace period.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::TechBlueprint;

/// Startup floor per framework family, in seconds. A blueprint may raise
/// its floor but never lower it.
const NODE_STARTUP_FLOOR_SECS: u64 = 90;
const PYTHON_STARTUP_FLOOR_SECS: u64 = 30;

const DEFAULT_PORT: u16 = 3000;
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors from server management.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no run command configured and none derivable")]
    NoRunCommand,

    #[error("server spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("port {0} not open after {1}s")]
    PortTimeout(u16, u64),
}

/// A running server subprocess.
pub struct ServerInfo {
    pub port: u16,
    pub url: String,
    child: Child,
    group_pid: Option<i32>,
}

/// Resolve the port: explicit blueprint port wins, then a `--port`/`-p`/
/// `:port` hint in the run command, then the project-type default.
pub fn detect_server_port(blueprint: &TechBlueprint) -> u16 {
    if let Some(port) = blueprint.server_port {
        return port;
    }

    if let Some(run_command) = &blueprint.run_command {
        let tokens: Vec<&str> = run_command.split_whitespace().collect();
        for (i, token) in tokens.iter().enumerate() {
            if (*token == "--port" || *token == "-p") && i + 1 < tokens.len() {
                if let Ok(port) = tokens[i + 1].parse() {
                    return port;
                }
            }
            if let Some(rest) = token.strip_prefix("--port=") {
                if let Ok(port) = rest.parse() {
                    return port;
                }
            }
        }
        if let Some(idx) = run_command.rfind(':') {
            if let Ok(port) = run_command[idx + 1..].trim().parse() {
                return port;
            }
        }
    }

    let fingerprint = blueprint.stack_fingerprint();
    if fingerprint.contains("flask") {
        5000
    } else if fingerprint.contains("fastapi") || fingerprint.contains("django") {
        8000
    } else {
        DEFAULT_PORT
    }
}

/// Startup timeout: framework floor, raisable by the blueprint or config.
/// Stacks outside the Node/Python families have no floor.
pub fn startup_timeout(blueprint: &TechBlueprint, configured_secs: u64) -> Duration {
    let floor = if blueprint.is_node_family() {
        NODE_STARTUP_FLOOR_SECS
    } else if blueprint.is_python() {
        PYTHON_STARTUP_FLOOR_SECS
    } else {
        0
    };
    let blueprint_secs = blueprint
        .server_startup_time_ms
        .map(|ms| ms.div_ceil(1000))
        .unwrap_or(0);
    Duration::from_secs(floor.max(blueprint_secs).max(configured_secs))
}

/// The command that starts the server.
pub fn resolve_run_command(blueprint: &TechBlueprint) -> Result<String, ServerError> {
    if let Some(run_command) = &blueprint.run_command {
        if !run_command.trim().is_empty() {
            return Ok(run_command.clone());
        }
    }
    let fingerprint = blueprint.stack_fingerprint();
    if fingerprint.contains("next") {
        Ok("npm run dev".to_string())
    } else if fingerprint.contains("flask") {
        Ok("python app.py".to_string())
    } else if fingerprint.contains("fastapi") {
        Ok("uvicorn main:app --port 8000".to_string())
    } else if blueprint.is_node_family() {
        Ok("npm start".to_string())
    } else {
        Err(ServerError::NoRunCommand)
    }
}

/// Poll until the TCP port accepts a connection or the timeout elapses.
pub async fn wait_for_port(port: u16, timeout: Duration) -> Result<(), ServerError> {
    let deadline = Instant::now() + timeout;
    let address = format!("127.0.0.1:{port}");
    loop {
        if TcpStream::connect(&address).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ServerError::PortTimeout(port, timeout.as_secs()));
        }
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}

/// Poll the URL until the app responds with real content: body longer
/// than 100 chars containing `<div` or `<html>`.
pub async fn wait_for_app_ready(url: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };

    loop {
        if let Ok(response) = client.get(url).send().await {
            if let Ok(body) = response.text().await {
                if body.len() > 100 && (body.contains("<div") || body.contains("<html>")) {
                    return true;
                }
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}

/// Spawn the server in a new process group and wait for its port.
pub async fn start_server(
    project_path: &Path,
    blueprint: &TechBlueprint,
    configured_timeout_secs: u64,
) -> Result<ServerInfo, ServerError> {
    let run_command = resolve_run_command(blueprint)?;
    let port = detect_server_port(blueprint);
    let timeout = startup_timeout(blueprint, configured_timeout_secs);

    info!(run_command, port, timeout_secs = timeout.as_secs(), "starting server");

    let mut std_command = std::process::Command::new("sh");
    std_command
        .args(["-c", &run_command])
        .current_dir(project_path)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_command.process_group(0);
    }

    let mut command = Command::from(std_command);
    command.kill_on_drop(true);
    let child = command.spawn()?;
    let group_pid = child.id().map(|id| id as i32);

    wait_for_port(port, timeout).await?;

    Ok(ServerInfo {
        port,
        url: format!("http://localhost:{port}"),
        child,
        group_pid,
    })
}

impl ServerInfo {
    /// Read whatever the server wrote so far, waiting at most `timeout`
    /// per pipe. The pipes stay usable, so a later capture picks up
    /// compile errors that arrive after the first page load.
    pub async fn capture_output(&mut self, timeout: Duration) -> String {
        use tokio::io::AsyncReadExt;

        let mut output = String::new();
        if let Some(stdout) = self.child.stdout.as_mut() {
            let mut buffer = vec![0u8; 8192];
            if let Ok(Ok(n)) = tokio::time::timeout(timeout, stdout.read(&mut buffer)).await {
                output.push_str(&String::from_utf8_lossy(&buffer[..n]));
            }
        }
        if let Some(stderr) = self.child.stderr.as_mut() {
            let mut buffer = vec![0u8; 8192];
            if let Ok(Ok(n)) = tokio::time::timeout(timeout, stderr.read(&mut buffer)).await {
                output.push('\n');
                output.push_str(&String::from_utf8_lossy(&buffer[..n]));
            }
        }
        output
    }

    /// SIGTERM the whole process group, SIGKILL stragglers after the
    /// grace period.
    pub async fn terminate(mut self) {
        if let Some(pid) = self.group_pid {
            signal_group(pid, "TERM").await;
            let waited = tokio::time::timeout(KILL_GRACE, self.child.wait()).await;
            if waited.is_err() {
                warn!(pid, "server ignored SIGTERM - sending SIGKILL");
                signal_group(pid, "KILL").await;
                let _ = self.child.kill().await;
            }
        } else {
            let _ = self.child.kill().await;
        }
        debug!("server terminated");
    }
}

/// Signal a process group through the `kill` utility (negative pid
/// addresses the group).
async fn signal_group(pid: i32, signal: &str) {
    let result = Command::new("kill")
        .args([format!("-{signal}"), format!("-{pid}")])
        .output()
        .await;
    if let Err(e) = result {
        debug!(pid, signal, error = %e, "group signal failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_port_wins() {
        let blueprint = TechBlueprint {
            server_port: Some(4321),
            run_command: Some("npm run dev --port 9999".to_string()),
            ..TechBlueprint::default()
        };
        assert_eq!(detect_server_port(&blueprint), 4321);
    }

    #[test]
    fn test_port_from_run_command() {
        let blueprint = TechBlueprint {
            run_command: Some("next dev --port 4000".to_string()),
            ..TechBlueprint::default()
        };
        assert_eq!(detect_server_port(&blueprint), 4000);

        let eq_form = TechBlueprint {
            run_command: Some("next dev --port=4100".to_string()),
            ..TechBlueprint::default()
        };
        assert_eq!(detect_server_port(&eq_form), 4100);
    }

    #[test]
    fn test_port_from_project_type() {
        let flask = TechBlueprint {
            language: "python".to_string(),
            project_type: "flask-app".to_string(),
            ..TechBlueprint::default()
        };
        assert_eq!(detect_server_port(&flask), 5000);

        let fastapi = TechBlueprint {
            language: "python".to_string(),
            project_type: "fastapi-service".to_string(),
            ..TechBlueprint::default()
        };
        assert_eq!(detect_server_port(&fastapi), 8000);

        assert_eq!(detect_server_port(&TechBlueprint::default()), 3000);
    }

    #[test]
    fn test_startup_floor_not_lowerable() {
        let node = TechBlueprint::default();
        // Configured below the floor: floor wins.
        assert_eq!(startup_timeout(&node, 10), Duration::from_secs(90));
        // Configured above: config wins.
        assert_eq!(startup_timeout(&node, 120), Duration::from_secs(120));

        let mut python = TechBlueprint {
            language: "python".to_string(),
            ..TechBlueprint::default()
        };
        assert_eq!(startup_timeout(&python, 0), Duration::from_secs(30));
        // Blueprint raises the floor.
        python.server_startup_time_ms = Some(45_000);
        assert_eq!(startup_timeout(&python, 0), Duration::from_secs(45));
    }

    #[test]
    fn test_resolve_run_command() {
        let explicit = TechBlueprint {
            run_command: Some("npm run dev".to_string()),
            ..TechBlueprint::default()
        };
        assert_eq!(resolve_run_command(&explicit).unwrap(), "npm run dev");

        let next = TechBlueprint {
            project_type: "nextjs-app".to_string(),
            run_command: None,
            ..TechBlueprint::default()
        };
        assert_eq!(resolve_run_command(&next).unwrap(), "npm run dev");

        let unknown = TechBlueprint {
            language: "cobol".to_string(),
            project_type: "mainframe".to_string(),
            run_command: None,
            ..TechBlueprint::default()
        };
        assert!(resolve_run_command(&unknown).is_err());
    }

    #[tokio::test]
    async fn test_wait_for_port_timeout() {
        // Port 1 is never open.
        let result = wait_for_port(1, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ServerError::PortTimeout(1, _))));
    }

    #[tokio::test]
    async fn test_wait_for_port_success() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let result = wait_for_port(port, Duration::from_secs(2)).await;
        assert!(result.is_ok());
        drop(listener);
    }
}
