//! Container runtime access.
//!
//! One-shot containers run `install && test` as a single shell command so
//! both steps share state; a persistent container handle exposes `exec`
//! for reuse across iterations. Timeouts are enforced by the caller-side
//! kill, never trusted to the daemon.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::DockerConfig;

/// Errors from container execution.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("docker unavailable: {0}")]
    DockerUnavailable(String),

    #[error("subprocess failed to spawn: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Captured output of one containerized (or host) command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecResult {
    fn timed_out_after(duration: Duration) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: format!("Timeout nach {}s", duration.as_secs()),
            duration,
            timed_out: true,
        }
    }
}

async fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<ExecResult, SandboxError> {
    let start = Instant::now();
    command.kill_on_drop(true);
    let child = command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ExecResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(SandboxError::Spawn(e)),
        Err(_) => {
            // kill_on_drop reaps the child when the future is dropped.
            warn!(timeout_secs = timeout.as_secs(), "container command timed out");
            Ok(ExecResult::timed_out_after(timeout))
        }
    }
}

/// Handle to a long-lived container that survives iterations.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    /// Whether the container still accepts exec calls.
    async fn is_healthy(&self) -> bool;

    /// Run a shell command inside the container.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecResult, SandboxError>;
}

/// Persistent container addressed by name via `docker exec`.
pub struct NamedContainer {
    pub name: String,
}

#[async_trait]
impl ContainerHandle for NamedContainer {
    async fn is_healthy(&self) -> bool {
        let mut command = Command::new("docker");
        command.args(["inspect", "-f", "{{.State.Running}}", &self.name]);
        match run_with_timeout(command, Duration::from_secs(5)).await {
            Ok(result) => result.success && result.stdout.trim() == "true",
            Err(_) => false,
        }
    }

    async fn exec(&self, shell_command: &str, timeout: Duration) -> Result<ExecResult, SandboxError> {
        let mut command = Command::new("docker");
        command.args(["exec", &self.name, "sh", "-c", shell_command]);
        run_with_timeout(command, timeout).await
    }
}

/// One-shot container execution bound to a project directory.
pub struct DockerExecutor {
    project_path: PathBuf,
    image: String,
    config: DockerConfig,
}

impl DockerExecutor {
    pub fn new(project_path: &Path, image: &str, config: DockerConfig) -> Self {
        Self {
            project_path: project_path.to_path_buf(),
            image: image.to_string(),
            config,
        }
    }

    /// Whether the docker daemon responds.
    pub async fn is_docker_available(&self) -> bool {
        let mut command = Command::new("docker");
        command.args(["version", "--format", "{{.Server.Version}}"]);
        match run_with_timeout(command, Duration::from_secs(10)).await {
            Ok(result) => result.success,
            Err(e) => {
                debug!(error = %e, "docker probe failed");
                false
            }
        }
    }

    /// Run a shell command in a fresh `--rm` container with the project
    /// mounted read-write at /app and the configured resource caps.
    pub async fn run(&self, shell_command: &str, timeout: Duration) -> Result<ExecResult, SandboxError> {
        let mount = format!("{}:/app", self.project_path.display());
        let mut command = Command::new("docker");
        command.args([
            "run",
            "--rm",
            "-v",
            &mount,
            "-w",
            "/app",
            "--memory",
            &self.config.memory_limit,
            "--cpus",
            &self.config.cpu_limit,
            &self.image,
            "sh",
            "-c",
            shell_command,
        ]);
        run_with_timeout(command, timeout).await
    }

    /// Install dependencies and run tests in ONE container so the test
    /// step sees the installed packages.
    pub async fn install_and_test(
        &self,
        install_command: &str,
        test_command: &str,
    ) -> Result<ExecResult, SandboxError> {
        let combined = format!("{install_command} && {test_command}");
        let timeout =
            Duration::from_secs(self.config.timeout_install + self.config.timeout_test);
        self.run(&combined, timeout).await
    }
}

/// Run a shell command directly on the host, in the project directory.
pub async fn run_on_host(
    project_path: &Path,
    shell_command: &str,
    timeout: Duration,
) -> Result<ExecResult, SandboxError> {
    let mut command = Command::new("sh");
    command.args(["-c", shell_command]).current_dir(project_path);
    run_with_timeout(command, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_run_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_on_host(dir.path(), "echo hello && echo err >&2", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_host_run_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_on_host(dir.path(), "exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_host_run_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_on_host(dir.path(), "sleep 30", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.success);
        assert!(result.stderr.contains("Timeout"));
    }

    #[tokio::test]
    async fn test_host_run_in_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "present").unwrap();
        let result = run_on_host(dir.path(), "cat marker.txt", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "present");
    }
}
