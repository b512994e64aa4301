// packages/fleet/src/runtime/process_manager.rs
//! Process manager for spawning and terminating agent processes
//!
//! Supports several runtimes:
//! - Native executables
//! - Python (python3)
//! - Node.js (node)
//! - Go (go run)

use crate::utils::errors::{FleetError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Supported process runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    Native,
    Python,
    NodeJs,
    Go,
}

impl ProcessType {
    /// Interpreter command for this runtime; `None` runs the entrypoint directly
    pub fn command(&self) -> Option<&'static str> {
        match self {
            ProcessType::Native => None,
            ProcessType::Python => Some("python3"),
            ProcessType::NodeJs => Some("node"),
            ProcessType::Go => Some("go"),
        }
    }

    /// Arguments placed before the entrypoint
    pub fn default_args(&self) -> Vec<&'static str> {
        match self {
            ProcessType::Native => vec![],
            ProcessType::Python => vec!["-u"], // Unbuffered, so signals flush per line
            ProcessType::NodeJs => vec![],
            ProcessType::Go => vec!["run"],
        }
    }
}

impl std::fmt::Display for ProcessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessType::Native => write!(f, "native"),
            ProcessType::Python => write!(f, "python"),
            ProcessType::NodeJs => write!(f, "nodejs"),
            ProcessType::Go => write!(f, "go"),
        }
    }
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Runtime used to launch the entrypoint
    pub process_type: ProcessType,

    /// Executable (native) or script path (interpreted runtimes)
    pub entrypoint: String,

    /// Arguments after the entrypoint
    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,

    /// File receiving the child's stderr; discarded when `None`
    pub stderr_log: Option<PathBuf>,
}

impl SpawnConfig {
    pub fn new(process_type: ProcessType, entrypoint: impl Into<String>) -> Self {
        Self {
            process_type,
            entrypoint: entrypoint.into(),
            args: vec![],
            work_dir: None,
            env_vars: vec![],
            stderr_log: None,
        }
    }
}

/// Process manager for spawning agent processes
#[derive(Default)]
pub struct ProcessManager {
    /// Paths to executables (cached)
    executable_paths: Mutex<HashMap<String, PathBuf>>,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a command name against PATH, caching the result
    fn find_executable(&self, command: &str) -> Result<PathBuf> {
        if command.contains(std::path::MAIN_SEPARATOR) {
            return Ok(PathBuf::from(command));
        }

        if let Some(path) = self.executable_paths.lock().get(command) {
            return Ok(path.clone());
        }

        match which::which(command) {
            Ok(path) => {
                info!("Found {} at {:?}", command, path);
                self.executable_paths
                    .lock()
                    .insert(command.to_string(), path.clone());
                Ok(path)
            }
            Err(e) => Err(FleetError::ProcessSpawnFailed(format!(
                "Executable '{}' not found in PATH: {}",
                command, e
            ))),
        }
    }

    /// Spawn a new process with stdout piped for agent signals
    pub fn spawn(&self, config: &SpawnConfig) -> Result<Child> {
        let mut command = match config.process_type.command() {
            Some(interpreter) => {
                let mut command = Command::new(self.find_executable(interpreter)?);
                command.args(config.process_type.default_args());
                command.arg(&config.entrypoint);
                command
            }
            None => Command::new(self.find_executable(&config.entrypoint)?),
        };

        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        let stderr = match &config.stderr_log {
            Some(path) => Stdio::from(open_log(path)?),
            None => Stdio::null(),
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            FleetError::ProcessSpawnFailed(format!(
                "Failed to spawn {} process '{}': {}",
                config.process_type, config.entrypoint, e
            ))
        })?;

        debug!("Process spawned with PID: {:?}", child.id());

        Ok(child)
    }

    /// Terminate a child: SIGTERM first, SIGKILL once `grace` has elapsed.
    ///
    /// Always reaps the child. Returns `None` only if the exit status could
    /// not be collected.
    pub async fn terminate(&self, child: &mut Child, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }

        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to PID {}", pid);
            if let Err(e) = send_signal(pid, nix::sys::signal::Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to PID {}: {}", pid, e);
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => return Some(status),
            Ok(Err(e)) => warn!("Error waiting for process: {}", e),
            Err(_) => debug!("Process did not exit within {:?}, sending SIGKILL", grace),
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill process: {}", e);
        }
        child.wait().await.ok()
    }

    /// True while `pid` exists (probed with signal 0)
    pub fn is_running(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| FleetError::RuntimeError(format!("Failed to send {}: {}", signal, e)))
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> SpawnConfig {
        let mut config = SpawnConfig::new(ProcessType::Native, "sh");
        config.args = vec!["-c".to_string(), script.to_string()];
        config
    }

    #[test]
    fn test_process_type_command() {
        assert_eq!(ProcessType::Native.command(), None);
        assert_eq!(ProcessType::Python.command(), Some("python3"));
        assert_eq!(ProcessType::NodeJs.command(), Some("node"));
        assert_eq!(ProcessType::Go.command(), Some("go"));
    }

    #[test]
    fn test_missing_executable() {
        let manager = ProcessManager::new();
        let config = SpawnConfig::new(ProcessType::Native, "definitely-not-a-real-binary-xyz");
        assert!(matches!(
            manager.spawn(&config),
            Err(FleetError::ProcessSpawnFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_passes_environment() {
        use tokio::io::AsyncReadExt;

        let manager = ProcessManager::new();
        let mut config = shell("echo $AGENT_ID");
        config.env_vars.push(("AGENT_ID".to_string(), "agent_x".to_string()));

        let mut child = manager.spawn(&config).unwrap();
        let mut out = String::new();
        child.stdout.take().unwrap().read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "agent_x");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let manager = ProcessManager::new();
        let mut child = manager.spawn(&shell("exec sleep 30")).unwrap();
        let pid = child.id().unwrap();
        assert!(manager.is_running(pid));

        let status = manager.terminate(&mut child, Duration::from_secs(5)).await;
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let manager = ProcessManager::new();
        // Ignores SIGTERM, so only SIGKILL ends it
        let mut child = manager
            .spawn(&shell("trap '' TERM; while true; do sleep 1; done"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let status = manager.terminate(&mut child, Duration::from_millis(200)).await;
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
