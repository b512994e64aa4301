// packages/fleet/src/runtime/agent_runtime.rs
//! Runtime for a single agent process
//!
//! Each launched agent gets two tasks:
//!
//! - a **signal pump** that reads stdout line by line and forwards parsed
//!   `AgentSignal`s on the process-event channel
//! - a **supervisor** that owns the `Child`, waits for it to exit, and on a
//!   stop request escalates SIGTERM → SIGKILL
//!
//! An exit nobody asked for is reported as `ProcessEvent::Exited`; a
//! requested stop is only reported back to the caller of `shutdown`.

use crate::events::AgentSignal;
use crate::registry::agent::{Agent, AgentId};
use crate::registry::template::StartupSpec;
use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::utils::errors::{FleetError, Result};
use futures::StreamExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, trace, warn};

/// Longest stdout line accepted from an agent
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Events delivered from agent processes to the manager
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// A signal parsed from the agent's stdout
    Signal { agent_id: AgentId, signal: AgentSignal },

    /// The process exited without being asked to
    Exited {
        agent_id: AgentId,
        pid: Option<u32>,
        code: Option<i32>,
        success: bool,
    },

    /// The process could not be observed (stdout failure, wait error)
    Fault { agent_id: AgentId, message: String },
}

/// A running agent process and its supervising tasks
pub struct AgentRuntime {
    agent_id: AgentId,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<Duration>>,
    done_rx: Option<oneshot::Receiver<Option<ExitStatus>>>,
    supervisor: JoinHandle<()>,
}

impl AgentRuntime {
    /// Spawn the agent process and start pumping its signals into `events`
    pub fn launch(
        agent_id: &str,
        spawn: &SpawnConfig,
        manager: Arc<ProcessManager>,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Self> {
        debug!(agent_id, "Spawning {:?} agent process", spawn.process_type);

        let mut child = manager.spawn(spawn)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FleetError::ProcessSpawnFailed("Failed to capture stdout".into()))?;

        let pid = child.id();
        let pump = tokio::spawn(pump_signals(agent_id.to_string(), stdout, events.clone()));

        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            agent_id.to_string(),
            pid,
            child,
            manager,
            pump,
            stop_rx,
            done_tx,
            events,
        ));

        Ok(Self {
            agent_id: agent_id.to_string(),
            pid,
            stop_tx: Some(stop_tx),
            done_rx: Some(done_rx),
            supervisor,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True while the supervisor still owns a live child
    pub fn is_alive(&self) -> bool {
        !self.supervisor.is_finished()
    }

    /// Stop the process, waiting at most `grace` before SIGKILL.
    ///
    /// Returns the exit status if one was collected. Never blocks longer
    /// than `grace` plus the time the kernel needs to reap a killed child.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        debug!(agent_id = %self.agent_id, "Shutting down agent process");

        if let Some(stop_tx) = self.stop_tx.take() {
            // Fails only if the process already exited
            let _ = stop_tx.send(grace);
        }

        match self.done_rx.take() {
            Some(done_rx) => done_rx.await.ok().flatten(),
            None => None,
        }
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        // Dropping `stop_tx` without sending makes the supervisor kill the
        // child immediately
        if self.stop_tx.is_some() {
            trace!(agent_id = %self.agent_id, "Agent runtime dropped while running");
        }
    }
}

/// Spawn settings for an agent's process.
///
/// Creates the agent's work, tmp and log directories. The process runs in
/// the work directory with `AGENT_*` variables plus the agent's own
/// variables, stderr goes to `<log_dir>/agent.log`, and the agent's config
/// is passed as a trailing `--config=<json>` argument.
pub fn agent_spawn_config(agent: &Agent, startup: &StartupSpec) -> Result<SpawnConfig> {
    let env = &agent.environment;
    for dir in [&env.working_dir, &env.temp_dir, &env.log_dir] {
        std::fs::create_dir_all(dir)?;
    }

    let config_json = serde_json::to_string(&agent.config)?;

    let mut spawn = SpawnConfig::new(env.runtime, startup.entrypoint.clone());
    spawn.args = startup.args.clone();
    spawn.args.push(format!("--config={}", config_json));
    spawn.work_dir = Some(env.working_dir.clone());
    spawn.stderr_log = Some(env.log_dir.join("agent.log"));

    spawn.env_vars = vec![
        ("AGENT_ID".to_string(), agent.id.clone()),
        ("AGENT_NAME".to_string(), agent.name.clone()),
        ("AGENT_TYPE".to_string(), agent.agent_type.clone()),
        ("AGENT_WORK_DIR".to_string(), env.working_dir.display().to_string()),
        ("AGENT_TEMP_DIR".to_string(), env.temp_dir.display().to_string()),
        ("AGENT_LOG_DIR".to_string(), env.log_dir.display().to_string()),
        ("AGENT_PERMISSIONS".to_string(), env.permissions.join(",")),
    ];
    spawn
        .env_vars
        .extend(env.variables.iter().map(|(k, v)| (k.clone(), v.clone())));

    Ok(spawn)
}

async fn pump_signals(
    agent_id: AgentId,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => match AgentSignal::parse_line(&line) {
                Some(signal) => {
                    let event = ProcessEvent::Signal {
                        agent_id: agent_id.clone(),
                        signal,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                None => trace!(agent_id = %agent_id, line = %line, "Ignoring agent output"),
            },
            Err(e) => {
                let _ = events.send(ProcessEvent::Fault {
                    agent_id: agent_id.clone(),
                    message: format!("stdout stream failed: {}", e),
                });
                break;
            }
        }
    }
}

async fn supervise(
    agent_id: AgentId,
    pid: Option<u32>,
    mut child: Child,
    manager: Arc<ProcessManager>,
    mut pump: JoinHandle<()>,
    stop_rx: oneshot::Receiver<Duration>,
    done_tx: oneshot::Sender<Option<ExitStatus>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    tokio::select! {
        status = child.wait() => {
            // Let buffered signals land before the exit is reported
            if tokio::time::timeout(Duration::from_secs(1), &mut pump).await.is_err() {
                pump.abort();
            }

            match status {
                Ok(status) => {
                    debug!(agent_id = %agent_id, %status, "Agent process exited");
                    let _ = events.send(ProcessEvent::Exited {
                        agent_id,
                        pid,
                        code: status.code(),
                        success: status.success(),
                    });
                    let _ = done_tx.send(Some(status));
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, "Error waiting for process: {}", e);
                    let _ = events.send(ProcessEvent::Fault {
                        agent_id,
                        message: format!("wait failed: {}", e),
                    });
                    let _ = done_tx.send(None);
                }
            }
        }
        grace = stop_rx => {
            let grace = grace.unwrap_or(Duration::ZERO);
            let status = manager.terminate(&mut child, grace).await;
            pump.abort();
            debug!(agent_id = %agent_id, ?status, "Agent process stopped");
            let _ = done_tx.send(status);
        }
    }
}
