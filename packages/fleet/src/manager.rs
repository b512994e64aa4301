// packages/fleet/src/manager.rs
//! Fleet manager
//!
//! `AgentManager` owns every registry (templates, agents, processes, pools,
//! clusters) and is the only place where lifecycle transitions happen.
//! It is a cheap `Clone` over an `Arc`; background tasks hold a `Weak`
//! reference so dropping the last manager tears everything down.
//!
//! # Lifecycle
//!
//! ```text
//! INITIALIZING ──ready──► IDLE ◄──► BUSY
//!      │                    │         │
//!      ▼                    ▼         ▼
//!    ERROR ◄─heartbeat timeout─┘   OFFLINE (abnormal exit)
//!      │
//!      └──heartbeat──► IDLE         TERMINATED (stopped / clean exit)
//! ```
//!
//! Locks are never held across `.await`.

use crate::events::{AgentSignal, EventBus, FleetEvent};
use crate::monitoring::{spawn_periodic, HealthMonitor, HeartbeatMonitor, RestartBudget};
use crate::persistence::snapshot::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
use crate::registry::agent::{
    Agent, AgentErrorRecord, AgentHealth, AgentId, AgentStatus, ErrorKind, Severity,
};
use crate::registry::store::{AgentRegistry, TaskSample};
use crate::registry::template::{AgentOverrides, AgentTemplate, TemplateRegistry};
use crate::runtime::agent_runtime::{agent_spawn_config, AgentRuntime, ProcessEvent};
use crate::runtime::process_manager::ProcessManager;
use crate::runtime::resource_limiter::{ResourceLimiter, ResourceUsage};
use crate::scaling::agent_pool::{AgentPool, PoolOptions};
use crate::scaling::cluster::{AgentCluster, AssignmentStrategy};
use crate::scaling::policy::{PoolMetrics, ScalingDecision, ScalingPolicy};
use crate::utils::config::{FleetConfig, PersistenceBackend};
use crate::utils::errors::{FleetError, Result};
use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Fleet-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_agents: usize,
    pub agents_by_status: BTreeMap<AgentStatus, usize>,
    pub agents_by_type: BTreeMap<String, usize>,
    pub average_health: f64,
    pub total_tasks_completed: u64,
    pub total_tasks_failed: u64,
    pub running_processes: usize,
    pub templates: usize,
    pub pools: usize,
    pub clusters: usize,
}

struct ManagerInner {
    config: FleetConfig,
    templates: TemplateRegistry,
    agents: AgentRegistry,
    limiter: ResourceLimiter,
    launcher: Arc<ProcessManager>,
    processes: Mutex<HashMap<AgentId, AgentRuntime>>,
    pools: RwLock<HashMap<String, AgentPool>>,
    clusters: RwLock<HashMap<String, AgentCluster>>,
    events: EventBus,
    store: Arc<dyn SnapshotStore>,
    health: HealthMonitor,
    heartbeat: HeartbeatMonitor,
    restart_budget: RestartBudget,

    /// Agents with a restart in flight
    restarting: Mutex<HashSet<AgentId>>,

    /// Pending `start_agent` calls waiting for `agent-ready`
    ready_waiters: Mutex<HashMap<AgentId, oneshot::Sender<()>>>,

    /// Serialises capacity check + insert
    admission: Mutex<()>,

    process_tx: mpsc::UnboundedSender<ProcessEvent>,
    process_rx: Mutex<Option<mpsc::UnboundedReceiver<ProcessEvent>>>,
    shutdown: CancellationToken,
    initialized: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Removes the agent from the in-flight restart set when dropped
struct RestartGuard<'a> {
    restarting: &'a Mutex<HashSet<AgentId>>,
    agent_id: &'a str,
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.restarting.lock().remove(self.agent_id);
    }
}

#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

impl AgentManager {
    pub fn new(config: FleetConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let limiter = ResourceLimiter::default();
        let (process_tx, process_rx) = mpsc::unbounded_channel();

        let inner = ManagerInner {
            health: HealthMonitor::new(config.health.clone(), limiter),
            heartbeat: HeartbeatMonitor::new(&config.heartbeat),
            restart_budget: RestartBudget::new(
                config.health.max_restarts,
                config.health.restart_window(),
            ),
            templates: TemplateRegistry::new(),
            agents: AgentRegistry::new(),
            limiter,
            launcher: Arc::new(ProcessManager::new()),
            processes: Mutex::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            clusters: RwLock::new(HashMap::new()),
            events: EventBus::default(),
            store,
            restarting: Mutex::new(HashSet::new()),
            ready_waiters: Mutex::new(HashMap::new()),
            admission: Mutex::new(()),
            process_tx,
            process_rx: Mutex::new(Some(process_rx)),
            shutdown: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Build a manager with the snapshot backend named in the config
    pub fn from_config(config: FleetConfig) -> Result<Self> {
        let store: Arc<dyn SnapshotStore> = match config.persistence.backend {
            PersistenceBackend::Memory => Arc::new(MemorySnapshotStore::new()),
            PersistenceBackend::Sqlite => {
                Arc::new(SqliteSnapshotStore::open(&config.persistence.path)?)
            }
        };
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Start the process-event dispatcher and the periodic monitors.
    /// Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.ensure_dispatcher();

        let config = &self.inner.config;
        let token = self.inner.shutdown.clone();
        let mut handles = Vec::new();

        let weak = Arc::downgrade(&self.inner);
        handles.push(spawn_periodic(
            "health-monitor",
            config.health.check_interval(),
            token.clone(),
            move || {
                let manager = upgrade(&weak);
                async move {
                    if let Some(manager) = manager {
                        manager.run_health_check().await;
                    }
                }
            },
        ));

        let weak = Arc::downgrade(&self.inner);
        handles.push(spawn_periodic(
            "heartbeat-monitor",
            config.heartbeat.check_interval(),
            token.clone(),
            move || {
                let manager = upgrade(&weak);
                async move {
                    if let Some(manager) = manager {
                        manager.run_heartbeat_check();
                    }
                }
            },
        ));

        if let Some(interval_ms) = config.scaling.autoscale_interval_ms {
            let weak = Arc::downgrade(&self.inner);
            handles.push(spawn_periodic(
                "autoscaler",
                Duration::from_millis(interval_ms),
                token,
                move || {
                    let manager = upgrade(&weak);
                    async move {
                        if let Some(manager) = manager {
                            manager.run_autoscale().await;
                        }
                    }
                },
            ));
        }

        self.inner.tasks.lock().extend(handles);

        match self.inner.store.purge_expired() {
            Ok(0) => {}
            Ok(n) => info!("Purged {} expired agent snapshots", n),
            Err(e) => warn!("Failed to purge expired snapshots: {}", e),
        }

        info!(
            health_interval_ms = config.health.check_interval_ms,
            heartbeat_interval_ms = config.heartbeat.check_interval_ms,
            "Agent manager initialized"
        );
        Ok(())
    }

    /// Stop background tasks and every agent process
    pub async fn shutdown(&self) {
        info!("Shutting down agent manager");
        self.inner.shutdown.cancel();

        let running: Vec<AgentId> = self
            .inner
            .agents
            .filter(|a| !a.status.is_terminal())
            .into_iter()
            .map(|a| a.id)
            .collect();

        let stops = running.iter().map(|id| async move {
            if let Err(e) = self.stop_agent(id, "shutdown").await {
                error!(agent_id = %id, "Failed to stop agent during shutdown: {}", e);
            }
        });
        join_all(stops).await;

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        info!("Agent manager stopped");
    }

    fn ensure_dispatcher(&self) {
        let Some(mut rx) = self.inner.process_rx.lock().take() else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => event,
                };
                let Some(event) = event else { break };
                let Some(manager) = upgrade(&weak) else { break };
                manager.dispatch(event);
            }
            debug!("Process event dispatcher stopped");
        });

        self.inner.tasks.lock().push(handle);
    }

    fn dispatch(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Signal { agent_id, signal } => {
                if let Err(e) = self.handle_signal(&agent_id, signal) {
                    debug!(agent_id = %agent_id, "Dropping signal: {}", e);
                }
            }
            ProcessEvent::Exited {
                agent_id,
                pid,
                code,
                success,
            } => self.handle_exit(&agent_id, pid, code, success),
            ProcessEvent::Fault { agent_id, message } => self.handle_fault(&agent_id, &message),
        }
    }

    // ------------------------------------------------------------------
    // Templates & creation
    // ------------------------------------------------------------------

    pub fn register_template(&self, template: AgentTemplate) -> Result<()> {
        self.inner.templates.register(template)
    }

    pub fn load_templates(&self, path: &Path) -> Result<usize> {
        let count = self.inner.templates.load_yaml_file(path)?;
        info!("Loaded {} templates from {:?}", count, path);
        Ok(count)
    }

    pub fn get_agent_templates(&self) -> Vec<Arc<AgentTemplate>> {
        self.inner.templates.list()
    }

    /// Create an `INITIALIZING` agent from a template
    pub fn create_agent(&self, template_name: &str, overrides: AgentOverrides) -> Result<AgentId> {
        let template = self
            .inner
            .templates
            .get(template_name)
            .ok_or_else(|| FleetError::TemplateNotFound(template_name.to_string()))?;
        overrides.validate()?;

        let max_agents = self.inner.config.manager.max_agents;
        let id = format!("agent_{}", Ulid::new());
        let agent = template.instantiate(id.clone(), &overrides, &self.inner.config.manager.data_dir);

        {
            let _admission = self.inner.admission.lock();
            self.inner.agents.insert(agent.clone(), max_agents)?;
        }

        self.persist(&agent);

        counter!("fleet_agents_created_total").increment(1);
        gauge!("fleet_agents").set(self.inner.agents.len() as f64);
        info!(agent_id = %id, template = %template_name, name = %agent.name, "Agent created");

        self.inner.events.publish(FleetEvent::Created {
            agent_id: id.clone(),
            template: template_name.to_string(),
        });
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the agent's process and wait for `agent-ready`
    pub async fn start_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self
            .get_agent(agent_id)
            .ok_or_else(|| FleetError::AgentNotFound(agent_id.to_string()))?;

        if !agent.status.can_start() {
            return Err(FleetError::InvalidTransition {
                agent_id: agent_id.to_string(),
                from: agent.status.to_string(),
                operation: "start",
            });
        }

        self.ensure_dispatcher();
        self.transition(agent_id, AgentStatus::Initializing);

        let (ready_tx, ready_rx) = oneshot::channel();
        self.inner
            .ready_waiters
            .lock()
            .insert(agent_id.to_string(), ready_tx);

        let pid = match self.launch(&agent) {
            Ok(pid) => pid,
            Err(e) => return Err(self.fail_start(agent_id, e).await),
        };

        let timeout = self.inner.config.lifecycle.startup_timeout();
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                let e = FleetError::ProcessSpawnFailed(format!(
                    "agent {} exited before reporting ready",
                    agent_id
                ));
                return Err(self.fail_start(agent_id, e).await);
            }
            Err(_) => {
                let e = FleetError::StartupTimeout {
                    agent_id: agent_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                return Err(self.fail_start(agent_id, e).await);
            }
        }

        self.inner.agents.update(agent_id, |e| {
            let now = Utc::now();
            e.agent.last_heartbeat = now;
            e.agent.last_activity = now;
        });

        if self
            .transition_when(agent_id, AgentStatus::Idle, |s| s == AgentStatus::Initializing)
            .is_none()
        {
            let status = self.inner.agents.status(agent_id);
            return Err(FleetError::RuntimeError(format!(
                "agent {} left INITIALIZING during startup (now {:?})",
                agent_id, status
            )));
        }

        if let Some(agent) = self.get_agent(agent_id) {
            self.persist(&agent);
        }

        counter!("fleet_agent_starts_total", "outcome" => "success").increment(1);
        info!(agent_id, ?pid, "Agent started");
        self.inner.events.publish(FleetEvent::Started {
            agent_id: agent_id.to_string(),
            pid,
        });
        Ok(())
    }

    /// Spawn the process and register its runtime
    fn launch(&self, agent: &Agent) -> Result<Option<u32>> {
        let template = self
            .inner
            .templates
            .get(&agent.template)
            .ok_or_else(|| FleetError::TemplateNotFound(agent.template.clone()))?;

        let startup = template.startup.as_ref().ok_or_else(|| {
            FleetError::ProcessSpawnFailed(format!(
                "template {} has no startup entrypoint",
                template.name
            ))
        })?;

        let spawn = agent_spawn_config(agent, startup)?;

        // Registered under the lock so the dispatcher cannot see the exit
        // of a process that is not in the table yet
        let mut processes = self.inner.processes.lock();
        let runtime = AgentRuntime::launch(
            &agent.id,
            &spawn,
            self.inner.launcher.clone(),
            self.inner.process_tx.clone(),
        )?;

        let pid = runtime.pid();
        processes.insert(agent.id.clone(), runtime);
        Ok(pid)
    }

    /// Kill whatever was spawned, mark the agent ERROR, hand back the error
    async fn fail_start(&self, agent_id: &str, error: FleetError) -> FleetError {
        // Stopped or removed while waiting; stop_agent already cleaned up
        if self.inner.agents.status(agent_id) != Some(AgentStatus::Initializing) {
            counter!("fleet_agent_starts_total", "outcome" => "aborted").increment(1);
            info!(agent_id, "Agent start aborted: {}", error);
            return FleetError::RuntimeError(format!(
                "agent {} was stopped during startup",
                agent_id
            ));
        }

        self.inner.ready_waiters.lock().remove(agent_id);

        let runtime = self.inner.processes.lock().remove(agent_id);
        if let Some(runtime) = runtime {
            runtime.shutdown(Duration::ZERO).await;
        }

        self.record_error(
            agent_id,
            AgentErrorRecord::new(
                agent_id,
                ErrorKind::InitializationError,
                Severity::Critical,
                error.to_string(),
                json!({ "operation": "start" }),
            ),
        );
        self.transition(agent_id, AgentStatus::Error);

        counter!("fleet_agent_starts_total", "outcome" => "failure").increment(1);
        error!(agent_id, "Agent failed to start: {}", error);
        error
    }

    /// Stop the agent's process; always ends TERMINATED
    pub async fn stop_agent(&self, agent_id: &str, reason: &str) -> Result<()> {
        let status = self
            .inner
            .agents
            .status(agent_id)
            .ok_or_else(|| FleetError::AgentNotFound(agent_id.to_string()))?;

        if status.is_terminal() {
            return Ok(());
        }

        // Held until TERMINATED so a pending start neither sees a late
        // ready signal nor fails before the status settles
        let ready_waiter = self.inner.ready_waiters.lock().remove(agent_id);

        let runtime = self.inner.processes.lock().remove(agent_id);
        if let Some(runtime) = runtime {
            let grace = self.inner.config.lifecycle.shutdown_timeout();
            match runtime.shutdown(grace).await {
                Some(exit) => debug!(agent_id, %exit, "Agent process exited"),
                None => warn!(agent_id, "Agent process exit status unavailable"),
            }
        }

        self.inner.agents.update(agent_id, |e| e.agent.workload.reset());
        self.transition(agent_id, AgentStatus::Terminated);
        drop(ready_waiter);

        if let Some(agent) = self.get_agent(agent_id) {
            self.persist(&agent);
        }

        info!(agent_id, reason, "Agent stopped");
        self.inner.events.publish(FleetEvent::Stopped {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Stop then start. Returns `Ok(false)` if a restart of the same agent
    /// is already in flight.
    pub async fn restart_agent(&self, agent_id: &str, reason: &str) -> Result<bool> {
        if !self.inner.agents.contains(agent_id) {
            return Err(FleetError::AgentNotFound(agent_id.to_string()));
        }

        if !self.inner.restarting.lock().insert(agent_id.to_string()) {
            debug!(agent_id, reason, "Restart already in progress");
            return Ok(false);
        }
        let _guard = RestartGuard {
            restarting: &self.inner.restarting,
            agent_id,
        };

        info!(agent_id, reason, "Restarting agent");
        self.stop_agent(agent_id, &format!("restart:{}", reason)).await?;

        self.inner
            .agents
            .update(agent_id, |e| e.agent.metrics.restart_count += 1);
        counter!("fleet_agent_restarts_total", "reason" => reason.to_string()).increment(1);

        self.start_agent(agent_id).await?;

        self.inner.events.publish(FleetEvent::Restarted {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// Stop (if needed) and forget the agent everywhere
    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        let status = self
            .inner
            .agents
            .status(agent_id)
            .ok_or_else(|| FleetError::AgentNotFound(agent_id.to_string()))?;

        if !status.is_terminal() {
            self.stop_agent(agent_id, "removed").await?;
        }

        self.inner.agents.remove(agent_id);

        {
            let mut pools = self.inner.pools.write();
            for pool in pools.values_mut() {
                if pool.remove(agent_id) {
                    gauge!("fleet_pool_size", "pool" => pool.id.clone())
                        .set(pool.current_size() as f64);
                }
            }
        }
        for cluster in self.inner.clusters.write().values_mut() {
            cluster.remove_member(agent_id);
        }

        self.inner.restart_budget.forget(agent_id);
        if let Err(e) = self.inner.store.delete(agent_id) {
            warn!(agent_id, "Failed to delete snapshot: {}", e);
        }

        gauge!("fleet_agents").set(self.inner.agents.len() as f64);
        info!(agent_id, "Agent removed");
        self.inner.events.publish(FleetEvent::Removed {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound signals and process events
    // ------------------------------------------------------------------

    /// Apply a signal reported by (or on behalf of) a running agent
    pub fn handle_signal(&self, agent_id: &str, signal: AgentSignal) -> Result<()> {
        if !self.inner.agents.contains(agent_id) {
            return Err(FleetError::AgentNotFound(agent_id.to_string()));
        }

        self.inner.agents.update(agent_id, |e| e.agent.touch());

        match signal {
            AgentSignal::AgentReady => {
                let waiter = self.inner.ready_waiters.lock().remove(agent_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => self.heartbeat(agent_id),
                }
            }
            AgentSignal::Heartbeat => self.heartbeat(agent_id),
            AgentSignal::AgentError { message } => {
                warn!(agent_id, %message, "Agent reported an error");
                self.record_error(
                    agent_id,
                    AgentErrorRecord::new(
                        agent_id,
                        ErrorKind::ExecutionError,
                        Severity::High,
                        message,
                        json!({ "source": "agent" }),
                    ),
                );
            }
            AgentSignal::TaskAssigned { task_id } => {
                self.inner
                    .agents
                    .update(agent_id, |e| e.agent.workload.assign());
                debug!(agent_id, %task_id, "Task assigned");
                self.transition_when(agent_id, AgentStatus::Busy, |s| s == AgentStatus::Idle);
            }
            AgentSignal::TaskCompleted {
                task_id,
                success,
                execution_time_ms,
            } => {
                let remaining = self.inner.agents.update(agent_id, |e| {
                    e.agent.workload.release();
                    e.agent.metrics.record_task(success, execution_time_ms);
                    e.push_task(TaskSample {
                        execution_time_ms,
                        success,
                        timestamp: Utc::now(),
                    });
                    e.agent.workload.current_tasks
                });
                debug!(agent_id, %task_id, success, execution_time_ms, "Task completed");
                if remaining == Some(0) {
                    self.transition_when(agent_id, AgentStatus::Idle, |s| s == AgentStatus::Busy);
                }
            }
            AgentSignal::ResourceUsage {
                memory_mb,
                cpu_percent,
                disk_mb,
                network_mbps,
            } => {
                let usage = ResourceUsage::new(memory_mb, cpu_percent, disk_mb, network_mbps);
                let violations = self
                    .inner
                    .agents
                    .update(agent_id, |e| {
                        let violations =
                            self.inner.limiter.violations(&e.agent.environment.limits, &usage);
                        e.push_usage(usage.clone());
                        violations
                    })
                    .unwrap_or_default();

                if !violations.is_empty() {
                    warn!(agent_id, ?violations, "Agent exceeded resource limits");
                    self.record_error(
                        agent_id,
                        AgentErrorRecord::new(
                            agent_id,
                            ErrorKind::ResourceError,
                            Severity::Medium,
                            violations.join("; "),
                            json!({
                                "memoryMb": memory_mb,
                                "cpuPercent": cpu_percent,
                                "diskMb": disk_mb,
                                "networkMbps": network_mbps,
                            }),
                        ),
                    );
                }
            }
        }

        Ok(())
    }

    fn heartbeat(&self, agent_id: &str) {
        self.inner
            .agents
            .update(agent_id, |e| e.agent.last_heartbeat = Utc::now());

        if self
            .transition_when(agent_id, AgentStatus::Idle, |s| s == AgentStatus::Error)
            .is_some()
        {
            info!(agent_id, "Agent recovered after heartbeat");
        }
    }

    fn handle_exit(&self, agent_id: &str, pid: Option<u32>, code: Option<i32>, success: bool) {
        // Only the exit of the currently registered process counts
        let runtime = {
            let mut processes = self.inner.processes.lock();
            match processes.get(agent_id) {
                Some(runtime) if runtime.pid() == pid => processes.remove(agent_id),
                Some(_) => {
                    debug!(agent_id, ?pid, "Ignoring exit of a replaced process");
                    return;
                }
                None => None,
            }
        };

        self.inner.events.publish(FleetEvent::ProcessExit {
            agent_id: agent_id.to_string(),
            code,
        });

        // Already detached by stop_agent or fail_start
        if runtime.is_none() {
            return;
        }

        // A start in progress observes the exit through its dropped waiter
        if self.inner.ready_waiters.lock().remove(agent_id).is_some() {
            warn!(agent_id, ?code, "Agent process exited during startup");
            return;
        }

        match self.inner.agents.status(agent_id) {
            None => {}
            Some(status) if status.is_terminal() => {}
            Some(_) if success => {
                info!(agent_id, "Agent process exited cleanly");
                self.inner.agents.update(agent_id, |e| e.agent.workload.reset());
                self.transition(agent_id, AgentStatus::Terminated);
            }
            Some(_) => {
                error!(agent_id, ?code, "Agent process exited unexpectedly");
                self.record_error(
                    agent_id,
                    AgentErrorRecord::new(
                        agent_id,
                        ErrorKind::ExecutionError,
                        Severity::High,
                        match code {
                            Some(code) => format!("process exited with code {}", code),
                            None => "process killed by signal".to_string(),
                        },
                        json!({ "exitCode": code }),
                    ),
                );
                self.inner.agents.update(agent_id, |e| e.agent.workload.reset());
                self.transition(agent_id, AgentStatus::Offline);
            }
        }
    }

    fn handle_fault(&self, agent_id: &str, message: &str) {
        error!(agent_id, %message, "Agent process fault");
        self.record_error(
            agent_id,
            AgentErrorRecord::new(
                agent_id,
                ErrorKind::ExecutionError,
                Severity::Critical,
                message,
                json!({ "source": "process" }),
            ),
        );
        self.inner.events.publish(FleetEvent::ProcessError {
            agent_id: agent_id.to_string(),
            message: message.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Health & heartbeat
    // ------------------------------------------------------------------

    /// Score one agent and act on the result
    pub async fn check_agent_health(&self, agent_id: &str) -> Result<AgentHealth> {
        let entry = self
            .inner
            .agents
            .entry(agent_id)
            .ok_or_else(|| FleetError::AgentNotFound(agent_id.to_string()))?;

        let report = self.inner.health.evaluate(&entry, Utc::now())?;
        let health = report.health;

        self.inner
            .agents
            .update(agent_id, |e| e.agent.health = health.clone());
        histogram!("fleet_agent_health").record(health.overall);

        if !health.issues.is_empty() {
            warn!(
                agent_id,
                overall = health.overall,
                issues = health.issues.len(),
                "Agent health degraded"
            );
            self.inner.events.publish(FleetEvent::HealthAlert {
                agent_id: agent_id.to_string(),
                overall: health.overall,
                issues: health.issues.clone(),
            });
        }

        if report.critical && entry.agent.status != AgentStatus::Initializing {
            self.auto_restart(&entry.agent, "health_critical");
        }

        Ok(health)
    }

    /// One health sweep over every non-terminal agent; returns how many
    /// were checked. A failed check zeroes that agent's score.
    pub async fn run_health_check(&self) -> usize {
        let ids: Vec<AgentId> = self
            .inner
            .agents
            .filter(|a| !a.status.is_terminal())
            .into_iter()
            .map(|a| a.id)
            .collect();

        let checks = ids.iter().map(|id| async move {
            (id, self.check_agent_health(id).await)
        });

        for (id, result) in join_all(checks).await {
            if let Err(e) = result {
                error!(agent_id = %id, "Health check failed: {}", e);
                self.inner.agents.update(id, |entry| {
                    entry.agent.health.overall = 0.0;
                    entry.agent.health.last_check = Utc::now();
                });
            }
        }

        ids.len()
    }

    /// One heartbeat sweep; returns the agents that timed out
    pub fn run_heartbeat_check(&self) -> Vec<AgentId> {
        let timeouts = self.inner.heartbeat.scan(&self.inner.agents, Utc::now());
        let mut timed_out = Vec::with_capacity(timeouts.len());

        for timeout in timeouts {
            let agent_id = timeout.agent_id.as_str();
            if self
                .transition_when(agent_id, AgentStatus::Error, |s| s.is_running())
                .is_none()
            {
                continue;
            }

            self.record_error(
                agent_id,
                AgentErrorRecord::new(
                    agent_id,
                    ErrorKind::CommunicationError,
                    Severity::High,
                    format!("no heartbeat for {}ms", timeout.silent_for_ms),
                    json!({ "lastHeartbeat": timeout.last_heartbeat }),
                ),
            );

            counter!("fleet_heartbeat_timeouts_total").increment(1);
            warn!(agent_id, silent_for_ms = timeout.silent_for_ms, "Agent heartbeat timeout");
            self.inner.events.publish(FleetEvent::HeartbeatTimeout {
                agent_id: timeout.agent_id.clone(),
                last_heartbeat: timeout.last_heartbeat,
            });

            if let Some(agent) = self.get_agent(agent_id) {
                self.auto_restart(&agent, "heartbeat_timeout");
            }
            timed_out.push(timeout.agent_id);
        }

        timed_out
    }

    /// Fire-and-forget restart, subject to config flags and the budget
    fn auto_restart(&self, agent: &Agent, reason: &'static str) -> bool {
        if !self.inner.config.health.auto_restart || !agent.config.auto_restart {
            debug!(agent_id = %agent.id, reason, "Auto-restart disabled");
            return false;
        }
        if self.inner.restarting.lock().contains(&agent.id) {
            return false;
        }
        if !self.inner.restart_budget.try_acquire(&agent.id) {
            error!(
                agent_id = %agent.id,
                reason,
                max_restarts = self.inner.config.health.max_restarts,
                "Restart budget exhausted, not restarting"
            );
            return false;
        }

        let manager = self.clone();
        let agent_id = agent.id.clone();
        tokio::spawn(async move {
            match manager.restart_agent(&agent_id, reason).await {
                Ok(true) => info!(agent_id = %agent_id, reason, "Automatic restart completed"),
                Ok(false) => debug!(agent_id = %agent_id, "Automatic restart skipped"),
                Err(e) => error!(agent_id = %agent_id, reason, "Automatic restart failed: {}", e),
            }
        });
        true
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Create a pool and fill it with `min_size` started agents
    pub async fn create_agent_pool(
        &self,
        name: &str,
        template_name: &str,
        options: PoolOptions,
    ) -> Result<String> {
        options.validate()?;
        let template = self
            .inner
            .templates
            .get(template_name)
            .ok_or_else(|| FleetError::TemplateNotFound(template_name.to_string()))?;

        let max_agents = self.inner.config.manager.max_agents;
        if self.inner.agents.len() + options.min_size > max_agents {
            return Err(FleetError::CapacityExceeded { max: max_agents });
        }

        let pool_id = format!("pool_{}", Ulid::new());
        let pool = AgentPool::new(
            pool_id.clone(),
            name,
            template.agent_type.clone(),
            template.name.clone(),
            &options,
        );
        self.inner.pools.write().insert(pool_id.clone(), pool);

        for _ in 0..options.min_size {
            if let Err(e) = self.grow_pool(&pool_id).await {
                self.discard_pool(&pool_id).await;
                return Err(e);
            }
        }

        gauge!("fleet_pool_size", "pool" => pool_id.clone()).set(options.min_size as f64);
        info!(pool_id = %pool_id, name, template = template_name, size = options.min_size, "Pool created");
        self.inner.events.publish(FleetEvent::PoolCreated {
            pool_id: pool_id.clone(),
            name: name.to_string(),
        });
        Ok(pool_id)
    }

    /// Undo a partially filled pool
    async fn discard_pool(&self, pool_id: &str) {
        let members = self.inner.pools.write().remove(pool_id).map(|p| p.members());
        for agent_id in members.unwrap_or_default() {
            if let Err(e) = self.remove_agent(&agent_id).await {
                warn!(pool_id, agent_id = %agent_id, "Failed to discard pool agent: {}", e);
            }
        }
        warn!(pool_id, "Pool creation failed, pool discarded");
    }

    /// Create, enlist and start one agent for the pool
    async fn grow_pool(&self, pool_id: &str) -> Result<AgentId> {
        let template = self
            .inner
            .pools
            .read()
            .get(pool_id)
            .map(|p| p.template.clone())
            .ok_or_else(|| FleetError::PoolNotFound(pool_id.to_string()))?;

        let agent_id = self.create_agent(&template, AgentOverrides::default())?;

        let enlisted = match self.inner.pools.write().get_mut(pool_id) {
            Some(pool) => {
                pool.add_available(agent_id.clone());
                true
            }
            None => false,
        };
        if !enlisted {
            return Err(FleetError::PoolNotFound(pool_id.to_string()));
        }

        if let Err(e) = self.start_agent(&agent_id).await {
            if let Err(remove_err) = self.remove_agent(&agent_id).await {
                warn!(agent_id = %agent_id, "Failed to discard unstarted pool agent: {}", remove_err);
            }
            return Err(e);
        }

        Ok(agent_id)
    }

    /// Grow or shrink a pool to `target_size`, one agent at a time.
    ///
    /// Not transactional: on failure the pool keeps whatever was done so
    /// far and the first error is returned.
    pub async fn scale_pool(&self, pool_id: &str, target_size: usize) -> Result<()> {
        let from = {
            let pools = self.inner.pools.read();
            let pool = pools
                .get(pool_id)
                .ok_or_else(|| FleetError::PoolNotFound(pool_id.to_string()))?;
            pool.check_target(target_size)?;
            pool.current_size()
        };

        let mut result = Ok(());

        if target_size > from {
            for _ in from..target_size {
                if let Err(e) = self.grow_pool(pool_id).await {
                    result = Err(e);
                    break;
                }
            }
        } else {
            for _ in target_size..from {
                let victim = self
                    .inner
                    .pools
                    .read()
                    .get(pool_id)
                    .and_then(|p| p.oldest_available().cloned());

                let Some(victim) = victim else {
                    result = Err(FleetError::RuntimeError(format!(
                        "pool {} has no available agents left to remove",
                        pool_id
                    )));
                    break;
                };
                if let Err(e) = self.remove_agent(&victim).await {
                    result = Err(e);
                    break;
                }
            }
        }

        let to = {
            let mut pools = self.inner.pools.write();
            let pool = pools
                .get_mut(pool_id)
                .ok_or_else(|| FleetError::PoolNotFound(pool_id.to_string()))?;
            pool.last_scaled_at = Some(Utc::now());
            pool.current_size()
        };

        gauge!("fleet_pool_size", "pool" => pool_id.to_string()).set(to as f64);
        info!(pool_id, from, to, target = target_size, "Pool scaled");
        self.inner.events.publish(FleetEvent::PoolScaled {
            pool_id: pool_id.to_string(),
            from,
            to,
        });
        result
    }

    pub fn get_pool(&self, pool_id: &str) -> Option<AgentPool> {
        self.inner.pools.read().get(pool_id).cloned()
    }

    pub fn get_all_pools(&self) -> Vec<AgentPool> {
        let mut pools: Vec<AgentPool> = self.inner.pools.read().values().cloned().collect();
        pools.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pools
    }

    pub fn attach_scaling_policy(&self, pool_id: &str, policy: ScalingPolicy) -> Result<()> {
        let mut pools = self.inner.pools.write();
        let pool = pools
            .get_mut(pool_id)
            .ok_or_else(|| FleetError::PoolNotFound(pool_id.to_string()))?;
        info!(pool_id, policy = %policy.name, "Scaling policy attached");
        pool.policy = Some(policy);
        Ok(())
    }

    /// Metrics the scaling rules look at
    pub fn pool_metrics(&self, pool_id: &str) -> Result<PoolMetrics> {
        let (members, utilization) = {
            let pools = self.inner.pools.read();
            let pool = pools
                .get(pool_id)
                .ok_or_else(|| FleetError::PoolNotFound(pool_id.to_string()))?;
            (pool.members(), pool.utilization())
        };

        let agents: Vec<Agent> = members.iter().filter_map(|id| self.get_agent(id)).collect();
        let (average_health, error_rate) = if agents.is_empty() {
            (1.0, 0.0)
        } else {
            let n = agents.len() as f64;
            (
                agents.iter().map(|a| a.health.overall).sum::<f64>() / n,
                agents.iter().map(|a| a.metrics.error_rate).sum::<f64>() / n,
            )
        };

        Ok(PoolMetrics {
            utilization,
            average_health,
            error_rate,
            size: members.len(),
        })
    }

    /// Advisory: what the pool's policy would do right now
    pub fn evaluate_scaling(&self, pool_id: &str) -> Result<Option<ScalingDecision>> {
        let metrics = self.pool_metrics(pool_id)?;
        let pools = self.inner.pools.read();
        let pool = pools
            .get(pool_id)
            .ok_or_else(|| FleetError::PoolNotFound(pool_id.to_string()))?;

        let decision = match &pool.policy {
            Some(policy) => policy.evaluate(&metrics, Utc::now()),
            None => self.derived_policy(pool).evaluate(&metrics, Utc::now()),
        };
        Ok(decision)
    }

    fn derived_policy(&self, pool: &AgentPool) -> ScalingPolicy {
        ScalingPolicy::from_thresholds(
            pool.scale_up_threshold,
            pool.scale_down_threshold,
            self.inner.config.scaling.default_cooldown_secs,
        )
    }

    /// Apply scaling decisions to every auto-scale pool
    pub async fn run_autoscale(&self) {
        let pool_ids: Vec<String> = self
            .inner
            .pools
            .read()
            .values()
            .filter(|p| p.auto_scale)
            .map(|p| p.id.clone())
            .collect();

        for pool_id in pool_ids {
            let decision = match self.evaluate_scaling(&pool_id) {
                Ok(Some(decision)) => decision,
                Ok(None) => continue,
                Err(e) => {
                    warn!(pool_id = %pool_id, "Scaling evaluation failed: {}", e);
                    continue;
                }
            };

            let target = {
                let mut pools = self.inner.pools.write();
                let Some(pool) = pools.get_mut(&pool_id) else {
                    continue;
                };
                let target = decision.target(pool.current_size(), pool.min_size, pool.max_size);
                if target == pool.current_size() {
                    continue;
                }
                if pool.policy.is_none() {
                    pool.policy = Some(self.derived_policy(pool));
                }
                if let Some(policy) = pool.policy.as_mut() {
                    policy.record_operation(Utc::now());
                }
                target
            };

            info!(pool_id = %pool_id, target, reason = %decision.reason, "Autoscaling pool");
            if let Err(e) = self.scale_pool(&pool_id, target).await {
                error!(pool_id = %pool_id, "Autoscale failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Clusters
    // ------------------------------------------------------------------

    pub fn create_cluster(
        &self,
        name: &str,
        member_ids: Vec<AgentId>,
        strategy: AssignmentStrategy,
        max_size: usize,
    ) -> Result<String> {
        if member_ids.is_empty() {
            return Err(FleetError::InvalidConfig(
                "a cluster needs at least one member".to_string(),
            ));
        }
        if let Some(missing) = member_ids.iter().find(|id| !self.inner.agents.contains(id)) {
            return Err(FleetError::AgentNotFound(missing.clone()));
        }

        let cluster_id = format!("cluster_{}", Ulid::new());
        let cluster = AgentCluster::new(cluster_id.clone(), name, member_ids, strategy, max_size)?;
        let coordinator = cluster.coordinator.clone().unwrap_or_default();

        self.inner
            .clusters
            .write()
            .insert(cluster_id.clone(), cluster);

        info!(cluster_id = %cluster_id, name, coordinator = %coordinator, "Cluster created");
        self.inner.events.publish(FleetEvent::ClusterCreated {
            cluster_id: cluster_id.clone(),
            coordinator,
        });
        Ok(cluster_id)
    }

    /// `Ok(false)` if the agent is already a member
    pub fn add_cluster_member(&self, cluster_id: &str, agent_id: &str) -> Result<bool> {
        if !self.inner.agents.contains(agent_id) {
            return Err(FleetError::AgentNotFound(agent_id.to_string()));
        }
        let mut clusters = self.inner.clusters.write();
        let cluster = clusters
            .get_mut(cluster_id)
            .ok_or_else(|| FleetError::ClusterNotFound(cluster_id.to_string()))?;
        cluster.add_member(agent_id.to_string())
    }

    /// Pick a member by the cluster's strategy
    pub fn select_cluster_agent(
        &self,
        cluster_id: &str,
        capability: Option<&str>,
    ) -> Result<Option<AgentId>> {
        let members = self
            .inner
            .clusters
            .read()
            .get(cluster_id)
            .map(|c| c.members.clone())
            .ok_or_else(|| FleetError::ClusterNotFound(cluster_id.to_string()))?;

        let agents: Vec<Agent> = members.iter().filter_map(|id| self.get_agent(id)).collect();

        let mut clusters = self.inner.clusters.write();
        let cluster = clusters
            .get_mut(cluster_id)
            .ok_or_else(|| FleetError::ClusterNotFound(cluster_id.to_string()))?;
        Ok(cluster.select(&agents, capability))
    }

    pub fn get_cluster(&self, cluster_id: &str) -> Option<AgentCluster> {
        self.inner.clusters.read().get(cluster_id).cloned()
    }

    pub fn get_all_clusters(&self) -> Vec<AgentCluster> {
        let mut clusters: Vec<AgentCluster> =
            self.inner.clusters.read().values().cloned().collect();
        clusters.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        clusters
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.inner.agents.get(agent_id)
    }

    pub fn get_all_agents(&self) -> Vec<Agent> {
        self.inner.agents.list()
    }

    pub fn get_agents_by_type(&self, agent_type: &str) -> Vec<Agent> {
        self.inner.agents.filter(|a| a.agent_type == agent_type)
    }

    pub fn get_agents_by_status(&self, status: AgentStatus) -> Vec<Agent> {
        self.inner.agents.filter(|a| a.status == status)
    }

    pub fn get_agent_health(&self, agent_id: &str) -> Option<AgentHealth> {
        self.inner.agents.get(agent_id).map(|a| a.health)
    }

    /// True if a process handle is registered for the agent
    pub fn has_process(&self, agent_id: &str) -> bool {
        self.inner.processes.lock().contains_key(agent_id)
    }

    pub fn get_system_stats(&self) -> SystemStats {
        let agents = self.inner.agents.list();

        let mut agents_by_status = BTreeMap::new();
        let mut agents_by_type = BTreeMap::new();
        for agent in &agents {
            *agents_by_status.entry(agent.status).or_insert(0) += 1;
            *agents_by_type.entry(agent.agent_type.clone()).or_insert(0) += 1;
        }

        let average_health = if agents.is_empty() {
            0.0
        } else {
            agents.iter().map(|a| a.health.overall).sum::<f64>() / agents.len() as f64
        };

        SystemStats {
            total_agents: agents.len(),
            agents_by_status,
            agents_by_type,
            average_health,
            total_tasks_completed: agents.iter().map(|a| a.metrics.tasks_completed).sum(),
            total_tasks_failed: agents.iter().map(|a| a.metrics.tasks_failed).sum(),
            running_processes: self
                .inner
                .processes
                .lock()
                .values()
                .filter_map(|runtime| runtime.pid())
                .filter(|pid| self.inner.launcher.is_running(*pid))
                .count(),
            templates: self.inner.templates.list().len(),
            pools: self.inner.pools.read().len(),
            clusters: self.inner.clusters.read().len(),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Re-register unexpired snapshots as TERMINATED agents
    pub fn restore_from_store(&self) -> Result<usize> {
        let snapshots = self.inner.store.list()?;
        let max_agents = self.inner.config.manager.max_agents;
        let mut restored = 0;

        let _admission = self.inner.admission.lock();
        for mut agent in snapshots {
            if self.inner.agents.contains(&agent.id) {
                continue;
            }
            agent.status = AgentStatus::Terminated;
            agent.workload.reset();

            if let Err(e) = self.inner.agents.insert(agent, max_agents) {
                warn!("Stopping snapshot restore: {}", e);
                break;
            }
            restored += 1;
        }

        gauge!("fleet_agents").set(self.inner.agents.len() as f64);
        info!("Restored {} agents from snapshots", restored);
        Ok(restored)
    }

    fn persist(&self, agent: &Agent) {
        let ttl = Duration::from_secs(self.inner.config.manager.snapshot_ttl_secs);
        if let Err(e) = self.inner.store.save(agent, ttl) {
            warn!(agent_id = %agent.id, "Failed to save snapshot: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn record_error(&self, agent_id: &str, record: AgentErrorRecord) {
        self.inner
            .agents
            .update(agent_id, |e| e.agent.record_error(record));
    }

    fn transition(&self, agent_id: &str, to: AgentStatus) -> Option<AgentStatus> {
        self.transition_when(agent_id, to, |_| true)
    }

    /// Move to `to` if the current status passes `allowed`. Returns the
    /// previous status when a change happened.
    fn transition_when(
        &self,
        agent_id: &str,
        to: AgentStatus,
        allowed: impl FnOnce(AgentStatus) -> bool,
    ) -> Option<AgentStatus> {
        let from = self
            .inner
            .agents
            .update(agent_id, |e| {
                let from = e.agent.status;
                if from != to && allowed(from) {
                    e.agent.status = to;
                    Some(from)
                } else {
                    None
                }
            })
            .flatten()?;

        {
            let mut pools = self.inner.pools.write();
            for pool in pools.values_mut() {
                if to == AgentStatus::Busy {
                    pool.mark_busy(agent_id);
                } else {
                    pool.mark_available(agent_id);
                }
            }
        }

        counter!("fleet_status_transitions_total", "to" => to.to_string()).increment(1);
        info!(agent_id, %from, %to, "Agent status changed");
        self.inner.events.publish(FleetEvent::StatusChanged {
            agent_id: agent_id.to_string(),
            from,
            to,
        });
        Some(from)
    }
}

fn upgrade(weak: &Weak<ManagerInner>) -> Option<AgentManager> {
    weak.upgrade().map(|inner| AgentManager { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::agent::IssueKind;
    use crate::runtime::resource_limiter::ResourceLimits;

    fn manager() -> AgentManager {
        let mut config = FleetConfig::default();
        config.manager.max_agents = 3;
        config.manager.data_dir = std::env::temp_dir().join("agent-fleet-unit");
        let manager = AgentManager::new(config, Arc::new(MemorySnapshotStore::new()));
        manager
            .register_template(AgentTemplate::new("coder", "worker"))
            .unwrap();
        manager
    }

    #[test]
    fn test_create_agent() {
        let manager = manager();
        let mut events = manager.subscribe();

        let id = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        assert!(id.starts_with("agent_"));

        let agent = manager.get_agent(&id).unwrap();
        assert_eq!(agent.status, AgentStatus::Initializing);
        assert_eq!(agent.health.overall, 1.0);
        assert!(manager.inner.store.load(&id).unwrap().is_some());
        assert_eq!(
            events.try_recv().unwrap(),
            FleetEvent::Created {
                agent_id: id,
                template: "coder".to_string()
            }
        );
    }

    #[test]
    fn test_create_validates_before_mutation() {
        let manager = manager();
        assert!(matches!(
            manager.create_agent("missing", AgentOverrides::default()),
            Err(FleetError::TemplateNotFound(_))
        ));

        for _ in 0..3 {
            manager.create_agent("coder", AgentOverrides::default()).unwrap();
        }
        assert!(matches!(
            manager.create_agent("coder", AgentOverrides::default()),
            Err(FleetError::CapacityExceeded { max: 3 })
        ));
        assert_eq!(manager.get_all_agents().len(), 3);
    }

    #[test]
    fn test_create_rejects_invalid_override_limits() {
        let manager = manager();
        let overrides = AgentOverrides {
            limits: Some(ResourceLimits {
                memory_limit_mb: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(matches!(
            manager.create_agent("coder", overrides),
            Err(FleetError::InvalidConfig(_))
        ));
        assert!(manager.get_all_agents().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_entrypoint_fails() {
        let manager = manager();
        let id = manager.create_agent("coder", AgentOverrides::default()).unwrap();

        let result = manager.start_agent(&id).await;
        assert!(matches!(result, Err(FleetError::ProcessSpawnFailed(_))));

        let agent = manager.get_agent(&id).unwrap();
        assert_eq!(agent.status, AgentStatus::Error);
        assert!(agent.has_error(ErrorKind::InitializationError));
        assert!(!manager.has_process(&id));
    }

    #[tokio::test]
    async fn test_start_from_idle_rejected() {
        let manager = manager();
        let id = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        manager.inner.agents.set_status(&id, AgentStatus::Idle);

        let result = manager.start_agent(&id).await;
        assert!(matches!(result, Err(FleetError::InvalidTransition { operation: "start", .. })));
    }

    #[tokio::test]
    async fn test_stop_terminated_is_noop() {
        let manager = manager();
        let id = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        manager.stop_agent(&id, "test").await.unwrap();
        assert_eq!(manager.get_agent(&id).unwrap().status, AgentStatus::Terminated);

        let mut events = manager.subscribe();
        manager.stop_agent(&id, "again").await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_task_signals_drive_busy_idle() {
        let manager = manager();
        let id = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        manager.inner.agents.set_status(&id, AgentStatus::Idle);

        manager
            .handle_signal(&id, AgentSignal::TaskAssigned { task_id: "t1".into() })
            .unwrap();
        manager
            .handle_signal(&id, AgentSignal::TaskAssigned { task_id: "t2".into() })
            .unwrap();
        assert_eq!(manager.get_agent(&id).unwrap().status, AgentStatus::Busy);

        let done = |task: &str| AgentSignal::TaskCompleted {
            task_id: task.into(),
            success: true,
            execution_time_ms: 100.0,
        };
        manager.handle_signal(&id, done("t1")).unwrap();
        assert_eq!(manager.get_agent(&id).unwrap().status, AgentStatus::Busy);
        manager.handle_signal(&id, done("t2")).unwrap();

        let agent = manager.get_agent(&id).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.workload.current_tasks, 0);
        assert_eq!(agent.metrics.tasks_completed, 2);
    }

    #[test]
    fn test_heartbeat_recovers_error() {
        let manager = manager();
        let id = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        manager.inner.agents.set_status(&id, AgentStatus::Error);

        manager.handle_signal(&id, AgentSignal::Heartbeat).unwrap();
        assert_eq!(manager.get_agent(&id).unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn test_resource_breach_recorded() {
        let manager = manager();
        let id = manager.create_agent("coder", AgentOverrides::default()).unwrap();

        manager
            .handle_signal(
                &id,
                AgentSignal::ResourceUsage {
                    memory_mb: 4096.0,
                    cpu_percent: 10.0,
                    disk_mb: 0.0,
                    network_mbps: 0.0,
                },
            )
            .unwrap();

        let agent = manager.get_agent(&id).unwrap();
        assert!(agent.has_error(ErrorKind::ResourceError));
        assert_eq!(agent.error_history.back().unwrap().severity, Severity::Medium);
    }

    #[test]
    fn test_signal_for_unknown_agent() {
        let manager = manager();
        assert!(matches!(
            manager.handle_signal("agent_nope", AgentSignal::Heartbeat),
            Err(FleetError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reliability_drop_reported() {
        let manager = manager();
        let id = manager.create_agent("coder", AgentOverrides::default()).unwrap();

        for (i, success) in [true, false, false, false].into_iter().enumerate() {
            manager
                .handle_signal(
                    &id,
                    AgentSignal::TaskCompleted {
                        task_id: format!("t{}", i),
                        success,
                        execution_time_ms: 100.0,
                    },
                )
                .unwrap();
        }

        let health = manager.check_agent_health(&id).await.unwrap();
        assert!(health.components.reliability < 0.5);
        assert!(health.overall < 1.0);
        assert!(health.issues.iter().any(|i| i.kind == IssueKind::Reliability));
        assert_eq!(manager.get_agent_health(&id).unwrap(), health);
    }

    #[tokio::test]
    async fn test_concurrent_restart_is_noop() {
        let manager = manager();
        let id = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        manager.inner.restarting.lock().insert(id.clone());

        assert!(!manager.restart_agent(&id, "test").await.unwrap());
        assert_eq!(manager.get_agent(&id).unwrap().status, AgentStatus::Initializing);
    }

    #[test]
    fn test_cluster_operations() {
        let manager = manager();
        let a = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        let b = manager.create_agent("coder", AgentOverrides::default()).unwrap();

        assert!(matches!(
            manager.create_cluster("team", vec!["agent_x".into()], AssignmentStrategy::RoundRobin, 3),
            Err(FleetError::AgentNotFound(_))
        ));

        let cluster_id = manager
            .create_cluster("team", vec![a.clone()], AssignmentStrategy::RoundRobin, 3)
            .unwrap();
        assert!(manager.add_cluster_member(&cluster_id, &b).unwrap());
        assert_eq!(manager.get_cluster(&cluster_id).unwrap().coordinator, Some(a.clone()));

        // Nobody is running yet
        assert_eq!(manager.select_cluster_agent(&cluster_id, None).unwrap(), None);

        manager.inner.agents.set_status(&b, AgentStatus::Idle);
        assert_eq!(
            manager.select_cluster_agent(&cluster_id, None).unwrap(),
            Some(b.clone())
        );
        assert!(matches!(
            manager.select_cluster_agent("cluster_missing", None),
            Err(FleetError::ClusterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_clears_membership() {
        let manager = manager();
        let a = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        let b = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        let cluster_id = manager
            .create_cluster("team", vec![a.clone(), b.clone()], AssignmentStrategy::LoadBased, 5)
            .unwrap();

        manager.remove_agent(&a).await.unwrap();

        assert!(manager.get_agent(&a).is_none());
        assert!(manager.inner.store.load(&a).unwrap().is_none());
        let cluster = manager.get_cluster(&cluster_id).unwrap();
        assert_eq!(cluster.members, vec![b.clone()]);
        assert_eq!(cluster.coordinator, Some(b));
    }

    #[test]
    fn test_restore_marks_terminated() {
        let store = Arc::new(MemorySnapshotStore::new());
        let first = AgentManager::new(FleetConfig::default(), store.clone());
        first
            .register_template(AgentTemplate::new("coder", "worker"))
            .unwrap();
        let id = first.create_agent("coder", AgentOverrides::default()).unwrap();
        first.inner.agents.set_status(&id, AgentStatus::Idle);
        first.persist(&first.get_agent(&id).unwrap());

        let second = AgentManager::new(FleetConfig::default(), store);
        assert_eq!(second.restore_from_store().unwrap(), 1);
        assert_eq!(second.get_agent(&id).unwrap().status, AgentStatus::Terminated);
        assert_eq!(second.restore_from_store().unwrap(), 0);
    }

    #[test]
    fn test_system_stats() {
        let manager = manager();
        let a = manager.create_agent("coder", AgentOverrides::default()).unwrap();
        manager.create_agent("coder", AgentOverrides::default()).unwrap();
        manager.inner.agents.set_status(&a, AgentStatus::Idle);

        let stats = manager.get_system_stats();
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.agents_by_status[&AgentStatus::Idle], 1);
        assert_eq!(stats.agents_by_status[&AgentStatus::Initializing], 1);
        assert_eq!(stats.agents_by_type["worker"], 2);
        assert_eq!(stats.average_health, 1.0);
        assert_eq!(stats.templates, 1);
        assert_eq!(stats.running_processes, 0);
    }
}
