// packages/fleet/src/runtime/mod.rs
//! Agent process runtime
//!
//! This module provides everything below the manager that touches an OS
//! process:
//!
//! - **Process Manager**: spawning and SIGTERM → SIGKILL termination (native, Python, Node.js, Go)
//! - **Agent Runtime**: per-agent supervisor and stdout signal pump
//! - **Resource Limiter**: limit validation, breach detection and headroom scoring
//!
//! # Architecture
//!
//! ```text
//!                 AgentManager
//!                      ▲
//!                      │ ProcessEvent (mpsc)
//!        ┌─────────────┼─────────────┐
//!        │             │             │
//!  ┌───────────┐ ┌───────────┐ ┌───────────┐
//!  │ Runtime A │ │ Runtime B │ │ Runtime C │  ...
//!  │  pump     │ │  pump     │ │  pump     │
//!  │  supervise│ │  supervise│ │  supervise│
//!  └─────┬─────┘ └─────┬─────┘ └─────┬─────┘
//!        │ stdout       │             │
//!   agent process  agent process  agent process
//! ```

pub mod agent_runtime;
pub mod process_manager;
pub mod resource_limiter;

// Re-export commonly used types
pub use agent_runtime::{agent_spawn_config, AgentRuntime, ProcessEvent};
pub use process_manager::{ProcessManager, ProcessType, SpawnConfig};
pub use resource_limiter::{ResourceLimiter, ResourceLimits, ResourceUsage};
