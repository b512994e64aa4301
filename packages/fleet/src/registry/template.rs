// packages/fleet/src/registry/template.rs
//! Agent templates
//!
//! A template is an immutable blueprint. Agents copy its capabilities,
//! config and environment at creation time, with caller overrides applied
//! field by field on top.

use crate::registry::agent::{
    Agent, AgentCapabilities, AgentConfig, AgentEnvironment, AgentHealth, AgentId, AgentMetrics,
    AgentStatus, Workload,
};
use crate::runtime::process_manager::ProcessType;
use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::{FleetError, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// How to launch the agent process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupSpec {
    pub entrypoint: String,

    #[serde(default)]
    pub args: Vec<String>,
}

/// Default environment of agents built from a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentDefaults {
    pub runtime: ProcessType,
    pub permissions: Vec<String>,
    pub variables: BTreeMap<String, String>,
}

impl Default for EnvironmentDefaults {
    fn default() -> Self {
        Self {
            runtime: ProcessType::Native,
            permissions: vec![],
            variables: BTreeMap::new(),
        }
    }
}

/// Immutable agent blueprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub name: String,

    #[serde(rename = "type")]
    pub agent_type: String,

    #[serde(default)]
    pub capabilities: AgentCapabilities,

    #[serde(default)]
    pub config: AgentConfig,

    #[serde(default)]
    pub environment: EnvironmentDefaults,

    #[serde(default)]
    pub startup: Option<StartupSpec>,
}

impl AgentTemplate {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities: AgentCapabilities::default(),
            config: AgentConfig::default(),
            environment: EnvironmentDefaults::default(),
            startup: None,
        }
    }

    pub fn with_startup(mut self, entrypoint: impl Into<String>, args: Vec<String>) -> Self {
        self.startup = Some(StartupSpec {
            entrypoint: entrypoint.into(),
            args,
        });
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Build a fresh `INITIALIZING` agent from this template
    pub fn instantiate(&self, id: AgentId, overrides: &AgentOverrides, data_dir: &Path) -> Agent {
        let now = Utc::now();

        let mut config = self.config.clone();
        overrides.config.apply(&mut config);

        let capabilities = overrides
            .capabilities
            .clone()
            .unwrap_or_else(|| self.capabilities.clone());

        let limits = overrides
            .limits
            .clone()
            .unwrap_or_else(|| capabilities.limits.clone());

        let mut variables = self.environment.variables.clone();
        variables.extend(overrides.variables.clone());

        let root = data_dir.join("agents").join(&id);
        let environment = AgentEnvironment {
            limits,
            permissions: overrides
                .permissions
                .clone()
                .unwrap_or_else(|| self.environment.permissions.clone()),
            runtime: self.environment.runtime,
            working_dir: root.join("work"),
            temp_dir: root.join("tmp"),
            log_dir: root.join("logs"),
            variables,
        };

        let name = overrides
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name, &id[id.len().saturating_sub(6)..]));

        Agent {
            name,
            agent_type: self.agent_type.clone(),
            template: self.name.clone(),
            status: AgentStatus::Initializing,
            capabilities,
            workload: Workload::new(config.max_concurrent_tasks),
            metrics: AgentMetrics::default(),
            health: AgentHealth::default(),
            environment,
            config,
            last_heartbeat: now,
            last_activity: now,
            created_at: now,
            error_history: VecDeque::new(),
            id,
        }
    }
}

/// Field-level config overrides; `None` keeps the template value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub autonomy_level: Option<f64>,
    pub max_concurrent_tasks: Option<u32>,
    pub task_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub auto_restart: Option<bool>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(v) = self.autonomy_level {
            config.autonomy_level = v;
        }
        if let Some(v) = self.max_concurrent_tasks {
            config.max_concurrent_tasks = v;
        }
        if let Some(v) = self.task_timeout_ms {
            config.task_timeout_ms = v;
        }
        if let Some(v) = self.heartbeat_interval_ms {
            config.heartbeat_interval_ms = v;
        }
        if let Some(v) = self.auto_restart {
            config.auto_restart = v;
        }
    }
}

/// Caller overrides applied on top of template defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOverrides {
    pub name: Option<String>,
    pub capabilities: Option<AgentCapabilities>,
    pub config: ConfigOverrides,
    pub limits: Option<ResourceLimits>,
    pub permissions: Option<Vec<String>>,

    /// Merged into the template's variables; these win on conflict
    pub variables: BTreeMap<String, String>,
}

impl AgentOverrides {
    /// Reject override limits that a template would not be allowed
    pub fn validate(&self) -> Result<()> {
        let limits = self
            .capabilities
            .iter()
            .map(|c| &c.limits)
            .chain(self.limits.as_ref());

        for limits in limits {
            limits
                .validate()
                .map_err(|reason| FleetError::InvalidConfig(format!("overrides: {}", reason)))?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct TemplateFile {
    templates: Vec<AgentTemplate>,
}

/// Named, immutable templates
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Arc<AgentTemplate>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template; names are unique and never replaced
    pub fn register(&self, template: AgentTemplate) -> Result<()> {
        if let Err(reason) = template.capabilities.limits.validate() {
            return Err(FleetError::InvalidConfig(format!(
                "template {}: {}",
                template.name, reason
            )));
        }

        let mut templates = self.templates.write();
        if templates.contains_key(&template.name) {
            return Err(FleetError::TemplateExists(template.name));
        }

        info!(template = %template.name, agent_type = %template.agent_type, "Template registered");
        templates.insert(template.name.clone(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentTemplate>> {
        self.templates.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.read().contains_key(name)
    }

    /// All templates, sorted by name
    pub fn list(&self) -> Vec<Arc<AgentTemplate>> {
        let mut templates: Vec<_> = self.templates.read().values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    /// Register every template in a YAML document of the form
    /// `templates: [ ... ]`. Returns how many were registered.
    pub fn load_yaml(&self, yaml: &str) -> Result<usize> {
        let file: TemplateFile = serde_yaml::from_str(yaml)?;
        let count = file.templates.len();
        for template in file.templates {
            self.register(template)?;
        }
        Ok(count)
    }

    pub fn load_yaml_file(&self, path: &Path) -> Result<usize> {
        let yaml = std::fs::read_to_string(path)?;
        self.load_yaml(&yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_register_and_get() {
        let registry = TemplateRegistry::new();
        registry.register(AgentTemplate::new("coder", "worker")).unwrap();

        assert!(registry.contains("coder"));
        assert_eq!(registry.get("coder").unwrap().agent_type, "worker");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_template_rejected() {
        let registry = TemplateRegistry::new();
        registry.register(AgentTemplate::new("coder", "worker")).unwrap();
        let result = registry.register(AgentTemplate::new("coder", "other"));
        assert!(matches!(result, Err(FleetError::TemplateExists(_))));
        assert_eq!(registry.get("coder").unwrap().agent_type, "worker");
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let registry = TemplateRegistry::new();
        let mut template = AgentTemplate::new("tiny", "worker");
        template.capabilities.limits.memory_limit_mb = Some(1);
        assert!(matches!(registry.register(template), Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn test_instantiate_applies_overrides() {
        let mut template = AgentTemplate::new("coder", "worker");
        template.config.max_concurrent_tasks = 3;
        template
            .environment
            .variables
            .insert("MODE".to_string(), "fast".to_string());

        let overrides = AgentOverrides {
            name: Some("alice".to_string()),
            config: ConfigOverrides {
                heartbeat_interval_ms: Some(1_000),
                ..Default::default()
            },
            variables: BTreeMap::from([("MODE".to_string(), "safe".to_string())]),
            ..Default::default()
        };

        let agent = template.instantiate("agent_01".to_string(), &overrides, &PathBuf::from("/data"));

        assert_eq!(agent.name, "alice");
        assert_eq!(agent.status, AgentStatus::Initializing);
        assert_eq!(agent.config.max_concurrent_tasks, 3);
        assert_eq!(agent.config.heartbeat_interval_ms, 1_000);
        assert_eq!(agent.workload.max_tasks, 3);
        assert_eq!(agent.environment.variables["MODE"], "safe");
        assert_eq!(agent.environment.working_dir, PathBuf::from("/data/agents/agent_01/work"));
        assert_eq!(agent.health.overall, 1.0);
    }

    #[test]
    fn test_override_limits_validated() {
        assert!(AgentOverrides::default().validate().is_ok());

        let mut overrides = AgentOverrides {
            limits: Some(ResourceLimits {
                memory_limit_mb: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(overrides.validate(), Err(FleetError::InvalidConfig(_))));

        let mut capabilities = AgentCapabilities::default();
        capabilities.limits.cpu_quota = Some(10_000);
        overrides.limits = None;
        overrides.capabilities = Some(capabilities);
        assert!(matches!(overrides.validate(), Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_yaml() {
        let yaml = r#"
templates:
  - name: researcher
    type: research
    capabilities:
      skills: [search, summarize]
    config:
      max_concurrent_tasks: 2
    startup:
      entrypoint: /usr/local/bin/researcher
      args: ["--verbose"]
  - name: reviewer
    type: review
"#;
        let registry = TemplateRegistry::new();
        assert_eq!(registry.load_yaml(yaml).unwrap(), 2);

        let researcher = registry.get("researcher").unwrap();
        assert!(researcher.capabilities.supports("search"));
        assert_eq!(researcher.config.max_concurrent_tasks, 2);
        assert_eq!(researcher.startup.as_ref().unwrap().args, vec!["--verbose"]);
        assert!(registry.get("reviewer").unwrap().startup.is_none());
    }
}
