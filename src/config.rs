//! Configuration for convflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONVFLOW_HOME)
//! 2. Config file (.convflow/config.yaml)
//! 3. Defaults (~/.convflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .convflow/config.yaml
//! - `paths.home` is relative to the .convflow/ directory

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{CommandAgent, CommandValidator, FileStorage};
use crate::core::{
    AgentRegistry, CircuitBreakerConfig, Orchestrator, OrchestratorSettings, RetentionPolicy,
    ValidationAggregator, ValidatorRegistry, DEFAULT_VALIDATOR_TIMEOUT,
};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Capability -> instances serving it
    #[serde(default)]
    pub agents: BTreeMap<String, Vec<AgentConfig>>,
    /// Validator name -> command
    #[serde(default)]
    pub validators: BTreeMap<String, ValidatorConfig>,
    #[serde(default)]
    pub orchestrator: Option<OrchestratorConfig>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
    #[serde(default)]
    pub aggregation: Option<AggregationConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .convflow/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Instance name (defaults to `<capability>-<n>`)
    pub name: Option<String>,
    pub command: Vec<String>,
    #[serde(default)]
    pub health_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub max_parallel_steps: Option<usize>,
    pub default_step_timeout_seconds: Option<u64>,
    pub suspension_ttl_hours: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    pub keep_last: Option<usize>,
    pub older_than_hours: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregationConfig {
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    pub default_weight: Option<f64>,
    pub validator_timeout_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to convflow home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub agents: BTreeMap<String, Vec<AgentConfig>>,
    pub validators: BTreeMap<String, ValidatorConfig>,
    pub orchestrator: OrchestratorSettings,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retention: RetentionPolicy,
    pub weights: HashMap<String, f64>,
    pub default_weight: f64,
    pub validator_timeout: Duration,
}

impl ResolvedConfig {
    /// Directory holding checkpoints and provenance
    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    /// One `CommandAgent` per configured instance
    pub fn agent_registry(&self) -> Result<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        for (capability, instances) in &self.agents {
            for (index, instance) in instances.iter().enumerate() {
                let name = instance
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", capability, index + 1));

                let mut agent = CommandAgent::new(name, capability, instance.command.clone())?;
                if let Some(health) = &instance.health_command {
                    agent = agent.with_health_command(health.clone());
                }
                registry.register(Arc::new(agent))?;
            }
        }
        Ok(registry)
    }

    pub fn validator_registry(&self) -> Result<ValidatorRegistry> {
        let mut registry = ValidatorRegistry::new();
        for (name, validator) in &self.validators {
            registry.register(Arc::new(CommandValidator::new(
                name,
                validator.command.clone(),
            )?))?;
        }
        Ok(registry)
    }

    pub fn aggregator(&self) -> ValidationAggregator {
        ValidationAggregator::new(self.weights.clone(), self.default_weight)
            .with_timeout(self.validator_timeout)
    }

    /// Orchestrator over the file store in the state directory
    pub async fn build_orchestrator(&self) -> Result<Orchestrator> {
        let storage = FileStorage::open(self.state_dir())
            .await
            .context("Failed to open state directory")?;

        Ok(Orchestrator::builder(Arc::new(storage))
            .agents(self.agent_registry()?)
            .validators(self.validator_registry()?)
            .settings(self.orchestrator.clone())
            .circuit_breaker(self.circuit_breaker.clone())
            .aggregator(self.aggregator())
            .build())
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".convflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed config file over defaults
fn resolve(
    file: ConfigFile,
    config_file: Option<PathBuf>,
    env_home: Option<PathBuf>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let home = env_home.unwrap_or_else(|| match (&file.paths.home, &config_file) {
        (Some(home), Some(config_path)) => {
            // home is relative to .convflow/
            let convflow_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(convflow_dir, home)
        }
        (Some(home), None) => PathBuf::from(home),
        _ => default_home,
    });

    let defaults = OrchestratorSettings::default();
    let orchestrator = match file.orchestrator {
        Some(o) => OrchestratorSettings {
            max_parallel_steps: o.max_parallel_steps.unwrap_or(defaults.max_parallel_steps),
            default_step_timeout: o
                .default_step_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_step_timeout),
            suspension_ttl: o
                .suspension_ttl_hours
                .map(chrono::Duration::hours)
                .unwrap_or(defaults.suspension_ttl),
        },
        None => defaults,
    };

    let retention = file
        .retention
        .map(|r| RetentionPolicy {
            keep_last: r.keep_last,
            older_than: r.older_than_hours.map(chrono::Duration::hours),
        })
        .unwrap_or_default();

    let aggregation = file.aggregation.unwrap_or_default();

    ResolvedConfig {
        home,
        config_file,
        agents: file.agents,
        validators: file.validators,
        orchestrator,
        circuit_breaker: file.circuit_breaker.unwrap_or_default(),
        retention,
        weights: aggregation.weights,
        default_weight: aggregation.default_weight.unwrap_or(1.0),
        validator_timeout: aggregation
            .validator_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_VALIDATOR_TIMEOUT),
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".convflow");
    let env_home = std::env::var("CONVFLOW_HOME").ok().map(PathBuf::from);

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(file, config_file, env_home, default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the convflow home directory (engine state)
pub fn convflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
