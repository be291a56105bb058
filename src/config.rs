//! Stack configuration (`config.toml`)
//!
//! Every section is optional; a missing file means all defaults.

use anyhow::{Context, Result};
use declarative::{ApplyOptions, DeployContext, MemoryOptions, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    #[serde(default)]
    pub stack: StackSettings,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub simulation: SimulationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackSettings {
    #[serde(default = "default_stack_name")]
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_account")]
    pub account: String,
    /// Directory for deploy state; defaults to the state dir
    #[serde(default)]
    pub state_dir: Option<String>,
}

fn default_stack_name() -> String {
    "PrivateApiStack".to_string()
}

fn default_environment() -> String {
    "Production".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_account() -> String {
    "000000000000".to_string()
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            name: default_stack_name(),
            environment: default_environment(),
            region: default_region(),
            account: default_account(),
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_jobs() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_timeout_secs() -> u64 {
    30 * 60
}

fn default_poll_interval_ms() -> u64 {
    200
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl EngineSettings {
    pub fn apply_options(&self) -> ApplyOptions {
        let mut retry = RetryConfig::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.backoff_factor,
        );
        retry.max_delay = Duration::from_millis(self.max_delay_ms);

        ApplyOptions {
            jobs: self.jobs,
            retry,
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Failure injection for the simulated backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationSettings {
    #[serde(default = "default_ready_after_polls")]
    pub ready_after_polls: u32,
    /// Logical id whose create fails permanently
    #[serde(default)]
    pub fail_resource: Option<String>,
    /// Logical id -> number of transient create failures
    #[serde(default)]
    pub transient_failures: BTreeMap<String, u32>,
}

fn default_ready_after_polls() -> u32 {
    1
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            ready_after_polls: default_ready_after_polls(),
            fail_resource: None,
            transient_failures: BTreeMap::new(),
        }
    }
}

impl SimulationSettings {
    pub fn memory_options(&self) -> MemoryOptions {
        MemoryOptions {
            ready_after_polls: self.ready_after_polls,
            permanent_failures: self.fail_resource.iter().cloned().collect(),
            transient_failures: self.transient_failures.clone(),
            ..MemoryOptions::default()
        }
    }
}

impl StackConfig {
    /// Default config location: `<config dir>/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        Ok(paths::config_dir()?.join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`
    ///
    /// A missing default file yields the default config; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML format in {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;

        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stack.name.trim().is_empty() {
            anyhow::bail!("Stack name cannot be empty");
        }
        if self.stack.environment.trim().is_empty() {
            anyhow::bail!("Environment cannot be empty");
        }
        if self.engine.jobs == 0 {
            anyhow::bail!("engine.jobs must be at least 1");
        }
        if self.engine.max_attempts == 0 {
            anyhow::bail!("engine.max_attempts must be at least 1");
        }
        if self.engine.backoff_factor < 1.0 {
            anyhow::bail!("engine.backoff_factor must be at least 1.0");
        }
        if self.engine.timeout_secs == 0 {
            anyhow::bail!("engine.timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn deploy_context(&self) -> DeployContext {
        DeployContext {
            stack_name: self.stack.name.clone(),
            environment: self.stack.environment.clone(),
            region: self.stack.region.clone(),
            account: self.stack.account.clone(),
        }
    }

    /// Directory holding this stack's state and simulated backend
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.stack.state_dir {
            Some(dir) => Ok(paths::expand(dir)),
            None => paths::state_dir(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_example_config() {
        let toml = r#"
[stack]
name = "Staging"
environment = "Staging"
region = "eu-west-1"

[engine]
jobs = 8
max_attempts = 3
base_delay_ms = 10

[simulation]
fail_resource = "RDSMySQL"

[simulation.transient_failures]
NatGateway = 2
"#;
        let config: StackConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.stack.name, "Staging");
        assert_eq!(config.stack.account, "000000000000");
        assert_eq!(config.engine.jobs, 8);
        assert_eq!(config.engine.timeout_secs, 30 * 60);

        let options = config.engine.apply_options();
        assert_eq!(options.retry.max_attempts, 3);
        assert_eq!(options.retry.base_delay, Duration::from_millis(10));

        let memory = config.simulation.memory_options();
        assert!(memory.permanent_failures.contains("RDSMySQL"));
        assert_eq!(memory.transient_failures.get("NatGateway"), Some(&2));

        let context = config.deploy_context();
        assert_eq!(context.region, "eu-west-1");
        assert_eq!(context.environment, "Staging");
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: StackConfig = toml::from_str("").unwrap();
        assert_eq!(config, StackConfig::default());
        assert_eq!(config.stack.environment, "Production");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = StackConfig::default();
        config.engine.jobs = 0;
        assert!(config.validate().is_err());

        let mut config = StackConfig::default();
        config.engine.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = StackConfig::default();
        config.stack.name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<StackConfig>("[stack]\nnmae = \"typo\"\n").is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine]\njobs = 2\n").unwrap();

        let config = StackConfig::load(Some(&path)).unwrap();
        assert_eq!(config.engine.jobs, 2);

        assert!(StackConfig::load(Some(&dir.path().join("missing.toml"))).is_err());

        fs::write(&path, "[engine]\njobs = 0\n").unwrap();
        assert!(StackConfig::load(Some(&path)).is_err());
    }
}
