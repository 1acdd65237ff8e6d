//! Configuration management for Gatekeeper.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `GATEKEEPER__*` environment variables (`__` separates nesting, e.g.
//! `GATEKEEPER__DISTRIBUTED__REDIS_URL`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::rules::{self, Rule, RuleDefinition};
use crate::ratelimit::DEFAULT_KEY_PREFIX;

/// Main configuration for the Gatekeeper engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Which backend holds attempt state
    #[serde(default)]
    pub backend: BackendKind,

    /// In-process backend settings
    #[serde(default)]
    pub local: LocalConfig,

    /// Redis backend settings
    #[serde(default)]
    pub distributed: DistributedConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Start from the built-in presets
    #[serde(default = "default_use_default_rules")]
    pub use_default_rules: bool,

    /// Optional YAML file with a list of rule definitions
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Inline rule definitions; override presets and file rules by action
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            local: LocalConfig::default(),
            distributed: DistributedConfig::default(),
            logging: LoggingConfig::default(),
            use_default_rules: default_use_default_rules(),
            rules_path: None,
            rules: Vec::new(),
        }
    }
}

fn default_use_default_rules() -> bool {
    true
}

/// Backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// State kept in this process
    #[default]
    Local,
    /// State kept in Redis and shared across processes
    Distributed,
}

/// In-process backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Seconds between idle-record sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl LocalConfig {
    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    300
}

/// Redis backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Redis connection URL, required for the distributed backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace for every key written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for each store command in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl DistributedConfig {
    /// Command deadline as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_command_timeout() -> u64 {
    2000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load layered configuration and validate it.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GATEKEEPER")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Reject configurations that must not start.
    pub fn validate(&self) -> Result<()> {
        if self.local.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "local.sweep_interval_secs must be positive".to_string(),
            ));
        }

        if self.backend == BackendKind::Distributed {
            let url = self
                .distributed
                .redis_url
                .as_deref()
                .filter(|url| !url.trim().is_empty())
                .ok_or_else(|| {
                    GatekeeperError::Config(
                        "distributed.redis_url is required for the distributed backend"
                            .to_string(),
                    )
                })?;
            redis::Client::open(url).map_err(|e| {
                GatekeeperError::Config(format!("invalid distributed.redis_url: {}", e))
            })?;

            if self.distributed.key_prefix.is_empty() {
                return Err(GatekeeperError::Config(
                    "distributed.key_prefix must not be empty".to_string(),
                ));
            }
            if self.distributed.command_timeout_ms == 0 {
                return Err(GatekeeperError::Config(
                    "distributed.command_timeout_ms must be positive".to_string(),
                ));
            }
        }

        for def in &self.rules {
            def.validate()?;
        }
        Ok(())
    }

    /// Presets, file rules and inline rules merged by action, in that order.
    pub fn rule_set(&self) -> Result<Vec<Rule>> {
        let presets = if self.use_default_rules {
            rules::default_rules()
        } else {
            Vec::new()
        };
        let from_file = match &self.rules_path {
            Some(path) => rules::rules_from_file(path)?,
            None => Vec::new(),
        };
        let inline = self
            .rules
            .iter()
            .cloned()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>>>()?;

        let mut merged: Vec<Rule> = rules::merge([presets, from_file, inline])
            .into_values()
            .collect();
        merged.sort_by(|a, b| a.action.cmp(&b.action));
        Ok(merged)
    }
}
