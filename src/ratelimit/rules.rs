//! Rate limit rules, their configuration format, and the rule registry.
//!
//! A rule governs exactly one action (`login`, `password_reset`, ...). Rules
//! are loaded from configuration as [`RuleDefinition`]s, validated into
//! [`Rule`]s and kept in a [`RuleRegistry`] that backends read on every call.
//! Rules are replaced as a unit; nothing mutates a rule in place.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{GatekeeperError, Result};

/// A rule as written in configuration files.
///
/// Numeric fields are signed so that a negative value is reported as a
/// configuration error instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// The action this rule applies to
    pub action: String,
    /// Attempts allowed inside one window
    pub max_attempts: i64,
    /// Window length in seconds
    pub window_size_seconds: i64,
    /// Block length in seconds once the limit is hit
    #[serde(default)]
    pub block_duration_seconds: i64,
    /// Inactive rules are kept but never enforced
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl RuleDefinition {
    /// Check the definition without converting it.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts <= 0 {
            return Err(GatekeeperError::Config(format!(
                "rule '{}': max_attempts must be positive, got {}",
                self.action, self.max_attempts
            )));
        }
        if self.max_attempts > u32::MAX as i64 {
            return Err(GatekeeperError::Config(format!(
                "rule '{}': max_attempts {} is out of range",
                self.action, self.max_attempts
            )));
        }
        if self.window_size_seconds <= 0 {
            return Err(GatekeeperError::Config(format!(
                "rule '{}': window_size_seconds must be positive, got {}",
                self.action, self.window_size_seconds
            )));
        }
        if self.block_duration_seconds < 0 {
            return Err(GatekeeperError::Config(format!(
                "rule '{}': block_duration_seconds must not be negative, got {}",
                self.action, self.block_duration_seconds
            )));
        }
        Ok(())
    }
}

impl TryFrom<RuleDefinition> for Rule {
    type Error = GatekeeperError;

    fn try_from(def: RuleDefinition) -> Result<Self> {
        def.validate()?;
        Ok(Rule {
            action: def.action,
            max_attempts: def.max_attempts as u32,
            window_size: Duration::from_secs(def.window_size_seconds as u64),
            block_duration: Duration::from_secs(def.block_duration_seconds as u64),
            active: def.is_active,
        })
    }
}

/// A validated rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// The action this rule applies to
    pub action: String,
    /// Attempts allowed inside one window
    pub max_attempts: u32,
    /// Length of the counting window
    pub window_size: Duration,
    /// How long a pair stays blocked once the limit is hit
    pub block_duration: Duration,
    /// Whether the rule is enforced
    pub active: bool,
}

impl Rule {
    /// Create an active rule.
    pub fn new(
        action: impl Into<String>,
        max_attempts: u32,
        window_size: Duration,
        block_duration: Duration,
    ) -> Self {
        Self {
            action: action.into(),
            max_attempts,
            window_size,
            block_duration,
            active: true,
        }
    }

    /// Return the same rule with enforcement switched off.
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Reject rules that could never allow or never expire.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(GatekeeperError::Config(format!(
                "rule '{}': max_attempts must be positive",
                self.action
            )));
        }
        if self.window_size.is_zero() {
            return Err(GatekeeperError::Config(format!(
                "rule '{}': window_size must be positive",
                self.action
            )));
        }
        Ok(())
    }

    /// Convert back into the configuration format.
    pub fn to_definition(&self) -> RuleDefinition {
        RuleDefinition {
            action: self.action.clone(),
            max_attempts: self.max_attempts as i64,
            window_size_seconds: self.window_size.as_secs() as i64,
            block_duration_seconds: self.block_duration.as_secs() as i64,
            is_active: self.active,
        }
    }
}

/// Parse a YAML list of rule definitions.
pub fn rules_from_yaml(yaml: &str) -> Result<Vec<Rule>> {
    let defs: Vec<RuleDefinition> = serde_yaml::from_str(yaml)
        .map_err(|e| GatekeeperError::Config(format!("Failed to parse rules: {}", e)))?;
    defs.into_iter().map(Rule::try_from).collect()
}

/// Load a YAML list of rule definitions from a file.
pub fn rules_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<Rule>> {
    let path = path.as_ref();
    info!(path = %path.display(), "Loading rate limit rules");

    let contents = std::fs::read_to_string(path)?;
    rules_from_yaml(&contents)
}

/// Fold several rule sets into one map keyed by action.
///
/// Later sets override earlier ones, so environment specific overrides are
/// passed after the defaults.
pub fn merge<I, S>(rule_sets: I) -> HashMap<String, Rule>
where
    I: IntoIterator<Item = S>,
    S: IntoIterator<Item = Rule>,
{
    let mut merged = HashMap::new();
    for set in rule_sets {
        for rule in set {
            merged.insert(rule.action.clone(), rule);
        }
    }
    merged
}

/// Presets for the actions most services guard.
pub fn default_rules() -> Vec<Rule> {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    let rule = |action: &str, attempts: u32, window: u64, block: u64| {
        Rule::new(
            action,
            attempts,
            Duration::from_secs(window),
            Duration::from_secs(block),
        )
    };

    vec![
        rule("login", 5, 5 * MINUTE, 30 * MINUTE),
        rule("password_reset", 3, HOUR, HOUR),
        rule("email_verify", 5, HOUR, HOUR),
        rule("resend_email", 3, 15 * MINUTE, 30 * MINUTE),
        rule("registration", 3, HOUR, 2 * HOUR),
        rule("otp_request", 5, 15 * MINUTE, 30 * MINUTE),
        rule("api_call", 100, MINUTE, 5 * MINUTE),
    ]
}

/// Concurrent collection of rules keyed by action.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Rule>>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from already merged rules, validating each one.
    pub fn with_rules<I>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = Rule>,
    {
        let mut map = HashMap::new();
        for rule in rules {
            rule.validate()?;
            map.insert(rule.action.clone(), rule);
        }
        Ok(Self {
            rules: RwLock::new(map),
        })
    }

    /// Look up the rule for an action, whether or not it is active.
    pub fn get(&self, action: &str) -> Option<Rule> {
        self.rules.read().get(action).cloned()
    }

    /// Look up the rule for an action only if it is enforced.
    pub fn get_active(&self, action: &str) -> Option<Rule> {
        self.rules
            .read()
            .get(action)
            .filter(|rule| rule.active)
            .cloned()
    }

    /// Insert or replace the rule for its action.
    pub fn add(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        debug!(
            action = %rule.action,
            max_attempts = rule.max_attempts,
            window = ?rule.window_size,
            block = ?rule.block_duration,
            active = rule.active,
            "Registering rule"
        );
        self.rules.write().insert(rule.action.clone(), rule);
        Ok(())
    }

    /// Remove the rule for an action, returning it if it existed.
    pub fn remove(&self, action: &str) -> Option<Rule> {
        let removed = self.rules.write().remove(action);
        if removed.is_some() {
            debug!(action = %action, "Removed rule");
        }
        removed
    }

    /// All rules, ordered by action.
    pub fn list(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.action.cmp(&b.action));
        rules
    }

    /// Number of configured rules.
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}
