//! Policy ensemble configuration.
//!
//! A configuration is a mapping with exactly one of the keys `policy` or
//! `policies`, each holding an ordered list of `{name: ..., ...options}`
//! mappings:
//!
//! ```yaml
//! policies:
//!   - name: MemoizationPolicy
//!     max_history: 3
//!   - name: RulePolicy
//!     priority: 7
//! ```

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{ConfigError, DialogueResult, PersistenceError};

/// Legacy singular key.
pub const POLICY_KEY: &str = "policy";
/// Preferred key.
pub const POLICIES_KEY: &str = "policies";

const NAME_KEY: &str = "name";
const PRIORITY_KEY: &str = "priority";

/// Configuration of a single policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySpec {
    /// Short type name (`MemoizationPolicy`) or qualified path
    /// (`colloquy::policy::memoization::MemoizationPolicy`).
    pub name: String,
    /// Overrides the policy's default priority.
    pub priority: Option<i32>,
    /// Remaining policy-specific options.
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl PolicySpec {
    /// Creates a spec without options.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: None,
            options: serde_json::Map::new(),
        }
    }

    /// Overrides the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Adds a policy-specific option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Deserializes the policy-specific options.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPolicyOptions` if an option has the wrong
    /// shape.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(serde_json::Value::Object(self.options.clone())).map_err(|e| {
            ConfigError::InvalidPolicyOptions {
                policy: self.name.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn from_value(index: usize, value: &serde_json::Value) -> Result<Self, ConfigError> {
        let serde_json::Value::Object(map) = value else {
            return Err(ConfigError::invalid(format!(
                "policy #{index} must be a mapping, got {value}"
            )));
        };

        let name = match map.get(NAME_KEY) {
            Some(serde_json::Value::String(name)) if !name.trim().is_empty() => name.clone(),
            Some(other) => {
                return Err(ConfigError::invalid(format!(
                    "policy #{index} has an invalid name {other}"
                )))
            }
            None => {
                return Err(ConfigError::invalid(format!(
                    "policy #{index} is missing the required '{NAME_KEY}' field"
                )))
            }
        };

        let priority = match map.get(PRIORITY_KEY) {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => {
                let priority = value
                    .as_i64()
                    .and_then(|p| i32::try_from(p).ok())
                    .ok_or_else(|| {
                        ConfigError::invalid(format!(
                            "priority of policy '{name}' must be an integer, got {value}"
                        ))
                    })?;
                Some(priority)
            }
        };

        let options = map
            .iter()
            .filter(|(key, _)| key.as_str() != NAME_KEY && key.as_str() != PRIORITY_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            name,
            priority,
            options,
        })
    }
}

/// Extracts the ordered policy specs from a configuration mapping.
///
/// The configuration is only read; callers keep their value untouched.
///
/// # Errors
///
/// Returns `ConfigError::InvalidPolicyConfig` if neither or both of
/// `policy`/`policies` are present, the list is empty, or an entry is
/// malformed.
pub fn policy_specs(config: &serde_json::Value) -> Result<Vec<PolicySpec>, ConfigError> {
    let serde_json::Value::Object(map) = config else {
        return Err(ConfigError::invalid("configuration must be a mapping"));
    };

    let policies = match (map.get(POLICY_KEY), map.get(POLICIES_KEY)) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid(format!(
                "only one of '{POLICY_KEY}' and '{POLICIES_KEY}' may be given"
            )))
        }
        (Some(policies), None) | (None, Some(policies)) => policies,
        (None, None) => {
            return Err(ConfigError::invalid(format!(
                "configuration needs a '{POLICIES_KEY}' key"
            )))
        }
    };

    let serde_json::Value::Array(entries) = policies else {
        return Err(ConfigError::invalid("policies must be given as a list"));
    };
    if entries.is_empty() {
        return Err(ConfigError::invalid("the list of policies must not be empty"));
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| PolicySpec::from_value(index, entry))
        .collect()
}

/// Converts YAML configuration text into a JSON value.
///
/// # Errors
///
/// Returns `ConfigError::Parse` for malformed YAML.
pub fn config_from_yaml(yaml: &str) -> Result<serde_json::Value, ConfigError> {
    serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
        message: e.to_string(),
    })
}

/// Reads a YAML (or JSON) configuration file.
///
/// # Errors
///
/// Returns a persistence error if the file cannot be read and
/// `ConfigError::Parse` if it is malformed.
pub fn load_config_file(path: impl AsRef<Path>) -> DialogueResult<serde_json::Value> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|e| PersistenceError::io(path, &e))?;
    Ok(config_from_yaml(&raw)?)
}
