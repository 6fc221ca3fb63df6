//! Error types for colloquy.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the specific failure: a broken configuration is handled differently from
//! a model directory that can no longer be loaded.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building an ensemble from configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid policy configuration: {reason}")]
    InvalidPolicyConfig {
        reason: String,
    },

    #[error("Module for policy '{name}' could not be found. Please verify the policy name")]
    UnknownPolicy {
        name: String,
    },

    #[error("Invalid options for policy '{policy}': {reason}")]
    InvalidPolicyOptions {
        policy: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {message}")]
    Parse {
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidPolicyConfig {
            reason: reason.into(),
        }
    }
}

/// Errors raised by domain lookups.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Cannot access action '{name}', as it is not part of the domain")]
    ActionNotFound {
        name: String,
    },

    #[error("Action index {index} is out of range for a domain with {num_actions} actions")]
    ActionIndexOutOfRange {
        index: usize,
        num_actions: usize,
    },

    #[error("Failed to parse domain: {message}")]
    Parse {
        message: String,
    },

    #[error("Domain is incompatible with the policy ensemble: {reason}")]
    Incompatible {
        reason: String,
    },
}

/// Errors raised while persisting or loading an ensemble.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error at {}: {message}", path.display())]
    Io {
        path: PathBuf,
        message: String,
    },

    #[error("Invalid ensemble metadata: {message}")]
    Metadata {
        message: String,
    },

    #[error("Persisted policy type '{name}' is not registered")]
    UnknownPolicyType {
        name: String,
    },

    #[error("Loading policy '{expected}' returned an instance of '{found}'")]
    PolicyTypeMismatch {
        expected: String,
        found: String,
    },

    #[error("Ensemble fingerprint mismatch: stored {stored}, computed {computed}")]
    FingerprintMismatch {
        stored: String,
        computed: String,
    },

    #[error("Model version {model_version} is not supported (minimum compatible version: {minimum})")]
    UnsupportedModel {
        model_version: String,
        minimum: String,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Errors raised while producing or reconciling predictions.
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Policy '{policy}' returned {actual} probabilities, expected {expected}")]
    InvalidProbabilityLength {
        policy: String,
        expected: usize,
        actual: usize,
    },
}

/// Top-level error type for colloquy.
#[derive(Debug, Error)]
pub enum DialogueError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Prediction error: {0}")]
    Prediction(#[from] PredictionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl DialogueError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a domain error.
    #[must_use]
    pub const fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(_))
    }

    /// Returns true if this is a persistence error.
    #[must_use]
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Returns true if this is a prediction error.
    #[must_use]
    pub const fn is_prediction(&self) -> bool {
        matches!(self, Self::Prediction(_))
    }
}

/// Result type alias for colloquy operations.
pub type DialogueResult<T> = Result<T, DialogueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::UnknownPolicy {
            name: "ykaüoppodas".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("ykaüoppodas"));
        assert!(msg.contains("could not be found"));
    }

    #[test]
    fn test_action_not_found_message() {
        let err = DomainError::ActionNotFound {
            name: "utter_nothing".to_string(),
        };
        assert!(format!("{err}").contains("utter_nothing"));
    }

    #[test]
    fn test_io_error_carries_path() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = PersistenceError::io("/tmp/model", &io);
        let msg = format!("{err}");
        assert!(msg.contains("/tmp/model"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_dialogue_error_from_config() {
        let err: DialogueError = ConfigError::invalid("empty").into();
        assert!(err.is_config());
        assert!(!err.is_persistence());
    }

    #[test]
    fn test_dialogue_error_from_persistence() {
        let err: DialogueError = PersistenceError::PolicyTypeMismatch {
            expected: "A".to_string(),
            found: "B".to_string(),
        }
        .into();
        assert!(err.is_persistence());
        assert!(format!("{err}").contains("returned an instance of 'B'"));
    }

    #[test]
    fn test_dialogue_error_internal() {
        let err = DialogueError::internal("unexpected state");
        assert!(!err.is_config());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
