//! Ensemble-level model metadata.
//!
//! Stored as `metadata.json` next to the per-policy directories:
//!
//! ```text
//! model/
//! ├── metadata.json
//! ├── policy_0_MemoizationPolicy/
//! └── policy_1_RulePolicy/
//! ```

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DialogueResult, PersistenceError};

/// Name of the metadata file inside a model directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Oldest model version this build can load.
pub const MINIMUM_COMPATIBLE_VERSION: &str = "0.1.0";

/// Version written into new models.
pub const MODEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A persisted policy and the directory holding its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPolicy {
    /// Qualified registry name of the policy type
    /// (`module::path::TypeName`).
    pub qualified_name: String,
    /// Sub-directory relative to the model directory.
    pub directory: String,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMetadata {
    /// Kind of ensemble that wrote the model.
    pub ensemble_name: String,
    /// Policies in ensemble order.
    pub policies: Vec<PersistedPolicy>,
    /// See [`EnsembleMetadata::compute_fingerprint`].
    pub fingerprint: String,
    /// When the ensemble was trained.
    pub trained_at: DateTime<Utc>,
    /// Fingerprint of the training domain, if the ensemble was trained.
    #[serde(default)]
    pub domain_fingerprint: Option<String>,
    /// colloquy version that wrote the model.
    pub version: String,
}

impl EnsembleMetadata {
    /// Builds metadata for the current model version.
    #[must_use]
    pub fn new(
        ensemble_name: impl Into<String>,
        policies: Vec<PersistedPolicy>,
        trained_at: DateTime<Utc>,
        domain_fingerprint: Option<String>,
    ) -> Self {
        let fingerprint =
            Self::compute_fingerprint(&policies, MODEL_VERSION, domain_fingerprint.as_deref());
        Self {
            ensemble_name: ensemble_name.into(),
            policies,
            fingerprint,
            trained_at,
            domain_fingerprint,
            version: MODEL_VERSION.to_string(),
        }
    }

    /// blake3 over the policy descriptors, model version and domain
    /// fingerprint.
    #[must_use]
    pub fn compute_fingerprint(
        policies: &[PersistedPolicy],
        version: &str,
        domain_fingerprint: Option<&str>,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(version.as_bytes());
        for policy in policies {
            hasher.update(&(policy.qualified_name.len() as u64).to_le_bytes());
            hasher.update(policy.qualified_name.as_bytes());
            hasher.update(&(policy.directory.len() as u64).to_le_bytes());
            hasher.update(policy.directory.as_bytes());
        }
        if let Some(domain) = domain_fingerprint {
            hasher.update(b"domain");
            hasher.update(domain.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Checks the fingerprint and that the model version can be loaded.
    ///
    /// # Errors
    ///
    /// Returns `FingerprintMismatch` if the descriptors were altered,
    /// `UnsupportedModel` for models older than
    /// [`MINIMUM_COMPATIBLE_VERSION`], and `Metadata` for unparseable versions.
    pub fn verify(&self) -> Result<(), PersistenceError> {
        let computed = Self::compute_fingerprint(
            &self.policies,
            &self.version,
            self.domain_fingerprint.as_deref(),
        );
        if computed != self.fingerprint {
            return Err(PersistenceError::FingerprintMismatch {
                stored: self.fingerprint.clone(),
                computed,
            });
        }

        let version = semver::Version::parse(&self.version).map_err(|e| PersistenceError::Metadata {
            message: format!("invalid model version '{}': {e}", self.version),
        })?;
        let minimum = semver::Version::parse(MINIMUM_COMPATIBLE_VERSION).map_err(|e| {
            PersistenceError::Metadata {
                message: format!("invalid minimum version: {e}"),
            }
        })?;
        if version < minimum {
            return Err(PersistenceError::UnsupportedModel {
                model_version: self.version.clone(),
                minimum: MINIMUM_COMPATIBLE_VERSION.to_string(),
            });
        }
        Ok(())
    }

    /// Writes `metadata.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns a persistence error on I/O failure.
    pub fn write(&self, dir: &Path) -> DialogueResult<()> {
        let path = dir.join(METADATA_FILE);
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| PersistenceError::Metadata {
            message: e.to_string(),
        })?;
        fs::write(&path, bytes).map_err(|e| PersistenceError::io(&path, &e))?;
        Ok(())
    }

    /// Reads `metadata.json` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the file is missing or malformed.
    pub fn read(dir: &Path) -> DialogueResult<Self> {
        let path = dir.join(METADATA_FILE);
        let raw = fs::read(&path).map_err(|e| PersistenceError::io(&path, &e))?;
        let metadata = serde_json::from_slice(&raw).map_err(|e| PersistenceError::Metadata {
            message: format!("{}: {e}", path.display()),
        })?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> EnsembleMetadata {
        EnsembleMetadata::new(
            "PolicyEnsemble",
            vec![PersistedPolicy {
                qualified_name: "colloquy::policy::rule::RulePolicy".to_string(),
                directory: "policy_0_RulePolicy".to_string(),
            }],
            Utc::now(),
            Some("abc".to_string()),
        )
    }

    #[test]
    fn round_trips_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = metadata();
        metadata.write(dir.path()).unwrap();
        let read = EnsembleMetadata::read(dir.path()).unwrap();
        assert_eq!(read, metadata);
        read.verify().unwrap();
    }

    #[test]
    fn tampered_descriptors_fail_verification() {
        let mut metadata = metadata();
        metadata.policies[0].qualified_name = "colloquy::policy::memoization::MemoizationPolicy".to_string();
        assert!(matches!(
            metadata.verify().unwrap_err(),
            PersistenceError::FingerprintMismatch { .. }
        ));
    }

    #[test]
    fn old_models_are_unsupported() {
        let mut metadata = metadata();
        metadata.version = "0.0.9".to_string();
        metadata.fingerprint = EnsembleMetadata::compute_fingerprint(
            &metadata.policies,
            &metadata.version,
            metadata.domain_fingerprint.as_deref(),
        );
        assert!(matches!(
            metadata.verify().unwrap_err(),
            PersistenceError::UnsupportedModel { .. }
        ));
    }

    #[test]
    fn missing_metadata_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EnsembleMetadata::read(dir.path()).unwrap_err().is_persistence());
    }
}
