//! Dialogue policies.
//!
//! A policy looks at a tracker and scores every domain action. Policies are
//! stateful: `train` fills their private parameters, `predict_action_probabilities`
//! reads them, `persist` and the registry loader move them to and from disk.

mod fallback;
mod memoization;
mod registry;
mod rule;
mod unexpected_intent;

use std::any::Any;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::PolicySpec;
use crate::domain::Domain;
use crate::error::{ConfigError, DialogueError, DialogueResult, PersistenceError};
use crate::interpreter::NaturalLanguageInterpreter;
use crate::prediction::PolicyPrediction;
use crate::tracker::DialogueStateTracker;

pub use fallback::{FallbackConfig, FallbackPolicy, FALLBACK_POLICY_PRIORITY};
pub use memoization::{
    AugmentedMemoizationPolicy, MemoizationConfig, MemoizationPolicy, MEMOIZATION_POLICY_PRIORITY,
};
pub use registry::{PolicyFactory, PolicyLoader, PolicyRegistry, RegisteredPolicy};
pub use rule::{RuleConfig, RulePolicy, RULE_POLICY_PRIORITY};
pub use unexpected_intent::{
    UnexpectedIntentConfig, UnexpectedIntentPolicy, UNLIKELY_INTENT_POLICY_PRIORITY,
};

/// File each built-in policy persists its state to.
pub const POLICY_STATE_FILE: &str = "policy.json";

/// Outcome of loading a policy: `Some` = loaded, `None` = the policy
/// abstained from loading, `Err` = loading failed.
pub type PolicyLoadResult = DialogueResult<Option<Box<dyn Policy>>>;

/// Declares that a policy can predict a fallback action.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackCapability {
    /// Action predicted when the ensemble cannot decide.
    pub action_name: String,
    /// Winners below this confidence are replaced by the fallback action.
    pub core_threshold: f64,
}

/// Fixed capability table a policy declares about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyCapabilities {
    /// The policy is trained from rule-derived trackers.
    pub supports_rules: bool,
    /// Set for policies the ensemble may substitute for a weak winner.
    pub fallback: Option<FallbackCapability>,
}

/// A strategy producing a distribution over the domain's actions.
pub trait Policy: Send + Sync + fmt::Debug {
    /// Short, stable type name used in prediction labels and model
    /// directories.
    fn type_name(&self) -> &'static str;

    /// Module the policy type lives in.
    fn module_path(&self) -> &'static str;

    /// `module::path::TypeName`, the name a persisted model records.
    fn qualified_name(&self) -> String {
        format!("{}::{}", self.module_path(), self.type_name())
    }

    /// Higher priorities win ties between predictions of the same tier.
    fn priority(&self) -> i32;

    /// What the ensemble may rely on this policy for.
    fn capabilities(&self) -> PolicyCapabilities {
        PolicyCapabilities::default()
    }

    /// Trains on the full tracker set. Each policy picks the trackers and
    /// features it needs.
    fn train(
        &mut self,
        training_trackers: &[DialogueStateTracker],
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<()>;

    /// Scores the next action. The returned probabilities are empty
    /// (abstention) or exactly `domain.num_actions()` long.
    fn predict_action_probabilities(
        &self,
        tracker: &DialogueStateTracker,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction>;

    /// Writes the trained state into `dir`, which already exists.
    fn persist(&self, dir: &Path) -> DialogueResult<()>;

    /// Downcasting support for callers that know the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// A policy type that can be constructed from configuration and loaded from
/// disk, and can therefore be registered with a [`PolicyRegistry`].
pub trait RegistrablePolicy: Policy + Sized + 'static {
    /// Short type name; must equal [`Policy::type_name`].
    const TYPE_NAME: &'static str;
    /// Module path forming the qualified name; must equal
    /// [`Policy::module_path`].
    const MODULE_PATH: &'static str;

    /// Builds an untrained policy.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for invalid options.
    fn from_spec(spec: &PolicySpec) -> Result<Self, ConfigError>;

    /// Restores a persisted policy. `Ok(None)` means there was nothing to
    /// restore.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted state is unreadable.
    fn load(dir: &Path) -> DialogueResult<Option<Self>>;
}

/// Serializes policy state to `dir/policy.json`.
///
/// # Errors
///
/// Returns a persistence error on I/O or serialization failure.
pub fn persist_state<T: Serialize>(dir: &Path, state: &T) -> DialogueResult<()> {
    let path = dir.join(POLICY_STATE_FILE);
    let bytes = serde_json::to_vec_pretty(state).map_err(|e| PersistenceError::Metadata {
        message: format!("failed to serialize policy state: {e}"),
    })?;
    fs::write(&path, bytes).map_err(|e| DialogueError::from(PersistenceError::io(&path, &e)))
}

/// Reads policy state from `dir/policy.json`; `Ok(None)` if the file does
/// not exist.
///
/// # Errors
///
/// Returns a persistence error if the file exists but cannot be read or
/// parsed.
pub fn load_state<T: DeserializeOwned>(dir: &Path) -> DialogueResult<Option<T>> {
    let path = dir.join(POLICY_STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(&path).map_err(|e| PersistenceError::io(&path, &e))?;
    let state = serde_json::from_slice(&raw).map_err(|e| PersistenceError::Metadata {
        message: format!("invalid policy state in {}: {e}", path.display()),
    })?;
    Ok(Some(state))
}

pub(crate) fn validate_threshold(policy: &str, name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPolicyOptions {
            policy: policy.to_string(),
            reason: format!("{name} must be within [0.0, 1.0], got {value}"),
        })
    }
}
