//! The policy ensemble.
//!
//! A [`PolicyEnsemble`] owns an ordered list of policies. It trains them on
//! the same trackers, persists and restores them as one model directory, and
//! for every turn asks each policy for a prediction and reconciles the
//! answers into the single prediction that drives the next action.

mod metadata;
mod reconcile;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use thiserror::Error;

use crate::config::{self, policy_specs};
use crate::domain::{Domain, ACTION_LISTEN_NAME, ACTION_UNLIKELY_INTENT_NAME};
use crate::error::{DialogueError, DialogueResult, DomainError, PersistenceError, PredictionError};
use crate::event::Event;
use crate::interpreter::NaturalLanguageInterpreter;
use crate::policy::{
    AugmentedMemoizationPolicy, FallbackCapability, MemoizationPolicy, Policy, PolicyRegistry,
    RegistrablePolicy, RulePolicy,
};
use crate::prediction::PolicyPrediction;
use crate::tracker::DialogueStateTracker;

pub use metadata::{
    EnsembleMetadata, PersistedPolicy, METADATA_FILE, MINIMUM_COMPATIBLE_VERSION, MODEL_VERSION,
};

use reconcile::Reconciliation;

const ENSEMBLE_NAME: &str = "PolicyEnsemble";

/// Label of the policy at `index`, used for prediction names and model
/// sub-directories.
fn policy_label(index: usize, type_name: &str) -> String {
    format!("policy_{index}_{type_name}")
}

/// How policies are queried during prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FanOut {
    /// One policy after the other on the calling thread.
    #[default]
    Sequential,
    /// One scoped thread per policy.
    Parallel,
}

/// Inconsistency between the policies and the training data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrainingWarning {
    /// Rule trackers were provided but no policy learns from them.
    #[error(
        "Found rule-based training data but no policy supporting rule-based data. Please add \
         `RulePolicy` or another policy that supports rule-based data to the policies section \
         of your configuration."
    )]
    RuleDataWithoutRulePolicy,

    /// A rule policy is configured but no rule trackers were provided.
    #[error(
        "Found a rule-based policy in your pipeline but no rule-based training data. Please add \
         rule-based stories to your training data or remove the rule-based policy (`{policies}`) \
         from your configuration."
    )]
    RulePolicyWithoutRuleData {
        /// Type names of the rule-capable policies.
        policies: String,
    },
}

/// Outcome of [`PolicyEnsemble::train`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainingReport {
    /// Warnings emitted before training.
    pub warnings: Vec<TrainingWarning>,
}

impl TrainingReport {
    /// True if training emitted no warnings.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Ordered collection of policies that together decide the next action.
#[derive(Debug)]
pub struct PolicyEnsemble {
    policies: Vec<Box<dyn Policy>>,
    fan_out: FanOut,
    date_trained: Option<DateTime<Utc>>,
    domain_fingerprint: Option<String>,
}

impl PolicyEnsemble {
    /// Creates an ensemble. The order of `policies` is the ensemble order.
    ///
    /// Logs a warning for every group of policies sharing a priority.
    #[must_use]
    pub fn new(policies: Vec<Box<dyn Policy>>) -> Self {
        let ensemble = Self {
            policies,
            fan_out: FanOut::default(),
            date_trained: None,
            domain_fingerprint: None,
        };
        for (priority, names) in ensemble.priority_collisions() {
            tracing::warn!(
                "Found policies {names:?} with same priority {priority} in PolicyEnsemble. When \
                 personalizing priorities, be sure to give all policies different priorities."
            );
        }
        ensemble
    }

    /// Builds an ensemble from a `policy`/`policies` configuration using the
    /// built-in policies.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed configurations, unknown
    /// policy names and invalid policy options.
    pub fn from_dict(config: &serde_json::Value) -> DialogueResult<Self> {
        Self::from_dict_with_registry(config, &PolicyRegistry::builtin())
    }

    /// Like [`from_dict`](Self::from_dict), resolving names in `registry`.
    ///
    /// # Errors
    ///
    /// See [`from_dict`](Self::from_dict).
    pub fn from_dict_with_registry(
        config: &serde_json::Value,
        registry: &PolicyRegistry,
    ) -> DialogueResult<Self> {
        let policies = policy_specs(config)?
            .iter()
            .map(|spec| registry.create(spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(policies))
    }

    /// Builds an ensemble from YAML configuration text.
    ///
    /// # Errors
    ///
    /// See [`from_dict`](Self::from_dict).
    pub fn from_yaml_str(yaml: &str) -> DialogueResult<Self> {
        Self::from_dict(&config::config_from_yaml(yaml)?)
    }

    /// Builds an ensemble from a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the file cannot be read, otherwise see
    /// [`from_dict`](Self::from_dict).
    pub fn from_config_file(path: impl AsRef<Path>) -> DialogueResult<Self> {
        Self::from_dict(&config::load_config_file(path)?)
    }

    /// Sets how policies are queried during prediction.
    #[must_use]
    pub fn with_fan_out(mut self, fan_out: FanOut) -> Self {
        self.fan_out = fan_out;
        self
    }

    /// The policies in ensemble order.
    #[must_use]
    pub fn policies(&self) -> &[Box<dyn Policy>] {
        &self.policies
    }

    /// How policies are queried during prediction.
    #[must_use]
    pub fn fan_out(&self) -> FanOut {
        self.fan_out
    }

    /// When the ensemble was last trained, if ever.
    #[must_use]
    pub fn date_trained(&self) -> Option<DateTime<Utc>> {
        self.date_trained
    }

    /// Groups of policy type names that share a priority.
    #[must_use]
    pub fn priority_collisions(&self) -> Vec<(i32, Vec<&'static str>)> {
        let mut by_priority: BTreeMap<i32, Vec<&'static str>> = BTreeMap::new();
        for policy in &self.policies {
            by_priority
                .entry(policy.priority())
                .or_default()
                .push(policy.type_name());
        }
        by_priority
            .into_iter()
            .filter(|(_, names)| names.len() > 1)
            .collect()
    }

    /// Checks that rule-based training data and rule-capable policies go
    /// together.
    fn check_rule_data(&self, training_trackers: &[DialogueStateTracker]) -> Vec<TrainingWarning> {
        let has_rule_data = training_trackers.iter().any(DialogueStateTracker::is_rule_tracker);
        let rule_policies: Vec<&str> = self
            .policies
            .iter()
            .filter(|p| p.capabilities().supports_rules)
            .map(|p| p.type_name())
            .collect();

        let mut warnings = Vec::new();
        if has_rule_data && rule_policies.is_empty() {
            warnings.push(TrainingWarning::RuleDataWithoutRulePolicy);
        }
        if !has_rule_data && !rule_policies.is_empty() {
            warnings.push(TrainingWarning::RulePolicyWithoutRuleData {
                policies: rule_policies.join(", "),
            });
        }
        warnings
    }

    /// Trains every policy on the full set of trackers.
    ///
    /// # Errors
    ///
    /// Returns the first policy's training error; policies after it are not
    /// trained.
    pub fn train(
        &mut self,
        training_trackers: &[DialogueStateTracker],
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<TrainingReport> {
        let report = TrainingReport {
            warnings: self.check_rule_data(training_trackers),
        };
        for warning in &report.warnings {
            tracing::warn!("{warning}");
        }

        for policy in &mut self.policies {
            policy.train(training_trackers, domain, interpreter)?;
            tracing::debug!("Trained policy {}", policy.type_name());
        }

        self.date_trained = Some(Utc::now());
        self.domain_fingerprint = Some(domain.fingerprint());
        Ok(report)
    }

    /// Writes the ensemble to `path`: one sub-directory per policy plus
    /// `metadata.json`.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if any directory or policy cannot be
    /// written.
    pub fn persist(&self, path: impl AsRef<Path>) -> DialogueResult<()> {
        let path = path.as_ref();
        fs::create_dir_all(path).map_err(|e| PersistenceError::io(path, &e))?;

        let mut persisted = Vec::with_capacity(self.policies.len());
        for (index, policy) in self.policies.iter().enumerate() {
            let directory = policy_label(index, policy.type_name());
            let dir = path.join(&directory);
            fs::create_dir_all(&dir).map_err(|e| PersistenceError::io(&dir, &e))?;
            policy.persist(&dir)?;
            persisted.push(PersistedPolicy {
                qualified_name: policy.qualified_name(),
                directory,
            });
        }

        EnsembleMetadata::new(
            ENSEMBLE_NAME,
            persisted,
            self.date_trained.unwrap_or_else(Utc::now),
            self.domain_fingerprint.clone(),
        )
        .write(path)?;
        tracing::debug!("Persisted policy ensemble to {}", path.display());
        Ok(())
    }

    /// Loads an ensemble persisted with [`persist`](Self::persist), using
    /// the built-in policies.
    ///
    /// # Errors
    ///
    /// See [`load_with_registry`](Self::load_with_registry).
    pub fn load(path: impl AsRef<Path>) -> DialogueResult<Self> {
        Self::load_with_registry(path, &PolicyRegistry::builtin())
    }

    /// Loads an ensemble, resolving recorded policy types in `registry`.
    ///
    /// Policies whose loader returns nothing are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the metadata is missing, malformed or
    /// fails verification, if a recorded type is not registered, if a policy
    /// fails to load, or if a loader returns a policy of a different type.
    pub fn load_with_registry(path: impl AsRef<Path>, registry: &PolicyRegistry) -> DialogueResult<Self> {
        let path = path.as_ref();
        let metadata = EnsembleMetadata::read(path)?;
        metadata.verify()?;

        let mut policies = Vec::with_capacity(metadata.policies.len());
        for persisted in &metadata.policies {
            let entry = registry.resolve(&persisted.qualified_name).ok_or_else(|| {
                PersistenceError::UnknownPolicyType {
                    name: persisted.qualified_name.clone(),
                }
            })?;
            let mut components = Path::new(&persisted.directory).components();
            if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
                return Err(PersistenceError::Metadata {
                    message: format!("invalid policy directory '{}'", persisted.directory),
                }
                .into());
            }

            match (entry.load)(&path.join(&persisted.directory))? {
                Some(policy) if policy.qualified_name() != entry.qualified_name() => {
                    return Err(PersistenceError::PolicyTypeMismatch {
                        expected: entry.qualified_name(),
                        found: policy.qualified_name(),
                    }
                    .into());
                }
                Some(policy) => policies.push(policy),
                None => {
                    tracing::warn!(
                        "Failed to load policy {}: load returned None",
                        persisted.qualified_name
                    );
                }
            }
        }

        let mut ensemble = Self::new(policies);
        ensemble.date_trained = Some(metadata.trained_at);
        ensemble.domain_fingerprint = metadata.domain_fingerprint;
        Ok(ensemble)
    }

    /// Checks that `domain` can serve this ensemble.
    ///
    /// Logs a warning if the ensemble was trained on a different domain.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Incompatible` if a policy's fallback action is
    /// missing from the domain.
    pub fn check_domain_compatibility(&self, domain: &Domain) -> DialogueResult<()> {
        for policy in &self.policies {
            if let Some(fallback) = policy.capabilities().fallback {
                if !domain.has_action(&fallback.action_name) {
                    return Err(DomainError::Incompatible {
                        reason: format!(
                            "{} predicts '{}', which is not an action of the domain",
                            policy.type_name(),
                            fallback.action_name
                        ),
                    }
                    .into());
                }
            }
        }
        if let Some(trained) = &self.domain_fingerprint {
            if *trained != domain.fingerprint() {
                tracing::warn!(
                    "The domain differs from the domain the ensemble was trained on. Retrain \
                     the model to pick up domain changes."
                );
            }
        }
        Ok(())
    }

    /// True if a prediction by `policy_name` with `max_confidence` did not
    /// come from memorized training data.
    ///
    /// Only predictions of the memorizing policies (rule and memoization
    /// policies) with a non-zero confidence count as memorized.
    #[must_use]
    pub fn is_not_in_training_data(policy_name: Option<&str>, max_confidence: Option<f64>) -> bool {
        let Some(policy_name) = policy_name.filter(|name| !name.is_empty()) else {
            return true;
        };
        let memorizing = [
            RulePolicy::TYPE_NAME,
            MemoizationPolicy::TYPE_NAME,
            AugmentedMemoizationPolicy::TYPE_NAME,
        ];
        let is_memorized = memorizing
            .iter()
            .any(|type_name| policy_name.ends_with(&format!("_{type_name}")));
        !is_memorized || max_confidence == Some(0.0)
    }

    fn query_sequential(
        &self,
        tracker: &DialogueStateTracker,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<Vec<PolicyPrediction>> {
        self.policies
            .iter()
            .map(|policy| policy.predict_action_probabilities(tracker, domain, interpreter))
            .collect()
    }

    /// Queries all policies on scoped threads. Results are put back in
    /// ensemble order; the first failing policy in that order decides the
    /// error.
    fn query_parallel(
        &self,
        tracker: &DialogueStateTracker,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<Vec<PolicyPrediction>> {
        let (tx, rx) = bounded(self.policies.len());
        thread::scope(|scope| {
            for (index, policy) in self.policies.iter().enumerate() {
                let tx = tx.clone();
                scope.spawn(move || {
                    let result = policy.predict_action_probabilities(tracker, domain, interpreter);
                    // Capacity equals the number of senders.
                    let _ = tx.send((index, result));
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<DialogueResult<PolicyPrediction>>> =
            (0..self.policies.len()).map(|_| None).collect();
        for (index, result) in rx.try_iter() {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Err(DialogueError::internal(format!(
                        "policy {index} did not report a prediction"
                    )))
                })
            })
            .collect()
    }

    fn fallback_capability(&self) -> Option<(usize, &dyn Policy, FallbackCapability)> {
        self.policies.iter().enumerate().find_map(|(index, policy)| {
            policy
                .capabilities()
                .fallback
                .map(|capability| (index, policy.as_ref(), capability))
        })
    }

    /// Replaces the winner by the fallback prediction if no prediction won,
    /// the winner predicts a listen right after a listen, or its confidence
    /// is below the fallback core threshold.
    fn apply_fallback(
        &self,
        reconciliation: &mut Reconciliation,
        tracker: &DialogueStateTracker,
        domain: &Domain,
    ) -> DialogueResult<()> {
        let Some((index, policy, capability)) = self.fallback_capability() else {
            return Ok(());
        };
        let label = policy_label(index, policy.type_name());

        let reason = match &reconciliation.winner {
            None => "no policy predicted an action",
            Some(winner) if winner.policy_name.as_deref() == Some(label.as_str()) => return Ok(()),
            Some(winner)
                if tracker.latest_action_name() == Some(ACTION_LISTEN_NAME)
                    && winner.max_confidence_index().is_some()
                    && winner.max_confidence_index() == domain.index_for_action(ACTION_LISTEN_NAME).ok() =>
            {
                "predicted action_listen after action_listen"
            }
            Some(winner) if winner.max_confidence() < capability.core_threshold => {
                "winning confidence is below the core threshold"
            }
            Some(_) => return Ok(()),
        };

        tracing::debug!("Predicting fallback action '{}': {reason}", capability.action_name);
        let fallback =
            PolicyPrediction::for_action_name(domain, &capability.action_name, Some(label), 1.0)?
                .with_priority(policy.priority());
        reconciliation.replace_winner(fallback);
        Ok(())
    }

    /// Predicts the next action.
    ///
    /// Every policy is queried and its prediction labelled
    /// `policy_{index}_{TypeName}`. The winner is the prediction with the
    /// highest `(tier, priority, max confidence)`, earliest index on ties.
    /// The result carries the winner's scores and flags, the must-have
    /// events of all policies followed by the winner's optional events, and,
    /// if the latest action was a listen, a featurization marker reflecting
    /// whether the winner predicted end-to-end.
    ///
    /// # Errors
    ///
    /// Returns the first policy's prediction error, or
    /// `PredictionError::InvalidProbabilityLength` for a probability vector
    /// that is neither empty nor as long as the domain's action list.
    pub fn probabilities_using_best_policy(
        &self,
        tracker: &DialogueStateTracker,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction> {
        let mut predictions = match self.fan_out {
            FanOut::Sequential => self.query_sequential(tracker, domain, interpreter)?,
            FanOut::Parallel => self.query_parallel(tracker, domain, interpreter)?,
        };

        for (index, (policy, prediction)) in self.policies.iter().zip(&mut predictions).enumerate() {
            let label = policy_label(index, policy.type_name());
            if !prediction.is_abstention() && prediction.probabilities.len() != domain.num_actions() {
                return Err(PredictionError::InvalidProbabilityLength {
                    policy: label,
                    expected: domain.num_actions(),
                    actual: prediction.probabilities.len(),
                }
                .into());
            }
            prediction.policy_name = Some(label);
            prediction.policy_priority = policy.priority();
        }

        if let Some(rejected) = tracker.rejected_action_name() {
            match domain.index_for_action(rejected) {
                Ok(index) => {
                    tracing::debug!("Action '{rejected}' was rejected; excluding it");
                    reconcile::zero_rejected_action(&mut predictions, index);
                }
                Err(e) => tracing::debug!("Ignoring rejected action: {e}"),
            }
        }

        let suppressed_action = if tracker.latest_action_name() == Some(ACTION_UNLIKELY_INTENT_NAME) {
            domain.index_for_action(ACTION_UNLIKELY_INTENT_NAME).ok()
        } else {
            None
        };

        let mut reconciliation = Reconciliation::pick(predictions, suppressed_action);
        self.apply_fallback(&mut reconciliation, tracker, domain)?;
        let mut prediction = reconciliation.finish();

        if tracker.latest_action_name() == Some(ACTION_LISTEN_NAME) {
            prediction
                .events
                .push(Event::define_prev_user_uttered_featurization(
                    prediction.is_end_to_end_prediction,
                ));
        }

        tracing::debug!(
            "Predicted next action using {}",
            prediction.policy_name.as_deref().unwrap_or("no policy")
        );
        Ok(prediction)
    }
}
