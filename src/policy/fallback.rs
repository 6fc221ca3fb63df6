use std::any::Any;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::PolicySpec;
use crate::domain::{Domain, ACTION_DEFAULT_FALLBACK_NAME, ACTION_LISTEN_NAME};
use crate::error::{ConfigError, DialogueResult};
use crate::interpreter::{NaturalLanguageInterpreter, ParseData};
use crate::policy::{
    load_state, persist_state, validate_threshold, FallbackCapability, Policy,
    PolicyCapabilities, RegistrablePolicy,
};
use crate::prediction::PolicyPrediction;
use crate::tracker::DialogueStateTracker;

/// Default priority of [`FallbackPolicy`].
pub const FALLBACK_POLICY_PRIORITY: i32 = 4;

/// Options of [`FallbackPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Minimum intent confidence.
    pub nlu_threshold: f64,
    /// Minimum gap between the two best intents.
    pub ambiguity_threshold: f64,
    /// Minimum confidence of the ensemble's winning prediction.
    pub core_threshold: f64,
    /// Action predicted on fallback.
    pub fallback_action_name: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            nlu_threshold: 0.3,
            ambiguity_threshold: 0.1,
            core_threshold: 0.3,
            fallback_action_name: ACTION_DEFAULT_FALLBACK_NAME.to_string(),
        }
    }
}

impl FallbackConfig {
    fn validate(self, policy: &str) -> Result<Self, ConfigError> {
        validate_threshold(policy, "nlu_threshold", self.nlu_threshold)?;
        validate_threshold(policy, "ambiguity_threshold", self.ambiguity_threshold)?;
        validate_threshold(policy, "core_threshold", self.core_threshold)?;
        if self.fallback_action_name.trim().is_empty() {
            return Err(ConfigError::InvalidPolicyOptions {
                policy: policy.to_string(),
                reason: "fallback_action_name cannot be empty".to_string(),
            });
        }
        Ok(self)
    }
}

/// Predicts a fallback action when NLU is unsure about the latest message.
///
/// Also declares the fallback capability: the ensemble substitutes this
/// policy's action when no other policy is confident enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    priority: i32,
    config: FallbackConfig,
}

impl FallbackPolicy {
    /// Creates an untrained policy.
    #[must_use]
    pub fn new(config: FallbackConfig, priority: i32) -> Self {
        Self { priority, config }
    }

    /// Thresholds and fallback action.
    #[must_use]
    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Reason the parse result should trigger a fallback, if any.
    fn nlu_fallback_reason(&self, parse: &ParseData) -> Option<String> {
        let Some(intent) = &parse.intent else {
            return Some("no intent was classified".to_string());
        };
        if intent.confidence < self.config.nlu_threshold {
            return Some(format!(
                "intent confidence {} is below {}",
                intent.confidence, self.config.nlu_threshold
            ));
        }
        if let [first, second, ..] = parse.intent_ranking.as_slice() {
            let gap = first.confidence - second.confidence;
            if gap < self.config.ambiguity_threshold {
                return Some(format!(
                    "intents '{}' and '{}' are ambiguous (gap {gap})",
                    first.name, second.name
                ));
            }
        }
        None
    }

    /// One-hot prediction of the fallback action.
    ///
    /// # Errors
    ///
    /// Returns a domain error if the fallback action is not in the domain.
    pub fn fallback_prediction(&self, domain: &Domain) -> DialogueResult<PolicyPrediction> {
        Ok(
            PolicyPrediction::for_action_name(domain, &self.config.fallback_action_name, None, 1.0)?
                .with_priority(self.priority),
        )
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::new(FallbackConfig::default(), FALLBACK_POLICY_PRIORITY)
    }
}

impl Policy for FallbackPolicy {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn module_path(&self) -> &'static str {
        Self::MODULE_PATH
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn capabilities(&self) -> PolicyCapabilities {
        PolicyCapabilities {
            fallback: Some(FallbackCapability {
                action_name: self.config.fallback_action_name.clone(),
                core_threshold: self.config.core_threshold,
            }),
            ..PolicyCapabilities::default()
        }
    }

    fn train(
        &mut self,
        _training_trackers: &[DialogueStateTracker],
        _domain: &Domain,
        _interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<()> {
        Ok(())
    }

    fn predict_action_probabilities(
        &self,
        tracker: &DialogueStateTracker,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction> {
        let abstain = PolicyPrediction::abstain(self.priority);
        if tracker.latest_action_name() != Some(ACTION_LISTEN_NAME) {
            return Ok(abstain);
        }
        let Some(message) = tracker.latest_message() else {
            return Ok(abstain);
        };

        let parsed;
        let parse = if message.intent.is_none() && !message.text.is_empty() {
            parsed = interpreter.parse(&message.text);
            &parsed
        } else {
            message
        };

        match self.nlu_fallback_reason(parse) {
            Some(reason) => {
                tracing::debug!("NLU fallback triggered: {reason}");
                Ok(self
                    .fallback_prediction(domain)?
                    .with_diagnostic("fallback_reason", serde_json::json!(reason)))
            }
            None => Ok(abstain),
        }
    }

    fn persist(&self, dir: &Path) -> DialogueResult<()> {
        persist_state(dir, self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegistrablePolicy for FallbackPolicy {
    const TYPE_NAME: &'static str = "FallbackPolicy";
    const MODULE_PATH: &'static str = module_path!();

    fn from_spec(spec: &PolicySpec) -> Result<Self, ConfigError> {
        let config = spec.options::<FallbackConfig>()?.validate(&spec.name)?;
        Ok(Self::new(
            config,
            spec.priority.unwrap_or(FALLBACK_POLICY_PRIORITY),
        ))
    }

    fn load(dir: &Path) -> DialogueResult<Option<Self>> {
        load_state(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::interpreter::{Intent, RegexInterpreter};

    fn tracker_with(message: &str) -> DialogueStateTracker {
        DialogueStateTracker::from_events(
            "c",
            vec![
                Event::action_executed(ACTION_LISTEN_NAME),
                Event::from_parse(RegexInterpreter.parse(message)),
            ],
        )
    }

    #[test]
    fn low_nlu_confidence_triggers_fallback() {
        let domain = Domain::empty();
        let prediction = FallbackPolicy::default()
            .predict_action_probabilities(&tracker_with("/greet@0.1"), &domain, &RegexInterpreter)
            .unwrap();
        assert_eq!(
            prediction.max_confidence_index(),
            Some(domain.index_for_action(ACTION_DEFAULT_FALLBACK_NAME).unwrap())
        );
        assert!(prediction.diagnostic_data.contains_key("fallback_reason"));
    }

    #[test]
    fn confident_nlu_abstains() {
        let prediction = FallbackPolicy::default()
            .predict_action_probabilities(&tracker_with("/greet@0.9"), &Domain::empty(), &RegexInterpreter)
            .unwrap();
        assert!(prediction.is_abstention());
    }

    #[test]
    fn ambiguous_ranking_triggers_fallback() {
        let policy = FallbackPolicy::default();
        let parse = ParseData {
            text: "hm".to_string(),
            intent: Some(Intent::with_confidence("a", 0.5)),
            entities: Vec::new(),
            intent_ranking: vec![
                Intent::with_confidence("a", 0.5),
                Intent::with_confidence("b", 0.45),
            ],
        };
        assert!(policy.nlu_fallback_reason(&parse).is_some());
    }

    #[test]
    fn abstains_outside_user_turns() {
        let mut tracker = tracker_with("/greet@0.1");
        tracker.update(Event::action_executed("utter_greet"));
        let prediction = FallbackPolicy::default()
            .predict_action_probabilities(&tracker, &Domain::empty(), &RegexInterpreter)
            .unwrap();
        assert!(prediction.is_abstention());
    }

    #[test]
    fn declares_fallback_capability() {
        let capability = FallbackPolicy::default().capabilities().fallback.unwrap();
        assert_eq!(capability.action_name, ACTION_DEFAULT_FALLBACK_NAME);
        assert!((capability.core_threshold - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn from_spec_rejects_bad_thresholds() {
        let spec = PolicySpec::new("FallbackPolicy").with_option("nlu_threshold", serde_json::json!(1.5));
        assert!(FallbackPolicy::from_spec(&spec).is_err());
    }
}
