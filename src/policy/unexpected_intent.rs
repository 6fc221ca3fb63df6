use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::PolicySpec;
use crate::domain::{Domain, ACTION_LISTEN_NAME, ACTION_UNLIKELY_INTENT_NAME};
use crate::error::{ConfigError, DialogueResult};
use crate::event::Event;
use crate::interpreter::NaturalLanguageInterpreter;
use crate::policy::{load_state, persist_state, Policy, RegistrablePolicy};
use crate::prediction::PolicyPrediction;
use crate::tracker::DialogueStateTracker;

/// Default priority of [`UnexpectedIntentPolicy`].
pub const UNLIKELY_INTENT_POLICY_PRIORITY: i32 = 2;

const CONVERSATION_START: &str = "<conversation_start>";

/// Options of [`UnexpectedIntentPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnexpectedIntentConfig {
    /// Intents never flagged as unlikely.
    pub ignore_intents: Vec<String>,
}

/// Flags user intents that never followed the current bot action in the
/// training stories by predicting `action_unlikely_intent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnexpectedIntentPolicy {
    priority: i32,
    config: UnexpectedIntentConfig,
    /// Bot action -> intents observed right after it.
    observed: BTreeMap<String, BTreeSet<String>>,
}

/// Bot action that preceded the listen which produced the latest user
/// message, and that message's intent.
fn user_turns(
    tracker: &DialogueStateTracker,
    interpreter: &dyn NaturalLanguageInterpreter,
) -> Vec<(String, String)> {
    let mut turns = Vec::new();
    let mut last_bot_action = CONVERSATION_START.to_string();
    for event in tracker.events() {
        match event {
            Event::ActionExecuted { .. } => {
                if let Some(action) = event.action_name_or_text() {
                    if action != ACTION_LISTEN_NAME {
                        last_bot_action = action.to_string();
                    }
                }
            }
            Event::UserUttered { text, intent, .. } => {
                let intent = match (intent, text) {
                    (Some(intent), _) => Some(intent.name.clone()),
                    (None, Some(text)) => interpreter.parse(text).intent.map(|i| i.name),
                    (None, None) => None,
                };
                if let Some(intent) = intent {
                    turns.push((last_bot_action.clone(), intent));
                }
            }
            Event::Restarted => last_bot_action = CONVERSATION_START.to_string(),
            _ => {}
        }
    }
    turns
}

impl UnexpectedIntentPolicy {
    /// Creates an untrained policy.
    #[must_use]
    pub fn new(config: UnexpectedIntentConfig, priority: i32) -> Self {
        Self {
            priority,
            config,
            observed: BTreeMap::new(),
        }
    }

    /// Returns true if `intent` was seen after `bot_action` during training.
    #[must_use]
    pub fn was_observed(&self, bot_action: &str, intent: &str) -> bool {
        self.observed
            .get(bot_action)
            .is_some_and(|intents| intents.contains(intent))
    }
}

impl Default for UnexpectedIntentPolicy {
    fn default() -> Self {
        Self::new(UnexpectedIntentConfig::default(), UNLIKELY_INTENT_POLICY_PRIORITY)
    }
}

impl Policy for UnexpectedIntentPolicy {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn module_path(&self) -> &'static str {
        Self::MODULE_PATH
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn train(
        &mut self,
        training_trackers: &[DialogueStateTracker],
        _domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<()> {
        self.observed.clear();
        for tracker in training_trackers.iter().filter(|t| !t.is_rule_tracker()) {
            for (bot_action, intent) in user_turns(tracker, interpreter) {
                self.observed.entry(bot_action).or_default().insert(intent);
            }
        }
        Ok(())
    }

    fn predict_action_probabilities(
        &self,
        tracker: &DialogueStateTracker,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction> {
        let abstain = PolicyPrediction::abstain(self.priority);
        if !tracker.latest_event().is_some_and(Event::is_user_uttered) {
            return Ok(abstain);
        }
        let Some((bot_action, intent)) = user_turns(tracker, interpreter).pop() else {
            return Ok(abstain);
        };
        if self.config.ignore_intents.contains(&intent)
            || !self.observed.contains_key(&bot_action)
            || self.was_observed(&bot_action, &intent)
        {
            return Ok(abstain);
        }

        tracing::debug!("Intent '{intent}' is unlikely after '{bot_action}'");
        Ok(
            PolicyPrediction::for_action_name(domain, ACTION_UNLIKELY_INTENT_NAME, None, 1.0)?
                .with_priority(self.priority)
                .with_diagnostic("unlikely_intent", serde_json::json!(intent))
                .with_diagnostic("after_action", serde_json::json!(bot_action)),
        )
    }

    fn persist(&self, dir: &Path) -> DialogueResult<()> {
        persist_state(dir, self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegistrablePolicy for UnexpectedIntentPolicy {
    const TYPE_NAME: &'static str = "UnexpectedIntentPolicy";
    const MODULE_PATH: &'static str = module_path!();

    fn from_spec(spec: &PolicySpec) -> Result<Self, ConfigError> {
        Ok(Self::new(
            spec.options()?,
            spec.priority.unwrap_or(UNLIKELY_INTENT_POLICY_PRIORITY),
        ))
    }

    fn load(dir: &Path) -> DialogueResult<Option<Self>> {
        load_state(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::RegexInterpreter;

    fn domain() -> Domain {
        Domain::new(
            vec!["greet".to_string(), "goodbye".to_string(), "mood_great".to_string()],
            Vec::new(),
            Vec::new(),
            vec!["utter_greet".to_string()],
        )
    }

    fn trained(config: UnexpectedIntentConfig) -> UnexpectedIntentPolicy {
        let story = DialogueStateTracker::from_events(
            "story",
            vec![
                Event::action_executed(ACTION_LISTEN_NAME),
                Event::user_uttered("hi", "greet"),
                Event::action_executed("utter_greet"),
                Event::action_executed(ACTION_LISTEN_NAME),
                Event::user_uttered("great", "mood_great"),
            ],
        );
        let mut policy = UnexpectedIntentPolicy::new(config, UNLIKELY_INTENT_POLICY_PRIORITY);
        policy.train(&[story], &domain(), &RegexInterpreter).unwrap();
        policy
    }

    fn after_greet(intent: &str) -> DialogueStateTracker {
        DialogueStateTracker::from_events(
            "c",
            vec![
                Event::action_executed(ACTION_LISTEN_NAME),
                Event::user_uttered("hi", "greet"),
                Event::action_executed("utter_greet"),
                Event::action_executed(ACTION_LISTEN_NAME),
                Event::user_uttered("x", intent),
            ],
        )
    }

    #[test]
    fn flags_unseen_intent() {
        let domain = domain();
        let prediction = trained(UnexpectedIntentConfig::default())
            .predict_action_probabilities(&after_greet("goodbye"), &domain, &RegexInterpreter)
            .unwrap();
        assert_eq!(
            prediction.max_confidence_index(),
            Some(domain.index_for_action(ACTION_UNLIKELY_INTENT_NAME).unwrap())
        );
    }

    #[test]
    fn accepts_seen_intent() {
        let prediction = trained(UnexpectedIntentConfig::default())
            .predict_action_probabilities(&after_greet("mood_great"), &domain(), &RegexInterpreter)
            .unwrap();
        assert!(prediction.is_abstention());
    }

    #[test]
    fn respects_ignore_intents() {
        let policy = trained(UnexpectedIntentConfig {
            ignore_intents: vec!["goodbye".to_string()],
        });
        let prediction = policy
            .predict_action_probabilities(&after_greet("goodbye"), &domain(), &RegexInterpreter)
            .unwrap();
        assert!(prediction.is_abstention());
    }

    #[test]
    fn only_predicts_right_after_user_message() {
        let mut tracker = after_greet("goodbye");
        tracker.update(Event::action_executed(ACTION_UNLIKELY_INTENT_NAME));
        let prediction = trained(UnexpectedIntentConfig::default())
            .predict_action_probabilities(&tracker, &domain(), &RegexInterpreter)
            .unwrap();
        assert!(prediction.is_abstention());
    }
}
