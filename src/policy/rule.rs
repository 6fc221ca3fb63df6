use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::PolicySpec;
use crate::domain::Domain;
use crate::error::{ConfigError, DialogueResult};
use crate::interpreter::NaturalLanguageInterpreter;
use crate::policy::{load_state, persist_state, Policy, PolicyCapabilities, RegistrablePolicy};
use crate::prediction::PolicyPrediction;
use crate::tracker::{DialogueStateTracker, TurnState};

/// Default priority of [`RulePolicy`].
pub const RULE_POLICY_PRIORITY: i32 = 6;

/// Options of [`RulePolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Drop rules whose conditions also lead to a different action.
    pub drop_contradicting_rules: bool,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            drop_contradicting_rules: true,
        }
    }
}

/// Conditions on the latest turns and the action they lead to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Rule {
    conditions: Vec<TurnState>,
    action: String,
    /// Some story contains this turn.
    #[serde(default)]
    in_stories: bool,
}

/// A condition matches a state if every feature the condition sets is
/// present in the state.
fn condition_matches(condition: &TurnState, state: &TurnState) -> bool {
    fn same(expected: Option<&String>, actual: Option<&String>) -> bool {
        expected.is_none() || expected == actual
    }

    same(condition.prev_action.as_ref(), state.prev_action.as_ref())
        && same(condition.user_intent.as_ref(), state.user_intent.as_ref())
        && same(condition.user_text.as_ref(), state.user_text.as_ref())
        && same(condition.active_loop.as_ref(), state.active_loop.as_ref())
        && condition.entities.iter().all(|e| state.entities.contains(e))
        && condition.slots.iter().all(|s| state.slots.contains(s))
}

impl Rule {
    fn matches(&self, states: &[TurnState]) -> bool {
        let k = self.conditions.len();
        k <= states.len()
            && self
                .conditions
                .iter()
                .zip(&states[states.len() - k..])
                .all(|(condition, state)| condition_matches(condition, state))
    }

    fn depends_on_user(&self) -> bool {
        self.conditions.last().is_some_and(TurnState::has_user_input)
    }

    fn occurs_in(&self, states: &[TurnState], actions: &[String]) -> bool {
        let k = self.conditions.len();
        actions.iter().enumerate().any(|(i, action)| {
            *action == self.action && i + 1 >= k && states[i + 1 - k..=i] == self.conditions[..]
        })
    }
}

/// Predicts the action of the most specific matching rule.
///
/// Rules are learned from rule-derived trackers only. Rules whose last
/// condition carries no user input are flagged as no-user predictions and
/// take precedence over everything else in the ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePolicy {
    priority: i32,
    config: RuleConfig,
    rules: Vec<Rule>,
}

impl RulePolicy {
    /// Creates an untrained policy.
    #[must_use]
    pub fn new(config: RuleConfig, priority: i32) -> Self {
        Self {
            priority,
            config,
            rules: Vec::new(),
        }
    }

    /// Number of learned rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn extract_rules(
        trackers: &[DialogueStateTracker],
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> Vec<Rule> {
        let mut rules = Vec::new();
        for tracker in trackers.iter().filter(|t| t.is_rule_tracker()) {
            let history = tracker.state_history(domain, interpreter);
            let first = usize::from(history.states.first().is_some_and(TurnState::is_conversation_start));
            for (i, action) in history.actions.iter().enumerate() {
                if i < first {
                    continue;
                }
                let rule = Rule {
                    conditions: history.states[first..=i].to_vec(),
                    action: action.clone(),
                    in_stories: false,
                };
                if !rules.contains(&rule) {
                    rules.push(rule);
                }
            }
        }
        rules
    }

    fn mark_story_turns(
        rules: &mut [Rule],
        trackers: &[DialogueStateTracker],
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) {
        for tracker in trackers.iter().filter(|t| !t.is_rule_tracker()) {
            let history = tracker.state_history(domain, interpreter);
            for rule in rules.iter_mut().filter(|r| !r.in_stories) {
                rule.in_stories = rule.occurs_in(&history.states, &history.actions);
            }
        }
    }

    fn drop_contradictions(rules: Vec<Rule>) -> Vec<Rule> {
        let mut actions_by_conditions: BTreeMap<&[TurnState], Vec<&str>> = BTreeMap::new();
        for rule in &rules {
            actions_by_conditions
                .entry(rule.conditions.as_slice())
                .or_default()
                .push(rule.action.as_str());
        }
        let contradicting: Vec<Vec<TurnState>> = actions_by_conditions
            .iter()
            .filter(|(_, actions)| actions.len() > 1)
            .map(|(conditions, actions)| {
                tracing::warn!(
                    "Contradicting rules: the same conditions lead to {}. These rules are ignored.",
                    actions.join(", ")
                );
                conditions.to_vec()
            })
            .collect();

        rules
            .into_iter()
            .filter(|rule| !contradicting.contains(&rule.conditions))
            .collect()
    }
}

impl Default for RulePolicy {
    fn default() -> Self {
        Self::new(RuleConfig::default(), RULE_POLICY_PRIORITY)
    }
}

impl Policy for RulePolicy {
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
            supports_rules: true,
            ..PolicyCapabilities::default()
        }
    }

    fn train(
        &mut self,
        training_trackers: &[DialogueStateTracker],
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<()> {
        let mut rules = Self::extract_rules(training_trackers, domain, interpreter);
        Self::mark_story_turns(&mut rules, training_trackers, domain, interpreter);
        self.rules = if self.config.drop_contradicting_rules {
            Self::drop_contradictions(rules)
        } else {
            rules
        };
        tracing::debug!("Learned {} rules", self.rules.len());
        Ok(())
    }

    fn predict_action_probabilities(
        &self,
        tracker: &DialogueStateTracker,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction> {
        let states = tracker.past_states(domain, interpreter);

        let mut best: Option<&Rule> = None;
        for rule in self.rules.iter().filter(|r| r.matches(&states)) {
            if best.map_or(true, |b| rule.conditions.len() > b.conditions.len()) {
                best = Some(rule);
            }
        }

        let Some(rule) = best else {
            return Ok(PolicyPrediction::abstain(self.priority));
        };
        match PolicyPrediction::for_action_name(domain, &rule.action, None, 1.0) {
            Ok(prediction) => Ok(prediction
                .with_priority(self.priority)
                .no_user(!rule.depends_on_user())
                .hide_rule_turn(!rule.in_stories)
                .with_diagnostic("rule_turns", serde_json::json!(rule.conditions.len()))),
            Err(e) => {
                tracing::debug!("Rule action is unavailable: {e}");
                Ok(PolicyPrediction::abstain(self.priority))
            }
        }
    }

    fn persist(&self, dir: &Path) -> DialogueResult<()> {
        persist_state(dir, self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegistrablePolicy for RulePolicy {
    const TYPE_NAME: &'static str = "RulePolicy";
    const MODULE_PATH: &'static str = module_path!();

    fn from_spec(spec: &PolicySpec) -> Result<Self, ConfigError> {
        Ok(Self::new(
            spec.options()?,
            spec.priority.unwrap_or(RULE_POLICY_PRIORITY),
        ))
    }

    fn load(dir: &Path) -> DialogueResult<Option<Self>> {
        load_state(dir)
    }
}
