use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::PolicySpec;
use crate::domain::Domain;
use crate::error::{ConfigError, DialogueError, DialogueResult};
use crate::interpreter::NaturalLanguageInterpreter;
use crate::policy::{load_state, persist_state, Policy, RegistrablePolicy};
use crate::prediction::PolicyPrediction;
use crate::tracker::{DialogueStateTracker, TurnState};

/// Default priority of the memorizing policies.
pub const MEMOIZATION_POLICY_PRIORITY: i32 = 3;

/// Options of [`MemoizationPolicy`] and [`AugmentedMemoizationPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoizationConfig {
    /// Number of turns forming the memorized context.
    pub max_history: usize,
}

impl Default for MemoizationConfig {
    fn default() -> Self {
        Self { max_history: 5 }
    }
}

impl MemoizationConfig {
    fn validate(self, policy: &str) -> Result<Self, ConfigError> {
        if self.max_history == 0 {
            return Err(ConfigError::InvalidPolicyOptions {
                policy: policy.to_string(),
                reason: "max_history must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}

/// Memorized `state window -> action` table.
///
/// A window seen with two different actions is contradictory and maps to
/// `None`, so it never predicts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Memory {
    max_history: usize,
    lookup: BTreeMap<String, Option<String>>,
}

fn window_key(window: &[TurnState]) -> DialogueResult<String> {
    serde_json::to_string(window)
        .map_err(|e| DialogueError::internal(format!("failed to encode dialogue states: {e}")))
}

impl Memory {
    fn new(max_history: usize) -> Self {
        Self {
            max_history,
            lookup: BTreeMap::new(),
        }
    }

    /// Memorizes every story turn. With `all_lengths`, every shorter suffix
    /// of each window is memorized as well.
    fn train(
        &mut self,
        trackers: &[DialogueStateTracker],
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
        all_lengths: bool,
    ) -> DialogueResult<()> {
        self.lookup.clear();
        for tracker in trackers.iter().filter(|t| !t.is_rule_tracker()) {
            let history = tracker.state_history(domain, interpreter);
            for (i, action) in history.actions.iter().enumerate() {
                let end = i + 1;
                let longest = end.min(self.max_history);
                let shortest = if all_lengths { 1 } else { longest };
                for len in shortest..=longest {
                    self.memorize(&history.states[end - len..end], action)?;
                }
            }
        }

        let contradictions = self.lookup.values().filter(|v| v.is_none()).count();
        tracing::debug!(
            "Memorized {} dialogue contexts ({contradictions} contradictory)",
            self.lookup.len()
        );
        Ok(())
    }

    fn memorize(&mut self, window: &[TurnState], action: &str) -> DialogueResult<()> {
        let key = window_key(window)?;
        match self.lookup.get_mut(&key) {
            None => {
                self.lookup.insert(key, Some(action.to_string()));
            }
            Some(existing) => {
                if existing.as_deref() != Some(action) {
                    *existing = None;
                }
            }
        }
        Ok(())
    }

    fn recall(&self, states: &[TurnState], len: usize) -> DialogueResult<Option<&str>> {
        if len == 0 || len > states.len() {
            return Ok(None);
        }
        let key = window_key(&states[states.len() - len..])?;
        Ok(self.lookup.get(&key).and_then(|a| a.as_deref()))
    }
}

fn memorized_prediction(
    domain: &Domain,
    action: &str,
    priority: i32,
    window_len: usize,
) -> PolicyPrediction {
    match PolicyPrediction::for_action_name(domain, action, None, 1.0) {
        Ok(prediction) => prediction
            .with_priority(priority)
            .with_diagnostic("memorized_turns", serde_json::json!(window_len)),
        Err(e) => {
            tracing::debug!("Memorized action is unavailable: {e}");
            PolicyPrediction::abstain(priority)
        }
    }
}

/// Predicts the action that followed the exact same dialogue context in the
/// training stories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoizationPolicy {
    priority: i32,
    memory: Memory,
}

impl MemoizationPolicy {
    /// Creates an untrained policy.
    #[must_use]
    pub fn new(config: MemoizationConfig, priority: i32) -> Self {
        Self {
            priority,
            memory: Memory::new(config.max_history),
        }
    }

    /// Longest state window that is memorized.
    #[must_use]
    pub fn max_history(&self) -> usize {
        self.memory.max_history
    }

    /// Number of memorized contexts, contradictory ones included.
    #[must_use]
    pub fn memorized_len(&self) -> usize {
        self.memory.lookup.len()
    }
}

impl Default for MemoizationPolicy {
    fn default() -> Self {
        Self::new(MemoizationConfig::default(), MEMOIZATION_POLICY_PRIORITY)
    }
}

impl Policy for MemoizationPolicy {
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
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<()> {
        self.memory.train(training_trackers, domain, interpreter, false)
    }

    fn predict_action_probabilities(
        &self,
        tracker: &DialogueStateTracker,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction> {
        let states = tracker.past_states(domain, interpreter);
        let len = states.len().min(self.memory.max_history);
        Ok(match self.memory.recall(&states, len)? {
            Some(action) => memorized_prediction(domain, action, self.priority, len),
            None => PolicyPrediction::abstain(self.priority),
        })
    }

    fn persist(&self, dir: &Path) -> DialogueResult<()> {
        persist_state(dir, self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegistrablePolicy for MemoizationPolicy {
    const TYPE_NAME: &'static str = "MemoizationPolicy";
    const MODULE_PATH: &'static str = module_path!();

    fn from_spec(spec: &PolicySpec) -> Result<Self, ConfigError> {
        let config = spec.options::<MemoizationConfig>()?.validate(&spec.name)?;
        Ok(Self::new(
            config,
            spec.priority.unwrap_or(MEMOIZATION_POLICY_PRIORITY),
        ))
    }

    fn load(dir: &Path) -> DialogueResult<Option<Self>> {
        load_state(dir)
    }
}

/// Memoization that falls back to shorter contexts.
///
/// When the full context was never seen, the oldest turns are forgotten one
/// by one until a memorized context matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AugmentedMemoizationPolicy {
    priority: i32,
    memory: Memory,
}

impl AugmentedMemoizationPolicy {
    /// Creates an untrained policy.
    #[must_use]
    pub fn new(config: MemoizationConfig, priority: i32) -> Self {
        Self {
            priority,
            memory: Memory::new(config.max_history),
        }
    }
}

impl Default for AugmentedMemoizationPolicy {
    fn default() -> Self {
        Self::new(MemoizationConfig::default(), MEMOIZATION_POLICY_PRIORITY)
    }
}

impl Policy for AugmentedMemoizationPolicy {
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
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<()> {
        self.memory.train(training_trackers, domain, interpreter, true)
    }

    fn predict_action_probabilities(
        &self,
        tracker: &DialogueStateTracker,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction> {
        let states = tracker.past_states(domain, interpreter);
        let longest = states.len().min(self.memory.max_history);
        for len in (1..=longest).rev() {
            if let Some(action) = self.memory.recall(&states, len)? {
                if len < longest {
                    tracing::debug!("Recalled '{action}' after forgetting {} turns", longest - len);
                }
                return Ok(memorized_prediction(domain, action, self.priority, len));
            }
        }
        Ok(PolicyPrediction::abstain(self.priority))
    }

    fn persist(&self, dir: &Path) -> DialogueResult<()> {
        persist_state(dir, self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegistrablePolicy for AugmentedMemoizationPolicy {
    const TYPE_NAME: &'static str = "AugmentedMemoizationPolicy";
    const MODULE_PATH: &'static str = module_path!();

    fn from_spec(spec: &PolicySpec) -> Result<Self, ConfigError> {
        let config = spec.options::<MemoizationConfig>()?.validate(&spec.name)?;
        Ok(Self::new(
            config,
            spec.priority.unwrap_or(MEMOIZATION_POLICY_PRIORITY),
        ))
    }

    fn load(dir: &Path) -> DialogueResult<Option<Self>> {
        load_state(dir)
    }
}
