//! Policy output.
//!
//! A `PolicyPrediction` is one policy's opinion about the next action: a
//! score per domain action plus the side-effect events the policy wants
//! applied.

use serde::{Deserialize, Serialize};

use crate::domain::Domain;
use crate::error::DomainError;
use crate::event::Event;

/// Priority used when a policy does not declare one.
pub const DEFAULT_POLICY_PRIORITY: i32 = 1;

/// Structured output of a policy.
///
/// `probabilities` is either empty (the policy abstains) or holds exactly
/// one score per domain action, aligned with the domain's action index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyPrediction {
    /// One score per domain action, or empty.
    pub probabilities: Vec<f64>,
    /// `policy_{index}_{TypeName}` once stamped by the ensemble.
    pub policy_name: Option<String>,
    /// Priority of the predicting policy.
    pub policy_priority: i32,
    /// Applied regardless of which policy wins.
    #[serde(default)]
    pub events: Vec<Event>,
    /// Applied only if this prediction wins.
    #[serde(default)]
    pub optional_events: Vec<Event>,
    /// The prediction was made from the user's raw text, not the intent.
    #[serde(default)]
    pub is_end_to_end_prediction: bool,
    /// The prediction does not depend on user input at all.
    #[serde(default)]
    pub is_no_user_prediction: bool,
    /// Free-form details about how the prediction was made.
    #[serde(default)]
    pub diagnostic_data: serde_json::Map<String, serde_json::Value>,
    /// The predicted turn comes from a rule that no story contains, so it
    /// should not be featurized as conversation history.
    #[serde(default)]
    pub hide_rule_turn: bool,
}

impl PolicyPrediction {
    /// Creates a prediction from a probability vector.
    #[must_use]
    pub fn new(probabilities: Vec<f64>, policy_name: Option<String>, policy_priority: i32) -> Self {
        Self {
            probabilities,
            policy_name,
            policy_priority,
            events: Vec::new(),
            optional_events: Vec::new(),
            is_end_to_end_prediction: false,
            is_no_user_prediction: false,
            diagnostic_data: serde_json::Map::new(),
            hide_rule_turn: false,
        }
    }

    /// A prediction without opinion. It is recorded by the ensemble but can
    /// never win.
    #[must_use]
    pub fn abstain(policy_priority: i32) -> Self {
        Self::new(Vec::new(), None, policy_priority)
    }

    /// One-hot prediction with `confidence` on `action_name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ActionNotFound` if the action is not part of
    /// the domain.
    pub fn for_action_name(
        domain: &Domain,
        action_name: &str,
        policy_name: Option<String>,
        confidence: f64,
    ) -> Result<Self, DomainError> {
        let index = domain.index_for_action(action_name)?;
        let mut probabilities = vec![0.0; domain.num_actions()];
        probabilities[index] = confidence;
        Ok(Self::new(probabilities, policy_name, DEFAULT_POLICY_PRIORITY))
    }

    /// Sets the policy priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.policy_priority = priority;
        self
    }

    /// Sets the must-have events.
    #[must_use]
    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    /// Sets the events applied only if this prediction wins.
    #[must_use]
    pub fn with_optional_events(mut self, optional_events: Vec<Event>) -> Self {
        self.optional_events = optional_events;
        self
    }

    /// Marks the prediction as made from raw user text.
    #[must_use]
    pub fn end_to_end(mut self, is_end_to_end_prediction: bool) -> Self {
        self.is_end_to_end_prediction = is_end_to_end_prediction;
        self
    }

    /// Marks the prediction as independent of user input.
    #[must_use]
    pub fn no_user(mut self, is_no_user_prediction: bool) -> Self {
        self.is_no_user_prediction = is_no_user_prediction;
        self
    }

    /// Marks the predicted turn as rule-only.
    #[must_use]
    pub fn hide_rule_turn(mut self, hide_rule_turn: bool) -> Self {
        self.hide_rule_turn = hide_rule_turn;
        self
    }

    /// Adds one diagnostic entry.
    #[must_use]
    pub fn with_diagnostic(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.diagnostic_data.insert(key.into(), value);
        self
    }

    /// True if the policy expressed no opinion.
    #[must_use]
    pub fn is_abstention(&self) -> bool {
        self.probabilities.is_empty()
    }

    /// Highest score, `0.0` for abstentions.
    #[must_use]
    pub fn max_confidence(&self) -> f64 {
        self.probabilities.iter().copied().fold(0.0, f64::max)
    }

    /// Index of the highest score; the first one on ties.
    #[must_use]
    pub fn max_confidence_index(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &p) in self.probabilities.iter().enumerate() {
            match best {
                Some((_, b)) if p <= b => {}
                _ => best = Some((i, p)),
            }
        }
        best.map(|(i, _)| i)
    }
}
