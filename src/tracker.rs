//! Conversation state.
//!
//! A `DialogueStateTracker` is an append-only event log plus the state derived
//! from it. The ensemble and every policy only read trackers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Domain, ACTION_LISTEN_NAME};
use crate::event::Event;
use crate::interpreter::{NaturalLanguageInterpreter, ParseData};

/// Dialogue state right before an action is predicted.
///
/// User features are only present when the previous action was
/// `action_listen`, i.e. when the state describes a user turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnState {
    /// Action executed right before this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_action: Option<String>,
    /// Intent of the user turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_intent: Option<String>,
    /// Raw text of a user turn that has no classified intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_text: Option<String>,
    /// Entity names of the user turn, sorted and deduplicated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    /// Featurized `(slot, value)` pairs, sorted by slot name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<(String, String)>,
    /// Loop running at this point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_loop: Option<String>,
}

impl TurnState {
    /// True for the empty state at the very start of a conversation.
    #[must_use]
    pub fn is_conversation_start(&self) -> bool {
        *self == Self::default()
    }

    /// True if this state carries user input.
    #[must_use]
    pub fn has_user_input(&self) -> bool {
        self.user_intent.is_some() || self.user_text.is_some()
    }
}

/// States and the actions that followed them.
///
/// `states[i]` is the state before `actions[i]`; the final state describes
/// the conversation as it is now, so `states.len() == actions.len() + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateHistory {
    /// One more than `actions`.
    pub states: Vec<TurnState>,
    /// Executed action names.
    pub actions: Vec<String>,
}

/// Ordered event history of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueStateTracker {
    sender_id: String,
    events: Vec<Event>,
    is_rule_tracker: bool,
    slots: BTreeMap<String, serde_json::Value>,
    latest_message: Option<ParseData>,
    latest_action_name: Option<String>,
    active_loop: Option<String>,
}

impl DialogueStateTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            events: Vec::new(),
            is_rule_tracker: false,
            slots: BTreeMap::new(),
            latest_message: None,
            latest_action_name: None,
            active_loop: None,
        }
    }

    /// Creates an empty tracker with a random sender id.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Creates a tracker and replays `events` into it.
    #[must_use]
    pub fn from_events(sender_id: impl Into<String>, events: Vec<Event>) -> Self {
        let mut tracker = Self::new(sender_id);
        for event in events {
            tracker.update(event);
        }
        tracker
    }

    /// Marks this tracker as authored from a rule rather than a story.
    #[must_use]
    pub fn into_rule_tracker(mut self) -> Self {
        self.is_rule_tracker = true;
        self
    }

    /// Appends an event and updates the derived state.
    pub fn update(&mut self, event: Event) {
        match &event {
            Event::UserUttered {
                text,
                intent,
                entities,
            } => {
                self.latest_message = Some(ParseData {
                    text: text.clone().unwrap_or_default(),
                    intent: intent.clone(),
                    entities: entities.clone(),
                    intent_ranking: intent.iter().cloned().collect(),
                });
            }
            Event::ActionExecuted { .. } => {
                self.latest_action_name = event.action_name_or_text().map(str::to_string);
            }
            Event::SlotSet { key, value } => {
                self.slots.insert(key.clone(), value.clone());
            }
            Event::ActiveLoop { name } => {
                self.active_loop = name.clone();
            }
            Event::Restarted => {
                self.slots.clear();
                self.latest_message = None;
                self.latest_action_name = None;
                self.active_loop = None;
            }
            Event::BotUttered { .. }
            | Event::ActionExecutionRejected { .. }
            | Event::DefinePrevUserUtteredFeaturization { .. } => {}
        }
        self.events.push(event);
    }

    /// Conversation id.
    #[must_use]
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Every event, oldest first.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// True for trackers built from rule training data.
    #[must_use]
    pub const fn is_rule_tracker(&self) -> bool {
        self.is_rule_tracker
    }

    /// The most recently appended event.
    #[must_use]
    pub fn latest_event(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Name of the most recently executed action.
    #[must_use]
    pub fn latest_action_name(&self) -> Option<&str> {
        self.latest_action_name.as_deref()
    }

    /// Parse data of the most recent user message.
    #[must_use]
    pub fn latest_message(&self) -> Option<&ParseData> {
        self.latest_message.as_ref()
    }

    /// Current slot values.
    #[must_use]
    pub fn slots(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.slots
    }

    /// Current value of one slot.
    #[must_use]
    pub fn get_slot(&self, key: &str) -> Option<&serde_json::Value> {
        self.slots.get(key)
    }

    /// Name of the running loop, if any.
    #[must_use]
    pub fn active_loop_name(&self) -> Option<&str> {
        self.active_loop.as_deref()
    }

    /// Name of the rejected action if the latest action-type event is an
    /// `ActionExecutionRejected`.
    #[must_use]
    pub fn rejected_action_name(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|event| match event {
            Event::ActionExecutionRejected { action_name, .. } => Some(Some(action_name.as_str())),
            Event::ActionExecuted { .. } => Some(None),
            _ => None,
        })?
    }

    /// Replays the events into dialogue states.
    ///
    /// User turns without a classified intent are parsed with `interpreter`.
    #[must_use]
    pub fn state_history(
        &self,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> StateHistory {
        let mut history = StateHistory::default();
        let mut replay = Replay::default();

        for event in &self.events {
            match event {
                Event::UserUttered {
                    text,
                    intent,
                    entities,
                } => {
                    let intent_name = match (intent, text) {
                        (Some(intent), _) => Some(intent.name.clone()),
                        (None, Some(text)) => interpreter.parse(text).intent.map(|i| i.name),
                        (None, None) => None,
                    };
                    let mut entity_names: Vec<String> =
                        entities.iter().map(|e| e.entity.clone()).collect();
                    entity_names.sort();
                    entity_names.dedup();
                    replay.user_text = if intent_name.is_none() { text.clone() } else { None };
                    replay.user_intent = intent_name;
                    replay.entities = entity_names;
                }
                Event::ActionExecuted { .. } => {
                    let Some(action) = event.action_name_or_text() else {
                        continue;
                    };
                    history.states.push(replay.state(domain));
                    history.actions.push(action.to_string());
                    replay.prev_action = Some(action.to_string());
                }
                Event::SlotSet { key, value } => {
                    replay.slots.insert(key.clone(), value.clone());
                }
                Event::ActiveLoop { name } => {
                    replay.active_loop = name.clone();
                }
                Event::Restarted => {
                    replay = Replay::default();
                }
                Event::BotUttered { .. }
                | Event::ActionExecutionRejected { .. }
                | Event::DefinePrevUserUtteredFeaturization { .. } => {}
            }
        }

        history.states.push(replay.state(domain));
        history
    }

    /// States leading up to the next prediction, oldest first.
    #[must_use]
    pub fn past_states(
        &self,
        domain: &Domain,
        interpreter: &dyn NaturalLanguageInterpreter,
    ) -> Vec<TurnState> {
        self.state_history(domain, interpreter).states
    }
}

#[derive(Default)]
struct Replay {
    prev_action: Option<String>,
    user_intent: Option<String>,
    user_text: Option<String>,
    entities: Vec<String>,
    slots: BTreeMap<String, serde_json::Value>,
    active_loop: Option<String>,
}

impl Replay {
    fn state(&self, domain: &Domain) -> TurnState {
        let after_listen = self.prev_action.as_deref() == Some(ACTION_LISTEN_NAME);
        let slots = self
            .slots
            .iter()
            .filter_map(|(name, value)| {
                domain
                    .slot(name)
                    .and_then(|slot| slot.featurize(value))
                    .map(|feature| (name.clone(), feature))
            })
            .collect();

        TurnState {
            prev_action: self.prev_action.clone(),
            user_intent: if after_listen { self.user_intent.clone() } else { None },
            user_text: if after_listen { self.user_text.clone() } else { None },
            entities: if after_listen { self.entities.clone() } else { Vec::new() },
            slots,
            active_loop: self.active_loop.clone(),
        }
    }
}
