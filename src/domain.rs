//! The bot's action catalog.
//!
//! A `Domain` fixes the dimensionality of every prediction vector: index `i`
//! of a probability vector always refers to `action_names_or_texts()[i]`.
//! Built-in default actions come first, followed by user-defined actions,
//! responses and end-to-end action texts.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DialogueResult, DomainError, PersistenceError};

/// Waits for the next user message.
pub const ACTION_LISTEN_NAME: &str = "action_listen";
/// Resets the conversation.
pub const ACTION_RESTART_NAME: &str = "action_restart";
/// Starts a new session.
pub const ACTION_SESSION_START_NAME: &str = "action_session_start";
/// Default fallback when no policy is confident.
pub const ACTION_DEFAULT_FALLBACK_NAME: &str = "action_default_fallback";
/// Deactivates the active loop.
pub const ACTION_DEACTIVATE_LOOP_NAME: &str = "action_deactivate_loop";
/// Reverts events of a fallback exchange.
pub const ACTION_REVERT_FALLBACK_EVENTS_NAME: &str = "action_revert_fallback_events";
/// Asks the user to affirm the classified intent.
pub const ACTION_DEFAULT_ASK_AFFIRMATION_NAME: &str = "action_default_ask_affirmation";
/// Asks the user to rephrase.
pub const ACTION_DEFAULT_ASK_REPHRASE_NAME: &str = "action_default_ask_rephrase";
/// Two-stage fallback loop.
pub const ACTION_TWO_STAGE_FALLBACK_NAME: &str = "action_two_stage_fallback";
/// Flags a user intent that was unlikely in the current context.
pub const ACTION_UNLIKELY_INTENT_NAME: &str = "action_unlikely_intent";
/// Undoes the last user message.
pub const ACTION_BACK_NAME: &str = "action_back";

/// Actions every domain contains, in index order.
pub const DEFAULT_ACTION_NAMES: [&str; 11] = [
    ACTION_LISTEN_NAME,
    ACTION_RESTART_NAME,
    ACTION_SESSION_START_NAME,
    ACTION_DEFAULT_FALLBACK_NAME,
    ACTION_DEACTIVATE_LOOP_NAME,
    ACTION_REVERT_FALLBACK_EVENTS_NAME,
    ACTION_DEFAULT_ASK_AFFIRMATION_NAME,
    ACTION_DEFAULT_ASK_REPHRASE_NAME,
    ACTION_TWO_STAGE_FALLBACK_NAME,
    ACTION_UNLIKELY_INTENT_NAME,
    ACTION_BACK_NAME,
];

/// How a slot value contributes to dialogue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    /// Only presence matters.
    #[default]
    Text,
    /// The value itself is the feature.
    Bool,
    /// The lowercased value is the feature.
    Categorical,
    /// The value itself is the feature.
    Float,
    /// Only presence matters.
    List,
    /// Never influences the conversation.
    Any,
}

/// A slot declared in the domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDefinition {
    /// Slot name.
    pub name: String,
    /// How values are featurized.
    #[serde(rename = "type", default)]
    pub slot_type: SlotType,
    /// False if the slot never appears in dialogue state.
    #[serde(default = "default_true")]
    pub influence_conversation: bool,
}

fn default_true() -> bool {
    true
}

impl SlotDefinition {
    /// Creates a slot that influences the conversation.
    #[must_use]
    pub fn new(name: impl Into<String>, slot_type: SlotType) -> Self {
        Self {
            name: name.into(),
            slot_type,
            influence_conversation: slot_type != SlotType::Any,
        }
    }

    /// Dialogue-state feature for a slot value, or `None` if the value does
    /// not influence the conversation.
    #[must_use]
    pub fn featurize(&self, value: &serde_json::Value) -> Option<String> {
        if !self.influence_conversation || value.is_null() {
            return None;
        }
        match self.slot_type {
            SlotType::Any => None,
            SlotType::Text | SlotType::List => Some("set".to_string()),
            SlotType::Bool | SlotType::Categorical | SlotType::Float => Some(match value {
                serde_json::Value::String(s) => s.to_lowercase(),
                other => other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntentEntry {
    Name(String),
    Configured(BTreeMap<String, serde_yaml::Value>),
}

#[derive(Debug, Deserialize)]
struct SlotEntry {
    #[serde(rename = "type", default)]
    slot_type: SlotType,
    #[serde(default = "default_true")]
    influence_conversation: bool,
}

#[derive(Debug, Default, Deserialize)]
struct DomainFile {
    #[serde(default)]
    intents: Vec<IntentEntry>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    slots: BTreeMap<String, SlotEntry>,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    responses: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    action_texts: Vec<String>,
}

/// Immutable catalog of intents, entities, slots and actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    intents: Vec<String>,
    entities: Vec<String>,
    slots: Vec<SlotDefinition>,
    action_names_or_texts: Vec<String>,
    index: HashMap<String, usize>,
}

impl Domain {
    /// Builds a domain. Default actions are prepended; duplicates keep their
    /// first position.
    #[must_use]
    pub fn new(
        intents: Vec<String>,
        entities: Vec<String>,
        slots: Vec<SlotDefinition>,
        user_actions: Vec<String>,
    ) -> Self {
        let mut action_names_or_texts: Vec<String> = Vec::with_capacity(
            DEFAULT_ACTION_NAMES.len() + user_actions.len(),
        );
        let mut index = HashMap::new();
        let candidates = DEFAULT_ACTION_NAMES
            .iter()
            .map(|a| (*a).to_string())
            .chain(user_actions);
        for action in candidates {
            if !index.contains_key(&action) {
                index.insert(action.clone(), action_names_or_texts.len());
                action_names_or_texts.push(action);
            }
        }

        Self {
            intents,
            entities,
            slots,
            action_names_or_texts,
            index,
        }
    }

    /// A domain holding only the default actions.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new(), Vec::new())
    }

    /// Parses a YAML domain definition.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Parse` if the document is malformed.
    pub fn from_yaml(yaml: &str) -> DialogueResult<Self> {
        let file: DomainFile = if yaml.trim().is_empty() {
            DomainFile::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| DomainError::Parse {
                message: e.to_string(),
            })?
        };

        let intents = file
            .intents
            .into_iter()
            .filter_map(|entry| match entry {
                IntentEntry::Name(name) => Some(name),
                IntentEntry::Configured(map) => map.into_keys().next(),
            })
            .collect();
        let slots = file
            .slots
            .into_iter()
            .map(|(name, entry)| SlotDefinition {
                name,
                slot_type: entry.slot_type,
                influence_conversation: entry.influence_conversation,
            })
            .collect();
        let user_actions = file
            .actions
            .into_iter()
            .chain(file.responses.into_keys())
            .chain(file.action_texts)
            .collect();

        Ok(Self::new(intents, file.entities, slots, user_actions))
    }

    /// Loads a YAML domain file.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the file cannot be read, or
    /// `DomainError::Parse` if it is malformed.
    pub fn load(path: impl AsRef<Path>) -> DialogueResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| PersistenceError::io(path, &e))?;
        Self::from_yaml(&raw)
    }

    /// Number of actions, i.e. the length of every non-empty prediction.
    #[must_use]
    pub fn num_actions(&self) -> usize {
        self.action_names_or_texts.len()
    }

    /// All action names (and end-to-end texts) in index order.
    #[must_use]
    pub fn action_names_or_texts(&self) -> &[String] {
        &self.action_names_or_texts
    }

    /// Intent names.
    #[must_use]
    pub fn intents(&self) -> &[String] {
        &self.intents
    }

    /// Entity names.
    #[must_use]
    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    /// Declared slots.
    #[must_use]
    pub fn slots(&self) -> &[SlotDefinition] {
        &self.slots
    }

    /// Looks up a slot definition by name.
    #[must_use]
    pub fn slot(&self, name: &str) -> Option<&SlotDefinition> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Returns true if the action (or action text) is part of the domain.
    #[must_use]
    pub fn has_action(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Index of an action in every prediction vector.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ActionNotFound` for unknown actions.
    pub fn index_for_action(&self, name: &str) -> Result<usize, DomainError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| DomainError::ActionNotFound {
                name: name.to_string(),
            })
    }

    /// Action at a prediction index.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ActionIndexOutOfRange` if `index` is too large.
    pub fn action_for_index(&self, index: usize) -> Result<&str, DomainError> {
        self.action_names_or_texts
            .get(index)
            .map(String::as_str)
            .ok_or(DomainError::ActionIndexOutOfRange {
                index,
                num_actions: self.num_actions(),
            })
    }

    /// Stable content hash. Two domains with the same intents, entities,
    /// slots and actions share a fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (section, items) in [
            ("intents", &self.intents),
            ("entities", &self.entities),
            ("actions", &self.action_names_or_texts),
        ] {
            hasher.update(section.as_bytes());
            for item in items {
                hasher.update(&(item.len() as u64).to_le_bytes());
                hasher.update(item.as_bytes());
            }
        }
        hasher.update(b"slots");
        for slot in &self.slots {
            hasher.update(slot.name.as_bytes());
            hasher.update(format!("{:?}:{}", slot.slot_type, slot.influence_conversation).as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}
