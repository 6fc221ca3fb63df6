//! Conversation events.
//!
//! Events are immutable once appended to a tracker. Policies may also emit
//! events as side effects of a prediction; the ensemble merges those into the
//! reconciled result.

use serde::{Deserialize, Serialize};

use crate::interpreter::{EntityAnnotation, Intent, ParseData};

/// A single entry of a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The user sent a message.
    UserUttered {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        intent: Option<Intent>,
        #[serde(default)]
        entities: Vec<EntityAnnotation>,
    },

    /// The bot sent a message.
    BotUttered {
        #[serde(default)]
        text: Option<String>,
    },

    /// An action was run. End-to-end actions carry `action_text` instead of
    /// a name.
    ActionExecuted {
        #[serde(default)]
        action_name: Option<String>,
        #[serde(default)]
        action_text: Option<String>,
        #[serde(default)]
        policy: Option<String>,
        #[serde(default)]
        confidence: Option<f64>,
    },

    /// A predicted action refused to run.
    ActionExecutionRejected {
        action_name: String,
        #[serde(default)]
        policy: Option<String>,
        #[serde(default)]
        confidence: Option<f64>,
    },

    /// A slot was set.
    SlotSet {
        key: String,
        value: serde_json::Value,
    },

    /// A loop was activated (`Some`) or deactivated (`None`).
    ActiveLoop {
        #[serde(default)]
        name: Option<String>,
    },

    /// Marks whether the previous user utterance was featurized from text
    /// (end-to-end) or from its intent.
    DefinePrevUserUtteredFeaturization {
        use_text_for_featurization: bool,
    },

    /// The conversation was reset.
    Restarted,
}

impl Event {
    /// `ActionExecuted` for a named action.
    #[must_use]
    pub fn action_executed(action_name: impl Into<String>) -> Self {
        Self::ActionExecuted {
            action_name: Some(action_name.into()),
            action_text: None,
            policy: None,
            confidence: None,
        }
    }

    /// `UserUttered` with text and a fully confident intent.
    #[must_use]
    pub fn user_uttered(text: impl Into<String>, intent: impl Into<String>) -> Self {
        Self::UserUttered {
            text: Some(text.into()),
            intent: Some(Intent::new(intent)),
            entities: Vec::new(),
        }
    }

    /// `UserUttered` carrying only raw text.
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::UserUttered {
            text: Some(text.into()),
            intent: None,
            entities: Vec::new(),
        }
    }

    /// `UserUttered` built from an interpreter result.
    #[must_use]
    pub fn from_parse(parse: ParseData) -> Self {
        Self::UserUttered {
            text: Some(parse.text),
            intent: parse.intent,
            entities: parse.entities,
        }
    }

    /// `SlotSet` event.
    #[must_use]
    pub fn slot_set(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::SlotSet {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `ActionExecutionRejected` event.
    #[must_use]
    pub fn action_rejected(action_name: impl Into<String>) -> Self {
        Self::ActionExecutionRejected {
            action_name: action_name.into(),
            policy: None,
            confidence: None,
        }
    }

    /// `DefinePrevUserUtteredFeaturization` event.
    #[must_use]
    pub const fn define_prev_user_uttered_featurization(use_text_for_featurization: bool) -> Self {
        Self::DefinePrevUserUtteredFeaturization {
            use_text_for_featurization,
        }
    }

    /// Short stable identifier suitable for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UserUttered { .. } => "user",
            Self::BotUttered { .. } => "bot",
            Self::ActionExecuted { .. } => "action",
            Self::ActionExecutionRejected { .. } => "action_execution_rejected",
            Self::SlotSet { .. } => "slot",
            Self::ActiveLoop { .. } => "active_loop",
            Self::DefinePrevUserUtteredFeaturization { .. } => "user_featurization",
            Self::Restarted => "restart",
        }
    }

    /// Name (or end-to-end text) of an executed action.
    #[must_use]
    pub fn action_name_or_text(&self) -> Option<&str> {
        match self {
            Self::ActionExecuted {
                action_name,
                action_text,
                ..
            } => action_name.as_deref().or(action_text.as_deref()),
            _ => None,
        }
    }

    /// True for user messages.
    pub const fn is_user_uttered(&self) -> bool {
        matches!(self, Self::UserUttered { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_event_tag() {
        let json = serde_json::to_value(Event::action_executed("action_listen")).unwrap();
        assert_eq!(json["event"], "action_executed");
        assert_eq!(json["action_name"], "action_listen");
    }

    #[test]
    fn deserializes_sparse_user_event() {
        let event: Event =
            serde_json::from_str(r#"{"event": "user_uttered", "text": "hi"}"#).unwrap();
        assert_eq!(event, Event::user_text("hi"));
    }

    #[test]
    fn action_text_is_used_when_name_missing() {
        let event = Event::ActionExecuted {
            action_name: None,
            action_text: Some("Hello!".to_string()),
            policy: None,
            confidence: None,
        };
        assert_eq!(event.action_name_or_text(), Some("Hello!"));
        assert_eq!(Event::slot_set("k", "v").action_name_or_text(), None);
    }
}
