//! NLU parse results and the interpreter seam.
//!
//! The ensemble never inspects the interpreter itself; it is passed through
//! to policies, which may use it to classify user turns that carry only text.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Classified intent of a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Intent name as declared in the domain.
    pub name: String,
    /// Classifier confidence in `[0.0, 1.0]`.
    #[serde(default = "default_intent_confidence")]
    pub confidence: f64,
}

fn default_intent_confidence() -> f64 {
    1.0
}

impl Intent {
    /// Creates an intent with full confidence.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            confidence: 1.0,
        }
    }

    /// Creates an intent with an explicit confidence.
    #[must_use]
    pub fn with_confidence(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// Entity extracted from a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAnnotation {
    /// Entity type.
    pub entity: String,
    /// Extracted value.
    pub value: serde_json::Value,
    /// Character offset where the entity starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    /// Character offset past the entity's end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

/// Structured result of parsing a user message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParseData {
    /// The message as sent.
    pub text: String,
    /// Best intent, if any was recognized.
    pub intent: Option<Intent>,
    /// Extracted entities.
    #[serde(default)]
    pub entities: Vec<EntityAnnotation>,
    /// Full ranking, best first. May be empty for interpreters that only
    /// report the top intent.
    #[serde(default)]
    pub intent_ranking: Vec<Intent>,
}

/// NLU parse capability handed opaquely to every policy.
pub trait NaturalLanguageInterpreter: Send + Sync {
    /// Parses a raw user message.
    fn parse(&self, text: &str) -> ParseData;
}

/// Interpreter for pre-classified messages of the form
/// `/intent@0.8{"entity": "value"}`.
///
/// Anything that does not start with `/` parses to text without intent.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexInterpreter;

fn message_regex() -> &'static regex::Regex {
    static MESSAGE: OnceLock<regex::Regex> = OnceLock::new();
    MESSAGE.get_or_init(|| {
        regex::Regex::new(r"^/(?P<intent>[^{@]+)(?:@(?P<confidence>[0-9.]+))?(?P<entities>\{.*\})?$")
            .expect("interpreter message regex is valid")
    })
}

impl RegexInterpreter {
    fn parse_entities(raw: &str) -> Vec<EntityAnnotation> {
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw) {
            Ok(map) => map
                .into_iter()
                .flat_map(|(entity, value)| match value {
                    serde_json::Value::Array(values) => values
                        .into_iter()
                        .map(|v| EntityAnnotation {
                            entity: entity.clone(),
                            value: v,
                            start: None,
                            end: None,
                        })
                        .collect::<Vec<_>>(),
                    other => vec![EntityAnnotation {
                        entity,
                        value: other,
                        start: None,
                        end: None,
                    }],
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Invalid entity payload '{raw}' in user message: {e}");
                Vec::new()
            }
        }
    }
}

impl NaturalLanguageInterpreter for RegexInterpreter {
    fn parse(&self, text: &str) -> ParseData {
        let trimmed = text.trim();
        let Some(caps) = message_regex().captures(trimmed) else {
            return ParseData {
                text: text.to_string(),
                ..ParseData::default()
            };
        };

        let name = caps
            .name("intent")
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let confidence = match caps.name("confidence") {
            Some(m) => match m.as_str().parse::<f64>() {
                Ok(c) => c.clamp(0.0, 1.0),
                Err(_) => {
                    tracing::warn!(
                        "Invalid confidence '{}' in user message '{trimmed}', using 1.0",
                        m.as_str()
                    );
                    1.0
                }
            },
            None => 1.0,
        };
        let entities = caps
            .name("entities")
            .map(|m| Self::parse_entities(m.as_str()))
            .unwrap_or_default();

        let intent = Intent::with_confidence(name, confidence);
        ParseData {
            text: text.to_string(),
            intent: Some(intent.clone()),
            entities,
            intent_ranking: vec![intent],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_intent() {
        let parsed = RegexInterpreter.parse("/greet");
        assert_eq!(parsed.intent, Some(Intent::new("greet")));
        assert!(parsed.entities.is_empty());
    }

    #[test]
    fn parses_confidence_and_entities() {
        let parsed = RegexInterpreter.parse(r#"/inform@0.4{"city": "Berlin"}"#);
        let intent = parsed.intent.unwrap();
        assert_eq!(intent.name, "inform");
        assert!((intent.confidence - 0.4).abs() < f64::EPSILON);
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].entity, "city");
        assert_eq!(parsed.entities[0].value, serde_json::json!("Berlin"));
    }

    #[test]
    fn list_entities_expand() {
        let parsed = RegexInterpreter.parse(r#"/order{"topping": ["cheese", "ham"]}"#);
        assert_eq!(parsed.entities.len(), 2);
    }

    #[test]
    fn free_text_has_no_intent() {
        let parsed = RegexInterpreter.parse("hello there");
        assert_eq!(parsed.text, "hello there");
        assert!(parsed.intent.is_none());
    }
}
