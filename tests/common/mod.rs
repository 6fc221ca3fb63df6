//! Test policies shared by the integration tests.

#![allow(dead_code)]

use std::any::Any;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use colloquy::config::PolicySpec;
use colloquy::policy::{load_state, persist_state, PolicyLoadResult, RegisteredPolicy};
use colloquy::{
    ConfigError, DialogueResult, DialogueStateTracker, Domain, Event, NaturalLanguageInterpreter,
    Policy, PolicyPrediction, PolicyRegistry, RegistrablePolicy,
};

/// Predicts the same action with a fixed confidence on every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantPolicy {
    pub priority: i32,
    pub predict_index: Option<usize>,
    pub confidence: f64,
    pub is_end_to_end_prediction: bool,
    pub is_no_user_prediction: bool,
    pub events: Vec<Event>,
    pub optional_events: Vec<Event>,
    pub trained_on: usize,
}

impl ConstantPolicy {
    pub fn new(priority: i32, predict_index: Option<usize>) -> Self {
        Self {
            priority,
            predict_index,
            confidence: 1.0,
            is_end_to_end_prediction: false,
            is_no_user_prediction: false,
            events: Vec::new(),
            optional_events: Vec::new(),
            trained_on: 0,
        }
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn end_to_end(mut self) -> Self {
        self.is_end_to_end_prediction = true;
        self
    }

    pub fn no_user(mut self) -> Self {
        self.is_no_user_prediction = true;
        self
    }

    pub fn events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    pub fn optional_events(mut self, events: Vec<Event>) -> Self {
        self.optional_events = events;
        self
    }

    pub fn boxed(self) -> Box<dyn Policy> {
        Box::new(self)
    }
}

impl Policy for ConstantPolicy {
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
        _interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<()> {
        self.trained_on = training_trackers.len();
        Ok(())
    }

    fn predict_action_probabilities(
        &self,
        _tracker: &DialogueStateTracker,
        domain: &Domain,
        _interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction> {
        let probabilities = match self.predict_index {
            Some(index) => {
                let mut probabilities = vec![0.0; domain.num_actions()];
                probabilities[index] = self.confidence;
                probabilities
            }
            None => Vec::new(),
        };
        Ok(PolicyPrediction::new(probabilities, None, self.priority)
            .end_to_end(self.is_end_to_end_prediction)
            .no_user(self.is_no_user_prediction)
            .with_events(self.events.clone())
            .with_optional_events(self.optional_events.clone()))
    }

    fn persist(&self, dir: &Path) -> DialogueResult<()> {
        persist_state(dir, self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegistrablePolicy for ConstantPolicy {
    const TYPE_NAME: &'static str = "ConstantPolicy";
    const MODULE_PATH: &'static str = module_path!();

    fn from_spec(spec: &PolicySpec) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct Options {
            predict_index: Option<usize>,
        }
        let options: Options = spec.options()?;
        Ok(Self::new(spec.priority.unwrap_or(1), options.predict_index))
    }

    fn load(dir: &Path) -> DialogueResult<Option<Self>> {
        load_state(dir)
    }
}

/// Persists nothing and refuses to load.
#[derive(Debug, Default)]
pub struct LoadReturnsNonePolicy;

impl Policy for LoadReturnsNonePolicy {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn module_path(&self) -> &'static str {
        Self::MODULE_PATH
    }

    fn priority(&self) -> i32 {
        1
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
        _tracker: &DialogueStateTracker,
        _domain: &Domain,
        _interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction> {
        Ok(PolicyPrediction::abstain(1))
    }

    fn persist(&self, _dir: &Path) -> DialogueResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegistrablePolicy for LoadReturnsNonePolicy {
    const TYPE_NAME: &'static str = "LoadReturnsNonePolicy";
    const MODULE_PATH: &'static str = module_path!();

    fn from_spec(_spec: &PolicySpec) -> Result<Self, ConfigError> {
        Ok(Self)
    }

    fn load(_dir: &Path) -> DialogueResult<Option<Self>> {
        Ok(None)
    }
}

/// Persists fine, but its registered loader hands back a different type.
#[derive(Debug, Default)]
pub struct LoadReturnsWrongTypePolicy;

impl Policy for LoadReturnsWrongTypePolicy {
    fn type_name(&self) -> &'static str {
        "LoadReturnsWrongTypePolicy"
    }

    fn module_path(&self) -> &'static str {
        module_path!()
    }

    fn priority(&self) -> i32 {
        1
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
        _tracker: &DialogueStateTracker,
        _domain: &Domain,
        _interpreter: &dyn NaturalLanguageInterpreter,
    ) -> DialogueResult<PolicyPrediction> {
        Ok(PolicyPrediction::abstain(1))
    }

    fn persist(&self, _dir: &Path) -> DialogueResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn create_wrong_type(_spec: &PolicySpec) -> Result<Box<dyn Policy>, ConfigError> {
    Ok(Box::new(LoadReturnsWrongTypePolicy))
}

fn load_wrong_type(_dir: &Path) -> PolicyLoadResult {
    Ok(Some(Box::new(ConstantPolicy::new(1, Some(0)))))
}

/// Built-in registry plus the test policies.
pub fn test_registry() -> PolicyRegistry {
    let mut registry = PolicyRegistry::builtin();
    registry
        .register_type::<ConstantPolicy>()
        .register_type::<LoadReturnsNonePolicy>()
        .register(RegisteredPolicy {
            type_name: "LoadReturnsWrongTypePolicy",
            module_path: module_path!(),
            create: create_wrong_type,
            load: load_wrong_type,
        });
    registry
}

/// A tracker whose latest action is `action_listen`.
pub fn listening_tracker() -> DialogueStateTracker {
    DialogueStateTracker::from_events("test", vec![Event::action_executed(colloquy::ACTION_LISTEN_NAME)])
}

/// In-memory sink for formatted log lines.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `f` with a subscriber recording everything logged on this thread.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (result, logs)
}
