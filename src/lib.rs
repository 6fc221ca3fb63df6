//! # colloquy - dialogue policy ensembles
//!
//! colloquy decides what a conversational assistant does next. Several
//! policies each score every action of the domain given the conversation so
//! far; a [`PolicyEnsemble`] trains them together, persists them as one
//! model, and reconciles their predictions into a single decision.
//!
//! ## Core Concepts
//!
//! - **Domain**: the actions, intents, entities and slots the assistant knows
//! - **Tracker**: the event log of one conversation
//! - **Policy**: a strategy scoring every action of the domain
//! - **PolicyPrediction**: one policy's scores plus the events it wants applied
//! - **PolicyEnsemble**: ordered policies with a deterministic winner rule
//!
//! ## Usage
//!
//! ```rust,ignore
//! use colloquy::{Domain, DialogueStateTracker, Event, PolicyEnsemble, RegexInterpreter};
//!
//! let domain = Domain::load("domain.yml")?;
//! let mut ensemble = PolicyEnsemble::from_yaml_str(
//!     "policies:\n  - name: MemoizationPolicy\n  - name: RulePolicy\n",
//! )?;
//! ensemble.train(&trackers, &domain, &RegexInterpreter)?;
//! ensemble.persist("models/dialogue")?;
//!
//! let ensemble = PolicyEnsemble::load("models/dialogue")?;
//! let tracker = DialogueStateTracker::from_events(
//!     "user-1",
//!     vec![Event::action_executed("action_listen"), Event::user_uttered("hi", "greet")],
//! );
//! let prediction = ensemble.probabilities_using_best_policy(&tracker, &domain, &RegexInterpreter)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod domain;
pub mod ensemble;
pub mod error;
pub mod event;
pub mod interpreter;
pub mod policy;
pub mod prediction;
pub mod tracker;

// Re-export primary types at crate root for convenience
pub use config::{PolicySpec, POLICIES_KEY, POLICY_KEY};
pub use domain::{Domain, SlotDefinition, SlotType, ACTION_LISTEN_NAME};
pub use ensemble::{EnsembleMetadata, FanOut, PolicyEnsemble, TrainingReport, TrainingWarning};
pub use error::{
    ConfigError, DialogueError, DialogueResult, DomainError, PersistenceError, PredictionError,
};
pub use event::Event;
pub use interpreter::{Intent, NaturalLanguageInterpreter, ParseData, RegexInterpreter};
pub use policy::{
    AugmentedMemoizationPolicy, FallbackPolicy, MemoizationPolicy, Policy, PolicyCapabilities,
    PolicyRegistry, RegisteredPolicy, RegistrablePolicy, RulePolicy, UnexpectedIntentPolicy,
};
pub use prediction::PolicyPrediction;
pub use tracker::{DialogueStateTracker, TurnState};
