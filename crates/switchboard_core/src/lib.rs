//! Switchboard core - semantic request routing for registered backends.
//!
//! Free text in, a validated routing decision out: which backend server,
//! which operation, with which parameters, and whether the operation is
//! safe to run. Five stages: intent parsing, capability lookup, routing
//! with a bounded decision cache, pre/post validation, and usage-driven
//! learning. Deterministic by design - the same registry snapshot and
//! query always produce the same decision.

pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod fuzzy;
pub mod intent;
pub mod intent_parser;
pub mod learning;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod validation;

pub use config::SwitchboardConfig;
pub use error::{NlpError, RoutingError, SwitchboardError};
pub use events::{EventBus, EventObserver, SwitchboardEvent};
pub use execution::{ExecutionEngine, ExecutionRequest};
pub use intent::{Action, Entity, Filter, Intent, QueryContext, UserContext};
pub use intent_parser::{IntentParser, IntentParsing};
pub use learning::{Feedback, Interaction, LearningSystem, OptimizationSuggestion};
pub use orchestrator::{QueryResponse, Switchboard};
pub use persistence::{JsonFileStore, LearningSnapshot, MemoryStore, SnapshotStore};
pub use registry::{CapabilityRegistry, ServerCapability, ServerRegistration, ServerStatus};
pub use router::{RoutingDecision, SemanticRouter};
pub use validation::{CustomValidator, Severity, ValidationEngine, ValidationResult};
