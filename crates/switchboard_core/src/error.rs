//! Error types for Switchboard.
//!
//! Two failure kinds are typed: intent parsing (`NlpError`) and routing
//! (`RoutingError`). Validation findings are data (`ValidationResult`),
//! never errors.

use thiserror::Error;

use crate::intent::{Action, Intent};

/// Intent parsing failure on malformed input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NlpError {
    #[error("Query is empty")]
    EmptyQuery,

    #[error("Query too long: {len} chars (max {max})")]
    QueryTooLong { len: usize, max: usize },

    #[error("Malformed query: {0}")]
    Malformed(String),
}

/// Routing failure: no eligible candidate, or an internal failure during
/// ranking/tool-selection. Carries the intent that was being routed so
/// callers can inspect what failed.
#[derive(Error, Debug, Clone)]
pub enum RoutingError {
    #[error("No eligible candidates for action '{action}'")]
    NoCandidates { action: Action, intent: Box<Intent> },

    #[error("Server '{server}' does not support operation '{action}'")]
    UnsupportedOperation {
        server: String,
        action: Action,
        intent: Box<Intent>,
    },

    #[error("Routing failed internally: {message}")]
    Internal { message: String, intent: Box<Intent> },
}

impl RoutingError {
    /// The intent that was being routed when the failure occurred.
    pub fn intent(&self) -> &Intent {
        match self {
            RoutingError::NoCandidates { intent, .. } => intent,
            RoutingError::UnsupportedOperation { intent, .. } => intent,
            RoutingError::Internal { intent, .. } => intent,
        }
    }
}

/// Top-level error for the Switchboard service surface.
#[derive(Error, Debug)]
pub enum SwitchboardError {
    #[error("NLP error: {0}")]
    Nlp(#[from] NlpError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Unknown interaction: {0}")]
    UnknownInteraction(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
