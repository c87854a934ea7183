//! Execution engine seam.
//!
//! This crate decides *what* to call; performing the call is the
//! execution engine's job. `StaticEngine` is the deterministic test
//! double: pre-configured responses per tool, recorded requests, no I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::router::RoutingDecision;

/// Everything an engine needs to perform one backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub protocol: String,
    pub server: String,
    pub tool: String,
    pub params: Map<String, Value>,
}

impl ExecutionRequest {
    pub fn from_decision(decision: &RoutingDecision) -> Self {
        Self {
            protocol: decision.protocol.clone(),
            server: decision.server.clone(),
            tool: decision.tool.clone(),
            params: decision.params.clone(),
        }
    }
}

/// External collaborator performing the actual backend call. Errors are
/// reported as strings; the orchestrator folds them into the response
/// and the interaction record.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<Value, String>;
}

// ============================================================================
// Static Engine (test double)
// ============================================================================

/// Deterministic engine with canned responses, keyed by tool name.
/// Unknown tools get the default response. Every request is recorded for
/// inspection.
pub struct StaticEngine {
    responses: HashMap<String, Result<Value, String>>,
    default_response: Result<Value, String>,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl StaticEngine {
    pub fn new(default_response: Result<Value, String>) -> Self {
        Self {
            responses: HashMap::new(),
            default_response,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Engine answering every call with `{"id": "r-1"}`.
    pub fn ok() -> Self {
        Self::new(Ok(serde_json::json!({ "id": "r-1" })))
    }

    pub fn with_response(mut self, tool: &str, response: Result<Value, String>) -> Self {
        self.responses.insert(tool.to_string(), response);
        self
    }

    /// Requests seen so far, in call order.
    pub fn recorded(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionEngine for StaticEngine {
    async fn execute(&self, request: ExecutionRequest) -> Result<Value, String> {
        let response = self
            .responses
            .get(&request.tool)
            .unwrap_or(&self.default_response)
            .clone();
        self.requests.lock().unwrap().push(request);
        response
    }
}

// ============================================================================
// Tests
// ============================================================================
