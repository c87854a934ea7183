//! Semantic router - turns an intent plus registry candidates into a
//! routing decision.
//!
//! Decisions are cached under a canonical key derived from the intent
//! (action + entity pairs + filter triples). A cache hit returns the
//! stored decision unchanged, with no re-ranking; the cache is bounded
//! and evicts its oldest entry first (FIFO, not LRU). Failures during
//! ranking or tool selection surface as `RoutingError` - a partial or
//! silently wrong decision is never produced.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::RouterConfig;
use crate::error::RoutingError;
use crate::intent::{clamp_confidence, EntityRole, FilterOperator, Intent};
use crate::registry::{CapabilityRegistry, ServerRegistration};

// ============================================================================
// Decision Types
// ============================================================================

/// The router's verdict for one intent: which server, which tool, with
/// which parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Target server; names an active registration at decision time
    pub server: String,
    /// Tool name, `{operation}_{entity_type}` when the intent has a
    /// primary entity
    pub tool: String,
    /// Flat parameter map for the execution engine
    pub params: Map<String, Value>,
    /// Wire protocol declared by the server
    pub protocol: String,
    /// Decision confidence in [0,1]
    pub confidence: f64,
    /// Up to two runner-up server names, best first
    pub alternates: Vec<String>,
    /// Human-readable join of the contributing match facts
    pub reasoning: String,
}

/// Decision cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

// ============================================================================
// Router
// ============================================================================

/// Intent router with a bounded FIFO decision cache.
#[derive(Debug)]
pub struct SemanticRouter {
    config: RouterConfig,
    cache: HashMap<String, RoutingDecision>,
    /// Insertion order for FIFO eviction
    cache_order: VecDeque<String>,
    /// Atomic so cache lookups work through a shared reference
    hits: AtomicU64,
    misses: u64,
    evictions: u64,
}

impl SemanticRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            hits: AtomicU64::new(0),
            misses: 0,
            evictions: 0,
        }
    }

    /// Cached decision for an intent, if any. Safe under a shared lock;
    /// the stored decision is returned unchanged.
    pub fn lookup(&self, intent: &Intent) -> Option<RoutingDecision> {
        let decision = self.cache.get(&intent.cache_key()).cloned();
        if decision.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    /// Route an intent. Checks the cache first, then ranks the registry's
    /// candidates, selects the tool, and builds parameters for the top
    /// candidate. The fresh decision is cached before returning.
    pub fn route(
        &mut self,
        intent: &Intent,
        registry: &CapabilityRegistry,
    ) -> Result<RoutingDecision, RoutingError> {
        let key = intent.cache_key();
        if let Some(decision) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = key.as_str(), server = decision.server.as_str(), "Decision cache hit");
            return Ok(decision.clone());
        }
        self.misses += 1;

        let candidates = registry.find_servers_for_intent(intent);
        if candidates.is_empty() {
            return Err(RoutingError::NoCandidates {
                action: intent.action,
                intent: Box::new(intent.clone()),
            });
        }

        let ranked = registry.rank_servers_by_relevance(&candidates, intent);
        let primary = ranked.first().ok_or_else(|| RoutingError::Internal {
            message: "ranking produced no result for a non-empty candidate set".to_string(),
            intent: Box::new(intent.clone()),
        })?;
        let registration =
            registry
                .get(&primary.name)
                .ok_or_else(|| RoutingError::Internal {
                    message: format!("ranked candidate '{}' vanished from registry", primary.name),
                    intent: Box::new(intent.clone()),
                })?;

        let tool = self.select_tool(registration, intent)?;
        let params = build_parameters(intent);
        let confidence = self.decision_confidence(registration, intent);
        let alternates: Vec<String> =
            ranked.iter().skip(1).take(2).map(|r| r.name.clone()).collect();
        let reasoning = build_reasoning(registration, intent, primary.score, &tool);

        let decision = RoutingDecision {
            server: registration.name.clone(),
            tool,
            params,
            protocol: registration.capability.protocol.clone(),
            confidence,
            alternates,
            reasoning,
        };

        info!(
            server = decision.server.as_str(),
            tool = decision.tool.as_str(),
            confidence = decision.confidence,
            "Routed intent"
        );
        self.insert(key, decision.clone());
        Ok(decision)
    }

    /// Pick the operation for a server: the first of the action's synonyms
    /// that the server declares, composed with the primary entity type.
    ///
    /// When no synonym is declared, an intent without entities falls back
    /// to the server's first declared operation; an intent that names
    /// entities fails instead - routing "create job" to a read-only
    /// server would be a silently wrong decision.
    fn select_tool(
        &self,
        registration: &ServerRegistration,
        intent: &Intent,
    ) -> Result<String, RoutingError> {
        let ops = &registration.capability.operations;
        let matched = intent
            .action
            .operation_synonyms()
            .iter()
            .find(|syn| ops.iter().any(|op| op == *syn));

        let operation = match matched {
            Some(op) => op.to_string(),
            None if intent.entities.is_empty() => match ops.first() {
                Some(op) => op.clone(),
                None => {
                    return Err(RoutingError::UnsupportedOperation {
                        server: registration.name.clone(),
                        action: intent.action,
                        intent: Box::new(intent.clone()),
                    })
                }
            },
            None => {
                return Err(RoutingError::UnsupportedOperation {
                    server: registration.name.clone(),
                    action: intent.action,
                    intent: Box::new(intent.clone()),
                })
            }
        };

        Ok(match intent.primary_entity() {
            Some(entity) => format!("{}_{}", operation, entity.entity_type),
            None => operation,
        })
    }

    /// Decision confidence blend:
    /// base + entity_weight * supported entity fraction
    ///      + operation_bonus * operation supported
    ///      + reliability_weight * (1 - error rate), capped at 1.0.
    /// An intent without entities counts as fully supported.
    fn decision_confidence(&self, registration: &ServerRegistration, intent: &Intent) -> f64 {
        let c = &self.config;
        let cap = &registration.capability;

        let types = intent.entity_types();
        let entity_fraction = if types.is_empty() {
            1.0
        } else {
            let supported = types
                .iter()
                .filter(|t| cap.entities.iter().any(|e| e.eq_ignore_ascii_case(t)))
                .count();
            supported as f64 / types.len() as f64
        };
        let operation = if cap.supports_action(intent.action) { 1.0 } else { 0.0 };
        let reliability = 1.0 - registration.metrics.error_rate;

        clamp_confidence(
            c.base_confidence
                + c.entity_weight * entity_fraction
                + c.operation_bonus * operation
                + c.reliability_weight * reliability,
        )
    }

    fn insert(&mut self, key: String, decision: RoutingDecision) {
        if self.config.cache_capacity == 0 {
            return;
        }
        if self.cache.contains_key(&key) {
            return;
        }
        while self.cache_order.len() >= self.config.cache_capacity {
            if let Some(oldest) = self.cache_order.pop_front() {
                self.cache.remove(&oldest);
                self.evictions += 1;
                debug!(key = oldest.as_str(), "Evicted oldest cached decision");
            }
        }
        self.cache_order.push_back(key.clone());
        self.cache.insert(key, decision);
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            size: self.cache.len(),
            capacity: self.config.cache_capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

// ============================================================================
// Parameter and Reasoning Builders
// ============================================================================

/// Flatten an intent into one parameter map: filter fields, filter-role
/// entity values, timeframe bounds (or the relative token), and the
/// aggregation directive.
pub fn build_parameters(intent: &Intent) -> Map<String, Value> {
    let mut params = Map::new();

    for filter in &intent.filters {
        let key = match filter.operator {
            FilterOperator::Equals => filter.field.clone(),
            _ => format!("{}_{}", filter.field, filter.operator.as_str()),
        };
        params.insert(key, Value::String(filter.value.clone()));
    }

    for entity in &intent.entities {
        if entity.role == EntityRole::Filter {
            params.insert(
                entity.entity_type.clone(),
                Value::String(entity.value.clone()),
            );
        }
    }

    if let Some(timeframe) = &intent.timeframe {
        match &timeframe.relative {
            Some(token) => {
                params.insert("timeframe".to_string(), Value::String(token.clone()));
            }
            None => {
                params.insert(
                    "start_date".to_string(),
                    Value::String(timeframe.start.to_rfc3339()),
                );
                params.insert(
                    "end_date".to_string(),
                    Value::String(timeframe.end.to_rfc3339()),
                );
            }
        }
    }

    if let Some(aggregation) = intent.aggregation {
        params.insert(
            "aggregation".to_string(),
            Value::String(aggregation.as_str().to_string()),
        );
    }

    params
}

fn build_reasoning(
    registration: &ServerRegistration,
    intent: &Intent,
    score: f64,
    tool: &str,
) -> String {
    let cap = &registration.capability;
    let mut facts = Vec::new();

    let supported: Vec<String> = intent
        .entity_types()
        .into_iter()
        .filter(|t| cap.entities.iter().any(|e| e.eq_ignore_ascii_case(t)))
        .collect();
    if !supported.is_empty() {
        facts.push(format!("supports entities [{}]", supported.join(", ")));
    }
    if cap.supports_action(intent.action) {
        facts.push(format!("handles '{}' operations", intent.action));
    }
    if let Some(domain) = &intent.context.domain {
        if cap.domains.iter().any(|d| d.eq_ignore_ascii_case(domain)) {
            facts.push(format!("serves the '{}' domain", domain));
        }
    }
    if registration.metrics.total_requests > 0 {
        facts.push(format!(
            "error rate {:.2} over {} requests",
            registration.metrics.error_rate, registration.metrics.total_requests
        ));
    }
    if facts.is_empty() {
        facts.push("closest fuzzy match for the request".to_string());
    }

    format!(
        "Selected {} (score {:.1}) for tool '{}': {}",
        registration.name,
        score,
        tool,
        facts.join("; ")
    )
}

// ============================================================================
// Tests
// ============================================================================
