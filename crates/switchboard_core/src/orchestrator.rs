//! Switchboard orchestrator - the five-stage pipeline behind one
//! service handle.
//!
//! Pipeline per query: parse -> route (cached) -> pre-validate ->
//! execute -> post-validate -> record. Every shared store sits behind
//! its own `RwLock`; the two background sweeps (registry health,
//! learning prune) take the same locks as the request path and log
//! their own problems instead of propagating them. `query()` never
//! fails: anything that goes wrong folds into a `success: false`
//! response carrying whatever partial state was computed.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::config::SwitchboardConfig;
use crate::error::{NlpError, RoutingError, SwitchboardError};
use crate::events::{EventBus, EventObserver, SwitchboardEvent};
use crate::execution::{ExecutionEngine, ExecutionRequest};
use crate::intent::{Action, Intent, QueryContext};
use crate::intent_parser::{IntentParser, IntentParsing};
use crate::learning::{
    Feedback, Interaction, LearningStats, LearningSystem, OptimizationSuggestion,
};
use crate::persistence::SnapshotStore;
use crate::registry::{CapabilityRegistry, RegistryStats, ServerCapability};
use crate::router::{CacheStats, RoutingDecision, SemanticRouter};
use crate::validation::{CustomValidator, Severity, ValidationEngine, ValidationResult};

// ============================================================================
// Response Type
// ============================================================================

/// What a `query()` call hands back, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Mean of intent and routing confidence; intent-only when routing
    /// never happened
    pub confidence: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Key for `record_feedback`, present once an interaction was
    /// recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
}

impl QueryResponse {
    fn failure(error: String, intent: Option<Intent>, duration_ms: u64) -> Self {
        let confidence = intent.as_ref().map(|i| i.confidence).unwrap_or(0.0);
        Self {
            success: false,
            intent,
            routing: None,
            validation: None,
            data: None,
            confidence,
            duration_ms,
            error: Some(error),
            interaction_id: None,
        }
    }
}

// ============================================================================
// Switchboard
// ============================================================================

/// The assembled pipeline. Cheap to share: wrap it in an `Arc` and clone
/// handles freely.
pub struct Switchboard {
    config: SwitchboardConfig,
    parser: Arc<dyn IntentParsing>,
    registry: Arc<RwLock<CapabilityRegistry>>,
    router: Arc<RwLock<SemanticRouter>>,
    validation: Arc<RwLock<ValidationEngine>>,
    learning: Arc<RwLock<LearningSystem>>,
    engine: Arc<dyn ExecutionEngine>,
    store: Arc<dyn SnapshotStore>,
    events: Arc<EventBus>,
}

impl Switchboard {
    pub fn new(
        config: SwitchboardConfig,
        engine: Arc<dyn ExecutionEngine>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let parser = Arc::new(IntentParser::new(config.parser.clone()));
        Self::with_parser(config, parser, engine, store)
    }

    /// Assemble the pipeline around a custom parser implementation.
    pub fn with_parser(
        config: SwitchboardConfig,
        parser: Arc<dyn IntentParsing>,
        engine: Arc<dyn ExecutionEngine>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            parser,
            registry: Arc::new(RwLock::new(CapabilityRegistry::new(config.registry.clone()))),
            router: Arc::new(RwLock::new(SemanticRouter::new(config.router.clone()))),
            validation: Arc::new(RwLock::new(ValidationEngine::new(config.validation.clone()))),
            learning: Arc::new(RwLock::new(LearningSystem::new(config.learning.clone()))),
            engine,
            store,
            events: Arc::new(EventBus::new()),
            config,
        }
    }

    // ------------------------------------------------------------------
    // Registration Surface
    // ------------------------------------------------------------------

    pub async fn register(&self, name: &str, capability: ServerCapability) {
        self.registry.write().await.register(name, capability);
        self.events.publish(&SwitchboardEvent::ServerRegistered {
            name: name.to_string(),
        });
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.registry.write().await.unregister(name);
        if removed {
            self.events.publish(&SwitchboardEvent::ServerUnregistered {
                name: name.to_string(),
            });
        }
        removed
    }

    pub async fn mark_healthy(&self, name: &str) -> bool {
        self.registry.write().await.mark_healthy(name)
    }

    pub async fn mark_unhealthy(&self, name: &str) -> bool {
        self.registry.write().await.mark_unhealthy(name)
    }

    // ------------------------------------------------------------------
    // Validation Surface
    // ------------------------------------------------------------------

    pub async fn add_business_rule(
        &self,
        key: &str,
        description: &str,
        severity: Severity,
        predicate: impl Fn(&serde_json::Map<String, Value>) -> bool + Send + Sync + 'static,
    ) {
        self.validation
            .write()
            .await
            .add_business_rule(key, description, severity, predicate);
    }

    pub async fn set_custom_validator(&self, server: &str, validator: Arc<dyn CustomValidator>) {
        self.validation
            .write()
            .await
            .set_custom_validator(server, validator);
    }

    pub async fn restrict_server(&self, server: &str, actions: &[Action]) {
        self.validation.write().await.restrict_server(server, actions);
    }

    // ------------------------------------------------------------------
    // Query Pipeline
    // ------------------------------------------------------------------

    /// Run the full pipeline for one request. Never fails; errors fold
    /// into a `success: false` response with the partial intent and the
    /// measured duration.
    pub async fn query(&self, text: &str, context: QueryContext) -> QueryResponse {
        let started = Instant::now();
        let timestamp = Utc::now();

        let intent = match self.parser.parse(text, context) {
            Ok(intent) => intent,
            Err(e) => {
                debug!(error = %e, "Query rejected by the parser");
                return QueryResponse::failure(e.to_string(), None, elapsed_ms(started));
            }
        };

        let decision = match self.route_parsed(&intent).await {
            Ok(decision) => decision,
            Err(e) => {
                debug!(error = %e, "No routing decision");
                return QueryResponse::failure(e.to_string(), Some(intent), elapsed_ms(started));
            }
        };

        let mut validation = self
            .validation
            .read()
            .await
            .validate_operation(&decision, &intent, &intent.context);

        let mut data = None;
        if validation.is_valid {
            match self
                .engine
                .execute(ExecutionRequest::from_decision(&decision))
                .await
            {
                Ok(value) => {
                    let post = self
                        .validation
                        .read()
                        .await
                        .validate_result(&value, &intent);
                    validation.merge(post);
                    data = Some(value);
                }
                Err(cause) => {
                    validation.add_error(format!("execution failed: {cause}"));
                }
            }

            let elapsed = elapsed_ms(started) as f64;
            if self
                .registry
                .write()
                .await
                .update_metrics(&decision.server, elapsed, validation.is_valid)
            {
                self.events.publish(&SwitchboardEvent::MetricsUpdated {
                    name: decision.server.clone(),
                });
            }
        }

        let duration_ms = elapsed_ms(started);
        let interaction = Interaction {
            id: Interaction::make_id(timestamp, text),
            query: text.to_string(),
            intent: intent.clone(),
            routing: decision.clone(),
            result: data.clone(),
            duration_ms,
            validation: validation.clone(),
            feedback: None,
            timestamp,
        };
        let interaction_id = interaction.id.clone();
        self.record(interaction).await;

        let success = validation.is_valid;
        let error = validation.errors.first().cloned();
        QueryResponse {
            success,
            confidence: (intent.confidence + decision.confidence) / 2.0,
            intent: Some(intent),
            routing: Some(decision),
            validation: Some(validation),
            data,
            duration_ms,
            error,
            interaction_id: Some(interaction_id),
        }
    }

    /// Routing step: shared-lock cache probe first, exclusive route on a
    /// miss. Lock order is registry before router everywhere.
    async fn route_parsed(&self, intent: &Intent) -> Result<RoutingDecision, RoutingError> {
        if let Some(cached) = self.router.read().await.lookup(intent) {
            return Ok(cached);
        }
        let registry = self.registry.read().await;
        let decision = self.router.write().await.route(intent, &registry)?;
        self.events.publish(&SwitchboardEvent::DecisionCached {
            server: decision.server.clone(),
        });
        Ok(decision)
    }

    /// Record an interaction and flush the snapshot when the cadence is
    /// due. A failing store logs and never fails the query.
    async fn record(&self, interaction: Interaction) {
        let snapshot = self.learning.write().await.record_interaction(interaction);
        if let Some(snapshot) = snapshot {
            let interactions = snapshot.interactions.len();
            match self.store.save(&snapshot).await {
                Ok(()) => {
                    self.events
                        .publish(&SwitchboardEvent::SnapshotFlushed { interactions });
                }
                Err(e) => error!(error = %e, "Snapshot flush failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Direct Library Surface
    // ------------------------------------------------------------------

    /// Parse only, with the typed error. The `query()` surface folds this
    /// into the response instead.
    pub fn parse_intent(&self, text: &str, context: QueryContext) -> Result<Intent, NlpError> {
        self.parser.parse(text, context)
    }

    /// Route an already-parsed intent, with the typed error.
    pub async fn route_intent(&self, intent: &Intent) -> Result<RoutingDecision, RoutingError> {
        self.route_parsed(intent).await
    }

    // ------------------------------------------------------------------
    // Learning Surface
    // ------------------------------------------------------------------

    /// Typed-query suggestions for a partial input.
    pub async fn get_suggestions(&self, partial: &str, limit: usize) -> Vec<String> {
        self.learning.read().await.suggest_queries(partial, limit)
    }

    /// File feedback for a recorded interaction. Negative feedback naming
    /// a better server credits it in the learning counters and nudges the
    /// originally routed server's registry error rate.
    pub async fn record_feedback(
        &self,
        interaction_id: &str,
        feedback: Feedback,
    ) -> Result<(), SwitchboardError> {
        let nudge = self
            .learning
            .write()
            .await
            .record_feedback(interaction_id, feedback)?;
        if let Some(nudge) = nudge {
            if self
                .registry
                .write()
                .await
                .nudge_error_rate(&nudge.server, nudge.delta)
            {
                info!(
                    server = nudge.server.as_str(),
                    delta = nudge.delta,
                    "Feedback nudged server error rate"
                );
                self.events
                    .publish(&SwitchboardEvent::MetricsUpdated { name: nudge.server });
            }
        }
        Ok(())
    }

    pub async fn predict_best_server(&self, intent: &Intent) -> Option<String> {
        self.learning.read().await.predict_best_server(intent)
    }

    pub async fn optimization_suggestions(&self) -> Vec<OptimizationSuggestion> {
        self.learning.read().await.optimization_suggestions()
    }

    /// Restore learning state from the snapshot store, if a snapshot
    /// exists. Returns whether anything was restored.
    pub async fn restore_from_store(&self) -> Result<bool, SwitchboardError> {
        match self.store.load().await? {
            Some(snapshot) => {
                self.learning.write().await.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Introspection and Events
    // ------------------------------------------------------------------

    pub fn subscribe(&self, observer: Arc<dyn EventObserver>) {
        self.events.subscribe(observer);
    }

    pub async fn registry_stats(&self) -> RegistryStats {
        self.registry.read().await.stats()
    }

    pub async fn learning_stats(&self) -> LearningStats {
        self.learning.read().await.stats()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.router.read().await.cache_stats()
    }

    // ------------------------------------------------------------------
    // Background Sweeps
    // ------------------------------------------------------------------

    /// Spawn the health sweep and the learning sweep on independent
    /// timers. Both take the same locks as the request path and log
    /// their own problems; neither can crash the serving path. The
    /// returned handles abort the sweeps when dropped by the caller's
    /// runtime shutdown.
    pub fn start_sweeps(&self) -> Vec<JoinHandle<()>> {
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        let health_period = self.config.registry.health_check_interval_secs.max(1);
        let health = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(health_period));
            loop {
                ticker.tick().await;
                let stale = registry.write().await.sweep_stale(Utc::now());
                for name in stale {
                    events.publish(&SwitchboardEvent::ServerMarkedInactive { name });
                }
            }
        });

        let learning = Arc::clone(&self.learning);
        let events = Arc::clone(&self.events);
        let learning_period = self.config.learning.sweep_interval_secs.max(1);
        let prune = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(learning_period));
            loop {
                ticker.tick().await;
                let pruned = learning.write().await.sweep(Utc::now());
                if !pruned.is_empty() {
                    events.publish(&SwitchboardEvent::PatternsPruned {
                        count: pruned.len(),
                    });
                }
            }
        });

        info!(
            health_period,
            learning_period, "Background sweeps started"
        );
        vec![health, prune]
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::StaticEngine;
    use crate::intent::UserContext;
    use crate::persistence::MemoryStore;
    use crate::registry::ServerCapability;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn capability(entities: &[&str], operations: &[&str]) -> ServerCapability {
        ServerCapability {
            protocol: "http".to_string(),
            domains: vec!["maintenance".to_string()],
            entities: entities.iter().map(|s| s.to_string()).collect(),
            operations: operations.iter().map(|s| s.to_string()).collect(),
            description: "maintenance backend".to_string(),
            rate_limit: None,
        }
    }

    fn switchboard(engine: StaticEngine) -> Switchboard {
        Switchboard::new(
            SwitchboardConfig::default(),
            Arc::new(engine),
            Arc::new(MemoryStore::new()),
        )
    }

    fn writer_context() -> QueryContext {
        QueryContext {
            domain: None,
            user: Some(UserContext {
                id: "tech-7".to_string(),
                role: "technician".to_string(),
                permissions: vec!["write".to_string()],
            }),
        }
    }

    #[tokio::test]
    async fn test_query_happy_path() {
        let board = switchboard(StaticEngine::ok());
        board
            .register("maintenance-api", capability(&["work_order"], &["query", "create"]))
            .await;

        let response = board
            .query("show open work orders", QueryContext::default())
            .await;
        assert!(response.success, "unexpected failure: {:?}", response.error);
        assert_eq!(response.routing.as_ref().unwrap().server, "maintenance-api");
        assert_eq!(response.routing.as_ref().unwrap().tool, "query_work_order");
        assert!(response.data.is_some());
        assert!(response.confidence > 0.5);
        assert!(response.interaction_id.is_some());

        // the run was recorded and the backend's metrics were updated
        assert_eq!(board.learning_stats().await.total_recorded, 1);
        let stats = board.registry_stats().await;
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn test_query_parse_failure_folds_into_response() {
        let board = switchboard(StaticEngine::ok());
        let response = board.query("   ", QueryContext::default()).await;
        assert!(!response.success);
        assert!(response.intent.is_none());
        assert!(response.error.unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn test_query_routing_failure_keeps_partial_intent() {
        let board = switchboard(StaticEngine::ok());
        let response = board
            .query("show open work orders", QueryContext::default())
            .await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("No eligible candidates"));
        // the parsed intent survives for the caller
        let intent = response.intent.unwrap();
        assert_eq!(intent.action, Action::Query);
        // nothing was recorded: the pipeline never reached validation
        assert_eq!(board.learning_stats().await.total_recorded, 0);
    }

    #[tokio::test]
    async fn test_invalid_operation_is_recorded_but_not_executed() {
        let engine = StaticEngine::ok();
        let board = switchboard(engine);
        board
            .register(
                "maintenance-api",
                capability(&["work_order"], &["query", "create", "delete"]),
            )
            .await;

        // anonymous callers may not delete
        let response = board
            .query("delete work order 4711", QueryContext::default())
            .await;
        assert!(!response.success);
        let validation = response.validation.unwrap();
        assert!(!validation.is_valid);
        assert!(response.data.is_none());
        // invalid operations still become interactions
        assert_eq!(board.learning_stats().await.total_recorded, 1);
    }

    #[tokio::test]
    async fn test_execution_failure_marks_interaction_failed() {
        let engine = StaticEngine::ok()
            .with_response("query_work_order", Err("backend timeout".to_string()));
        let board = switchboard(engine);
        board
            .register("maintenance-api", capability(&["work_order"], &["query"]))
            .await;

        let response = board
            .query("show work orders", QueryContext::default())
            .await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("backend timeout"));

        // the failure reached the registry metrics
        let registry = board.registry.read().await;
        let metrics = &registry.get("maintenance-api").unwrap().metrics;
        assert_eq!(metrics.total_requests, 1);
        assert!(metrics.error_rate > 0.99);
    }

    #[tokio::test]
    async fn test_feedback_credits_named_server_and_nudges_routed_one() {
        let board = switchboard(StaticEngine::ok());
        board
            .register("server-a", capability(&["work_order"], &["query", "create"]))
            .await;
        board.register("server-b", capability(&["job"], &["query"])).await;

        let response = board
            .query("show work orders", QueryContext::default())
            .await;
        assert_eq!(response.routing.unwrap().server, "server-a");
        let error_rate_before = {
            let registry = board.registry.read().await;
            registry.get("server-a").unwrap().metrics.error_rate
        };

        board
            .record_feedback(
                &response.interaction_id.unwrap(),
                Feedback {
                    helpful: false,
                    rating: Some(2),
                    comment: Some("wrong backend".to_string()),
                    correct_server: Some("server-b".to_string()),
                },
            )
            .await
            .unwrap();

        let learning = board.learning.read().await;
        assert_eq!(
            learning.server_usage("server-b").unwrap().successful_requests,
            1
        );
        drop(learning);

        let registry = board.registry.read().await;
        let error_rate_after = registry.get("server-a").unwrap().metrics.error_rate;
        assert!(error_rate_after > error_rate_before);
    }

    #[tokio::test]
    async fn test_create_pipeline_with_payload() {
        let engine = StaticEngine::new(Ok(json!({"id": "wo-99", "status": "open"})));
        let board = switchboard(engine);
        board
            .register("maintenance-api", capability(&["work_order"], &["query", "create"]))
            .await;

        let response = board
            .query(
                "create a high priority work order for Maria",
                writer_context(),
            )
            .await;
        assert!(response.success, "unexpected failure: {:?}", response.error);
        let routing = response.routing.unwrap();
        assert_eq!(routing.tool, "create_work_order");
        assert_eq!(routing.params.get("priority").unwrap(), "high");
        assert_eq!(routing.params.get("person").unwrap(), "maria");
    }

    #[tokio::test]
    async fn test_snapshot_flush_and_restore() {
        let store = Arc::new(MemoryStore::new());
        let mut config = SwitchboardConfig::default();
        config.learning.snapshot_every = 1;
        let board = Switchboard::new(config.clone(), Arc::new(StaticEngine::ok()), store.clone());
        board
            .register("maintenance-api", capability(&["work_order"], &["query"]))
            .await;
        board
            .query("show work orders", QueryContext::default())
            .await;

        // a fresh instance over the same store picks the state back up
        let revived = Switchboard::new(config, Arc::new(StaticEngine::ok()), store);
        assert!(revived.restore_from_store().await.unwrap());
        assert_eq!(revived.learning_stats().await.history_len, 1);
        assert_eq!(
            revived.get_suggestions("show", 5).await,
            vec!["show work orders".to_string()]
        );
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        struct Count(AtomicUsize);
        impl EventObserver for Count {
            fn on_event(&self, event: &SwitchboardEvent) {
                if matches!(event, SwitchboardEvent::ServerRegistered { .. }) {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let board = switchboard(StaticEngine::ok());
        let counter = Arc::new(Count(AtomicUsize::new(0)));
        board.subscribe(counter.clone());
        board
            .register("maintenance-api", capability(&["work_order"], &["query"]))
            .await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_decision_short_circuits_reranking() {
        let board = switchboard(StaticEngine::ok());
        board
            .register("maintenance-api", capability(&["work_order"], &["query"]))
            .await;

        board.query("show work orders", QueryContext::default()).await;
        board.query("show work orders", QueryContext::default()).await;

        let stats = board.cache_stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }
}
