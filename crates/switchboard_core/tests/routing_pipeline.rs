//! Routing Pipeline Integration Tests
//!
//! End-to-end coverage of the five-stage pipeline through the public
//! `Switchboard` surface:
//!
//! 1. The canonical two-server scenario: entity-matched routing, tool
//!    composition, and the unroutable-create failure
//! 2. Decision cache identity and FIFO eviction under real queries
//! 3. Feedback redirecting credit between servers
//! 4. Staleness sweeps for registry health and pattern pruning
//!
//! ## Running
//!
//! ```bash
//! cargo test -p switchboard_core --test routing_pipeline
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use switchboard_core::execution::StaticEngine;
use switchboard_core::intent::{Action, Entity, EntityRole, Intent, QueryContext, UserContext};
use switchboard_core::learning::Feedback;
use switchboard_core::persistence::MemoryStore;
use switchboard_core::registry::CapabilityRegistry;
use switchboard_core::router::SemanticRouter;
use switchboard_core::{
    RoutingError, ServerCapability, Switchboard, SwitchboardConfig,
};

// ============================================================================
// Fixtures
// ============================================================================

fn capability(entities: &[&str], operations: &[&str]) -> ServerCapability {
    ServerCapability {
        protocol: "http".to_string(),
        domains: vec!["maintenance".to_string()],
        entities: entities.iter().map(|s| s.to_string()).collect(),
        operations: operations.iter().map(|s| s.to_string()).collect(),
        description: "integration test backend".to_string(),
        rate_limit: None,
    }
}

async fn board_with_ab(engine: StaticEngine) -> Switchboard {
    let board = Switchboard::new(
        SwitchboardConfig::default(),
        Arc::new(engine),
        Arc::new(MemoryStore::new()),
    );
    board
        .register("server-a", capability(&["work_order"], &["query", "create"]))
        .await;
    board.register("server-b", capability(&["job"], &["query"])).await;
    board
}

fn writer_context() -> QueryContext {
    QueryContext {
        domain: None,
        user: Some(UserContext {
            id: "dispatcher".to_string(),
            role: "dispatcher".to_string(),
            permissions: vec!["write".to_string()],
        }),
    }
}

fn intent_for(action: Action, entity_type: &str) -> Intent {
    let mut intent = Intent::with_action(action);
    intent
        .entities
        .push(Entity::new(entity_type, entity_type, EntityRole::Subject, 0.8));
    intent
}

// ============================================================================
// Canonical Two-Server Scenario
// ============================================================================

#[tokio::test]
async fn test_create_work_order_routes_to_server_a() {
    let engine = StaticEngine::new(Ok(json!({"id": "wo-1"})));
    let board = board_with_ab(engine).await;

    let response = board
        .query("create a high priority work order", writer_context())
        .await;
    assert!(response.success, "unexpected failure: {:?}", response.error);

    let routing = response.routing.expect("routing decision");
    assert_eq!(routing.server, "server-a");
    assert_eq!(routing.tool, "create_work_order");
    assert!(routing.alternates.is_empty());
}

#[tokio::test]
async fn test_create_job_fails_because_b_lacks_create() {
    let board = board_with_ab(StaticEngine::ok()).await;

    // direct library surface raises the typed error
    let err = board
        .route_intent(&intent_for(Action::Create, "job"))
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::UnsupportedOperation { .. }));

    // the query surface folds the same failure into the response
    let response = board.query("create a job", writer_context()).await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("does not support"));
    assert!(response.routing.is_none());
}

#[tokio::test]
async fn test_query_job_routes_to_server_b() {
    let engine = StaticEngine::new(Ok(json!([{"id": "j-1"}, {"id": "j-2"}])));
    let board = board_with_ab(engine).await;

    let response = board.query("list all jobs", QueryContext::default()).await;
    assert!(response.success);
    let routing = response.routing.expect("routing decision");
    assert_eq!(routing.server, "server-b");
    assert_eq!(routing.tool, "query_job");
    assert_eq!(response.data.unwrap(), json!([{"id": "j-1"}, {"id": "j-2"}]));
}

#[tokio::test]
async fn test_unroutable_intent_fails_with_no_candidates() {
    let board = board_with_ab(StaticEngine::ok()).await;
    // no index covers a sync on an unknown entity, and the fuzzy
    // fallback finds nothing close to "starship"
    let err = board
        .route_intent(&intent_for(Action::Sync, "starship"))
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::NoCandidates { .. }));
}

// ============================================================================
// Decision Cache Behavior
// ============================================================================

#[tokio::test]
async fn test_repeated_queries_hit_the_decision_cache() {
    let board = board_with_ab(StaticEngine::ok()).await;

    for _ in 0..3 {
        let response = board.query("list all jobs", QueryContext::default()).await;
        assert!(response.success);
    }

    let stats = board.cache_stats().await;
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.evictions, 0);
}

#[tokio::test]
async fn test_cache_eviction_is_fifo() {
    let mut config = SwitchboardConfig::default();
    config.router.cache_capacity = 2;
    let board = Switchboard::new(
        config,
        Arc::new(StaticEngine::ok()),
        Arc::new(MemoryStore::new()),
    );
    board
        .register("server-a", capability(&["work_order", "job"], &["query"]))
        .await;

    board.query("show work order 1", QueryContext::default()).await;
    board.query("show work order 2", QueryContext::default()).await;
    // third distinct key evicts the oldest (work order 1)
    board.query("show jobs", QueryContext::default()).await;
    // still cached: the jobs decision
    board.query("show jobs", QueryContext::default()).await;
    // work order 1 must re-rank, evicting work order 2 in turn
    board.query("show work order 1", QueryContext::default()).await;

    let stats = board.cache_stats().await;
    assert_eq!(stats.evictions, 2);
    assert_eq!(stats.misses, 4);
    assert_eq!(stats.hits, 1);
}

// ============================================================================
// Feedback Loop
// ============================================================================

#[tokio::test]
async fn test_negative_feedback_moves_credit_from_a_to_b() -> anyhow::Result<()> {
    let board = board_with_ab(StaticEngine::ok()).await;

    let response = board
        .query("show work orders", QueryContext::default())
        .await;
    assert_eq!(response.routing.as_ref().unwrap().server, "server-a");

    board
        .record_feedback(
            &response.interaction_id.expect("interaction id"),
            Feedback {
                helpful: false,
                rating: Some(1),
                comment: Some("should have gone to the job backend".to_string()),
                correct_server: Some("server-b".to_string()),
            },
        )
        .await?;

    // server-b never served a request, so only the feedback credit can
    // have put it in the learning system's usage table
    assert_eq!(board.learning_stats().await.servers_tracked, 2);

    let err = board
        .record_feedback(
            "0:never recorded",
            Feedback {
                helpful: true,
                rating: None,
                comment: None,
                correct_server: None,
            },
        )
        .await;
    assert!(err.is_err());
    Ok(())
}

// ============================================================================
// Sweeps With an Injected Clock
// ============================================================================

#[test]
fn test_health_sweep_then_fuzzy_and_index_agree() {
    let mut registry = CapabilityRegistry::new(Default::default());
    registry.register("server-a", capability(&["work_order"], &["query", "create"]));

    // nothing checked in for six minutes: the sweep marks it inactive
    let transitioned = registry.sweep_stale(Utc::now() + Duration::seconds(360));
    assert_eq!(transitioned, vec!["server-a".to_string()]);

    let intent = intent_for(Action::Query, "work_order");
    assert!(registry.find_servers_for_intent(&intent).is_empty());

    // a manual health report brings it back
    registry.mark_healthy("server-a");
    assert_eq!(
        registry.find_servers_for_intent(&intent),
        vec!["server-a".to_string()]
    );
}

#[test]
fn test_router_reflects_registry_snapshot_purely() {
    let mut registry = CapabilityRegistry::new(Default::default());
    registry.register("server-a", capability(&["work_order"], &["query", "create"]));
    registry.register("server-b", capability(&["work_order"], &["query"]));

    let intent = intent_for(Action::Query, "work_order");
    let candidates = registry.find_servers_for_intent(&intent);

    // same snapshot, same ranking, any number of times
    let first = registry.rank_servers_by_relevance(&candidates, &intent);
    for _ in 0..5 {
        assert_eq!(registry.rank_servers_by_relevance(&candidates, &intent), first);
    }

    // and the router turns the top candidate into a decision with the
    // runner-up as the alternate
    let mut router = SemanticRouter::new(Default::default());
    let decision = router.route(&intent, &registry).unwrap();
    assert_eq!(decision.server, first[0].name);
    assert_eq!(decision.alternates, vec![first[1].name.clone()]);
}
