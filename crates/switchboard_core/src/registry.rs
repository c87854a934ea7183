//! Capability registry - indexed store of backend server capabilities.
//!
//! Three inverted indices (by domain, by entity, by operation) are kept
//! exactly in sync with the currently registered capabilities: every
//! register inserts into all applicable buckets and every unregister
//! removes from all of them. Candidate lookup walks the indices; a fuzzy
//! text search over the registered metadata is the fallback when no index
//! matches. Relevance ranking is a pure function of the registry snapshot
//! and the intent.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::fuzzy;
use crate::intent::{Action, Intent};

// ============================================================================
// Capability Types
// ============================================================================

/// Rate limit declared by a backend at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub window_ms: u64,
}

/// What a backend server declares it can do. Immutable until the server
/// re-registers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapability {
    /// Wire protocol the execution engine should use ("http", "grpc", ...)
    pub protocol: String,
    /// Domains served ("maintenance", "billing", ...)
    #[serde(default)]
    pub domains: Vec<String>,
    /// Entity types served ("work_order", "tenant", ...)
    #[serde(default)]
    pub entities: Vec<String>,
    /// Operations exposed ("query", "create", "assign", ...)
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

impl ServerCapability {
    /// Whether any of the action's operation synonyms is declared.
    pub fn supports_action(&self, action: Action) -> bool {
        action
            .operation_synonyms()
            .iter()
            .any(|syn| self.operations.iter().any(|op| op == syn))
    }
}

/// Registration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Inactive,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Active => write!(f, "active"),
            ServerStatus::Inactive => write!(f, "inactive"),
            ServerStatus::Error => write!(f, "error"),
        }
    }
}

/// Running request metrics for a registered server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub total_requests: u64,
    pub avg_response_time_ms: f64,
    /// Fraction of failed requests in [0,1]
    pub error_rate: f64,
}

impl ServerMetrics {
    /// Incremental running-average update:
    /// `avg' = (avg * (n-1) + x) / n`, applied to both the response time
    /// and the error rate (x = 0 for success, 1 for failure).
    pub fn record(&mut self, response_time_ms: f64, success: bool) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        self.avg_response_time_ms =
            (self.avg_response_time_ms * (n - 1.0) + response_time_ms) / n;
        let failure = if success { 0.0 } else { 1.0 };
        self.error_rate = (self.error_rate * (n - 1.0) + failure) / n;
    }

    /// Fixed-size error-rate adjustment from feedback, clamped to [0,1].
    /// A nudge, not a recompute.
    pub fn nudge_error_rate(&mut self, delta: f64) {
        self.error_rate = (self.error_rate + delta).clamp(0.0, 1.0);
    }
}

/// A registered backend server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub name: String,
    pub capability: ServerCapability,
    pub status: ServerStatus,
    pub last_health_check: DateTime<Utc>,
    pub metrics: ServerMetrics,
    /// Monotonic registration sequence; rank ties resolve in this order
    pub seq: u64,
}

/// A ranked candidate produced by `rank_servers_by_relevance`.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedServer {
    pub name: String,
    pub score: f64,
}

/// Registry shape summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub error: usize,
    pub domains_indexed: usize,
    pub entities_indexed: usize,
    pub operations_indexed: usize,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
struct FuzzyEntry {
    name: String,
    text: String,
}

/// Indexed store of backend capabilities and their health.
#[derive(Debug)]
pub struct CapabilityRegistry {
    config: RegistryConfig,
    servers: HashMap<String, ServerRegistration>,
    by_domain: HashMap<String, Vec<String>>,
    by_entity: HashMap<String, Vec<String>>,
    by_operation: HashMap<String, Vec<String>>,
    fuzzy_index: Vec<FuzzyEntry>,
    next_seq: u64,
}

impl CapabilityRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            servers: HashMap::new(),
            by_domain: HashMap::new(),
            by_entity: HashMap::new(),
            by_operation: HashMap::new(),
            fuzzy_index: Vec::new(),
            next_seq: 0,
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register (or re-register) a server. Status resets to active,
    /// metrics to zero, and the health clock to now. All three indices
    /// and the fuzzy index are rebuilt to include the new declaration.
    pub fn register(&mut self, name: &str, capability: ServerCapability) {
        if self.servers.contains_key(name) {
            debug!(server = name, "Re-registering server, dropping old indices");
            self.remove_from_indices(name);
        }

        let registration = ServerRegistration {
            name: name.to_string(),
            capability,
            status: ServerStatus::Active,
            last_health_check: Utc::now(),
            metrics: ServerMetrics::default(),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        for domain in &registration.capability.domains {
            self.by_domain
                .entry(domain.to_lowercase())
                .or_default()
                .push(name.to_string());
        }
        for entity in &registration.capability.entities {
            self.by_entity
                .entry(entity.to_lowercase())
                .or_default()
                .push(name.to_string());
        }
        for operation in &registration.capability.operations {
            self.by_operation
                .entry(operation.to_lowercase())
                .or_default()
                .push(name.to_string());
        }

        info!(
            server = name,
            domains = registration.capability.domains.len(),
            entities = registration.capability.entities.len(),
            operations = registration.capability.operations.len(),
            "Server registered"
        );
        self.servers.insert(name.to_string(), registration);
        self.rebuild_fuzzy_index();
    }

    /// Remove a server from the registry and from every index bucket it
    /// appears in. Returns false when the name was never registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        if !self.servers.contains_key(name) {
            return false;
        }
        self.remove_from_indices(name);
        self.servers.remove(name);
        self.rebuild_fuzzy_index();
        info!(server = name, "Server unregistered");
        true
    }

    fn remove_from_indices(&mut self, name: &str) {
        for index in [&mut self.by_domain, &mut self.by_entity, &mut self.by_operation] {
            index.retain(|_, names| {
                names.retain(|n| n != name);
                !names.is_empty()
            });
        }
    }

    fn rebuild_fuzzy_index(&mut self) {
        let mut entries: Vec<&ServerRegistration> = self.servers.values().collect();
        entries.sort_by_key(|r| r.seq);
        self.fuzzy_index = entries
            .into_iter()
            .map(|r| {
                let text = format!(
                    "{} {} {} {} {}",
                    r.name,
                    r.capability.description,
                    r.capability.domains.join(" "),
                    r.capability.entities.join(" "),
                    r.capability.operations.join(" ")
                )
                .to_lowercase();
                FuzzyEntry {
                    name: r.name.clone(),
                    text,
                }
            })
            .collect();
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<&ServerRegistration> {
        self.servers.get(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        let mut regs: Vec<&ServerRegistration> = self.servers.values().collect();
        regs.sort_by_key(|r| r.seq);
        regs.iter().map(|r| r.name.clone()).collect()
    }

    /// Candidate servers for an intent, active only, in registration
    /// order.
    ///
    /// The entity index (per intent entity type) and the domain index
    /// (context domain) drive the lookup. The operation index supplies
    /// candidates only when neither produced any - an entity-bearing
    /// intent must not be routed to a server that merely shares a verb.
    /// When every index misses, a fuzzy search over the registered
    /// metadata is the last resort.
    pub fn find_servers_for_intent(&self, intent: &Intent) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();

        for entity_type in intent.entity_types() {
            if let Some(bucket) = self.by_entity.get(&entity_type.to_lowercase()) {
                names.extend(bucket.iter().cloned());
            }
        }
        if let Some(domain) = &intent.context.domain {
            if let Some(bucket) = self.by_domain.get(&domain.to_lowercase()) {
                names.extend(bucket.iter().cloned());
            }
        }
        if names.is_empty() {
            if let Some(bucket) = self.by_operation.get(intent.action.as_str()) {
                names.extend(bucket.iter().cloned());
            }
        }

        let mut candidates = self.dedup_active(names);
        if candidates.is_empty() {
            let needle = self.fuzzy_needle(intent);
            candidates = self.fuzzy_search(&needle);
            if !candidates.is_empty() {
                debug!(
                    needle = needle.as_str(),
                    hits = candidates.len(),
                    "Index lookup empty, fuzzy fallback matched"
                );
            }
        }
        candidates
    }

    fn fuzzy_needle(&self, intent: &Intent) -> String {
        let mut parts = vec![intent.action.as_str().to_string()];
        parts.extend(intent.entity_types());
        parts.extend(intent.entities.iter().map(|e| e.value.to_lowercase()));
        parts.join(" ")
    }

    /// Active servers whose indexed text scores below the fuzzy cutoff,
    /// closest first.
    pub fn fuzzy_search(&self, needle: &str) -> Vec<String> {
        let mut scored: Vec<(f64, &str)> = self
            .fuzzy_index
            .iter()
            .filter(|entry| {
                self.servers
                    .get(&entry.name)
                    .map(|r| r.status == ServerStatus::Active)
                    .unwrap_or(false)
            })
            .map(|entry| (fuzzy::match_score(needle, &entry.text), entry.name.as_str()))
            .filter(|(score, _)| *score < self.config.fuzzy_threshold)
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.into_iter().map(|(_, name)| name.to_string()).collect()
    }

    /// Dedup a name list, keep active registrations only, order by
    /// registration sequence.
    fn dedup_active(&self, names: Vec<String>) -> Vec<String> {
        let mut regs: Vec<&ServerRegistration> = names
            .iter()
            .filter_map(|n| self.servers.get(n))
            .filter(|r| r.status == ServerStatus::Active)
            .collect();
        regs.sort_by_key(|r| r.seq);
        regs.dedup_by_key(|r| r.seq);
        regs.iter().map(|r| r.name.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Ranking
    // ------------------------------------------------------------------

    /// Score candidates against an intent. Pure and deterministic for a
    /// given registry snapshot: stable descending sort, ties keep the
    /// candidates' (registration) order.
    ///
    /// score = entity_weight * supported entity types
    ///       + operation_weight * operation supported
    ///       + domain_weight * context domain declared
    ///       - error_rate_penalty * error_rate
    ///       - response_time_penalty * avg response time (seconds)
    pub fn rank_servers_by_relevance(
        &self,
        candidates: &[String],
        intent: &Intent,
    ) -> Vec<RankedServer> {
        let mut ranked: Vec<RankedServer> = candidates
            .iter()
            .filter_map(|name| self.servers.get(name))
            .map(|r| RankedServer {
                name: r.name.clone(),
                score: self.relevance_score(r, intent),
            })
            .collect();
        // Vec::sort_by is stable, so equal scores keep candidate order
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }

    fn relevance_score(&self, registration: &ServerRegistration, intent: &Intent) -> f64 {
        let cap = &registration.capability;
        let c = &self.config;

        let supported_entities = intent
            .entity_types()
            .iter()
            .filter(|t| cap.entities.iter().any(|e| e.eq_ignore_ascii_case(t)))
            .count() as f64;

        let operation = if cap.supports_action(intent.action) { 1.0 } else { 0.0 };

        let domain = match &intent.context.domain {
            Some(d) if cap.domains.iter().any(|cd| cd.eq_ignore_ascii_case(d)) => 1.0,
            _ => 0.0,
        };

        c.entity_weight * supported_entities + c.operation_weight * operation
            + c.domain_weight * domain
            - c.error_rate_penalty * registration.metrics.error_rate
            - c.response_time_penalty * (registration.metrics.avg_response_time_ms / 1000.0)
    }

    // ------------------------------------------------------------------
    // Metrics and Health
    // ------------------------------------------------------------------

    /// Fold one request outcome into the server's running averages.
    /// Returns false for an unknown server.
    pub fn update_metrics(&mut self, name: &str, response_time_ms: f64, success: bool) -> bool {
        match self.servers.get_mut(name) {
            Some(registration) => {
                registration.metrics.record(response_time_ms, success);
                debug!(
                    server = name,
                    total = registration.metrics.total_requests,
                    error_rate = registration.metrics.error_rate,
                    "Metrics updated"
                );
                true
            }
            None => {
                warn!(server = name, "Metrics update for unknown server");
                false
            }
        }
    }

    /// Apply a feedback-driven error-rate nudge. Returns false for an
    /// unknown server.
    pub fn nudge_error_rate(&mut self, name: &str, delta: f64) -> bool {
        match self.servers.get_mut(name) {
            Some(registration) => {
                registration.metrics.nudge_error_rate(delta);
                true
            }
            None => false,
        }
    }

    /// Manual transition: mark a server healthy, refreshing its health
    /// clock.
    pub fn mark_healthy(&mut self, name: &str) -> bool {
        match self.servers.get_mut(name) {
            Some(registration) => {
                registration.status = ServerStatus::Active;
                registration.last_health_check = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Manual transition: mark a server failed. Sweeps use Inactive for
    /// staleness; Error is reserved for explicit reports like this one.
    pub fn mark_unhealthy(&mut self, name: &str) -> bool {
        match self.servers.get_mut(name) {
            Some(registration) => {
                registration.status = ServerStatus::Error;
                warn!(server = name, "Server marked unhealthy");
                true
            }
            None => false,
        }
    }

    /// One pass of the health sweep: every active registration whose last
    /// health check is older than the staleness threshold goes inactive.
    /// Returns the names that transitioned. The periodic timer calls this
    /// with `Utc::now()`; tests inject their own clock.
    pub fn sweep_stale(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let threshold = Duration::seconds(self.config.stale_after_secs);
        let mut transitioned = Vec::new();
        for registration in self.servers.values_mut() {
            if registration.status == ServerStatus::Active
                && now - registration.last_health_check > threshold
            {
                registration.status = ServerStatus::Inactive;
                transitioned.push(registration.name.clone());
            }
        }
        if !transitioned.is_empty() {
            info!(count = transitioned.len(), "Health sweep marked servers inactive");
        }
        transitioned
    }

    /// Shape summary for introspection surfaces.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total: self.servers.len(),
            active: self.count_status(ServerStatus::Active),
            inactive: self.count_status(ServerStatus::Inactive),
            error: self.count_status(ServerStatus::Error),
            domains_indexed: self.by_domain.len(),
            entities_indexed: self.by_entity.len(),
            operations_indexed: self.by_operation.len(),
        }
    }

    fn count_status(&self, status: ServerStatus) -> usize {
        self.servers.values().filter(|r| r.status == status).count()
    }

    /// True when the name appears in any of the three indices. Test
    /// support for the index/registration sync invariant.
    pub fn appears_in_any_index(&self, name: &str) -> bool {
        [&self.by_domain, &self.by_entity, &self.by_operation]
            .iter()
            .any(|index| index.values().any(|names| names.iter().any(|n| n == name)))
    }
}

// ============================================================================
// Tests
// ============================================================================
