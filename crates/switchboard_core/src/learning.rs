//! Learning system - usage statistics, feedback, pruning, suggestions.
//!
//! Every completed pipeline run is recorded as an `Interaction` in a
//! bounded ring buffer and folded into a `QueryPattern` keyed by the
//! intent's value-free signature, so paraphrases of the same request
//! aggregate together. Patterns drive three surfaces: server prediction
//! for recurring signatures, optimization suggestions, and typed query
//! suggestions. A durable snapshot is flushed every N interactions, not
//! on every write; a periodic sweep prunes stale low-frequency patterns.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::LearningConfig;
use crate::error::SwitchboardError;
use crate::intent::Intent;
use crate::persistence::LearningSnapshot;
use crate::router::RoutingDecision;
use crate::validation::ValidationResult;

// ============================================================================
// Record Types
// ============================================================================

/// Aggregated statistics for one recurring intent signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPattern {
    pub signature: String,
    /// Only ever decreases by being pruned outright, never decremented
    pub frequency: u64,
    pub avg_duration_ms: f64,
    /// Running mean of per-interaction validity, in [0,1]
    pub success_rate: f64,
    pub last_used: DateTime<Utc>,
}

impl QueryPattern {
    fn new(signature: &str, now: DateTime<Utc>) -> Self {
        Self {
            signature: signature.to_string(),
            frequency: 0,
            avg_duration_ms: 0.0,
            success_rate: 0.0,
            last_used: now,
        }
    }

    /// Fold one observation in with the incremental running-average
    /// formula: `avg' = (avg * (n-1) + x) / n`.
    fn record(&mut self, duration_ms: f64, success: bool, at: DateTime<Utc>) {
        self.frequency += 1;
        let n = self.frequency as f64;
        self.avg_duration_ms = (self.avg_duration_ms * (n - 1.0) + duration_ms) / n;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * (n - 1.0) + outcome) / n;
        self.last_used = at;
    }
}

/// Caller feedback on a recorded interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub helpful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Server the caller believes should have handled the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_server: Option<String>,
}

/// One completed pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// `"{timestamp_ms}:{query}"`, the key feedback is filed under
    pub id: String,
    pub query: String,
    pub intent: Intent,
    pub routing: RoutingDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub duration_ms: u64,
    pub validation: ValidationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    pub timestamp: DateTime<Utc>,
}

impl Interaction {
    /// Canonical interaction id.
    pub fn make_id(timestamp: DateTime<Utc>, query: &str) -> String {
        format!("{}:{}", timestamp.timestamp_millis(), query)
    }
}

/// Per-server usage counters kept by the learning system (distinct from
/// the registry's live metrics).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerUsage {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub avg_duration_ms: f64,
}

impl ServerUsage {
    fn record(&mut self, duration_ms: f64, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        }
        let n = self.total_requests as f64;
        self.avg_duration_ms = (self.avg_duration_ms * (n - 1.0) + duration_ms) / n;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Success tally of one server for one pattern signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerTally {
    pub attempts: u64,
    pub successes: u64,
}

impl ServerTally {
    fn fraction(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// Error-rate adjustment the registry should apply after negative
/// feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorNudge {
    pub server: String,
    pub delta: f64,
}

/// One optimization suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub kind: SuggestionKind,
    /// Pattern signature or server name, depending on the kind
    pub target: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Frequent and slow pattern: cache its results
    CachePattern,
    /// Pattern with a poor success rate: revisit its routing
    ReroutePattern,
    /// Server with a high error rate or slow responses
    FlagServer,
}

/// Shape summary for introspection surfaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningStats {
    pub history_len: usize,
    pub pattern_count: usize,
    pub total_recorded: u64,
    pub servers_tracked: usize,
}

// ============================================================================
// Learning System
// ============================================================================

/// In-memory learning state. One logical writer; the orchestrator wraps
/// it in a lock before serving concurrent requests.
pub struct LearningSystem {
    config: LearningConfig,
    history: VecDeque<Interaction>,
    patterns: HashMap<String, QueryPattern>,
    server_usage: HashMap<String, ServerUsage>,
    /// signature -> server -> tally
    pattern_servers: HashMap<String, HashMap<String, ServerTally>>,
    total_recorded: u64,
}

impl LearningSystem {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            patterns: HashMap::new(),
            server_usage: HashMap::new(),
            pattern_servers: HashMap::new(),
            total_recorded: 0,
        }
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Record a completed interaction. Returns a snapshot when the flush
    /// cadence (every N recordings) is due; the caller persists it.
    pub fn record_interaction(&mut self, interaction: Interaction) -> Option<LearningSnapshot> {
        let success = interaction.validation.is_valid;
        let signature = interaction.intent.signature();
        let duration = interaction.duration_ms as f64;
        let server = interaction.routing.server.clone();
        let at = interaction.timestamp;

        self.history.push_back(interaction);
        while self.history.len() > self.config.max_history_size {
            self.history.pop_front();
        }

        self.patterns
            .entry(signature.clone())
            .or_insert_with(|| QueryPattern::new(&signature, at))
            .record(duration, success, at);

        self.server_usage
            .entry(server.clone())
            .or_default()
            .record(duration, success);

        let tally = self
            .pattern_servers
            .entry(signature.clone())
            .or_default()
            .entry(server)
            .or_default();
        tally.attempts += 1;
        if success {
            tally.successes += 1;
        }

        self.total_recorded += 1;
        debug!(
            signature = signature.as_str(),
            total = self.total_recorded,
            "Interaction recorded"
        );
        if self.total_recorded % self.config.snapshot_every as u64 == 0 {
            Some(self.snapshot())
        } else {
            None
        }
    }

    /// File feedback under an interaction id. On dissatisfaction naming a
    /// better server, credit that server's counters and hand back a fixed
    /// error-rate nudge for the originally routed one - a nudge, not a
    /// recompute.
    pub fn record_feedback(
        &mut self,
        interaction_id: &str,
        feedback: Feedback,
    ) -> Result<Option<ErrorNudge>, SwitchboardError> {
        let interaction = self
            .history
            .iter_mut()
            .rev()
            .find(|i| i.id == interaction_id)
            .ok_or_else(|| SwitchboardError::UnknownInteraction(interaction_id.to_string()))?;

        let routed_server = interaction.routing.server.clone();
        let signature = interaction.intent.signature();
        interaction.feedback = Some(feedback.clone());

        let nudge = match (feedback.helpful, &feedback.correct_server) {
            (false, Some(correct_server)) => {
                let usage = self.server_usage.entry(correct_server.clone()).or_default();
                usage.total_requests += 1;
                usage.successful_requests += 1;

                let tally = self
                    .pattern_servers
                    .entry(signature)
                    .or_default()
                    .entry(correct_server.clone())
                    .or_default();
                tally.attempts += 1;
                tally.successes += 1;

                info!(
                    routed = routed_server.as_str(),
                    correct = correct_server.as_str(),
                    "Negative feedback redirects credit"
                );
                Some(ErrorNudge {
                    server: routed_server,
                    delta: self.config.feedback_error_nudge,
                })
            }
            _ => None,
        };
        Ok(nudge)
    }

    // ------------------------------------------------------------------
    // Prediction and Suggestions
    // ------------------------------------------------------------------

    /// Recommend a server for an intent, but only when its signature's
    /// pattern has a success rate strictly above the threshold. The
    /// winner is the server with the best per-pattern success share among
    /// those that have served the signature.
    pub fn predict_best_server(&self, intent: &Intent) -> Option<String> {
        let signature = intent.signature();
        let pattern = self.patterns.get(&signature)?;
        if pattern.success_rate <= self.config.predict_min_success_rate {
            return None;
        }

        let tallies = self.pattern_servers.get(&signature)?;
        tallies
            .iter()
            .max_by(|(name_a, a), (name_b, b)| {
                a.fraction()
                    .total_cmp(&b.fraction())
                    .then(a.attempts.cmp(&b.attempts))
                    .then(name_b.cmp(name_a))
            })
            .map(|(name, _)| name.clone())
    }

    /// Current optimization suggestions, computed from the live state.
    pub fn optimization_suggestions(&self) -> Vec<OptimizationSuggestion> {
        let c = &self.config;
        let mut suggestions = Vec::new();

        let mut signatures: Vec<&QueryPattern> = self.patterns.values().collect();
        signatures.sort_by(|a, b| a.signature.cmp(&b.signature));

        for pattern in &signatures {
            if pattern.frequency > c.hot_pattern_frequency
                && pattern.avg_duration_ms > c.slow_pattern_ms
            {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::CachePattern,
                    target: pattern.signature.clone(),
                    detail: format!(
                        "seen {} times at {:.0}ms average; worth caching",
                        pattern.frequency, pattern.avg_duration_ms
                    ),
                });
            }
            if pattern.success_rate < c.reroute_below_success_rate {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::ReroutePattern,
                    target: pattern.signature.clone(),
                    detail: format!(
                        "success rate {:.2}; current routing may be wrong",
                        pattern.success_rate
                    ),
                });
            }
        }

        let mut servers: Vec<(&String, &ServerUsage)> = self.server_usage.iter().collect();
        servers.sort_by(|a, b| a.0.cmp(b.0));
        for (name, usage) in servers {
            let error_rate = 1.0 - usage.success_rate();
            if error_rate > c.flag_error_rate || usage.avg_duration_ms > c.flag_response_time_ms {
                suggestions.push(OptimizationSuggestion {
                    kind: SuggestionKind::FlagServer,
                    target: name.clone(),
                    detail: format!(
                        "error rate {:.2}, average response {:.0}ms",
                        error_rate, usage.avg_duration_ms
                    ),
                });
            }
        }

        suggestions
    }

    /// Typed-query suggestions: recorded queries matching the partial
    /// text, ranked by their pattern's frequency.
    pub fn suggest_queries(&self, partial: &str, limit: usize) -> Vec<String> {
        let needle = partial.trim().to_lowercase();
        let mut seen: Vec<(String, u64)> = Vec::new();

        for interaction in self.history.iter().rev() {
            let lowered = interaction.query.to_lowercase();
            if !needle.is_empty() && !lowered.contains(&needle) {
                continue;
            }
            if seen.iter().any(|(q, _)| *q == interaction.query) {
                continue;
            }
            let frequency = self
                .patterns
                .get(&interaction.intent.signature())
                .map(|p| p.frequency)
                .unwrap_or(0);
            seen.push((interaction.query.clone(), frequency));
        }

        seen.sort_by(|a, b| b.1.cmp(&a.1));
        seen.into_iter().take(limit).map(|(q, _)| q).collect()
    }

    // ------------------------------------------------------------------
    // Sweeping and Snapshots
    // ------------------------------------------------------------------

    /// Drop patterns unseen for the pruning window with a frequency below
    /// the floor. Returns the pruned signatures. The periodic timer calls
    /// this with `Utc::now()`; tests inject their own clock.
    pub fn prune_patterns(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = Duration::days(self.config.prune_after_days);
        let min_frequency = self.config.prune_min_frequency;
        let pruned: Vec<String> = self
            .patterns
            .values()
            .filter(|p| now - p.last_used > cutoff && p.frequency < min_frequency)
            .map(|p| p.signature.clone())
            .collect();

        for signature in &pruned {
            self.patterns.remove(signature);
            self.pattern_servers.remove(signature);
        }
        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned stale patterns");
        }
        pruned
    }

    /// One sweep pass: prune, then regenerate suggestions for the log.
    /// Returns the pruned signatures.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let pruned = self.prune_patterns(now);
        let suggestions = self.optimization_suggestions();
        debug!(
            pruned = pruned.len(),
            suggestions = suggestions.len(),
            "Learning sweep complete"
        );
        pruned
    }

    /// Current durable snapshot: the interaction tail, patterns, and
    /// per-server usage.
    pub fn snapshot(&self) -> LearningSnapshot {
        LearningSnapshot {
            interactions: self.history.iter().cloned().collect(),
            patterns: self.patterns.clone(),
            server_metrics: self.server_usage.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Restore state from a loaded snapshot, replacing the current
    /// in-memory state.
    pub fn restore(&mut self, snapshot: LearningSnapshot) {
        self.history = snapshot.interactions.into();
        while self.history.len() > self.config.max_history_size {
            self.history.pop_front();
        }
        self.patterns = snapshot.patterns;
        self.server_usage = snapshot.server_metrics;

        // rebuild the nested tallies from the restored tail
        self.pattern_servers.clear();
        let tallies: Vec<(String, String, bool)> = self
            .history
            .iter()
            .map(|i| {
                (
                    i.intent.signature(),
                    i.routing.server.clone(),
                    i.validation.is_valid,
                )
            })
            .collect();
        for (signature, server, success) in tallies {
            let tally = self
                .pattern_servers
                .entry(signature)
                .or_default()
                .entry(server)
                .or_default();
            tally.attempts += 1;
            if success {
                tally.successes += 1;
            }
        }
        info!(
            interactions = self.history.len(),
            patterns = self.patterns.len(),
            "Learning state restored from snapshot"
        );
    }

    pub fn stats(&self) -> LearningStats {
        LearningStats {
            history_len: self.history.len(),
            pattern_count: self.patterns.len(),
            total_recorded: self.total_recorded,
            servers_tracked: self.server_usage.len(),
        }
    }

    pub fn pattern(&self, signature: &str) -> Option<&QueryPattern> {
        self.patterns.get(signature)
    }

    pub fn server_usage(&self, server: &str) -> Option<&ServerUsage> {
        self.server_usage.get(server)
    }

    /// Most recent interaction, if any.
    pub fn last_interaction(&self) -> Option<&Interaction> {
        self.history.back()
    }
}

// ============================================================================
// Tests
// ============================================================================
