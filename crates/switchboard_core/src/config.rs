//! Switchboard configuration.
//!
//! Every hand-picked constant in the pipeline - confidence blend weights,
//! ranking weights, cache and history capacities, sweep intervals,
//! learning thresholds - lives here so deployments can tune behavior
//! without touching code. All sections have full defaults; a config file
//! only needs the keys it overrides.

use serde::{Deserialize, Serialize};

/// Top-level configuration, one section per pipeline stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub parser: ParserConfig,

    pub registry: RegistryConfig,

    pub router: RouterConfig,

    pub validation: ValidationConfig,

    pub learning: LearningConfig,
}

impl SwitchboardConfig {
    /// Parse a TOML document. Missing sections and keys fall back to
    /// defaults; unknown keys are ignored.
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Intent parser tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Maximum accepted query length in characters
    pub max_query_len: usize,

    /// Confidence floor for every successfully parsed intent
    pub base_confidence: f64,

    /// Added when the action matched a keyword (not the fallback classifier)
    pub action_bonus: f64,

    /// Weight of the mean entity confidence
    pub entity_weight: f64,

    /// Added when at least one filter was extracted
    pub filter_bonus: f64,

    /// Confidence for domain-dictionary entity matches
    pub domain_entity_confidence: f64,

    /// Confidence for generic place/person matches
    pub generic_entity_confidence: f64,

    /// Confidence for bare number matches
    pub number_confidence: f64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_query_len: 1000,
            base_confidence: 0.5,
            action_bonus: 0.2,
            entity_weight: 0.2,
            filter_bonus: 0.1,
            domain_entity_confidence: 0.8,
            generic_entity_confidence: 0.7,
            number_confidence: 0.6,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Capability registry tuning: ranking weights and health sweep timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Fuzzy-match distance cutoff; only matches scoring below this are kept
    pub fuzzy_threshold: f64,

    /// Relevance points per intent entity type the server declares
    pub entity_weight: f64,

    /// Relevance points when the server supports the intent's operation
    pub operation_weight: f64,

    /// Relevance points when the server declares the context domain
    pub domain_weight: f64,

    /// Relevance penalty multiplier on the server's error rate
    pub error_rate_penalty: f64,

    /// Relevance penalty multiplier on avg response time in seconds
    pub response_time_penalty: f64,

    /// Health sweep period in seconds
    pub health_check_interval_secs: u64,

    /// A registration is marked inactive once its last health check is
    /// older than this
    pub stale_after_secs: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.4,
            entity_weight: 3.0,
            operation_weight: 5.0,
            domain_weight: 4.0,
            error_rate_penalty: 2.0,
            response_time_penalty: 0.5,
            health_check_interval_secs: 60,
            stale_after_secs: 300,
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Router tuning: decision cache size and confidence blend weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Decision cache capacity; insertion past this evicts the oldest key
    pub cache_capacity: usize,

    /// Confidence floor for every routing decision
    pub base_confidence: f64,

    /// Weight of the fraction of intent entity types the server declares
    pub entity_weight: f64,

    /// Added when the server supports the intent's operation
    pub operation_bonus: f64,

    /// Weight of the server's reliability (1 - error rate)
    pub reliability_weight: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 100,
            base_confidence: 0.5,
            entity_weight: 0.2,
            operation_bonus: 0.2,
            reliability_weight: 0.1,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validation engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Serialized parameter payloads above this size draw a warning
    pub max_payload_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 64 * 1024,
        }
    }
}

// ============================================================================
// Learning
// ============================================================================

/// Learning system tuning: history capacity, snapshot cadence, prediction
/// and pruning thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Interaction ring buffer capacity
    pub max_history_size: usize,

    /// Flush a durable snapshot every N recorded interactions
    pub snapshot_every: usize,

    /// Prediction requires a pattern success rate strictly above this
    pub predict_min_success_rate: f64,

    /// Fixed error-rate nudge applied to a misrouted server on negative
    /// feedback
    pub feedback_error_nudge: f64,

    /// Learning sweep period in seconds
    pub sweep_interval_secs: u64,

    /// Patterns unseen for this many days are prune candidates
    pub prune_after_days: i64,

    /// Prune candidates below this frequency are dropped
    pub prune_min_frequency: u64,

    /// Patterns at least this frequent count as hot for suggestions
    pub hot_pattern_frequency: u64,

    /// Hot patterns slower than this (ms) draw a caching suggestion
    pub slow_pattern_ms: f64,

    /// Patterns below this success rate draw a re-routing suggestion
    pub reroute_below_success_rate: f64,

    /// Servers above this error rate are flagged
    pub flag_error_rate: f64,

    /// Servers slower than this (ms) are flagged
    pub flag_response_time_ms: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            max_history_size: 1000,
            snapshot_every: 10,
            predict_min_success_rate: 0.8,
            feedback_error_nudge: 0.1,
            sweep_interval_secs: 300,
            prune_after_days: 7,
            prune_min_frequency: 5,
            hot_pattern_frequency: 50,
            slow_pattern_ms: 1000.0,
            reroute_below_success_rate: 0.7,
            flag_error_rate: 0.1,
            flag_response_time_ms: 3000.0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = SwitchboardConfig::default();
        assert_eq!(config.parser.base_confidence, 0.5);
        assert_eq!(config.registry.fuzzy_threshold, 0.4);
        assert_eq!(config.registry.operation_weight, 5.0);
        assert_eq!(config.router.cache_capacity, 100);
        assert_eq!(config.learning.snapshot_every, 10);
        assert_eq!(config.learning.prune_after_days, 7);
    }

    #[test]
    fn test_partial_toml_overrides_only_named_keys() {
        let raw = r#"
            [router]
            cache_capacity = 16

            [learning]
            max_history_size = 50
        "#;
        let config = SwitchboardConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.router.cache_capacity, 16);
        assert_eq!(config.learning.max_history_size, 50);
        // untouched sections keep defaults
        assert_eq!(config.parser.max_query_len, 1000);
        assert_eq!(config.registry.stale_after_secs, 300);
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config = SwitchboardConfig::from_toml_str("").unwrap();
        assert_eq!(config.router.base_confidence, 0.5);
        assert_eq!(config.learning.predict_min_success_rate, 0.8);
    }
}
