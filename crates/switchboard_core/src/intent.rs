//! Intent model - structured parse of a free-text request.
//!
//! An `Intent` is built fresh per query by the intent parser and discarded
//! after the pipeline run (it survives only inside a recorded
//! `Interaction`). Two canonical string forms are derived from it:
//! - `cache_key()`: value-bearing, used by the router's decision cache
//! - `signature()`: value-free, used by the learning system so paraphrases
//!   of the same request share a pattern

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Action Taxonomy
// ============================================================================

/// Canonical request actions, in match precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read/lookup requests - "show", "list", "find"
    Query,
    /// Creation requests - "create", "add", "schedule"
    Create,
    /// Mutation requests - "update", "assign", "set"
    Update,
    /// Removal requests - "delete", "cancel", "close"
    Delete,
    /// Synchronization requests - "sync", "refresh", "import"
    Sync,
    /// Analysis requests - "analyze", "report", "stats"
    Analyze,
    /// Comparison requests - "compare", "diff"
    Compare,
}

impl Action {
    /// All actions in match precedence order (first match wins).
    pub fn in_precedence_order() -> [Action; 7] {
        [
            Action::Query,
            Action::Create,
            Action::Update,
            Action::Delete,
            Action::Sync,
            Action::Analyze,
            Action::Compare,
        ]
    }

    /// Ordered operation synonyms for this action. Tool selection walks
    /// the list and returns the first operation a server declares;
    /// relevance ranking uses the same table to decide whether a server
    /// supports the action at all.
    pub fn operation_synonyms(&self) -> &'static [&'static str] {
        match self {
            Action::Query => &["list", "get", "find", "search", "query"],
            Action::Create => &["create", "add", "insert", "new", "schedule"],
            Action::Update => &["update", "edit", "modify", "set", "assign"],
            Action::Delete => &["delete", "remove", "cancel", "close"],
            Action::Sync => &["sync", "synchronize", "refresh", "import"],
            Action::Analyze => &["analyze", "report", "stats", "summary"],
            Action::Compare => &["compare", "diff", "benchmark"],
        }
    }

    /// Canonical lowercase name, used in cache keys and tool names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Query => "query",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Sync => "sync",
            Action::Analyze => "analyze",
            Action::Compare => "compare",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Role an entity plays inside the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    /// The thing the request is about ("work order 4711")
    Subject,
    /// A constraint on the result set ("for Oslo", "over 500")
    Filter,
}

/// A recognized entity with its extraction confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity type (e.g. "work_order", "tenant", "place", "number")
    pub entity_type: String,
    /// Captured value - the qualifying token when one followed the match,
    /// otherwise the matched keyword itself
    pub value: String,
    /// Role within the request
    pub role: EntityRole,
    /// Extraction confidence in [0,1]
    pub confidence: f64,
}

impl Entity {
    pub fn new(entity_type: &str, value: &str, role: EntityRole, confidence: f64) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            value: value.to_string(),
            role,
            confidence: clamp_confidence(confidence),
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Comparison operator for an extracted filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    GreaterThan,
    LessThan,
    AtLeast,
    Contains,
}

impl FilterOperator {
    /// Short canonical form, used in cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equals => "eq",
            FilterOperator::GreaterThan => "gt",
            FilterOperator::LessThan => "lt",
            FilterOperator::AtLeast => "gte",
            FilterOperator::Contains => "contains",
        }
    }
}

/// A single extracted filter constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: String,
}

impl Filter {
    pub fn new(field: &str, operator: FilterOperator, value: &str) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// Timeframe and Aggregation
// ============================================================================

/// A resolved time window. `relative` keeps the original keyword when the
/// window came from the relative lookup table ("last week"), so downstream
/// parameters can forward the token instead of the computed bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeframe {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative: Option<String>,
}

/// Aggregation directive detected in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    Sum,
    Average,
    Min,
    Max,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum => "sum",
            Aggregation::Average => "average",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }
}

// ============================================================================
// Caller Context
// ============================================================================

/// Caller identity attached to a request, consulted by permission rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    /// Role name; "admin" satisfies every permission rule
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Optional caller context for a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    /// Domain hint ("maintenance", "billing", ...) consulted by the
    /// registry's domain index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserContext>,
}

// ============================================================================
// Intent
// ============================================================================

/// Structured parse of a free-text request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub action: Action,
    pub entities: Vec<Entity>,
    pub filters: Vec<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    /// Parse confidence in [0,1]
    pub confidence: f64,
    #[serde(default)]
    pub context: QueryContext,
}

impl Intent {
    /// Minimal intent for a bare action. Used by tests and as the partial
    /// intent attached to routing failures.
    pub fn with_action(action: Action) -> Self {
        Self {
            action,
            entities: Vec::new(),
            filters: Vec::new(),
            timeframe: None,
            aggregation: None,
            confidence: 0.0,
            context: QueryContext::default(),
        }
    }

    /// The primary entity: first subject-role entity, falling back to the
    /// first entity of any role.
    pub fn primary_entity(&self) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.role == EntityRole::Subject)
            .or_else(|| self.entities.first())
    }

    /// Sorted, deduplicated entity types.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> =
            self.entities.iter().map(|e| e.entity_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    /// Canonical decision-cache key: action + sorted `type:value` entity
    /// pairs + sorted `field:operator:value` filter triples.
    pub fn cache_key(&self) -> String {
        let mut entity_pairs: Vec<String> = self
            .entities
            .iter()
            .map(|e| format!("{}:{}", e.entity_type, e.value))
            .collect();
        entity_pairs.sort();

        let mut filter_triples: Vec<String> = self
            .filters
            .iter()
            .map(|f| format!("{}:{}:{}", f.field, f.operator.as_str(), f.value))
            .collect();
        filter_triples.sort();

        format!(
            "{}|{}|{}",
            self.action.as_str(),
            entity_pairs.join(","),
            filter_triples.join(",")
        )
    }

    /// Value-free pattern signature: action + sorted entity types.
    /// Paraphrases of the same request class share a signature.
    pub fn signature(&self) -> String {
        format!("{}|{}", self.action.as_str(), self.entity_types().join(","))
    }
}

/// Clamp a confidence value into [0,1]. All confidence math in the crate
/// funnels through this.
pub fn clamp_confidence(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

// ============================================================================
// Tests
// ============================================================================
