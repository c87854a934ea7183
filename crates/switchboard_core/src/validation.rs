//! Validation engine - pre-execution safety checks and post-execution
//! result checks.
//!
//! Findings are always returned as data (`ValidationResult`), never as
//! errors. Four rule layers run in order and merge: required fields by
//! action, permission rules, registered business rules, and one optional
//! custom validator per server. A custom validator that fails is caught
//! and contributes no findings - a plugin must never abort the pass.
//! Independent of all business rules, string parameters are scanned for
//! injection control keywords (reject) and oversized payloads (warn).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::ValidationConfig;
use crate::intent::{Action, Intent, QueryContext};
use crate::router::RoutingDecision;

// ============================================================================
// Result Type
// ============================================================================

/// Outcome of a validation pass. `is_valid` holds iff no errors
/// accumulated; warnings and suggestions never invalidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn add_suggestion(&mut self, message: impl Into<String>) {
        self.suggestions.push(message.into());
    }

    /// Fold another result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.is_valid = self.is_valid && other.is_valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.suggestions.extend(other.suggestions);
        for (key, value) in other.metadata {
            self.metadata.insert(key, value);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::valid()
    }
}

// ============================================================================
// Rules
// ============================================================================

/// Severity of a business rule violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A registered business rule: a predicate over the parameter payload.
/// The predicate returns true when the payload satisfies the rule.
pub struct BusinessRule {
    pub description: String,
    pub severity: Severity,
    pub predicate: Box<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>,
}

/// Findings reported by a server's custom validator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorFindings {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Pluggable per-server validator. A returned `Err` is caught by the
/// engine and treated as "no findings".
pub trait CustomValidator: Send + Sync {
    fn validate(&self, routing: &RoutingDecision, intent: &Intent)
        -> Result<ValidatorFindings, String>;
}

/// String fragments that reject a parameter value outright when found in
/// any string parameter, case-insensitively.
const INJECTION_PATTERNS: &[&str] = &[
    "drop table",
    "delete from",
    "truncate table",
    "union select",
    "insert into",
    "; --",
    "<script",
    "javascript:",
    "rm -rf",
];

/// Words that identify a result payload as domain data, switching the
/// structural result checks on.
const DOMAIN_VOCABULARY: &[&str] = &[
    "work_order",
    "work order",
    "job",
    "tenant",
    "unit",
    "property",
    "invoice",
    "technician",
];

// ============================================================================
// Engine
// ============================================================================

/// Pre/post execution validation engine.
pub struct ValidationEngine {
    config: ValidationConfig,
    /// Permissions that satisfy each action; empty set = open access
    required_permissions: HashMap<Action, Vec<String>>,
    /// Actions hard-denied per server, regardless of caller role
    server_restrictions: HashMap<String, Vec<Action>>,
    /// Business rules keyed `"server:action"` or wildcard `"*:action"`
    business_rules: HashMap<String, Vec<BusinessRule>>,
    custom_validators: HashMap<String, Arc<dyn CustomValidator>>,
}

impl ValidationEngine {
    pub fn new(config: ValidationConfig) -> Self {
        let mut required_permissions: HashMap<Action, Vec<String>> = HashMap::new();
        required_permissions.insert(
            Action::Create,
            vec!["create".to_string(), "write".to_string()],
        );
        required_permissions.insert(
            Action::Update,
            vec!["update".to_string(), "write".to_string()],
        );
        required_permissions.insert(
            Action::Delete,
            vec!["delete".to_string(), "admin".to_string()],
        );
        required_permissions.insert(Action::Sync, vec!["sync".to_string(), "write".to_string()]);

        Self {
            config,
            required_permissions,
            server_restrictions: HashMap::new(),
            business_rules: HashMap::new(),
            custom_validators: HashMap::new(),
        }
    }

    /// Register a business rule under `"server:action"` or `"*:action"`.
    pub fn add_business_rule(
        &mut self,
        key: &str,
        description: &str,
        severity: Severity,
        predicate: impl Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    ) {
        self.business_rules
            .entry(key.to_string())
            .or_default()
            .push(BusinessRule {
                description: description.to_string(),
                severity,
                predicate: Box::new(predicate),
            });
    }

    /// Install the custom validator for a server, replacing any previous
    /// one.
    pub fn set_custom_validator(&mut self, server: &str, validator: Arc<dyn CustomValidator>) {
        self.custom_validators.insert(server.to_string(), validator);
    }

    /// Hard-deny actions for a server, regardless of caller permissions.
    pub fn restrict_server(&mut self, server: &str, actions: &[Action]) {
        self.server_restrictions
            .entry(server.to_string())
            .or_default()
            .extend_from_slice(actions);
    }

    // ------------------------------------------------------------------
    // Pre-execution
    // ------------------------------------------------------------------

    /// Run every pre-execution layer in order and merge the findings.
    pub fn validate_operation(
        &self,
        routing: &RoutingDecision,
        intent: &Intent,
        context: &QueryContext,
    ) -> ValidationResult {
        let mut result = ValidationResult::valid();

        self.check_required_fields(routing, intent, &mut result);
        self.check_permissions(routing, intent, context, &mut result);
        let rules_checked = self.check_business_rules(routing, intent, &mut result);
        self.run_custom_validator(routing, intent, &mut result);
        self.scan_parameters(routing, &mut result);

        result.metadata.insert(
            "business_rules_checked".to_string(),
            Value::from(rules_checked),
        );
        debug!(
            server = routing.server.as_str(),
            valid = result.is_valid,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "Operation validated"
        );
        result
    }

    fn check_required_fields(
        &self,
        routing: &RoutingDecision,
        intent: &Intent,
        result: &mut ValidationResult,
    ) {
        match intent.action {
            Action::Create => {
                if routing.params.is_empty() {
                    result.add_error("create requires a non-empty payload");
                }
            }
            Action::Update | Action::Delete => {
                if !has_identifier(&routing.params) && intent.primary_entity().is_none() {
                    result.add_error(format!(
                        "{} requires an id parameter",
                        intent.action
                    ));
                }
            }
            _ => {}
        }
    }

    fn check_permissions(
        &self,
        routing: &RoutingDecision,
        intent: &Intent,
        context: &QueryContext,
        result: &mut ValidationResult,
    ) {
        // hard server restrictions first; these bind even for admins
        if let Some(denied) = self.server_restrictions.get(&routing.server) {
            if denied.contains(&intent.action) {
                result.add_error(format!(
                    "server '{}' does not allow '{}' operations",
                    routing.server, intent.action
                ));
                return;
            }
        }

        let required = match self.required_permissions.get(&intent.action) {
            Some(required) if !required.is_empty() => required,
            _ => return,
        };

        match &context.user {
            Some(user) if user.role == "admin" => {}
            Some(user) if required.iter().any(|p| user.permissions.contains(p)) => {}
            Some(user) => {
                result.add_error(format!(
                    "user '{}' lacks permission for '{}' (requires one of: {})",
                    user.id,
                    intent.action,
                    required.join(", ")
                ));
            }
            None => {
                result.add_error(format!(
                    "'{}' requires an authenticated caller",
                    intent.action
                ));
            }
        }
    }

    fn check_business_rules(
        &self,
        routing: &RoutingDecision,
        intent: &Intent,
        result: &mut ValidationResult,
    ) -> u64 {
        let keys = [
            format!("{}:{}", routing.server, intent.action),
            format!("*:{}", intent.action),
        ];
        let mut checked = 0u64;
        for key in keys {
            let Some(rules) = self.business_rules.get(&key) else {
                continue;
            };
            for rule in rules {
                checked += 1;
                if (rule.predicate)(&routing.params) {
                    continue;
                }
                match rule.severity {
                    Severity::Error => result.add_error(rule.description.clone()),
                    Severity::Warning => result.add_warning(rule.description.clone()),
                }
            }
        }
        checked
    }

    fn run_custom_validator(
        &self,
        routing: &RoutingDecision,
        intent: &Intent,
        result: &mut ValidationResult,
    ) {
        let Some(validator) = self.custom_validators.get(&routing.server) else {
            return;
        };
        match validator.validate(routing, intent) {
            Ok(findings) => {
                for error in findings.errors {
                    result.add_error(error);
                }
                for warning in findings.warnings {
                    result.add_warning(warning);
                }
            }
            Err(cause) => {
                // catch-and-continue: a broken plugin contributes nothing
                warn!(
                    server = routing.server.as_str(),
                    cause = cause.as_str(),
                    "Custom validator failed; ignoring its findings"
                );
            }
        }
    }

    /// Injection scan and payload size check. Independent of business
    /// rules: these run for every operation.
    fn scan_parameters(&self, routing: &RoutingDecision, result: &mut ValidationResult) {
        for (key, value) in &routing.params {
            let Some(text) = value.as_str() else { continue };
            let lowered = text.to_lowercase();
            for pattern in INJECTION_PATTERNS {
                if lowered.contains(pattern) {
                    result.add_error(format!(
                        "parameter '{}' contains a rejected control sequence ('{}')",
                        key, pattern
                    ));
                    break;
                }
            }
        }

        let payload_size = Value::Object(routing.params.clone()).to_string().len();
        if payload_size > self.config.max_payload_bytes {
            result.add_warning(format!(
                "payload is {} bytes (threshold {})",
                payload_size, self.config.max_payload_bytes
            ));
        }
    }

    // ------------------------------------------------------------------
    // Post-execution
    // ------------------------------------------------------------------

    /// Check an execution result against the intent that produced it.
    pub fn validate_result(&self, result_value: &Value, intent: &Intent) -> ValidationResult {
        let mut result = ValidationResult::valid();

        match intent.action {
            Action::Query => match result_value {
                Value::Array(items) => {
                    if items.is_empty() {
                        result.add_warning("query returned no results");
                    }
                    let missing = items
                        .iter()
                        .filter(|item| item.is_object() && !has_identifier_value(item))
                        .count();
                    if missing > 0 {
                        result.add_warning(format!(
                            "{} result item(s) are missing an identifier",
                            missing
                        ));
                    }
                }
                Value::Null => result.add_warning("query returned no results"),
                _ => {}
            },
            Action::Create | Action::Update => {
                if !has_identifier_value(result_value) {
                    result.add_error(format!(
                        "{} result is missing an identifier",
                        intent.action
                    ));
                }
            }
            _ => {}
        }

        if contains_domain_vocabulary(result_value) {
            self.check_structure(result_value, &mut result);
        }
        result
    }

    /// Structural checks for recognized domain payloads, applied to the
    /// object itself or to every object in an array.
    fn check_structure(&self, value: &Value, result: &mut ValidationResult) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.check_structure(item, result);
                }
            }
            Value::Object(object) => {
                if object.get("status").and_then(Value::as_str) == Some("completed")
                    && !object.contains_key("completed_at")
                    && !object.contains_key("completion_date")
                {
                    result.add_error("completed record is missing a completion timestamp");
                }

                if let (Some(start), Some(end)) = (
                    object.get("start_date").and_then(Value::as_str),
                    object.get("end_date").and_then(Value::as_str),
                ) {
                    if end <= start {
                        result.add_error("end date must be after start date");
                    }
                }

                if object.get("occupied").and_then(Value::as_bool) == Some(true)
                    && !object.contains_key("occupant")
                {
                    result.add_warning("occupied unit has no occupant recorded");
                }
                if object.get("assigned").and_then(Value::as_bool) == Some(true)
                    && !object.contains_key("assignee")
                {
                    result.add_warning("assigned record has no assignee");
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn has_identifier(params: &Map<String, Value>) -> bool {
    params
        .keys()
        .any(|key| key == "id" || key.ends_with("_id"))
}

fn has_identifier_value(value: &Value) -> bool {
    match value {
        Value::Object(object) => object.keys().any(|key| key == "id" || key.ends_with("_id")),
        _ => false,
    }
}

fn contains_domain_vocabulary(value: &Value) -> bool {
    let rendered = value.to_string().to_lowercase();
    DOMAIN_VOCABULARY.iter().any(|word| rendered.contains(word))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{Entity, EntityRole, UserContext};
    use serde_json::json;

    fn decision(server: &str, params: Map<String, Value>) -> RoutingDecision {
        RoutingDecision {
            server: server.to_string(),
            tool: "query_work_order".to_string(),
            params,
            protocol: "http".to_string(),
            confidence: 0.9,
            alternates: Vec::new(),
            reasoning: String::new(),
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    fn admin_context() -> QueryContext {
        QueryContext {
            domain: None,
            user: Some(UserContext {
                id: "root".to_string(),
                role: "admin".to_string(),
                permissions: Vec::new(),
            }),
        }
    }

    #[test]
    fn test_update_with_empty_params_requires_id() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let intent = Intent::with_action(Action::Update);
        let result = engine.validate_operation(
            &decision("server-a", Map::new()),
            &intent,
            &admin_context(),
        );
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("id")));
    }

    #[test]
    fn test_update_with_entity_subject_passes_required_fields() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let mut intent = Intent::with_action(Action::Update);
        intent
            .entities
            .push(Entity::new("work_order", "4711", EntityRole::Subject, 0.8));
        let result = engine.validate_operation(
            &decision("server-a", params(&[("status", "open")])),
            &intent,
            &admin_context(),
        );
        assert!(result.is_valid);
    }

    #[test]
    fn test_create_requires_payload() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let intent = Intent::with_action(Action::Create);
        let result = engine.validate_operation(
            &decision("server-a", Map::new()),
            &intent,
            &admin_context(),
        );
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("payload")));
    }

    #[test]
    fn test_permissions_any_of_required_or_admin() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let intent = Intent::with_action(Action::Delete);
        let routing = decision("server-a", params(&[("id", "4711")]));

        // holder of one required permission passes
        let context = QueryContext {
            domain: None,
            user: Some(UserContext {
                id: "tech-1".to_string(),
                role: "technician".to_string(),
                permissions: vec!["delete".to_string()],
            }),
        };
        assert!(engine.validate_operation(&routing, &intent, &context).is_valid);

        // a caller without the permission is rejected
        let context = QueryContext {
            domain: None,
            user: Some(UserContext {
                id: "viewer".to_string(),
                role: "viewer".to_string(),
                permissions: vec!["read".to_string()],
            }),
        };
        let result = engine.validate_operation(&routing, &intent, &context);
        assert!(!result.is_valid);

        // anonymous callers cannot mutate
        let result = engine.validate_operation(&routing, &intent, &QueryContext::default());
        assert!(!result.is_valid);

        // admin role passes without explicit permissions
        assert!(engine
            .validate_operation(&routing, &intent, &admin_context())
            .is_valid);
    }

    #[test]
    fn test_server_restriction_binds_even_for_admin() {
        let mut engine = ValidationEngine::new(ValidationConfig::default());
        engine.restrict_server("readonly-mirror", &[Action::Delete]);
        let intent = Intent::with_action(Action::Delete);
        let routing = decision("readonly-mirror", params(&[("id", "4711")]));
        let result = engine.validate_operation(&routing, &intent, &admin_context());
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("does not allow"));
    }

    #[test]
    fn test_business_rules_by_severity() {
        let mut engine = ValidationEngine::new(ValidationConfig::default());
        engine.add_business_rule(
            "server-a:create",
            "work orders need a priority",
            Severity::Error,
            |params| params.contains_key("priority"),
        );
        engine.add_business_rule(
            "*:create",
            "a description is recommended",
            Severity::Warning,
            |params| params.contains_key("description"),
        );

        let intent = Intent::with_action(Action::Create);
        let routing = decision("server-a", params(&[("summary", "leaky faucet")]));
        let result = engine.validate_operation(&routing, &intent, &admin_context());
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.metadata["business_rules_checked"], json!(2));
    }

    #[test]
    fn test_failing_custom_validator_is_caught() {
        struct Broken;
        impl CustomValidator for Broken {
            fn validate(
                &self,
                _routing: &RoutingDecision,
                _intent: &Intent,
            ) -> Result<ValidatorFindings, String> {
                Err("backend offline".to_string())
            }
        }

        let mut engine = ValidationEngine::new(ValidationConfig::default());
        engine.set_custom_validator("server-a", Arc::new(Broken));
        let intent = Intent::with_action(Action::Query);
        let routing = decision("server-a", params(&[("status", "open")]));
        let result = engine.validate_operation(&routing, &intent, &QueryContext::default());
        assert!(result.is_valid);
    }

    #[test]
    fn test_custom_validator_findings_merge() {
        struct Picky;
        impl CustomValidator for Picky {
            fn validate(
                &self,
                routing: &RoutingDecision,
                _intent: &Intent,
            ) -> Result<ValidatorFindings, String> {
                let mut findings = ValidatorFindings::default();
                if !routing.params.contains_key("building") {
                    findings.errors.push("a building is required".to_string());
                }
                Ok(findings)
            }
        }

        let mut engine = ValidationEngine::new(ValidationConfig::default());
        engine.set_custom_validator("server-a", Arc::new(Picky));
        let intent = Intent::with_action(Action::Query);
        let routing = decision("server-a", params(&[("status", "open")]));
        let result = engine.validate_operation(&routing, &intent, &QueryContext::default());
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["a building is required".to_string()]);
    }

    #[test]
    fn test_injection_patterns_reject() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let intent = Intent::with_action(Action::Query);
        let routing = decision(
            "server-a",
            params(&[("name", "x'; DROP TABLE tenants; --")]),
        );
        let result = engine.validate_operation(&routing, &intent, &QueryContext::default());
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("control sequence"));
    }

    #[test]
    fn test_oversized_payload_warns_only() {
        let engine = ValidationEngine::new(ValidationConfig {
            max_payload_bytes: 32,
        });
        let intent = Intent::with_action(Action::Query);
        let routing = decision(
            "server-a",
            params(&[("description", "a rather long free text description")]),
        );
        let result = engine.validate_operation(&routing, &intent, &QueryContext::default());
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_validate_result_create_requires_identifier() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let intent = Intent::with_action(Action::Create);
        let result = engine.validate_result(&json!({}), &intent);
        assert!(!result.is_valid);

        let result = engine.validate_result(&json!({"id": "wo-1"}), &intent);
        assert!(result.is_valid);
    }

    #[test]
    fn test_validate_result_empty_query_is_warning_only() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let intent = Intent::with_action(Action::Query);
        let result = engine.validate_result(&json!([]), &intent);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_validate_result_items_without_id_warn() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let intent = Intent::with_action(Action::Query);
        let result =
            engine.validate_result(&json!([{"id": "1"}, {"name": "no id"}]), &intent);
        assert!(result.is_valid);
        assert!(result.warnings[0].contains("1 result item"));
    }

    #[test]
    fn test_structural_checks_on_domain_payloads() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let intent = Intent::with_action(Action::Query);

        let completed = json!([{
            "id": "wo-9",
            "work_order": true,
            "status": "completed"
        }]);
        let result = engine.validate_result(&completed, &intent);
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("completion timestamp"));

        let dates = json!([{
            "id": "job-2",
            "job": "repaint",
            "start_date": "2026-08-02",
            "end_date": "2026-08-01"
        }]);
        let result = engine.validate_result(&dates, &intent);
        assert!(!result.is_valid);

        let occupancy = json!([{
            "id": "unit-3",
            "unit": "3B",
            "occupied": true
        }]);
        let result = engine.validate_result(&occupancy, &intent);
        assert!(result.is_valid);
        assert!(result.warnings[0].contains("occupant"));
    }

    #[test]
    fn test_non_domain_payload_skips_structural_checks() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let intent = Intent::with_action(Action::Query);
        // "completed" status alone is not domain vocabulary
        let result = engine.validate_result(&json!([{"id": "x", "state": "done"}]), &intent);
        assert!(result.is_valid);
        assert!(result.warnings.is_empty());
    }
}
