//! Intent parser - deterministic free text to structured Intent.
//!
//! No statistical model anywhere: normalization, ordered keyword tables
//! for the action, phrase dictionaries for entities, pattern extraction
//! for filters and timeframes, and a tiny bag-of-words fallback when no
//! action keyword matches. The same text always parses to the same
//! intent (relative timeframes are anchored at the injected call time).

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;
use tracing::debug;

use crate::config::ParserConfig;
use crate::error::NlpError;
use crate::intent::{
    clamp_confidence, Action, Aggregation, Entity, EntityRole, Filter, FilterOperator, Intent,
    QueryContext, Timeframe,
};

// ============================================================================
// Keyword Tables
// ============================================================================

/// Action keywords in match precedence order: the first category with a
/// token hit wins.
const ACTION_KEYWORDS: &[(Action, &[&str])] = &[
    (
        Action::Query,
        &["show", "list", "get", "find", "display", "view", "search", "what", "which", "tell"],
    ),
    (
        Action::Create,
        &["create", "add", "new", "make", "schedule", "register", "log"],
    ),
    (
        Action::Update,
        &["update", "change", "modify", "edit", "set", "assign", "reassign", "mark", "move"],
    ),
    (
        Action::Delete,
        &["delete", "remove", "cancel", "close", "archive"],
    ),
    (
        Action::Sync,
        &["sync", "synchronize", "refresh", "import", "export", "pull", "push"],
    ),
    (
        Action::Analyze,
        &["analyze", "analyse", "report", "summarize", "breakdown", "trends", "statistics", "stats"],
    ),
    (
        Action::Compare,
        &["compare", "versus", "vs", "diff", "benchmark"],
    ),
];

/// Fallback classifier weights. Summed per action over the query tokens;
/// the best-scoring action wins, query when everything scores zero.
const BAG_OF_WORDS: &[(&str, Action, f64)] = &[
    ("how", Action::Query, 0.5),
    ("many", Action::Query, 0.3),
    ("much", Action::Query, 0.3),
    ("who", Action::Query, 0.5),
    ("where", Action::Query, 0.5),
    ("when", Action::Query, 0.4),
    ("available", Action::Query, 0.3),
    ("need", Action::Create, 0.4),
    ("want", Action::Create, 0.3),
    ("fix", Action::Update, 0.5),
    ("wrong", Action::Update, 0.3),
    ("outdated", Action::Sync, 0.4),
    ("stale", Action::Sync, 0.4),
    ("insight", Action::Analyze, 0.5),
    ("performance", Action::Analyze, 0.4),
    ("better", Action::Compare, 0.4),
    ("worse", Action::Compare, 0.4),
];

/// Domain entity dictionary: canonical type and the phrases that name it.
/// Phrases are matched on word boundaries against the normalized text;
/// when the next token looks like an identifier it is captured as the
/// entity value.
const ENTITY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "work_order",
        &["work order", "work orders", "workorder", "workorders", "ticket", "tickets"],
    ),
    ("job", &["job", "jobs"]),
    ("property", &["property", "properties", "building", "buildings"]),
    ("unit", &["unit", "units", "apartment", "apartments"]),
    (
        "tenant",
        &["tenant", "tenants", "resident", "residents", "occupant", "occupants"],
    ),
    (
        "invoice",
        &["invoice", "invoices", "bill", "bills", "payment", "payments"],
    ),
    (
        "technician",
        &["technician", "technicians", "contractor", "contractors", "crew"],
    ),
    ("report", &["report", "reports", "summary", "summaries"]),
];

const STATUS_KEYWORDS: &[&str] =
    &["open", "closed", "pending", "completed", "overdue", "active", "inactive"];

const PRIORITY_LEVELS: &[&str] = &["high", "medium", "low"];

/// Relative timeframe phrases, matched against the normalized text.
const RELATIVE_TIMEFRAMES: &[&str] = &[
    "today",
    "yesterday",
    "this week",
    "last week",
    "this month",
    "last month",
    "this year",
];

/// Tokens that never make sense as a captured place name.
const PLACE_STOPWORDS: &[&str] =
    &["the", "a", "an", "this", "last", "least", "progress", "my", "our", "all"];

// ============================================================================
// Parser
// ============================================================================

/// Parser seam. The rest of the pipeline only sees this trait, so a
/// statistical parser can replace the rule-based one without touching
/// the registry/router/validation contracts.
pub trait IntentParsing: Send + Sync {
    fn parse(&self, text: &str, context: QueryContext) -> Result<Intent, NlpError>;
}

/// Deterministic intent parser.
pub struct IntentParser {
    config: ParserConfig,
    re_greater: Regex,
    re_less: Regex,
    re_at_least: Regex,
    re_contains: Regex,
    re_from_to: Regex,
    re_on_date: Regex,
}

impl IntentParser {
    pub fn new(config: ParserConfig) -> Self {
        // the patterns are literals; construction cannot fail
        Self {
            config,
            re_greater: Regex::new(r"\b(?:greater than|more than|over|above)\s+(\d+(?:\.\d+)?)")
                .unwrap(),
            re_less: Regex::new(r"\b(?:less than|fewer than|under|below)\s+(\d+(?:\.\d+)?)")
                .unwrap(),
            re_at_least: Regex::new(r"\bat least\s+(\d+(?:\.\d+)?)").unwrap(),
            re_contains: Regex::new(r"\bcontain(?:s|ing)?\s+([a-z0-9_-]+)").unwrap(),
            re_from_to: Regex::new(r"\bfrom\s+(\d{4}-\d{2}-\d{2})\s+to\s+(\d{4}-\d{2}-\d{2})")
                .unwrap(),
            re_on_date: Regex::new(r"\bon\s+(\d{4}-\d{2}-\d{2})").unwrap(),
        }
    }

    /// Parse a request, anchoring relative timeframes at the current
    /// time.
    pub fn parse(&self, text: &str, context: QueryContext) -> Result<Intent, NlpError> {
        self.parse_at(text, context, Utc::now())
    }

    /// Parse with an injected clock. Tests use this to make relative
    /// timeframes reproducible.
    pub fn parse_at(
        &self,
        text: &str,
        context: QueryContext,
        now: DateTime<Utc>,
    ) -> Result<Intent, NlpError> {
        if text.trim().is_empty() {
            return Err(NlpError::EmptyQuery);
        }
        if text.len() > self.config.max_query_len {
            return Err(NlpError::QueryTooLong {
                len: text.len(),
                max: self.config.max_query_len,
            });
        }

        let normalized = normalize(text);
        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(NlpError::Malformed("no parseable tokens".to_string()));
        }

        let (action, action_matched) = classify_action(&tokens);
        let filters = self.extract_filters(&normalized, &tokens);
        let timeframe = self.extract_timeframe(&normalized, now)?;
        let aggregation = extract_aggregation(&normalized);

        // values already claimed by filters or dates must not re-surface
        // as bare number entities
        let mut claimed: Vec<String> = filters.iter().map(|f| f.value.clone()).collect();
        if let Some(tf) = &timeframe {
            claimed.push(tf.start.format("%Y-%m-%d").to_string());
            claimed.push(tf.end.format("%Y-%m-%d").to_string());
        }
        let entities = self.extract_entities(text, &normalized, &tokens, &claimed);

        let confidence = self.blend_confidence(action_matched, &entities, &filters);
        debug!(
            action = action.as_str(),
            entities = entities.len(),
            filters = filters.len(),
            confidence,
            "Parsed intent"
        );

        Ok(Intent {
            action,
            entities,
            filters,
            timeframe,
            aggregation,
            confidence,
            context,
        })
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    fn extract_entities(
        &self,
        raw: &str,
        normalized: &str,
        tokens: &[&str],
        claimed: &[String],
    ) -> Vec<Entity> {
        let mut entities = Vec::new();
        let padded = format!(" {} ", normalized);

        // domain dictionary, one entity per matched type
        for (entity_type, phrases) in ENTITY_KEYWORDS {
            let Some(after) = phrases.iter().find_map(|p| phrase_suffix(&padded, p)) else {
                continue;
            };
            let value = after
                .split_whitespace()
                .next()
                .filter(|t| looks_like_identifier(t))
                .map(|t| t.trim_start_matches('#').to_string())
                .unwrap_or_else(|| entity_type.to_string());
            entities.push(Entity::new(
                entity_type,
                &value,
                EntityRole::Subject,
                self.config.domain_entity_confidence,
            ));
        }

        // generic places: "in X" / "at X" / "near X"
        for (i, token) in tokens.iter().enumerate() {
            if !matches!(*token, "in" | "at" | "near") {
                continue;
            }
            let Some(next) = tokens.get(i + 1) else { continue };
            if PLACE_STOPWORDS.contains(next)
                || looks_like_identifier(next)
                || STATUS_KEYWORDS.contains(next)
                || is_entity_keyword(next)
            {
                continue;
            }
            entities.push(Entity::new(
                "place",
                next,
                EntityRole::Filter,
                self.config.generic_entity_confidence,
            ));
            break;
        }

        // generic persons: "for Bob" / "by Bob", capitalization from the
        // raw text decides whether the token reads as a name
        let raw_tokens: Vec<&str> = raw.split_whitespace().collect();
        for (i, token) in raw_tokens.iter().enumerate() {
            if !matches!(token.to_lowercase().as_str(), "for" | "by") {
                continue;
            }
            let Some(next) = raw_tokens.get(i + 1) else { continue };
            let cleaned: String = next
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect();
            if cleaned.chars().next().map(|c| c.is_uppercase()) != Some(true) {
                continue;
            }
            entities.push(Entity::new(
                "person",
                &cleaned.to_lowercase(),
                EntityRole::Filter,
                self.config.generic_entity_confidence,
            ));
            break;
        }

        // bare numbers, unless already captured elsewhere
        let captured: Vec<&str> = entities.iter().map(|e| e.value.as_str()).collect();
        for token in tokens {
            if token.parse::<i64>().is_ok()
                && !captured.contains(token)
                && !claimed.iter().any(|c| c == token)
            {
                entities.push(Entity::new(
                    "number",
                    token,
                    EntityRole::Filter,
                    self.config.number_confidence,
                ));
                break;
            }
        }

        entities
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// Filters are extracted independently and non-exclusively: every
    /// matching pattern contributes.
    fn extract_filters(&self, normalized: &str, tokens: &[&str]) -> Vec<Filter> {
        let mut filters = Vec::new();

        for level in PRIORITY_LEVELS {
            if normalized.contains(&format!("{level} priority"))
                || normalized.contains(&format!("priority {level}"))
            {
                filters.push(Filter::new("priority", FilterOperator::Equals, level));
            }
        }
        if tokens.contains(&"urgent") || tokens.contains(&"critical") {
            filters.push(Filter::new("priority", FilterOperator::Equals, "urgent"));
        }

        for status in STATUS_KEYWORDS {
            if tokens.contains(status) {
                filters.push(Filter::new("status", FilterOperator::Equals, status));
            }
        }
        if normalized.contains("in progress") {
            filters.push(Filter::new("status", FilterOperator::Equals, "in_progress"));
        }

        for capture in self.re_greater.captures_iter(normalized) {
            filters.push(Filter::new("value", FilterOperator::GreaterThan, &capture[1]));
        }
        for capture in self.re_less.captures_iter(normalized) {
            filters.push(Filter::new("value", FilterOperator::LessThan, &capture[1]));
        }
        for capture in self.re_at_least.captures_iter(normalized) {
            filters.push(Filter::new("value", FilterOperator::AtLeast, &capture[1]));
        }
        for capture in self.re_contains.captures_iter(normalized) {
            filters.push(Filter::new("text", FilterOperator::Contains, &capture[1]));
        }

        filters
    }

    // ------------------------------------------------------------------
    // Timeframe
    // ------------------------------------------------------------------

    fn extract_timeframe(
        &self,
        normalized: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Timeframe>, NlpError> {
        // explicit ranges take precedence over relative phrases
        if let Some(capture) = self.re_from_to.captures(normalized) {
            let start = parse_date(&capture[1])?;
            let end = parse_date(&capture[2])?;
            return Ok(Some(Timeframe {
                start: midnight(start),
                end: midnight(end) + Duration::days(1),
                relative: None,
            }));
        }
        if let Some(capture) = self.re_on_date.captures(normalized) {
            let day = parse_date(&capture[1])?;
            return Ok(Some(Timeframe {
                start: midnight(day),
                end: midnight(day) + Duration::days(1),
                relative: None,
            }));
        }

        let padded = format!(" {} ", normalized);
        for phrase in RELATIVE_TIMEFRAMES {
            if !padded.contains(&format!(" {} ", phrase)) {
                continue;
            }
            if let Some((start, end)) = relative_window(phrase, now) {
                return Ok(Some(Timeframe {
                    start,
                    end,
                    relative: Some(phrase.replace(' ', "_")),
                }));
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Confidence
    // ------------------------------------------------------------------

    /// base + action bonus (keyword match only) + entity weight * mean
    /// entity confidence + filter bonus, capped at 1.0.
    fn blend_confidence(&self, action_matched: bool, entities: &[Entity], filters: &[Filter]) -> f64 {
        let c = &self.config;
        let mut confidence = c.base_confidence;
        if action_matched {
            confidence += c.action_bonus;
        }
        if !entities.is_empty() {
            let mean: f64 =
                entities.iter().map(|e| e.confidence).sum::<f64>() / entities.len() as f64;
            confidence += c.entity_weight * mean;
        }
        if !filters.is_empty() {
            confidence += c.filter_bonus;
        }
        clamp_confidence(confidence)
    }
}

impl Default for IntentParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl IntentParsing for IntentParser {
    fn parse(&self, text: &str, context: QueryContext) -> Result<Intent, NlpError> {
        IntentParser::parse(self, text, context)
    }
}

// ============================================================================
// Free Helpers
// ============================================================================

/// Lowercase, strip punctuation (identifier characters survive), collapse
/// whitespace.
fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '_' | '#') {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ordered keyword match over the precedence table, falling back to the
/// bag-of-words classifier. Returns the action and whether a keyword
/// (not the fallback) decided it.
fn classify_action(tokens: &[&str]) -> (Action, bool) {
    for (action, keywords) in ACTION_KEYWORDS {
        if tokens.iter().any(|t| keywords.contains(t)) {
            return (*action, true);
        }
    }

    let mut scores: Vec<(Action, f64)> = Action::in_precedence_order()
        .iter()
        .map(|a| (*a, 0.0))
        .collect();
    for token in tokens {
        for (word, action, weight) in BAG_OF_WORDS {
            if token == word {
                if let Some(entry) = scores.iter_mut().find(|(a, _)| a == action) {
                    entry.1 += weight;
                }
            }
        }
    }
    // stable max: ties resolve to the earlier action in precedence order
    let best = scores
        .iter()
        .fold((Action::Query, 0.0), |acc, (a, s)| if *s > acc.1 { (*a, *s) } else { acc });
    (best.0, false)
}

/// If the padded text contains the phrase on word boundaries, return the
/// remainder after the match.
fn phrase_suffix<'a>(padded: &'a str, phrase: &str) -> Option<&'a str> {
    let needle = format!(" {} ", phrase);
    padded
        .find(&needle)
        .map(|pos| &padded[pos + needle.len()..])
}

/// Identifier-ish token: contains a digit, possibly prefixed with '#'.
fn looks_like_identifier(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}

fn is_entity_keyword(token: &str) -> bool {
    ENTITY_KEYWORDS
        .iter()
        .any(|(_, phrases)| phrases.contains(&token))
}

fn extract_aggregation(normalized: &str) -> Option<Aggregation> {
    let padded = format!(" {} ", normalized);
    let has = |phrase: &str| padded.contains(&format!(" {} ", phrase));
    if has("how many") || has("count") {
        Some(Aggregation::Count)
    } else if has("total") || has("sum") {
        Some(Aggregation::Sum)
    } else if has("average") || has("avg") || has("mean") {
        Some(Aggregation::Average)
    } else if has("maximum") || has("max") || has("highest") {
        Some(Aggregation::Max)
    } else if has("minimum") || has("min") || has("lowest") {
        Some(Aggregation::Min)
    } else {
        None
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, NlpError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| NlpError::Malformed(format!("invalid date '{raw}'")))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Compute the [start, end) window for a relative phrase, anchored at
/// `now`. Weeks start on Monday; months and years on their first day.
fn relative_window(phrase: &str, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let today = now.date_naive();
    let week_start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
    let month_start = today.with_day(1)?;
    let year_start = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;

    match phrase {
        "today" => Some((midnight(today), midnight(today) + Duration::days(1))),
        "yesterday" => Some((midnight(today) - Duration::days(1), midnight(today))),
        "this week" => Some((midnight(week_start), midnight(week_start) + Duration::days(7))),
        "last week" => Some((
            midnight(week_start) - Duration::days(7),
            midnight(week_start),
        )),
        "this month" => Some((midnight(month_start), midnight(next_month(month_start)?))),
        "last month" => {
            let previous = previous_month(month_start)?;
            Some((midnight(previous), midnight(month_start)))
        }
        "this year" => {
            let next = NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)?;
            Some((midnight(year_start), midnight(next)))
        }
        _ => None,
    }
}

fn next_month(first: NaiveDate) -> Option<NaiveDate> {
    if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
}

fn previous_month(first: NaiveDate) -> Option<NaiveDate> {
    if first.month() == 1 {
        NaiveDate::from_ymd_opt(first.year() - 1, 12, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() - 1, 1)
    }
}

// ============================================================================
// Tests
// ============================================================================
