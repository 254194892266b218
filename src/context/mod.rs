//! Context Extraction
//!
//! Turns a free-form question into a structured `QueryContext`: mentioned
//! entities and attributes, operations, filters, aggregations, temporal
//! references and business intent. Pure keyword/regex work, no external calls,
//! so it is available even when every other service is down.

pub mod vocabulary;

use crate::config::ConfidenceWeights;
use chrono::{Datelike, Days, Local, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;
use vocabulary::{Vocabulary, ALL, NOT_PLURAL, STOP_WORDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Select,
    Filter,
    Sort,
    Group,
    Join,
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Count,
    Sum,
    Average,
    Max,
    Min,
}

impl AggregationKind {
    pub fn sql_function(&self) -> &'static str {
        match self {
            AggregationKind::Count => "COUNT",
            AggregationKind::Sum => "SUM",
            AggregationKind::Average => "AVG",
            AggregationKind::Max => "MAX",
            AggregationKind::Min => "MIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessIntent {
    Reporting,
    Analytics,
    Lookup,
    Monitoring,
    Optimization,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Date,
    Numeric,
    Text,
}

/// One extracted condition. `operator` is a symbol for date/text filters and
/// the comparison word ("greater", "less", "equal", "at least", ...) for
/// numeric filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub kind: FilterKind,
    pub operator: String,
    pub field: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    English,
    Chinese,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Chinese => "zh",
        }
    }
}

/// Structured interpretation of a question; built once, read-only afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    pub question: String,
    pub language: Language,
    pub entities_mentioned: BTreeSet<String>,
    pub attributes_mentioned: BTreeSet<String>,
    pub operations: BTreeSet<Operation>,
    pub filters: Vec<Filter>,
    pub aggregations: BTreeSet<AggregationKind>,
    pub temporal_references: Vec<String>,
    pub business_intent: BusinessIntent,
    pub confidence: f64,
}

impl QueryContext {
    /// Low confidence is a quality signal, not an error
    pub fn is_degraded(&self) -> bool {
        self.confidence < 0.5
    }
}

lazy_static! {
    static ref DATE_FILTER: Regex = Regex::new(
        r"(?i)\b(?:([a-z_]+_(?:at|date|on)|date)\s+)?(after|since|before|until|from|on)\s+(\d{4}-\d{2}-\d{2}|yesterday|today|last\s+(?:week|month|year|quarter)|this\s+(?:week|month|year|quarter)|\d+\s+days?\s+ago)\b"
    ).unwrap();
    static ref LAST_N_DAYS: Regex = Regex::new(r"(?i)\b(?:in\s+the\s+)?(?:past|last)\s+(\d+)\s+days?\b").unwrap();
    static ref NUMERIC_FILTER: Regex = Regex::new(
        r"(?i)(?:\b([a-z_][a-z0-9_]*)\s+)?(?:is\s+|are\s+|of\s+)?\b(greater than|more than|higher than|above|over|exceeding|less than|fewer than|lower than|below|under|equal to|equals|at least|at most)\s+\$?(-?\d+(?:\.\d+)?)"
    ).unwrap();
    static ref NUMERIC_FILTER_ZH: Regex = Regex::new(r"(大于|超过|多于|小于|少于|低于|等于)\s*(-?\d+(?:\.\d+)?)").unwrap();
    static ref EQUALITY_FILTER: Regex = Regex::new(
        r#"(?i)\b([a-z_][a-z0-9_]*)\s*(?:==|=|:)\s*(?:'([^']*)'|"([^"]*)"|([^\s,;'"]+))"#
    ).unwrap();
    static ref QUOTED_IS_FILTER: Regex = Regex::new(
        r#"(?i)\b([a-z_][a-z0-9_]*)\s+(?:is|equals)\s+(?:'([^']*)'|"([^"]*)")"#
    ).unwrap();
    static ref WHERE_IS_FILTER: Regex = Regex::new(r"(?i)\bwhere\s+([a-z_][a-z0-9_]*)\s+is\s+([a-z0-9_\-]+)").unwrap();
    static ref LOCATION_FILTER: Regex = Regex::new(r"\b(?:from|in)\s+(\p{Lu}[\p{L}\-]*(?:\s+\p{Lu}[\p{L}\-]*)*)").unwrap();
    static ref QUOTED: Regex = Regex::new(r#""([^"]+)"|'([^']+)'|“([^”]+)”"#).unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap();
    static ref DAYS_AGO: Regex = Regex::new(r"(?i)\b\d+\s+days?\s+ago\b").unwrap();
}

/// Capitalized words after "from"/"in" that are time words, not places
const NOT_PLACES: &[&str] = &[
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday",
    "Saturday", "Sunday", "Q1", "Q2", "Q3", "Q4",
];

/// Normalized question text with keyword lookup helpers
struct Text {
    lower: String,
    padded: String,
    tokens: Vec<String>,
}

impl Text {
    fn new(question: &str) -> Self {
        let lower = question.to_lowercase();
        let tokens: Vec<String> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
            .map(|t| t.trim_matches('.'))
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();
        let padded = format!(" {} ", tokens.join(" "));
        Self { lower, padded, tokens }
    }

    /// ASCII keywords match whole words/phrases; other scripts match as substrings
    fn has(&self, keyword: &str) -> bool {
        if keyword.is_ascii() {
            self.padded.contains(&format!(" {} ", keyword))
        } else {
            self.lower.contains(keyword)
        }
    }
}

pub struct ContextExtractor {
    vocabularies: Vec<&'static Vocabulary>,
    weights: ConfidenceWeights,
    reference_date: Option<NaiveDate>,
}

impl Default for ContextExtractor {
    fn default() -> Self {
        Self::new(ConfidenceWeights::default())
    }
}

impl ContextExtractor {
    pub fn new(weights: ConfidenceWeights) -> Self {
        Self {
            vocabularies: ALL.to_vec(),
            weights,
            reference_date: None,
        }
    }

    /// Pin the date relative expressions ("yesterday", "last month") resolve against
    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }

    /// Extract a context from a question. Never fails: the worst case is an
    /// empty, low-confidence context.
    pub fn extract(&self, question: &str) -> QueryContext {
        let text = Text::new(question);
        let language = detect_language(question);

        let filters = self.extract_filters(question);
        let filter_values: BTreeSet<String> = filters.iter().map(|f| f.value.to_lowercase()).collect();

        let mut entities = BTreeSet::new();
        let mut attributes = BTreeSet::new();
        let mut operations = BTreeSet::new();
        let mut aggregations = BTreeSet::new();
        let mut temporal = Vec::new();

        for vocab in &self.vocabularies {
            entities.extend(vocab.entities.iter().filter(|k| text.has(k)).map(|k| k.to_string()));
            attributes.extend(vocab.attributes.iter().filter(|k| text.has(k)).map(|k| k.to_string()));
            for (op, keywords) in vocab.operations {
                if keywords.iter().any(|k| text.has(k)) {
                    operations.insert(*op);
                }
            }
            for (agg, keywords) in vocab.aggregations {
                if keywords.iter().any(|k| text.has(k)) {
                    aggregations.insert(*agg);
                }
            }
            for k in vocab.temporal.iter().filter(|k| text.has(k)) {
                push_unique(&mut temporal, k.to_string());
            }
        }

        self.structural_mentions(&text, &filter_values, &mut entities, &mut attributes);

        for cap in QUOTED.captures_iter(question) {
            if let Some(m) = cap.get(1).or_else(|| cap.get(2)).or_else(|| cap.get(3)) {
                let quoted = m.as_str().trim().to_lowercase();
                if !quoted.is_empty() && !filter_values.contains(&quoted) {
                    entities.insert(quoted);
                }
            }
        }

        for m in ISO_DATE.find_iter(question).chain(DAYS_AGO.find_iter(question)).chain(LAST_N_DAYS.find_iter(question)) {
            push_unique(&mut temporal, m.as_str().to_lowercase());
        }

        if !filters.is_empty() {
            operations.insert(Operation::Filter);
        }
        if !aggregations.is_empty() {
            operations.insert(Operation::Aggregate);
        }
        if operations.is_empty() && !entities.is_empty() {
            operations.insert(Operation::Select);
        }

        let business_intent = self.classify_intent(&text);
        let confidence = if question.trim().is_empty() {
            0.0
        } else {
            self.score(entities.len(), attributes.len(), operations.len())
        };

        let context = QueryContext {
            question: question.to_string(),
            language,
            entities_mentioned: entities,
            attributes_mentioned: attributes,
            operations,
            filters,
            aggregations,
            temporal_references: temporal,
            business_intent,
            confidence,
        };
        debug!(
            "Extracted context: {} entities, {} attributes, {} filters, confidence {:.2}",
            context.entities_mentioned.len(),
            context.attributes_mentioned.len(),
            context.filters.len(),
            context.confidence
        );
        context
    }

    /// Separator-bearing and pluralized tokens
    fn structural_mentions(
        &self,
        text: &Text,
        filter_values: &BTreeSet<String>,
        entities: &mut BTreeSet<String>,
        attributes: &mut BTreeSet<String>,
    ) {
        let known_attribute = |t: &str| self.vocabularies.iter().any(|v| v.attributes.contains(&t));

        for token in &text.tokens {
            if filter_values.contains(token) || token.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-') {
                continue;
            }
            if let Some((table, column)) = token.split_once('.') {
                if !table.is_empty() && !column.is_empty() {
                    entities.insert(table.to_string());
                    attributes.insert(column.to_string());
                }
                continue;
            }
            if token.contains('_') {
                let is_column = ["_id", "_at", "_date", "_name", "_count", "_amount", "_code", "_type"]
                    .iter()
                    .any(|suffix| token.ends_with(suffix));
                if is_column {
                    attributes.insert(token.clone());
                } else {
                    entities.insert(token.clone());
                }
                continue;
            }
            let plural = token.len() > 3
                && token.ends_with('s')
                && !token.ends_with("ss")
                && token.chars().all(|c| c.is_ascii_alphabetic())
                && !NOT_PLURAL.contains(&token.as_str())
                && !STOP_WORDS.contains(&token.as_str())
                && !known_attribute(token);
            if plural {
                entities.insert(token.clone());
            }
        }
    }

    fn extract_filters(&self, question: &str) -> Vec<Filter> {
        let mut filters = Vec::new();
        let today = self.reference_date.unwrap_or_else(|| Local::now().date_naive());

        // Relative and absolute date comparisons
        for cap in DATE_FILTER.captures_iter(question) {
            let operator = match cap[2].to_lowercase().as_str() {
                "after" => ">",
                "since" | "from" => ">=",
                "before" | "until" => "<",
                _ => "=",
            };
            if let Some(value) = resolve_date(&cap[3], today) {
                filters.push(Filter {
                    kind: FilterKind::Date,
                    operator: operator.to_string(),
                    field: cap.get(1).map(|m| m.as_str().to_lowercase()),
                    value,
                });
            }
        }
        for cap in LAST_N_DAYS.captures_iter(question) {
            if let Some(since) = cap[1].parse::<u64>().ok().and_then(|days| days_before(today, days)) {
                filters.push(Filter {
                    kind: FilterKind::Date,
                    operator: ">=".to_string(),
                    field: None,
                    value: since.format("%Y-%m-%d").to_string(),
                });
            }
        }

        // Numeric comparisons
        for cap in NUMERIC_FILTER.captures_iter(question) {
            let field = cap
                .get(1)
                .map(|m| m.as_str().to_lowercase())
                .filter(|f| !STOP_WORDS.contains(&f.as_str()) && !matches!(f.as_str(), "is" | "are" | "of"));
            filters.push(Filter {
                kind: FilterKind::Numeric,
                operator: cap[2].to_lowercase(),
                field,
                value: cap[3].to_string(),
            });
        }
        for cap in NUMERIC_FILTER_ZH.captures_iter(question) {
            let operator = match &cap[1] {
                "大于" | "超过" | "多于" => "greater",
                "小于" | "少于" | "低于" => "less",
                _ => "equal",
            };
            filters.push(Filter {
                kind: FilterKind::Numeric,
                operator: operator.to_string(),
                field: None,
                value: cap[2].to_string(),
            });
        }

        // Equality assignments
        let mut text_filter = |field: &str, value: &str| {
            let field = field.to_lowercase();
            if value.is_empty() || STOP_WORDS.contains(&field.as_str()) {
                return;
            }
            let filter = Filter {
                kind: FilterKind::Text,
                operator: "=".to_string(),
                field: Some(field),
                value: value.to_string(),
            };
            if !filters.contains(&filter) {
                filters.push(filter);
            }
        };
        for cap in EQUALITY_FILTER.captures_iter(question) {
            let value = cap.get(2).or_else(|| cap.get(3)).or_else(|| cap.get(4)).map(|m| m.as_str()).unwrap_or("");
            text_filter(&cap[1], value);
        }
        for cap in QUOTED_IS_FILTER.captures_iter(question) {
            let value = cap.get(2).or_else(|| cap.get(3)).map(|m| m.as_str()).unwrap_or("");
            text_filter(&cap[1], value);
        }
        for cap in WHERE_IS_FILTER.captures_iter(question) {
            text_filter(&cap[1], &cap[2]);
        }

        // "from China", "in New York": a place with no named column
        for cap in LOCATION_FILTER.captures_iter(question) {
            let place = cap[1].trim();
            if NOT_PLACES.contains(&place) || place.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let lower = place.to_lowercase();
            let names_entity = self.vocabularies.iter().any(|v| v.entities.contains(&lower.as_str()));
            if !names_entity && !filters.iter().any(|f| f.value.eq_ignore_ascii_case(place)) {
                filters.push(Filter {
                    kind: FilterKind::Text,
                    operator: "=".to_string(),
                    field: None,
                    value: place.to_string(),
                });
            }
        }

        filters
    }

    fn classify_intent(&self, text: &Text) -> BusinessIntent {
        const ORDER: [BusinessIntent; 5] = [
            BusinessIntent::Reporting,
            BusinessIntent::Analytics,
            BusinessIntent::Lookup,
            BusinessIntent::Monitoring,
            BusinessIntent::Optimization,
        ];
        for intent in ORDER {
            let hit = self.vocabularies.iter().any(|vocab| {
                vocab
                    .intents
                    .iter()
                    .filter(|(i, _)| *i == intent)
                    .any(|(_, keywords)| keywords.iter().any(|k| text.has(k)))
            });
            if hit {
                return intent;
            }
        }
        BusinessIntent::General
    }

    fn score(&self, entities: usize, attributes: usize, operations: usize) -> f64 {
        let w = &self.weights;
        let score = w.context_base
            + w.context_entities * (entities as f64 / 3.0).min(1.0)
            + w.context_attributes * (attributes as f64 / 5.0).min(1.0)
            + w.context_operations * (operations as f64 / 3.0).min(1.0);
        score.clamp(0.0, 1.0)
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Share of CJK characters among letters decides the question language
pub fn detect_language(question: &str) -> Language {
    let mut letters = 0usize;
    let mut cjk = 0usize;
    for c in question.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        if matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF) {
            cjk += 1;
        }
    }
    if letters > 0 && cjk as f64 / letters as f64 > 0.3 {
        Language::Chinese
    } else {
        Language::English
    }
}

/// `None` when the offset falls outside the representable calendar
fn days_before(today: NaiveDate, days: u64) -> Option<NaiveDate> {
    today.checked_sub_days(Days::new(days))
}

/// Resolve a date expression to an ISO date against `today`
fn resolve_date(expr: &str, today: NaiveDate) -> Option<String> {
    let expr = expr.trim().to_lowercase();
    let expr: String = expr.split_whitespace().collect::<Vec<_>>().join(" ");
    let date = match expr.as_str() {
        "today" => today,
        "yesterday" => days_before(today, 1)?,
        "last week" => days_before(today, 7)?,
        "last month" => days_before(today, 30)?,
        "last quarter" => days_before(today, 90)?,
        "last year" => days_before(today, 365)?,
        "this week" => days_before(today, today.weekday().num_days_from_monday() as u64)?,
        "this month" => NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?,
        "this quarter" => NaiveDate::from_ymd_opt(today.year(), (today.month0() / 3) * 3 + 1, 1)?,
        "this year" => NaiveDate::from_ymd_opt(today.year(), 1, 1)?,
        other => {
            if let Some(days) = other.strip_suffix(" days ago").or_else(|| other.strip_suffix(" day ago")) {
                days_before(today, days.trim().parse::<u64>().ok()?)?
            } else {
                NaiveDate::parse_from_str(other, "%Y-%m-%d").ok()?
            }
        }
    };
    Some(date.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ContextExtractor {
        ContextExtractor::default().with_reference_date(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap())
    }

    #[test]
    fn test_location_filter_and_entities() {
        let ctx = extractor().extract("Show customers from China");
        assert!(ctx.entities_mentioned.contains("customers"));
        assert!(ctx.operations.contains(&Operation::Select));
        assert!(ctx.operations.contains(&Operation::Filter));
        assert_eq!(ctx.business_intent, BusinessIntent::Lookup);
        assert_eq!(
            ctx.filters,
            vec![Filter { kind: FilterKind::Text, operator: "=".to_string(), field: None, value: "China".to_string() }]
        );
        assert!(!ctx.entities_mentioned.contains("china"));
    }

    #[test]
    fn test_vague_question_is_degraded() {
        let ctx = extractor().extract("show me stuff");
        assert!(ctx.entities_mentioned.is_empty());
        assert!(ctx.confidence < 0.5);
        assert!(ctx.is_degraded());
    }

    #[test]
    fn test_numeric_filter_and_aggregation() {
        let ctx = extractor().extract("What is the total amount of orders with amount greater than 100 by status?");
        let numeric: Vec<_> = ctx.filters.iter().filter(|f| f.kind == FilterKind::Numeric).collect();
        assert_eq!(numeric.len(), 1);
        assert_eq!(numeric[0].operator, "greater than");
        assert_eq!(numeric[0].field.as_deref(), Some("amount"));
        assert_eq!(numeric[0].value, "100");
        assert!(ctx.aggregations.contains(&AggregationKind::Sum));
        assert!(ctx.operations.contains(&Operation::Group));
        assert!(ctx.attributes_mentioned.contains("amount"));
        assert!(ctx.attributes_mentioned.contains("status"));
    }

    #[test]
    fn test_relative_dates_resolve_against_reference() {
        let ctx = extractor().extract("orders placed since yesterday and in the last 30 days");
        let dates: Vec<_> = ctx.filters.iter().filter(|f| f.kind == FilterKind::Date).map(|f| f.value.as_str()).collect();
        assert_eq!(dates, vec!["2024-06-14", "2024-05-16"]);
        assert!(ctx.temporal_references.contains(&"yesterday".to_string()));
    }

    #[test]
    fn test_out_of_range_day_counts_are_skipped() {
        let ctx = extractor().extract("orders from 99999999999 days ago");
        assert!(ctx.filters.iter().all(|f| f.kind != FilterKind::Date));

        let ctx = extractor().extract("orders in the last 999999999999999 days");
        assert!(ctx.filters.iter().all(|f| f.kind != FilterKind::Date));

        let ctx = extractor().extract("orders from 3 days ago");
        assert!(ctx.filters.iter().any(|f| f.kind == FilterKind::Date && f.value == "2024-06-12"));
    }

    #[test]
    fn test_equality_assignment() {
        let ctx = extractor().extract("list orders where status = 'shipped'");
        assert!(ctx.filters.contains(&Filter {
            kind: FilterKind::Text,
            operator: "=".to_string(),
            field: Some("status".to_string()),
            value: "shipped".to_string(),
        }));
    }

    #[test]
    fn test_chinese_question() {
        let ctx = extractor().extract("统计每个国家的客户数量");
        assert_eq!(ctx.language, Language::Chinese);
        assert!(ctx.entities_mentioned.contains("客户"));
        assert!(ctx.aggregations.contains(&AggregationKind::Count));
        assert!(ctx.operations.contains(&Operation::Group));
    }

    #[test]
    fn test_structural_tokens() {
        let ctx = extractor().extract("sum orders.amount for customer_segments");
        assert!(ctx.entities_mentioned.contains("orders"));
        assert!(ctx.attributes_mentioned.contains("amount"));
        assert!(ctx.entities_mentioned.contains("customer_segments"));
    }

    #[test]
    fn test_confidence_bounds() {
        for q in ["", "   ", "customers orders products users employees sales name email price amount status count sort by"] {
            let ctx = extractor().extract(q);
            assert!((0.0..=1.0).contains(&ctx.confidence));
        }
        assert_eq!(extractor().extract("").confidence, 0.0);
    }
}
