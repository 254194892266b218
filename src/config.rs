//! Engine Configuration
//!
//! All tunables of the pipeline: execution bounds, the fallback cascade order,
//! matcher scores and synonyms, confidence weights and business rules.
//! Loaded from JSON with environment overrides.

use crate::error::{NlqError, Result};
use crate::execution::fallback::{CascadeStep, FallbackStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub execution: ExecutionSettings,
    pub matcher: MatcherSettings,
    pub confidence: ConfidenceWeights,
    pub completion: CompletionSettings,

    /// Capacity of the execution history ring buffer
    pub history_capacity: usize,

    /// Max questions answered concurrently by batch processing
    pub batch_concurrency: usize,

    /// Domain label -> default predicates appended by business rule enhancement
    pub business_rules: HashMap<String, Vec<BusinessRule>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionSettings::default(),
            matcher: MatcherSettings::default(),
            confidence: ConfidenceWeights::default(),
            completion: CompletionSettings::default(),
            history_capacity: 1000,
            batch_concurrency: 4,
            business_rules: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Per-attempt timeout enforced by the relational engine
    pub max_execution_time_ms: u64,

    /// Per-attempt row cap
    pub max_rows: usize,

    /// LIMIT injected into generated SQL that has none
    pub default_limit: usize,

    /// LIMIT the adjust-limit fallback shrinks to
    pub fallback_limit: usize,

    /// Treat an empty result set as a soft failure and keep cascading
    pub continue_on_empty: bool,

    /// Ordered fallback cascade tried after the primary attempt
    pub cascade: Vec<CascadeStep>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 30_000,
            max_rows: 10_000,
            default_limit: 100,
            fallback_limit: 10,
            continue_on_empty: false,
            cascade: FallbackStrategy::default_cascade()
                .into_iter()
                .map(CascadeStep::always)
                .collect(),
        }
    }
}

impl ExecutionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }
}

/// One group of interchangeable words, e.g. customers <-> client, buyer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SynonymGroup {
    pub canonical: String,
    pub synonyms: Vec<String>,
}

impl SynonymGroup {
    fn new(canonical: &str, synonyms: &[&str]) -> Self {
        Self {
            canonical: canonical.to_string(),
            synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// All members of the group, canonical first
    pub fn members(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical.as_str()).chain(self.synonyms.iter().map(|s| s.as_str()))
    }

    pub fn contains(&self, word: &str) -> bool {
        self.members().any(|m| m.eq_ignore_ascii_case(word))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherSettings {
    pub exact_score: f64,
    pub partial_score: f64,
    pub fuzzy_score: f64,

    /// Jaro-Winkler threshold for typo-tolerant name matching
    pub fuzzy_threshold: f64,

    pub semantic_top_k: usize,
    pub min_similarity: f64,
    pub direct_query_limit: usize,
    pub max_matches: usize,

    /// Per-strategy timeout; a strategy that exceeds it contributes nothing
    pub strategy_timeout_ms: u64,

    pub synonyms: Vec<SynonymGroup>,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            exact_score: 1.0,
            partial_score: 0.8,
            fuzzy_score: 0.6,
            fuzzy_threshold: 0.88,
            semantic_top_k: 5,
            min_similarity: 0.3,
            direct_query_limit: 10,
            max_matches: 10,
            strategy_timeout_ms: 5_000,
            synonyms: default_synonyms(),
        }
    }
}

fn default_synonyms() -> Vec<SynonymGroup> {
    vec![
        SynonymGroup::new("customers", &["customer", "client", "clients", "buyer", "buyers", "user", "users", "account", "accounts", "客户", "顾客"]),
        SynonymGroup::new("orders", &["order", "purchase", "purchases", "transaction", "transactions", "sale", "sales", "订单"]),
        SynonymGroup::new("products", &["product", "item", "items", "goods", "sku", "merchandise", "产品", "商品"]),
        SynonymGroup::new("employees", &["employee", "staff", "worker", "workers", "personnel", "员工"]),
        SynonymGroup::new("suppliers", &["supplier", "vendor", "vendors", "provider", "providers", "供应商"]),
        SynonymGroup::new("payments", &["payment", "invoice", "invoices", "billing", "charge", "charges", "付款"]),
    ]
}

/// Heuristic weights used by confidence scoring; tunable, not calibrated
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub context_base: f64,
    pub context_entities: f64,
    pub context_attributes: f64,
    pub context_operations: f64,

    pub plan_base: f64,
    pub plan_match: f64,
    pub plan_tables: f64,
    pub plan_columns: f64,

    /// Confidence multiplier applied to alternative plans
    pub alternative_factor: f64,

    /// Multiplier on plan confidence for completion-generated SQL
    pub completion_factor: f64,
    pub completion_cap: f64,

    /// Upper bound on template-generated SQL confidence
    pub template_cap: f64,

    /// Multiplier applied when validation still fails after repair
    pub validation_penalty: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            context_base: 0.3,
            context_entities: 0.3,
            context_attributes: 0.2,
            context_operations: 0.2,
            plan_base: 0.5,
            plan_match: 0.3,
            plan_tables: 0.1,
            plan_columns: 0.1,
            alternative_factor: 0.8,
            completion_factor: 1.1,
            completion_cap: 0.95,
            template_cap: 0.7,
            validation_penalty: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 1000,
            timeout_ms: 30_000,
        }
    }
}

/// Default predicate registered for a domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusinessRule {
    /// Only applied when the SQL reads this table; applied always when absent
    #[serde(default)]
    pub table: Option<String>,
    pub predicate: String,
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| NlqError::Config(format!("Failed to read config {}: {}", path.display(), e)))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| NlqError::Config(format!("Failed to parse config {}: {}", path.display(), e)))?;
        config.check()?;
        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Apply `NLQ_*` environment overrides on top of the current values
    pub fn apply_env(mut self) -> Result<Self> {
        if let Some(v) = env_number::<usize>("NLQ_MAX_ROWS")? {
            self.execution.max_rows = v;
        }
        if let Some(v) = env_number::<usize>("NLQ_DEFAULT_LIMIT")? {
            self.execution.default_limit = v;
        }
        if let Some(v) = env_number::<u64>("NLQ_MAX_EXECUTION_MS")? {
            self.execution.max_execution_time_ms = v;
        }
        if let Some(v) = env_number::<usize>("NLQ_HISTORY_CAPACITY")? {
            self.history_capacity = v;
        }
        if let Some(v) = env_number::<usize>("NLQ_BATCH_CONCURRENCY")? {
            self.batch_concurrency = v;
        }
        self.check()?;
        Ok(self)
    }

    fn check(&self) -> Result<()> {
        if self.execution.default_limit == 0 || self.execution.max_rows == 0 {
            return Err(NlqError::Config("default_limit and max_rows must be positive".to_string()));
        }
        if self.history_capacity == 0 {
            return Err(NlqError::Config("history_capacity must be positive".to_string()));
        }
        if self.batch_concurrency == 0 {
            warn!("batch_concurrency of 0 would stall batches, treating as 1");
        }
        for step in &self.execution.cascade {
            step.compiled_pattern()?;
        }
        Ok(())
    }

    /// Business rules registered for a domain label (case-insensitive)
    pub fn rules_for_domain(&self, domain: &str) -> &[BusinessRule] {
        self.business_rules
            .iter()
            .find(|(label, _)| label.eq_ignore_ascii_case(domain))
            .map(|(_, rules)| rules.as_slice())
            .unwrap_or(&[])
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| NlqError::Config(format!("{} must be a number, got '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
