//! Execution History
//!
//! Bounded ring buffer of answered questions, used for confidence
//! calibration and insights. The only mutable state shared across calls:
//! appends go through a mutex, insights read a snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Failure messages reported by insights
const TOP_FAILURES: usize = 5;

/// Records needed before a trend is reported
const MIN_TREND_RECORDS: usize = 4;

/// Success-rate delta between halves that counts as a trend
const TREND_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistoryRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub question: String,
    pub sql: String,
    pub confidence: f64,
    pub success: bool,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

impl ExecutionHistoryRecord {
    pub fn new(
        question: &str,
        sql: &str,
        confidence: f64,
        success: bool,
        execution_time_ms: u64,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            question: question.to_string(),
            sql: sql.to_string(),
            confidence,
            success,
            execution_time_ms,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCount {
    pub message: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStats {
    /// "low", "medium" or "high"
    pub band: String,
    pub total: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInsights {
    pub total_executions: usize,
    pub success_rate: f64,
    pub common_failures: Vec<FailureCount>,
    pub avg_confidence_success: Option<f64>,
    pub avg_confidence_failure: Option<f64>,
    pub confidence_bands: Vec<BandStats>,
    pub avg_execution_time_ms: f64,
    pub trend: Trend,
}

pub struct ExecutionHistory {
    capacity: usize,
    records: Mutex<VecDeque<ExecutionHistoryRecord>>,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A poisoned lock still holds consistent records; appends are single pushes
    fn lock(&self) -> MutexGuard<'_, VecDeque<ExecutionHistoryRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append, evicting the oldest record once full
    pub fn append(&self, record: ExecutionHistoryRecord) {
        let mut records = self.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        debug!("History append: success={} confidence={:.2}", record.success, record.confidence);
        records.push_back(record);
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<ExecutionHistoryRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insights(&self) -> ExecutionInsights {
        summarize(&self.snapshot())
    }
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

fn success_rate(records: &[ExecutionHistoryRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().filter(|r| r.success).count() as f64 / records.len() as f64
}

fn band_of(confidence: f64) -> &'static str {
    if confidence < 0.4 {
        "low"
    } else if confidence < 0.7 {
        "medium"
    } else {
        "high"
    }
}

fn trend_of(records: &[ExecutionHistoryRecord]) -> Trend {
    if records.len() < MIN_TREND_RECORDS {
        return Trend::InsufficientData;
    }
    let (older, newer) = records.split_at(records.len() / 2);
    let delta = success_rate(newer) - success_rate(older);
    if delta > TREND_THRESHOLD {
        Trend::Improving
    } else if delta < -TREND_THRESHOLD {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// Aggregate a snapshot; records are oldest first
pub fn summarize(records: &[ExecutionHistoryRecord]) -> ExecutionInsights {
    let mut failures: HashMap<&str, usize> = HashMap::new();
    for error in records.iter().filter(|r| !r.success).filter_map(|r| r.error.as_deref()) {
        *failures.entry(error).or_insert(0) += 1;
    }
    let mut common_failures: Vec<FailureCount> = failures
        .into_iter()
        .map(|(message, count)| FailureCount {
            message: message.to_string(),
            count,
        })
        .collect();
    common_failures.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    common_failures.truncate(TOP_FAILURES);

    let confidence_bands = ["low", "medium", "high"]
        .iter()
        .filter_map(|band| {
            let members: Vec<ExecutionHistoryRecord> =
                records.iter().filter(|r| band_of(r.confidence) == *band).cloned().collect();
            (!members.is_empty()).then(|| BandStats {
                band: band.to_string(),
                total: members.len(),
                success_rate: success_rate(&members),
            })
        })
        .collect();

    ExecutionInsights {
        total_executions: records.len(),
        success_rate: success_rate(records),
        common_failures,
        avg_confidence_success: average(records.iter().filter(|r| r.success).map(|r| r.confidence)),
        avg_confidence_failure: average(records.iter().filter(|r| !r.success).map(|r| r.confidence)),
        confidence_bands,
        avg_execution_time_ms: average(records.iter().map(|r| r.execution_time_ms as f64)).unwrap_or(0.0),
        trend: trend_of(records),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(confidence: f64, success: bool, error: Option<&str>) -> ExecutionHistoryRecord {
        ExecutionHistoryRecord::new("q", "SELECT 1;", confidence, success, 10, error.map(|e| e.to_string()))
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let history = ExecutionHistory::new(2);
        history.append(record(0.1, false, Some("first")));
        history.append(record(0.5, true, None));
        history.append(record(0.9, true, None));
        let records = history.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].confidence, 0.5);
    }

    #[test]
    fn test_insights() {
        let history = ExecutionHistory::new(100);
        history.append(record(0.2, false, Some("no such table: x")));
        history.append(record(0.3, false, Some("no such table: x")));
        history.append(record(0.5, false, Some("timeout")));
        history.append(record(0.8, true, None));
        history.append(record(0.9, true, None));
        history.append(record(0.75, true, None));

        let insights = history.insights();
        assert_eq!(insights.total_executions, 6);
        assert!((insights.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(insights.common_failures[0].message, "no such table: x");
        assert_eq!(insights.common_failures[0].count, 2);
        assert!(insights.avg_confidence_success.unwrap() > insights.avg_confidence_failure.unwrap());
        assert_eq!(insights.confidence_bands.len(), 3);
        assert_eq!(insights.confidence_bands[2].success_rate, 1.0);
        assert_eq!(insights.avg_execution_time_ms, 10.0);
        assert_eq!(insights.trend, Trend::Improving);
    }

    #[test]
    fn test_empty_history() {
        let insights = ExecutionHistory::new(10).insights();
        assert_eq!(insights.total_executions, 0);
        assert_eq!(insights.success_rate, 0.0);
        assert!(insights.avg_confidence_success.is_none());
        assert_eq!(insights.trend, Trend::InsufficientData);
    }
}
