use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::create_timestamp;
use crate::engine::{ExecutionObserver, ExecutionResult, ExecutionStatus};
use crate::error::EngineError;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub since: String,
    pub total_executions: u64,
    pub successful_executions: u64,
    /// Percentage of executions that ended in `Success`
    pub success_rate: f64,
    pub average_duration_millis: f64,
    pub by_status: BTreeMap<String, u64>,
    pub language_usage: BTreeMap<String, u64>,
    pub rejections: BTreeMap<String, u64>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    total_duration_millis: u64,
    by_status: BTreeMap<ExecutionStatus, u64>,
    language_usage: BTreeMap<String, u64>,
    rejections: BTreeMap<&'static str, u64>,
}

/// Process-lifetime execution counters
pub struct ExecutionStats {
    since: String,
    counters: Mutex<Counters>,
}

impl Default for ExecutionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self {
            since: create_timestamp(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters.lock();
        let successful = counters
            .by_status
            .get(&ExecutionStatus::Success)
            .copied()
            .unwrap_or(0);
        let ratio = |part: u64| {
            if counters.total == 0 {
                0.0
            } else {
                part as f64 / counters.total as f64
            }
        };

        StatsSnapshot {
            since: self.since.clone(),
            total_executions: counters.total,
            successful_executions: successful,
            success_rate: ratio(successful) * 100.0,
            average_duration_millis: ratio(counters.total_duration_millis),
            by_status: counters
                .by_status
                .iter()
                .map(|(status, n)| (status.as_str().to_string(), *n))
                .collect(),
            language_usage: counters.language_usage.clone(),
            rejections: counters
                .rejections
                .iter()
                .map(|(reason, n)| (reason.to_string(), *n))
                .collect(),
        }
    }
}

impl ExecutionObserver for ExecutionStats {
    fn on_completed(&self, language: &str, result: &ExecutionResult) {
        let mut counters = self.counters.lock();
        counters.total += 1;
        counters.total_duration_millis += result.duration_millis;
        *counters.by_status.entry(result.status).or_default() += 1;
        *counters
            .language_usage
            .entry(language.to_string())
            .or_default() += 1;
    }

    fn on_rejected(&self, _language: &str, error: &EngineError) {
        *self.counters.lock().rejections.entry(error.reason()).or_default() += 1;
    }
}
