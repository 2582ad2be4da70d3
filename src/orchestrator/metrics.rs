use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct Metrics {
    success_counts: HashMap<String, u64>,
    failure_counts: HashMap<String, u64>,
    retries: u64,
    escalations: u64,
    cache_hits: u64,
}

/// Point-in-time copy of the counters, sorted by recognizer name
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub recognizers: BTreeMap<String, RecognizerStats>,
    pub retries: u64,
    pub escalations: u64,
    pub cache_hits: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RecognizerStats {
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f32,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, recognizer: &str) {
        *self
            .success_counts
            .entry(recognizer.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_failure(&mut self, recognizer: &str) {
        *self
            .failure_counts
            .entry(recognizer.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn record_escalation(&mut self) {
        self.escalations += 1;
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn get_success_count(&self, recognizer: &str) -> u64 {
        *self.success_counts.get(recognizer).unwrap_or(&0)
    }

    pub fn get_failure_count(&self, recognizer: &str) -> u64 {
        *self.failure_counts.get(recognizer).unwrap_or(&0)
    }

    pub fn get_success_rate(&self, recognizer: &str) -> f32 {
        let success = self.get_success_count(recognizer) as f32;
        let total = success + self.get_failure_count(recognizer) as f32;

        if total == 0.0 {
            0.0
        } else {
            success / total
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let recognizers = self
            .success_counts
            .keys()
            .chain(self.failure_counts.keys())
            .map(|name| {
                let stats = RecognizerStats {
                    successes: self.get_success_count(name),
                    failures: self.get_failure_count(name),
                    success_rate: self.get_success_rate(name),
                };
                (name.clone(), stats)
            })
            .collect();

        MetricsSnapshot {
            recognizers,
            retries: self.retries,
            escalations: self.escalations,
            cache_hits: self.cache_hits,
        }
    }
}
