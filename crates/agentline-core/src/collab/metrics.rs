//! Per-account query timing kept in memory

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use super::MetricsSink;

/// Recent durations kept per account for percentiles
const MAX_RECORDS_PER_RESOURCE: usize = 100;

/// Lifetime totals plus a window of recent durations for one account
#[derive(Default)]
struct ResourceTimes {
    count: u64,
    total: Duration,
    max: Duration,
    recent: VecDeque<Duration>,
}

pub struct InMemoryMetrics {
    query_times: DashMap<String, ResourceTimes>,
    started: Instant,
}

/// Counts, mean and max cover every recorded query. Percentiles cover the
/// recent window of each account.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub total_resources: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p90_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ms: Option<u64>,
    pub uptime_secs: u64,
}

impl Default for InMemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self {
            query_times: DashMap::new(),
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut count = 0u64;
        let mut total = Duration::ZERO;
        let mut max = Duration::ZERO;
        let mut recent: Vec<u64> = Vec::new();
        for entry in self.query_times.iter() {
            let times = entry.value();
            count += times.count;
            total += times.total;
            max = max.max(times.max);
            recent.extend(times.recent.iter().map(|d| d.as_millis() as u64));
        }
        recent.sort_unstable();

        let window = recent.len();
        let percentile = |p: f64| {
            let at = ((window as f64 * p) as usize).min(window.saturating_sub(1));
            recent.get(at).copied()
        };

        MetricsSnapshot {
            total_queries: count,
            total_resources: self.query_times.len(),
            avg_ms: (count > 0).then(|| total.as_millis() as u64 / count),
            p50_ms: percentile(0.5),
            p90_ms: percentile(0.9),
            max_ms: (count > 0).then(|| max.as_millis() as u64),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_query(&self, resource_id: &str, duration: Duration) {
        let mut times = self.query_times.entry(resource_id.to_string()).or_default();
        times.count += 1;
        times.total += duration;
        times.max = times.max.max(duration);
        times.recent.push_back(duration);
        if times.recent.len() > MAX_RECORDS_PER_RESOURCE {
            times.recent.pop_front();
        }
        tracing::debug!(
            "Query timing for {}: {}ms ({} recorded)",
            resource_id,
            duration.as_millis(),
            times.count
        );
    }
}
