//! Per-key hit/miss counters. Advisory only: nothing here feeds back into
//! cache decisions.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyCounters {
    pub hits: u64,
    pub misses: u64,
    pub last_access: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub total_requests: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    /// Keyed by the displayed cache key, sorted.
    pub per_key: BTreeMap<String, KeyCounters>,
}

#[derive(Debug, Default)]
pub struct PerformanceLedger {
    counters: HashMap<CacheKey, KeyCounters>,
}

impl PerformanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_access(&mut self, key: &CacheKey, hit: bool, now: DateTime<Utc>) {
        let counters = self.counters.entry(key.clone()).or_insert(KeyCounters {
            hits: 0,
            misses: 0,
            last_access: now,
        });
        if hit {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        counters.last_access = now;
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let (hits, misses) = self
            .counters
            .values()
            .fold((0u64, 0u64), |(h, m), c| (h + c.hits, m + c.misses));
        let total_requests = hits + misses;
        let (hit_rate, miss_rate) = if total_requests == 0 {
            (0.0, 0.0)
        } else {
            (
                hits as f64 / total_requests as f64,
                misses as f64 / total_requests as f64,
            )
        };

        PerformanceSnapshot {
            total_requests,
            hit_rate,
            miss_rate,
            per_key: self
                .counters
                .iter()
                .map(|(key, counters)| (key.to_string(), *counters))
                .collect(),
        }
    }

    pub fn reset(&mut self) {
        self.counters.clear();
    }
}
