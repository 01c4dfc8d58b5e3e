//! Request-wrapper stats singleton (C11, §4.11).
//!
//! A process-wide component, but — per spec §9's "global mutable state
//! in tests" design note — constructed explicitly and passed down
//! through `AppState` rather than reached via a `static`, so tests can
//! observe a private instance without cross-test interference. Modeled
//! after the teacher's `Metrics` (`hls-vod-server/src/metrics.rs`):
//! `dashmap`-backed counters behind `parking_lot`, exposed read-only as
//! JSON rather than a Prometheus exporter (§C of SPEC_FULL.md).

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
struct Entry {
    success_count: u64,
    total_latency_ms: u64,
    max_latency_ms: u64,
    failures: HashMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct EntrySnapshot {
    pub success_count: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub failures: HashMap<String, u64>,
}

/// Per-(session, request-name) stats, keyed the way the teacher keys
/// its per-endpoint request counters, just narrowed to a session scope.
#[derive(Debug, Default)]
pub struct Stats {
    entries: DashMap<(String, String), Mutex<Entry>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, session: &str, request_name: &str, latency: Duration) {
        let key = (session.to_string(), request_name.to_string());
        let entry = self.entries.entry(key).or_default();
        let mut guard = entry.lock();
        let ms = latency.as_millis() as u64;
        guard.success_count += 1;
        guard.total_latency_ms += ms;
        guard.max_latency_ms = guard.max_latency_ms.max(ms);
    }

    pub fn record_failure(&self, session: &str, request_name: &str, error_kind: &str) {
        let key = (session.to_string(), request_name.to_string());
        let entry = self.entries.entry(key).or_default();
        let mut guard = entry.lock();
        *guard.failures.entry(error_kind.to_string()).or_insert(0) += 1;
    }

    /// Snapshot the full table as `{session}/{request_name} -> stats`,
    /// suitable for the `/eos/v1/stats` debug endpoint.
    pub fn snapshot(&self) -> HashMap<String, EntrySnapshot> {
        self.entries
            .iter()
            .map(|kv| {
                let (session, name) = kv.key();
                let e = kv.value().lock();
                let avg = if e.success_count > 0 {
                    e.total_latency_ms as f64 / e.success_count as f64
                } else {
                    0.0
                };
                (
                    format!("{session}/{name}"),
                    EntrySnapshot {
                        success_count: e.success_count,
                        avg_latency_ms: avg,
                        max_latency_ms: e.max_latency_ms,
                        failures: e.failures.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_computes_average() {
        let stats = Stats::new();
        stats.record_success("s1", "origin_fetch", Duration::from_millis(100));
        stats.record_success("s1", "origin_fetch", Duration::from_millis(300));
        let snap = stats.snapshot();
        let entry = &snap["s1/origin_fetch"];
        assert_eq!(entry.success_count, 2);
        assert_eq!(entry.avg_latency_ms, 200.0);
        assert_eq!(entry.max_latency_ms, 300);
    }

    #[test]
    fn records_failures_by_kind() {
        let stats = Stats::new();
        stats.record_failure("s1", "origin_fetch", "timeout");
        stats.record_failure("s1", "origin_fetch", "timeout");
        stats.record_failure("s1", "origin_fetch", "connection_refused");
        let snap = stats.snapshot();
        let entry = &snap["s1/origin_fetch"];
        assert_eq!(entry.failures["timeout"], 2);
        assert_eq!(entry.failures["connection_refused"], 1);
    }

    #[test]
    fn separate_instances_do_not_share_state() {
        let a = Stats::new();
        let b = Stats::new();
        a.record_success("s", "r", Duration::from_millis(1));
        assert!(b.snapshot().is_empty());
    }
}
