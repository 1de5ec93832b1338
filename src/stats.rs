//! Stats: process-wide counters, rates derived from those counters over a
//! sliding window, and timing histograms; a read-only JSON snapshot.
//!
//! Counters are plain atomics so they are safe to update concurrently
//! without locks. Alongside the JSON snapshot, the player also emits
//! `metrics` crate counters/histograms for the same underlying values.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// A cumulative counter plus a bounded history of `(elapsed, count)` samples
/// used to derive a rate (default: 15 samples of 60s each).
struct RateCounter {
    counter: AtomicU64,
    history: Mutex<VecDeque<(Instant, u64)>>,
    depth: usize,
}

impl RateCounter {
    fn new(depth: usize) -> Self {
        let now = Instant::now();
        let mut history = VecDeque::with_capacity(depth.max(1));
        history.push_back((now, 0));
        RateCounter {
            counter: AtomicU64::new(0),
            history: Mutex::new(history),
            depth: depth.max(1),
        }
    }

    fn add(&self, delta: u64) {
        self.counter.fetch_add(delta, Ordering::Relaxed);
    }

    fn value(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Record the current cumulative value as a new sample, trimming the
    /// history to `depth` entries. Called periodically by the sampler task.
    fn sample(&self) {
        let mut history = self.history.lock().expect("rate history mutex poisoned");
        history.push_back((Instant::now(), self.value()));
        while history.len() > self.depth {
            history.pop_front();
        }
    }

    fn per_second(&self) -> f64 {
        let history = self.history.lock().expect("rate history mutex poisoned");
        let (Some(&(oldest_t, oldest_v)), Some(&(newest_t, newest_v))) = (history.front(), history.back()) else {
            return 0.0;
        };
        let elapsed = newest_t.duration_since(oldest_t).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (newest_v.saturating_sub(oldest_v)) as f64 / elapsed
    }
}

/// A simple exponential-bucket timing histogram: total count, total elapsed
/// time, and per-bucket counts at power-of-ten boundaries.
struct Histogram {
    count: AtomicU64,
    total_nanos: AtomicU64,
    buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
}

const BUCKET_BOUNDS_MS: [u64; 6] = [1, 10, 100, 1_000, 10_000, 100_000];

impl Histogram {
    fn new() -> Self {
        Histogram {
            count: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            buckets: Default::default(),
        }
    }

    fn record(&self, d: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
        let ms = d.as_millis() as u64;
        let idx = BUCKET_BOUNDS_MS.iter().position(|&bound| ms <= bound).unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_time_ns: self.total_nanos.load(Ordering::Relaxed),
            buckets: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub total_time_ns: u64,
    pub buckets: Vec<u64>,
}

pub struct Stats {
    txn_count: RateCounter,
    query_count: RateCounter,
    txn_time: Histogram,
    query_time: Histogram,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub txn_count: u64,
    pub query_count: u64,
    pub queries_per_sec: f64,
    pub txn_per_sec: f64,
    pub txn_time: HistogramSnapshot,
    pub query_time: HistogramSnapshot,
}

impl Stats {
    pub fn new(rate_window_samples: usize) -> Self {
        Stats {
            txn_count: RateCounter::new(rate_window_samples),
            query_count: RateCounter::new(rate_window_samples),
            txn_time: Histogram::new(),
            query_time: Histogram::new(),
        }
    }

    pub fn add_txns(&self, n: u64) {
        self.txn_count.add(n);
        metrics::counter!("blp_txn_count", n);
    }

    pub fn add_queries(&self, n: u64) {
        self.query_count.add(n);
        metrics::counter!("blp_query_count", n);
    }

    pub fn record_txn(&self, d: Duration) {
        self.txn_time.record(d);
        metrics::histogram!("blp_txn_time_seconds", d.as_secs_f64());
    }

    pub fn record_query(&self, d: Duration) {
        self.query_time.record(d);
        metrics::histogram!("blp_query_time_seconds", d.as_secs_f64());
    }

    /// Called periodically (e.g. every 60s) to roll the rate windows forward.
    pub fn tick(&self) {
        self.txn_count.sample();
        self.query_count.sample();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            txn_count: self.txn_count.value(),
            query_count: self.query_count.value(),
            queries_per_sec: self.query_count.per_second(),
            txn_per_sec: self.txn_count.per_second(),
            txn_time: self.txn_time.snapshot(),
            query_time: self.query_time.snapshot(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).expect("StatsSnapshot always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new(15);
        stats.add_txns(2);
        stats.add_queries(3);
        stats.record_txn(Duration::from_millis(5));
        let snap = stats.snapshot();
        assert_eq!(snap.txn_count, 2);
        assert_eq!(snap.query_count, 3);
        assert_eq!(snap.txn_time.count, 1);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let stats = Stats::new(15);
        stats.add_txns(1);
        let json = stats.to_json();
        assert_eq!(json["txn_count"], 1);
    }
}
