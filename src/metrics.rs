//! Engine metrics.
//!
//! Each `Database` owns one `Metrics`, shared with its background worker.
//! Counters and gauges are plain atomics; latency histograms keep a bounded
//! reservoir of samples.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Metrics {
    // Writes
    pub writes_total: Counter,
    pub writes_bytes: Counter,
    pub batches_total: Counter,

    // Reads
    pub reads_total: Counter,
    pub reads_hits: Counter,
    pub reads_misses: Counter,
    pub scans_total: Counter,

    // Flushes
    pub flushes_total: Counter,
    pub flush_bytes: Counter,
    pub flush_duration: Histogram,

    // Compactions
    pub compactions_total: Counter,
    pub trivial_moves: Counter,
    pub compaction_bytes_in: Counter,
    pub compaction_bytes_out: Counter,
    pub compaction_duration: Histogram,
    pub tombstones_dropped: Counter,

    // Bloom filter: hits are "may contain", misses are definite rejections.
    pub bloom_filter_hits: Counter,
    pub bloom_filter_misses: Counter,
    pub bloom_filter_false_positives: Counter,

    pub background_errors: Counter,

    pub write_latency: Histogram,
    pub read_latency: Histogram,

    // State
    pub memtable_size_bytes: Gauge,
    pub memtable_entries: Gauge,
    pub immutable_count: Gauge,
    pub sstable_count: Gauge,
    pub disk_usage_bytes: Gauge,
    pub wal_size_bytes: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            writes_total: Counter::new(),
            writes_bytes: Counter::new(),
            batches_total: Counter::new(),
            reads_total: Counter::new(),
            reads_hits: Counter::new(),
            reads_misses: Counter::new(),
            scans_total: Counter::new(),
            flushes_total: Counter::new(),
            flush_bytes: Counter::new(),
            flush_duration: Histogram::new(),
            compactions_total: Counter::new(),
            trivial_moves: Counter::new(),
            compaction_bytes_in: Counter::new(),
            compaction_bytes_out: Counter::new(),
            compaction_duration: Histogram::new(),
            tombstones_dropped: Counter::new(),

            bloom_filter_hits: Counter::new(),
            bloom_filter_misses: Counter::new(),
            bloom_filter_false_positives: Counter::new(),

            background_errors: Counter::new(),

            write_latency: Histogram::new(),
            read_latency: Histogram::new(),

            memtable_size_bytes: Gauge::new(),
            memtable_entries: Gauge::new(),
            immutable_count: Gauge::new(),
            sstable_count: Gauge::new(),
            disk_usage_bytes: Gauge::new(),
            wal_size_bytes: Gauge::new(),
        }
    }

    /// Read hit rate (0.0 to 1.0)
    pub fn read_hit_rate(&self) -> f64 {
        let total = self.reads_total.get();
        if total == 0 {
            return 0.0;
        }
        self.reads_hits.get() as f64 / total as f64
    }

    /// Share of table probes the bloom filter answered without a block read.
    pub fn bloom_filter_rejection_rate(&self) -> f64 {
        let misses = self.bloom_filter_misses.get();
        let total = misses + self.bloom_filter_hits.get();
        if total == 0 {
            return 0.0;
        }
        misses as f64 / total as f64
    }

    /// False positives among probes the filter let through.
    pub fn bloom_filter_fp_rate(&self) -> f64 {
        let hits = self.bloom_filter_hits.get();
        if hits == 0 {
            return 0.0;
        }
        self.bloom_filter_false_positives.get() as f64 / hits as f64
    }

    /// Compaction space savings (0.0 to 1.0)
    pub fn compaction_space_savings(&self) -> f64 {
        let bytes_in = self.compaction_bytes_in.get();
        if bytes_in == 0 {
            return 0.0;
        }
        1.0 - (self.compaction_bytes_out.get() as f64 / bytes_in as f64)
    }

    /// Bytes written to tables per byte written by the user.
    pub fn write_amplification(&self) -> f64 {
        let logical = self.writes_bytes.get();
        if logical == 0 {
            return 1.0;
        }
        (self.flush_bytes.get() + self.compaction_bytes_out.get()) as f64 / logical as f64
    }

    pub fn summary(&self) -> String {
        format!(
            r#"Storage Engine Metrics
======================

Operations:
  Writes:      {:>12}  ({} KB, {} batches)
  Reads:       {:>12}  (hits: {}, misses: {})
  Scans:       {:>12}
  Flushes:     {:>12}
  Compactions: {:>12}  ({} trivial moves)

Bloom Filter:
  Rejected:    {:>11.2}%
  FP Rate:     {:>11.2}%

Compaction:
  Input:       {:>9} KB
  Output:      {:>9} KB
  Space Saved: {:>11.2}%
  Write Amp:   {:>12.2}x
  Tombstones:  {:>12} dropped
  Errors:      {:>12}

Latency (us):
  Write p50:   {:>12}
  Write p99:   {:>12}
  Read p50:    {:>12}
  Read p99:    {:>12}
  Flush p50:   {:>12}

System State:
  MemTable:    {:>9} KB  ({} entries)
  Immutable:   {:>12}
  SSTables:    {:>12}
  WAL Size:    {:>9} KB
  Disk Usage:  {:>9} KB
"#,
            self.writes_total.get(),
            self.writes_bytes.get() / 1024,
            self.batches_total.get(),
            self.reads_total.get(),
            self.reads_hits.get(),
            self.reads_misses.get(),
            self.scans_total.get(),
            self.flushes_total.get(),
            self.compactions_total.get(),
            self.trivial_moves.get(),
            self.bloom_filter_rejection_rate() * 100.0,
            self.bloom_filter_fp_rate() * 100.0,
            self.compaction_bytes_in.get() / 1024,
            self.compaction_bytes_out.get() / 1024,
            self.compaction_space_savings() * 100.0,
            self.write_amplification(),
            self.tombstones_dropped.get(),
            self.background_errors.get(),
            self.write_latency.percentile(0.5).as_micros(),
            self.write_latency.percentile(0.99).as_micros(),
            self.read_latency.percentile(0.5).as_micros(),
            self.read_latency.percentile(0.99).as_micros(),
            self.flush_duration.percentile(0.5).as_micros(),
            self.memtable_size_bytes.get() / 1024,
            self.memtable_entries.get(),
            self.immutable_count.get(),
            self.sstable_count.get(),
            self.wal_size_bytes.get() / 1024,
            self.disk_usage_bytes.get() / 1024,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomic counter (lock-free)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Last observed value of some engine state.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency histogram over a bounded reservoir of samples.
#[derive(Debug)]
pub struct Histogram {
    samples: RwLock<Vec<Duration>>,
    max_samples: usize,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            samples: RwLock::new(Vec::with_capacity(max_samples.min(1024))),
            max_samples,
        }
    }

    pub fn observe(&self, duration: Duration) {
        let mut samples = self.samples.write();
        if samples.len() < self.max_samples {
            samples.push(duration);
        } else {
            let idx = fastrand::usize(..samples.len());
            samples[idx] = duration;
        }
    }

    /// Record the time elapsed since `start`.
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed());
    }

    /// Get percentile (0.0 to 1.0)
    pub fn percentile(&self, p: f64) -> Duration {
        let mut sorted = self.samples.read().clone();
        if sorted.is_empty() {
            return Duration::ZERO;
        }
        sorted.sort();
        let idx = ((sorted.len() - 1) as f64 * p) as usize;
        sorted[idx]
    }

    pub fn count(&self) -> usize {
        self.samples.read().len()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_histogram_percentiles() {
        let hist = Histogram::new();
        for i in 1..=100 {
            hist.observe(Duration::from_micros(i));
        }
        assert_eq!(hist.count(), 100);

        let p50 = hist.percentile(0.5).as_micros();
        let p99 = hist.percentile(0.99).as_micros();
        assert!((45..=55).contains(&p50));
        assert!((95..=100).contains(&p99));
    }

    #[test]
    fn test_reservoir_is_bounded() {
        let hist = Histogram::with_capacity(10);
        for i in 0..1000 {
            hist.observe(Duration::from_nanos(i));
        }
        assert_eq!(hist.count(), 10);
    }

    #[test]
    fn test_computed_rates() {
        let metrics = Metrics::new();
        metrics.reads_total.add(100);
        metrics.reads_hits.add(80);
        assert_eq!(metrics.read_hit_rate(), 0.8);

        metrics.bloom_filter_misses.add(3);
        metrics.bloom_filter_hits.add(1);
        assert_eq!(metrics.bloom_filter_rejection_rate(), 0.75);

        metrics.compaction_bytes_in.add(1000);
        metrics.compaction_bytes_out.add(300);
        assert!((metrics.compaction_space_savings() - 0.7).abs() < 1e-9);
        assert!(metrics.summary().contains("Compactions"));
    }

    #[test]
    fn test_concurrent_counter() {
        let counter = Arc::new(Counter::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.inc();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 10_000);
    }
}
