//! Per-node runtime statistics.
//!
//! Each metric keeps Welford-online moments plus a fixed-bucket histogram.
//! The first `warmup` samples feed min/max and the histogram range but are
//! excluded from the moments. Bucket increments are atomic so the read and
//! write side hooks can update one shared struct without locking each other
//! out of the hot path.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Observable quantities, one histogram each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// One-way delay between origin and received timestamps.
    Owd,
    /// Wall-clock gap between receive times of consecutive samples.
    GapReceived,
    /// Origin-timestamp gap between consecutive samples.
    GapSample,
    /// Sequence distance of reordered samples.
    Reordered,
    /// Age of a sample when it is written out.
    Age,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Owd,
        Metric::GapReceived,
        Metric::GapSample,
        Metric::Reordered,
        Metric::Age,
    ];

    pub fn from_str(s: &str) -> Result<Metric> {
        match s {
            "owd" => Ok(Metric::Owd),
            "gap_received" => Ok(Metric::GapReceived),
            "gap_sample" => Ok(Metric::GapSample),
            "reordered" => Ok(Metric::Reordered),
            "age" => Ok(Metric::Age),
            _ => Err(Error::config(format!("unknown stats metric '{}'", s))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Owd => "owd",
            Metric::GapReceived => "gap_received",
            Metric::GapSample => "gap_sample",
            Metric::Reordered => "reordered",
            Metric::Age => "age",
        }
    }

    fn index(self) -> usize {
        match self {
            Metric::Owd => 0,
            Metric::GapReceived => 1,
            Metric::GapSample => 2,
            Metric::Reordered => 3,
            Metric::Age => 4,
        }
    }
}

/// Aggregate selectors usable from mapping entries
/// (`node.stats.owd.mean` and friends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Last,
    Highest,
    Lowest,
    Mean,
    Var,
    Stddev,
    Total,
}

impl Aggregate {
    pub fn from_str(s: &str) -> Result<Aggregate> {
        match s {
            "last" => Ok(Aggregate::Last),
            "highest" => Ok(Aggregate::Highest),
            "lowest" => Ok(Aggregate::Lowest),
            "mean" => Ok(Aggregate::Mean),
            "var" => Ok(Aggregate::Var),
            "stddev" => Ok(Aggregate::Stddev),
            "total" => Ok(Aggregate::Total),
            _ => Err(Error::config(format!("unknown stats aggregate '{}'", s))),
        }
    }
}

#[derive(Debug, Default)]
struct Moments {
    /// Total updates, warmup included.
    total: u64,
    /// Updates that entered the moments.
    count: u64,
    mean: f64,
    m2: f64,
    last: f64,
    min: f64,
    max: f64,
    /// Values seen so far during warmup; drives the histogram range.
    remaining_warmup: usize,
}

/// Snapshot of one metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct Summary {
    pub total: u64,
    pub count: u64,
    pub last: f64,
    pub mean: f64,
    pub var: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
}

pub struct Histogram {
    moments: Mutex<Moments>,
    buckets: Box<[AtomicU64]>,
    /// Range resolved once warmup completes.
    ranged: AtomicBool,
    lower_bits: AtomicU64,
    width_bits: AtomicU64,
    below: AtomicU64,
    above: AtomicU64,
    warmup: usize,
}

impl Histogram {
    fn new(buckets: usize, warmup: usize) -> Self {
        Histogram {
            moments: Mutex::new(Moments {
                remaining_warmup: warmup,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                ..Default::default()
            }),
            buckets: (0..buckets.max(1)).map(|_| AtomicU64::new(0)).collect(),
            ranged: AtomicBool::new(false),
            lower_bits: AtomicU64::new(0),
            width_bits: AtomicU64::new(0),
            below: AtomicU64::new(0),
            above: AtomicU64::new(0),
            warmup,
        }
    }

    fn update(&self, value: f64) {
        let mut in_warmup = false;
        {
            let mut m = self.moments.lock();
            m.total += 1;
            m.last = value;
            m.min = m.min.min(value);
            m.max = m.max.max(value);

            if m.remaining_warmup > 0 {
                in_warmup = true;
                m.remaining_warmup -= 1;
                if m.remaining_warmup == 0 {
                    self.resolve_range(m.min, m.max);
                }
            } else {
                if self.warmup == 0 && !self.ranged.load(Ordering::Relaxed) {
                    // No warmup configured: center the range on the first
                    // observation.
                    let half = value.abs().max(0.5);
                    self.resolve_range(value - half, value + half);
                }

                m.count += 1;
                let delta = value - m.mean;
                m.mean += delta / m.count as f64;
                let delta2 = value - m.mean;
                m.m2 += delta * delta2;
            }
        }

        if !in_warmup && self.ranged.load(Ordering::Acquire) {
            let lower = f64::from_bits(self.lower_bits.load(Ordering::Relaxed));
            let width = f64::from_bits(self.width_bits.load(Ordering::Relaxed));
            if value < lower {
                self.below.fetch_add(1, Ordering::Relaxed);
            } else {
                let idx = ((value - lower) / width) as usize;
                if idx >= self.buckets.len() {
                    self.above.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.buckets[idx].fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn resolve_range(&self, min: f64, max: f64) {
        let span = (max - min).abs();
        // Widen slightly so warmup extremes land inside the outer buckets.
        let margin = if span > 0.0 { span * 0.05 } else { 0.5 };
        let lower = min - margin;
        let upper = max + margin;
        let width = (upper - lower) / self.buckets.len() as f64;

        self.lower_bits.store(lower.to_bits(), Ordering::Relaxed);
        self.width_bits.store(width.to_bits(), Ordering::Relaxed);
        self.ranged.store(true, Ordering::Release);
    }

    fn summary(&self) -> Summary {
        let m = self.moments.lock();
        let var = if m.count > 1 {
            m.m2 / (m.count - 1) as f64
        } else {
            0.0
        };
        Summary {
            total: m.total,
            count: m.count,
            last: m.last,
            mean: m.mean,
            var,
            stddev: var.sqrt(),
            min: if m.total > 0 { m.min } else { 0.0 },
            max: if m.total > 0 { m.max } else { 0.0 },
        }
    }

    fn reset(&self) {
        let mut m = self.moments.lock();
        *m = Moments {
            remaining_warmup: self.warmup,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            ..Default::default()
        };
        self.ranged.store(false, Ordering::Release);
        self.below.store(0, Ordering::Relaxed);
        self.above.store(0, Ordering::Relaxed);
        for b in self.buckets.iter() {
            b.store(0, Ordering::Relaxed);
        }
    }

    fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

pub const DEFAULT_BUCKETS: usize = 20;
pub const DEFAULT_WARMUP: usize = 500;

/// Shared statistics block for one node, updated by the read- and write-side
/// stats hooks and read by the supervisor and stats mappings.
pub struct Stats {
    metrics: [Histogram; 5],
}

impl Stats {
    pub fn new(buckets: usize, warmup: usize) -> Self {
        Stats {
            metrics: [
                Histogram::new(buckets, warmup),
                Histogram::new(buckets, warmup),
                Histogram::new(buckets, warmup),
                Histogram::new(buckets, warmup),
                Histogram::new(buckets, warmup),
            ],
        }
    }

    pub fn update(&self, metric: Metric, value: f64) {
        self.metrics[metric.index()].update(value);
    }

    pub fn summary(&self, metric: Metric) -> Summary {
        self.metrics[metric.index()].summary()
    }

    pub fn aggregate(&self, metric: Metric, agg: Aggregate) -> f64 {
        let s = self.summary(metric);
        match agg {
            Aggregate::Last => s.last,
            Aggregate::Highest => s.max,
            Aggregate::Lowest => s.min,
            Aggregate::Mean => s.mean,
            Aggregate::Var => s.var,
            Aggregate::Stddev => s.stddev,
            Aggregate::Total => s.total as f64,
        }
    }

    /// Reset all metrics, e.g. after an upstream restart.
    pub fn reset(&self) {
        for h in &self.metrics {
            h.reset();
        }
    }

    /// One line per metric with data, for periodic logging.
    pub fn format_periodic(&self) -> String {
        let mut out = String::new();
        for metric in Metric::ALL {
            let s = self.summary(metric);
            if s.total == 0 {
                continue;
            }
            if !out.is_empty() {
                out.push_str(", ");
            }
            let _ = write!(
                out,
                "{}: last={:.3e} mean={:.3e} total={}",
                metric.as_str(),
                s.last,
                s.mean,
                s.total
            );
        }
        out
    }

    /// Full counter table with histogram buckets, printed at stop.
    pub fn format_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<14} {:>10} {:>12} {:>12} {:>12} {:>12}",
            "metric", "total", "mean", "stddev", "min", "max"
        );
        for metric in Metric::ALL {
            let s = self.summary(metric);
            let _ = writeln!(
                out,
                "{:<14} {:>10} {:>12.4e} {:>12.4e} {:>12.4e} {:>12.4e}",
                metric.as_str(),
                s.total,
                s.mean,
                s.stddev,
                s.min,
                s.max
            );

            let h = &self.metrics[metric.index()];
            if s.total > 0 && h.ranged.load(Ordering::Relaxed) {
                let _ = writeln!(out, "  buckets: {:?}", h.bucket_counts());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welford_moments() {
        let stats = Stats::new(10, 0);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.update(Metric::Owd, v);
        }
        let s = stats.summary(Metric::Owd);
        assert_eq!(s.count, 8);
        assert!((s.mean - 5.0).abs() < 1e-12);
        // Sample variance of the set is 32/7.
        assert!((s.var - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
    }

    #[test]
    fn test_warmup_excluded_from_moments() {
        let stats = Stats::new(10, 3);
        for v in [100.0, 200.0, 300.0] {
            stats.update(Metric::Age, v);
        }
        let s = stats.summary(Metric::Age);
        assert_eq!(s.total, 3);
        assert_eq!(s.count, 0);
        assert_eq!(s.mean, 0.0);

        stats.update(Metric::Age, 150.0);
        let s = stats.summary(Metric::Age);
        assert_eq!(s.total, 4);
        assert_eq!(s.count, 1);
        assert_eq!(s.mean, 150.0);
    }

    #[test]
    fn test_buckets_fill_after_warmup() {
        let stats = Stats::new(4, 2);
        stats.update(Metric::Owd, 0.0);
        stats.update(Metric::Owd, 10.0);
        for v in [1.0, 4.0, 6.0, 9.0] {
            stats.update(Metric::Owd, v);
        }
        let h = &stats.metrics[Metric::Owd.index()];
        let total_bucketed: u64 = h.bucket_counts().iter().sum();
        assert_eq!(total_bucketed, 4);
    }

    #[test]
    fn test_reset() {
        let stats = Stats::new(4, 0);
        stats.update(Metric::Owd, 1.0);
        stats.reset();
        let s = stats.summary(Metric::Owd);
        assert_eq!(s.total, 0);
        assert_eq!(s.count, 0);
    }

    #[test]
    fn test_aggregates() {
        let stats = Stats::new(4, 0);
        for v in [1.0, 3.0, 2.0] {
            stats.update(Metric::GapSample, v);
        }
        assert_eq!(stats.aggregate(Metric::GapSample, Aggregate::Last), 2.0);
        assert_eq!(stats.aggregate(Metric::GapSample, Aggregate::Highest), 3.0);
        assert_eq!(stats.aggregate(Metric::GapSample, Aggregate::Lowest), 1.0);
        assert_eq!(stats.aggregate(Metric::GapSample, Aggregate::Total), 3.0);
        assert!((stats.aggregate(Metric::GapSample, Aggregate::Mean) - 2.0).abs() < 1e-12);
    }
}
