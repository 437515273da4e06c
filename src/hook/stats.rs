//! Statistics hooks.
//!
//! Two instances share one per-node [`Stats`] block: the read-side hook
//! observes delays, gaps and reordering as samples enter the process, the
//! write-side hook observes sample age as they leave.

use std::sync::Arc;

use crate::hook::{Hook, HookContext, Verdict};
use crate::sample::{flags, SampleRef};
use crate::stats::{Metric, Stats, DEFAULT_BUCKETS, DEFAULT_WARMUP};
use crate::timing::Timestamp;

/// Header of the previously observed sample; enough for gap and reorder
/// detection without extending the sample's lifetime.
#[derive(Clone, Copy)]
struct LastHeader {
    flags: u32,
    sequence: u64,
    ts_origin: Timestamp,
    ts_received: Timestamp,
}

pub struct StatsReadHook {
    stats: Arc<Stats>,
    last: Option<LastHeader>,
}

impl StatsReadHook {
    pub fn new(stats: Arc<Stats>) -> Self {
        StatsReadHook { stats, last: None }
    }

    /// Use the node's shared stats block when present, otherwise a private
    /// one (the hook was configured on a chain without node stats).
    pub fn from_context(ctx: &HookContext) -> Self {
        let stats = ctx
            .stats
            .clone()
            .unwrap_or_else(|| Arc::new(Stats::new(DEFAULT_BUCKETS, DEFAULT_WARMUP)));
        StatsReadHook { stats, last: None }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }
}

impl Hook for StatsReadHook {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn priority(&self) -> i32 {
        98
    }

    fn start(&mut self) {
        self.last = None;
    }

    fn restart(&mut self) {
        self.last = None;
        self.stats.reset();
    }

    fn process(&mut self, smp: &mut SampleRef) -> Verdict {
        let f = smp.flags;

        if f & flags::HAS_TS_ORIGIN != 0 && f & flags::HAS_TS_RECEIVED != 0 {
            self.stats
                .update(Metric::Owd, smp.ts_origin.delta(&smp.ts_received));
        }

        if let Some(last) = self.last {
            if f & last.flags & flags::HAS_TS_RECEIVED != 0 {
                self.stats.update(
                    Metric::GapReceived,
                    last.ts_received.delta(&smp.ts_received),
                );
            }

            if f & last.flags & flags::HAS_TS_ORIGIN != 0 {
                self.stats
                    .update(Metric::GapSample, last.ts_origin.delta(&smp.ts_origin));
            }

            if f & last.flags & flags::HAS_SEQUENCE != 0 {
                let dist = smp.sequence as i64 - last.sequence as i64;
                if dist != 1 {
                    self.stats.update(Metric::Reordered, dist as f64);
                }
            }
        }

        self.last = Some(LastHeader {
            flags: f,
            sequence: smp.sequence,
            ts_origin: smp.ts_origin,
            ts_received: smp.ts_received,
        });

        Verdict::Ok
    }
}

pub struct StatsWriteHook {
    stats: Arc<Stats>,
}

impl StatsWriteHook {
    pub fn new(stats: Arc<Stats>) -> Self {
        StatsWriteHook { stats }
    }
}

impl Hook for StatsWriteHook {
    fn name(&self) -> &'static str {
        "stats_write"
    }

    fn priority(&self) -> i32 {
        99
    }

    fn process(&mut self, smp: &mut SampleRef) -> Verdict {
        if smp.flags & flags::HAS_TS_RECEIVED != 0 {
            let now = Timestamp::now();
            self.stats.update(Metric::Age, smp.ts_received.delta(&now));
        }
        Verdict::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryType, Pool};

    fn sample(pool: &Pool, seq: u64, origin: Timestamp, received: Timestamp) -> SampleRef {
        let mut smp = pool.alloc_one().unwrap();
        {
            let s = smp.as_mut();
            s.sequence = seq;
            s.ts_origin = origin;
            s.ts_received = received;
            s.flags = flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN | flags::HAS_TS_RECEIVED;
        }
        smp
    }

    #[test]
    fn test_owd_and_gaps() {
        let pool = Pool::new(8, 2, MemoryType::Heap).unwrap();
        let stats = Arc::new(Stats::new(4, 0));
        let mut hook = StatsReadHook::new(Arc::clone(&stats));

        let mut a = sample(
            &pool,
            1,
            Timestamp::new(100, 0),
            Timestamp::new(100, 250_000_000),
        );
        hook.process(&mut a);
        // One-way delay is per-sample; gaps need a predecessor.
        assert_eq!(stats.summary(Metric::Owd).total, 1);
        assert_eq!(stats.summary(Metric::GapSample).total, 0);

        let mut b = sample(
            &pool,
            2,
            Timestamp::new(101, 0),
            Timestamp::new(101, 500_000_000),
        );
        hook.process(&mut b);

        let owd = stats.summary(Metric::Owd);
        assert_eq!(owd.total, 2);
        assert!((owd.last - 0.5).abs() < 1e-9);

        let gap = stats.summary(Metric::GapSample);
        assert_eq!(gap.total, 1);
        assert!((gap.last - 1.0).abs() < 1e-9);

        let gapr = stats.summary(Metric::GapReceived);
        assert!((gapr.last - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_reorder_distance() {
        let pool = Pool::new(8, 2, MemoryType::Heap).unwrap();
        let stats = Arc::new(Stats::new(4, 0));
        let mut hook = StatsReadHook::new(Arc::clone(&stats));

        for seq in [1u64, 2, 5, 4] {
            let mut smp = sample(&pool, seq, Timestamp::new(0, 0), Timestamp::new(0, 0));
            hook.process(&mut smp);
        }

        let r = stats.summary(Metric::Reordered);
        // 2->5 distance 3, 5->4 distance -1; 1->2 is in order.
        assert_eq!(r.total, 2);
        assert_eq!(r.last, -1.0);
    }

    #[test]
    fn test_write_side_age() {
        let pool = Pool::new(8, 2, MemoryType::Heap).unwrap();
        let stats = Arc::new(Stats::new(4, 0));
        let mut hook = StatsWriteHook::new(Arc::clone(&stats));

        let mut smp = sample(&pool, 1, Timestamp::new(0, 0), Timestamp::now());
        hook.process(&mut smp);

        let age = stats.summary(Metric::Age);
        assert_eq!(age.total, 1);
        assert!(age.last >= 0.0);
        assert!(age.last < 1.0);
    }
}
