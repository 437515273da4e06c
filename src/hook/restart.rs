//! Restart hook: detect an upstream sequence wrap-around and re-arm.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;

use crate::hook::{Hook, HookContext, Verdict};
use crate::sample::{flags, SampleRef};
use crate::stats::Stats;

/// An upstream counts sequences in 32 bits; a jump back to zero from close
/// to the wrap point is treated as a restart of the sender.
const WRAP_WINDOW: u64 = u32::MAX as u64 - 32;

pub struct RestartHook {
    prev: Option<u64>,
    stats: Option<Arc<Stats>>,
    restarts: Option<Arc<AtomicU64>>,
}

impl RestartHook {
    pub fn new(ctx: &HookContext) -> Self {
        RestartHook {
            prev: None,
            stats: ctx.stats.clone(),
            restarts: ctx.restarts.clone(),
        }
    }
}

impl Hook for RestartHook {
    fn name(&self) -> &'static str {
        "restart"
    }

    fn priority(&self) -> i32 {
        99
    }

    fn start(&mut self) {
        self.prev = None;
    }

    fn process(&mut self, smp: &mut SampleRef) -> Verdict {
        if smp.flags & flags::HAS_SEQUENCE == 0 {
            return Verdict::Ok;
        }

        let seq = smp.sequence;
        if let Some(prev) = self.prev {
            if seq == 0 && prev >= WRAP_WINDOW {
                warn!(
                    "upstream restart detected: sequence dropped from {} to 0",
                    prev
                );
                if let Some(stats) = &self.stats {
                    stats.reset();
                }
                if let Some(restarts) = &self.restarts {
                    restarts.fetch_add(1, Ordering::Relaxed);
                }
                self.prev = Some(0);
                return Verdict::Ok;
            }
        }

        self.prev = Some(seq);
        Verdict::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryType, Pool};
    use crate::stats::Metric;

    fn sample_with_seq(pool: &Pool, seq: u64) -> SampleRef {
        let mut smp = pool.alloc_one().unwrap();
        {
            let s = smp.as_mut();
            s.sequence = seq;
            s.flags = flags::HAS_SEQUENCE;
        }
        smp
    }

    #[test]
    fn test_wrap_fires_restart() {
        let pool = Pool::new(8, 2, MemoryType::Heap).unwrap();
        let stats = Arc::new(Stats::new(4, 0));
        let restarts = Arc::new(AtomicU64::new(0));
        let mut hook = RestartHook::new(&HookContext {
            stats: Some(Arc::clone(&stats)),
            restarts: Some(Arc::clone(&restarts)),
        });

        stats.update(Metric::Owd, 1.0);

        let mut smp = sample_with_seq(&pool, u32::MAX as u64 - 10);
        assert_eq!(hook.process(&mut smp), Verdict::Ok);

        let mut smp = sample_with_seq(&pool, 0);
        assert_eq!(hook.process(&mut smp), Verdict::Ok);

        assert_eq!(restarts.load(Ordering::Relaxed), 1);
        // Counters were reset by the restart.
        assert_eq!(stats.summary(Metric::Owd).total, 0);
        // The sample itself passes downstream with its sequence flag intact.
        assert!(smp.flags & flags::HAS_SEQUENCE != 0);
    }

    #[test]
    fn test_ordinary_zero_is_no_restart() {
        let pool = Pool::new(8, 2, MemoryType::Heap).unwrap();
        let restarts = Arc::new(AtomicU64::new(0));
        let mut hook = RestartHook::new(&HookContext {
            stats: None,
            restarts: Some(Arc::clone(&restarts)),
        });

        let mut smp = sample_with_seq(&pool, 100);
        hook.process(&mut smp);
        let mut smp = sample_with_seq(&pool, 0);
        hook.process(&mut smp);

        assert_eq!(restarts.load(Ordering::Relaxed), 0);
    }
}
