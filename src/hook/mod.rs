//! Hook pipeline.
//!
//! Hooks are per-sample transforms, filters and observers arranged in a
//! priority-ordered list. Each hook sees every sample and answers with a
//! verdict; the list short-circuits on skip, stop and error verdicts.

pub mod decimate;
pub mod drop;
pub mod print;
pub mod restart;
pub mod shift;
pub mod stats;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sample::SampleRef;
use crate::signal::SignalList;
use crate::stats::Stats;

pub use decimate::DecimateHook;
pub use drop::DropHook;
pub use print::PrintHook;
pub use restart::RestartHook;
pub use shift::{ShiftSeqHook, ShiftTsHook};
pub use stats::{StatsReadHook, StatsWriteHook};

/// Outcome of processing one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue with the next hook.
    Ok,
    /// Drop this sample, continue with the next sample.
    SkipSample,
    /// Deliver only the samples processed so far.
    StopProcessing,
    /// Abort the batch.
    Error,
}

/// Context masks restricting where a hook may be attached.
pub mod context {
    pub const NODE_READ: u32 = 1 << 0;
    pub const NODE_WRITE: u32 = 1 << 1;
    pub const PATH: u32 = 1 << 2;
    /// Auto-inserted ahead of user hooks when the owning chain enables
    /// builtin hooks.
    pub const BUILTIN: u32 = 1 << 3;
}

pub trait Hook: Send {
    fn name(&self) -> &'static str;

    /// Higher priorities run earlier; ties keep insertion order.
    fn priority(&self) -> i32 {
        0
    }

    fn parse(&mut self, _cfg: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    /// Receives the signal list flowing into this hook and returns the list
    /// flowing out of it.
    fn prepare(&mut self, signals: SignalList) -> Result<SignalList> {
        Ok(signals)
    }

    fn start(&mut self) {}

    fn stop(&mut self) {}

    /// Re-arm after an upstream restart.
    fn restart(&mut self) {}

    /// Invoked at the supervisor's stats interval, never concurrently with
    /// `process` of the same instance.
    fn periodic(&mut self) {}

    fn process(&mut self, smp: &mut SampleRef) -> Verdict;
}

/// Shared state handed to hook factories.
#[derive(Default, Clone)]
pub struct HookContext {
    /// Statistics block of the owning node, when stats are enabled.
    pub stats: Option<Arc<Stats>>,
    /// Supervisor-visible counter of detected upstream restarts.
    pub restarts: Option<Arc<AtomicU64>>,
}

pub struct HookType {
    pub name: &'static str,
    pub description: &'static str,
    /// Context mask; the BUILTIN bit marks hooks inserted automatically.
    pub flags: u32,
    pub make: fn(&HookContext) -> Box<dyn Hook>,
}

/// Compile-time hook registry.
pub static HOOK_TYPES: &[HookType] = &[
    HookType {
        name: "restart",
        description: "Detect upstream restarts by sequence wrap-around",
        flags: context::NODE_READ | context::BUILTIN,
        make: |ctx| Box::new(RestartHook::new(ctx)),
    },
    HookType {
        name: "drop",
        description: "Drop samples with non-increasing sequence numbers",
        flags: context::NODE_READ | context::BUILTIN,
        make: |_| Box::new(DropHook::new()),
    },
    HookType {
        name: "stats",
        description: "Collect per-node statistics",
        flags: context::NODE_READ,
        make: |ctx| Box::new(StatsReadHook::from_context(ctx)),
    },
    HookType {
        name: "decimate",
        description: "Downsampling by integer factor",
        flags: context::NODE_READ | context::NODE_WRITE | context::PATH,
        make: |_| Box::new(DecimateHook::new()),
    },
    HookType {
        name: "shift_seq",
        description: "Shift sequence numbers by a constant offset",
        flags: context::NODE_READ | context::NODE_WRITE | context::PATH,
        make: |_| Box::new(ShiftSeqHook::new()),
    },
    HookType {
        name: "shift_ts",
        description: "Shift origin timestamps by a constant offset",
        flags: context::NODE_READ | context::NODE_WRITE | context::PATH,
        make: |_| Box::new(ShiftTsHook::new()),
    },
    HookType {
        name: "print",
        description: "Dump samples in the human-readable line format",
        flags: context::NODE_READ | context::NODE_WRITE | context::PATH,
        make: |_| Box::new(PrintHook::new()),
    },
];

pub fn lookup(name: &str) -> Option<&'static HookType> {
    HOOK_TYPES.iter().find(|t| t.name == name)
}

/// Ordered hook chain. Built from config, completed with builtin hooks, then
/// sorted by descending priority before signal lists are threaded through.
pub struct HookList {
    hooks: Vec<Box<dyn Hook>>,
    signals: Option<SignalList>,
}

impl Default for HookList {
    fn default() -> Self {
        Self::new()
    }
}

impl HookList {
    pub fn new() -> Self {
        HookList {
            hooks: Vec::new(),
            signals: None,
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Insert a pre-built hook instance.
    pub fn push(&mut self, hook: Box<dyn Hook>) {
        self.hooks.push(hook);
    }

    /// Parse configured hooks. Each entry is an object with a `type` tag;
    /// hooks outside `mask` are rejected, disabled entries are skipped.
    pub fn parse(
        &mut self,
        cfgs: &[serde_json::Value],
        mask: u32,
        ctx: &HookContext,
    ) -> Result<()> {
        for cfg in cfgs {
            let kind = cfg
                .get("type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::config("hook entry without a 'type' tag"))?;

            let ht = lookup(kind)
                .ok_or_else(|| Error::config(format!("unknown hook type '{}'", kind)))?;

            if ht.flags & mask == 0 {
                return Err(Error::validation(format!(
                    "hook '{}' is not allowed here",
                    kind
                )));
            }

            if cfg.get("enabled").and_then(|v| v.as_bool()) == Some(false) {
                continue;
            }

            let mut hook = (ht.make)(ctx);
            hook.parse(cfg)?;
            hook.check()?;
            self.hooks.push(hook);
        }
        Ok(())
    }

    /// Auto-insert builtin hooks for `builtin_mask` (0 skips the insertion),
    /// sort by descending priority and thread the signal list through every
    /// hook. Returns the output signal list of the chain.
    pub fn prepare(
        &mut self,
        mut signals: SignalList,
        builtin_mask: u32,
        ctx: &HookContext,
    ) -> Result<SignalList> {
        if builtin_mask != 0 {
            for ht in HOOK_TYPES {
                let want = builtin_mask | context::BUILTIN;
                if ht.flags & want == want && !self.hooks.iter().any(|h| h.name() == ht.name) {
                    self.hooks.push((ht.make)(ctx));
                }
            }
        }

        // Stable sort keeps insertion order between equal priorities.
        self.hooks.sort_by_key(|h| std::cmp::Reverse(h.priority()));

        for hook in &mut self.hooks {
            signals = hook.prepare(signals)?;
        }

        self.signals = Some(signals.clone());
        Ok(signals)
    }

    /// Output signal list after `prepare`.
    pub fn signals(&self) -> Option<&SignalList> {
        self.signals.as_ref()
    }

    /// Run the chain over a batch, compacting it to the delivered prefix.
    /// Returns the number of samples surviving.
    pub fn process(&mut self, batch: &mut Vec<SampleRef>) -> Result<usize> {
        if self.hooks.is_empty() {
            return Ok(batch.len());
        }

        let mut out = Vec::with_capacity(batch.len());
        let mut stopped = false;

        'samples: for mut smp in batch.drain(..) {
            if stopped {
                // Samples after a stop verdict are not delivered; dropping
                // the handle releases them.
                continue;
            }

            for hook in &mut self.hooks {
                match hook.process(&mut smp) {
                    Verdict::Ok => {}
                    Verdict::SkipSample => continue 'samples,
                    Verdict::StopProcessing => {
                        stopped = true;
                        continue 'samples;
                    }
                    Verdict::Error => {
                        return Err(Error::resource(format!(
                            "hook '{}' failed",
                            hook.name()
                        )));
                    }
                }
            }

            out.push(smp);
        }

        *batch = out;
        Ok(batch.len())
    }

    pub fn start(&mut self) {
        for hook in &mut self.hooks {
            hook.start();
        }
    }

    pub fn stop(&mut self) {
        for hook in &mut self.hooks {
            hook.stop();
        }
    }

    pub fn restart(&mut self) {
        for hook in &mut self.hooks {
            hook.restart();
        }
    }

    pub fn periodic(&mut self) {
        for hook in &mut self.hooks {
            hook.periodic();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryType, Pool};
    use crate::signal::{signal_list_generate, SignalType};

    struct TagHook {
        tag: u64,
        prio: i32,
    }

    impl Hook for TagHook {
        fn name(&self) -> &'static str {
            "tag"
        }

        fn priority(&self) -> i32 {
            self.prio
        }

        fn process(&mut self, smp: &mut SampleRef) -> Verdict {
            // Record visit order in the sequence field.
            let s = smp.as_mut();
            s.sequence = s.sequence * 10 + self.tag;
            Verdict::Ok
        }
    }

    fn batch(pool: &Pool, n: usize) -> Vec<SampleRef> {
        let mut out = Vec::new();
        for i in 0..n {
            let mut smp = pool.alloc_one().unwrap();
            smp.as_mut().sequence = i as u64;
            out.push(smp);
        }
        out
    }

    #[test]
    fn test_priority_order_descending() {
        let pool = Pool::new(8, 2, MemoryType::Heap).unwrap();
        let mut list = HookList::new();
        list.push(Box::new(TagHook { tag: 1, prio: 10 }));
        list.push(Box::new(TagHook { tag: 2, prio: 50 }));
        list.push(Box::new(TagHook { tag: 3, prio: 10 }));

        let signals = signal_list_generate(1, SignalType::Float);
        list.prepare(signals, 0, &HookContext::default()).unwrap();

        let mut smps = batch(&pool, 1);
        list.process(&mut smps).unwrap();
        // 50 first, then the two tens in insertion order.
        assert_eq!(smps[0].sequence, 213);
    }

    struct SkipOdd;

    impl Hook for SkipOdd {
        fn name(&self) -> &'static str {
            "skip_odd"
        }

        fn process(&mut self, smp: &mut SampleRef) -> Verdict {
            if smp.sequence % 2 == 1 {
                Verdict::SkipSample
            } else {
                Verdict::Ok
            }
        }
    }

    #[test]
    fn test_skip_sample() {
        let pool = Pool::new(8, 2, MemoryType::Heap).unwrap();
        let mut list = HookList::new();
        list.push(Box::new(SkipOdd));

        let mut smps = batch(&pool, 6);
        let n = list.process(&mut smps).unwrap();
        assert_eq!(n, 3);
        let seqs: Vec<u64> = smps.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![0, 2, 4]);
    }

    struct StopAt(u64);

    impl Hook for StopAt {
        fn name(&self) -> &'static str {
            "stop_at"
        }

        fn process(&mut self, smp: &mut SampleRef) -> Verdict {
            if smp.sequence >= self.0 {
                Verdict::StopProcessing
            } else {
                Verdict::Ok
            }
        }
    }

    #[test]
    fn test_stop_processing_delivers_prefix() {
        let pool = Pool::new(8, 2, MemoryType::Heap).unwrap();
        let mut list = HookList::new();
        list.push(Box::new(StopAt(3)));

        let mut smps = batch(&pool, 6);
        let n = list.process(&mut smps).unwrap();
        assert_eq!(n, 3);
        assert_eq!(pool.outstanding(), 3); // the rest went back to the pool
    }

    #[test]
    fn test_parse_rejects_wrong_context() {
        let mut list = HookList::new();
        let cfg = vec![serde_json::json!({ "type": "restart" })];
        // restart is a node-read hook; a path chain must reject it.
        assert!(list
            .parse(&cfg, context::PATH, &HookContext::default())
            .is_err());
    }

    #[test]
    fn test_parse_skips_disabled() {
        let mut list = HookList::new();
        let cfg = vec![serde_json::json!({ "type": "decimate", "ratio": 2, "enabled": false })];
        list.parse(
            &cfg,
            context::PATH,
            &HookContext::default(),
        )
        .unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_builtin_insertion_by_mask() {
        let signals = signal_list_generate(1, SignalType::Float);
        let ctx = HookContext::default();

        let mut list = HookList::new();
        list.prepare(signals.clone(), context::NODE_READ, &ctx).unwrap();
        let names: Vec<&str> = list.hooks.iter().map(|h| h.name()).collect();
        assert!(names.contains(&"restart"));
        assert!(names.contains(&"drop"));

        // Path chains have no builtin hooks.
        let mut list = HookList::new();
        list.prepare(signals, context::PATH, &ctx).unwrap();
        assert!(list.is_empty());
    }
}
