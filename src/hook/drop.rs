//! Drop hook: filter samples whose sequence does not advance.

use log::debug;

use crate::hook::{Hook, Verdict};
use crate::sample::{flags, SampleRef};

pub struct DropHook {
    prev: Option<u64>,
    dropped: u64,
}

impl DropHook {
    pub fn new() -> Self {
        DropHook {
            prev: None,
            dropped: 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for DropHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Hook for DropHook {
    fn name(&self) -> &'static str {
        "drop"
    }

    fn priority(&self) -> i32 {
        97
    }

    fn start(&mut self) {
        self.prev = None;
    }

    fn restart(&mut self) {
        self.prev = None;
    }

    fn stop(&mut self) {
        if self.dropped > 0 {
            debug!("drop hook discarded {} reordered samples", self.dropped);
        }
    }

    fn process(&mut self, smp: &mut SampleRef) -> Verdict {
        if smp.flags & flags::HAS_SEQUENCE == 0 {
            return Verdict::Ok;
        }

        let seq = smp.sequence;
        match self.prev {
            // The first sample always passes.
            None => {
                self.prev = Some(seq);
                Verdict::Ok
            }
            Some(prev) if seq > prev => {
                self.prev = Some(seq);
                Verdict::Ok
            }
            Some(_) => {
                self.dropped += 1;
                Verdict::SkipSample
            }
        }
    }
}
