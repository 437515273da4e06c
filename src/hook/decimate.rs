//! Downsampling hook: pass every ratio-th sample.

use crate::error::{Error, Result};
use crate::hook::{Hook, Verdict};
use crate::sample::SampleRef;

pub struct DecimateHook {
    ratio: u64,
    counter: u64,
}

impl DecimateHook {
    pub fn new() -> Self {
        DecimateHook {
            ratio: 0,
            counter: 0,
        }
    }

    pub fn with_ratio(ratio: u64) -> Self {
        DecimateHook { ratio, counter: 0 }
    }
}

impl Default for DecimateHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Hook for DecimateHook {
    fn name(&self) -> &'static str {
        "decimate"
    }

    fn parse(&mut self, cfg: &serde_json::Value) -> Result<()> {
        self.ratio = cfg
            .get("ratio")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::config("decimate hook needs an integer 'ratio'"))?;
        Ok(())
    }

    fn start(&mut self) {
        self.counter = 0;
    }

    fn process(&mut self, _smp: &mut SampleRef) -> Verdict {
        if self.ratio != 0 {
            let c = self.counter;
            self.counter += 1;
            if c % self.ratio != 0 {
                return Verdict::SkipSample;
            }
        }
        Verdict::Ok
    }
}
