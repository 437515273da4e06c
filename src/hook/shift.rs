//! Shift hooks: add a constant to the sequence number or origin timestamp.
//!
//! Shifting mutates the sample, which is only possible while the handle is
//! unique. On fan-out paths samples are shared between destinations; attach
//! these hooks to the read side or the path chain instead.

use log::warn;

use crate::error::{Error, Result};
use crate::hook::{Hook, Verdict};
use crate::sample::SampleRef;

pub struct ShiftSeqHook {
    offset: i64,
    warned: bool,
}

impl ShiftSeqHook {
    pub fn new() -> Self {
        ShiftSeqHook {
            offset: 0,
            warned: false,
        }
    }

    pub fn with_offset(offset: i64) -> Self {
        ShiftSeqHook {
            offset,
            warned: false,
        }
    }
}

impl Default for ShiftSeqHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Hook for ShiftSeqHook {
    fn name(&self) -> &'static str {
        "shift_seq"
    }

    fn parse(&mut self, cfg: &serde_json::Value) -> Result<()> {
        self.offset = cfg
            .get("offset")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::config("shift_seq hook needs an integer 'offset'"))?;
        Ok(())
    }

    fn process(&mut self, smp: &mut SampleRef) -> Verdict {
        match smp.try_mut() {
            Some(s) => {
                s.sequence = s.sequence.wrapping_add(self.offset as u64);
            }
            None => {
                if !self.warned {
                    warn!("shift_seq cannot modify a shared sample; passing unchanged");
                    self.warned = true;
                }
            }
        }
        Verdict::Ok
    }
}

pub struct ShiftTsHook {
    /// Offset in seconds, may be fractional and negative.
    offset: f64,
    warned: bool,
}

impl ShiftTsHook {
    pub fn new() -> Self {
        ShiftTsHook {
            offset: 0.0,
            warned: false,
        }
    }

    pub fn with_offset(offset: f64) -> Self {
        ShiftTsHook {
            offset,
            warned: false,
        }
    }
}

impl Default for ShiftTsHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Hook for ShiftTsHook {
    fn name(&self) -> &'static str {
        "shift_ts"
    }

    fn parse(&mut self, cfg: &serde_json::Value) -> Result<()> {
        self.offset = cfg
            .get("offset")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::config("shift_ts hook needs a numeric 'offset'"))?;
        Ok(())
    }

    fn process(&mut self, smp: &mut SampleRef) -> Verdict {
        match smp.try_mut() {
            Some(s) => {
                s.ts_origin = s.ts_origin.add_secs(self.offset);
            }
            None => {
                if !self.warned {
                    warn!("shift_ts cannot modify a shared sample; passing unchanged");
                    self.warned = true;
                }
            }
        }
        Verdict::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryType, Pool};
    use crate::timing::Timestamp;

    #[test]
    fn test_shift_seq() {
        let pool = Pool::new(4, 2, MemoryType::Heap).unwrap();
        let mut hook = ShiftSeqHook::with_offset(-10);

        let mut smp = pool.alloc_one().unwrap();
        smp.as_mut().sequence = 100;
        hook.process(&mut smp);
        assert_eq!(smp.sequence, 90);
    }

    #[test]
    fn test_shift_ts() {
        let pool = Pool::new(4, 2, MemoryType::Heap).unwrap();
        let mut hook = ShiftTsHook::with_offset(1.5);

        let mut smp = pool.alloc_one().unwrap();
        smp.as_mut().ts_origin = Timestamp::new(10, 0);
        hook.process(&mut smp);
        assert_eq!(smp.ts_origin.sec, 11);
        assert!((smp.ts_origin.nsec as i64 - 500_000_000).abs() < 1000);
    }

    #[test]
    fn test_shared_sample_passes_unchanged() {
        let pool = Pool::new(4, 2, MemoryType::Heap).unwrap();
        let mut hook = ShiftSeqHook::with_offset(5);

        let mut smp = pool.alloc_one().unwrap();
        smp.as_mut().sequence = 7;
        let _other = smp.clone();

        assert_eq!(hook.process(&mut smp), Verdict::Ok);
        assert_eq!(smp.sequence, 7);
    }

    #[test]
    fn test_parse() {
        let mut hook = ShiftSeqHook::new();
        hook.parse(&serde_json::json!({ "offset": 42 })).unwrap();
        assert_eq!(hook.offset, 42);
        assert!(hook.parse(&serde_json::json!({})).is_err());
    }
}
