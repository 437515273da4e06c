//! Loopback node: echoes written samples back through an internal queue.
//!
//! The minimum node contract: `write` copies incoming samples into a private
//! pool and enqueues them, `read` dequeues and copies into the caller's
//! slots. Useful for wiring paths together in-process and for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::Result;
use crate::node::{NodeKind, ReadResult};
use crate::pool::{MemoryType, Pool};
use crate::queue::PushError;
use crate::queue_signalled::SignalledQueue;
use crate::sample::SampleRef;
use crate::signal::SignalList;

const DEFAULT_QUEUELEN: usize = 1024;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct LoopbackNode {
    queuelen: usize,
    pool: Option<Pool>,
    queue: Option<Arc<SignalledQueue<SampleRef>>>,
    overruns: AtomicU64,
}

impl LoopbackNode {
    pub fn new() -> Self {
        LoopbackNode {
            queuelen: DEFAULT_QUEUELEN,
            pool: None,
            queue: None,
            overruns: AtomicU64::new(0),
        }
    }

    fn queue(&self) -> &Arc<SignalledQueue<SampleRef>> {
        self.queue.as_ref().expect("loopback node not prepared")
    }

    fn pool(&self) -> &Pool {
        self.pool.as_ref().expect("loopback node not prepared")
    }
}

impl Default for LoopbackNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeKind for LoopbackNode {
    fn parse(&mut self, cfg: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        if let Some(q) = cfg.get("queuelen").and_then(|v| v.as_u64()) {
            self.queuelen = q as usize;
        }
        Ok(())
    }

    fn prepare(&mut self, in_signals: &SignalList, out_signals: &SignalList) -> Result<()> {
        let capacity = in_signals.len().max(out_signals.len()).max(1);
        // Slots for everything queued plus what callers hold in flight.
        self.pool = Some(Pool::new(self.queuelen * 2, capacity, MemoryType::Heap)?);
        self.queue = Some(Arc::new(SignalledQueue::new(self.queuelen)));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if let Some(q) = &self.queue {
            q.close();
        }
        let overruns = self.overruns.load(Ordering::Relaxed);
        if overruns > 0 {
            debug!("loopback dropped {} samples on overrun", overruns);
        }
        Ok(())
    }

    fn read(&self, smps: &mut [SampleRef]) -> Result<ReadResult> {
        if smps.is_empty() {
            return Ok(ReadResult::all(0));
        }

        let queue = self.queue();
        let first = match queue.pull_timeout(READ_TIMEOUT) {
            Ok(Some(smp)) => smp,
            Ok(None) => return Ok(ReadResult::all(0)),
            Err(_) => return Ok(ReadResult::all(0)), // closed during stop
        };

        smps[0].as_mut().shallow_copy_from(&first);
        drop(first);
        let mut n = 1;

        // Drain whatever else is already queued, up to the batch size.
        while n < smps.len() {
            match queue.pull() {
                Ok(smp) => {
                    smps[n].as_mut().shallow_copy_from(&smp);
                    n += 1;
                }
                Err(_) => break,
            }
        }

        Ok(ReadResult::all(n))
    }

    fn write(&self, smps: &[SampleRef]) -> Result<usize> {
        let queue = self.queue();
        let pool = self.pool();

        for (i, smp) in smps.iter().enumerate() {
            let mut copy = match pool.alloc_one() {
                Some(c) => c,
                None => {
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                    return Ok(i);
                }
            };
            copy.as_mut().shallow_copy_from(smp);

            match queue.push(copy) {
                Ok(()) => {}
                Err(PushError::Full(_)) | Err(PushError::Closed(_)) => {
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                    return Ok(i);
                }
            }
        }

        Ok(smps.len())
    }

    fn print(&self) -> String {
        format!("queuelen={}", self.queuelen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::flags;
    use crate::signal::{signal_list_generate, SignalData, SignalType};

    fn prepared(queuelen: usize, values: usize) -> LoopbackNode {
        let mut node = LoopbackNode::new();
        let mut cfg = serde_json::Map::new();
        cfg.insert("queuelen".into(), serde_json::json!(queuelen));
        node.parse(&cfg).unwrap();

        let signals = signal_list_generate(values, SignalType::Float);
        node.prepare(&signals, &signals).unwrap();
        node
    }

    #[test]
    fn test_echo() {
        let node = prepared(8, 2);
        let pool = Pool::new(4, 2, MemoryType::Heap).unwrap();

        let mut smp = pool.alloc_one().unwrap();
        {
            let s = smp.as_mut();
            s.sequence = 5;
            s.flags = flags::HAS_SEQUENCE | flags::HAS_DATA;
            s.set_len(2);
            s.data_mut()[0] = SignalData::float(1.0);
            s.data_mut()[1] = SignalData::float(2.0);
        }

        assert_eq!(node.write(&[smp]).unwrap(), 1);

        let mut batch = Vec::new();
        pool.alloc_many(&mut batch, 2);
        let r = node.read(&mut batch).unwrap();
        assert_eq!(r.count, 1);
        assert_eq!(batch[0].sequence, 5);
        assert_eq!(batch[0].data()[1].f(), 2.0);
    }

    #[test]
    fn test_queue_full_accepts_prefix() {
        let node = prepared(2, 1);
        let pool = Pool::new(8, 1, MemoryType::Heap).unwrap();

        let mut smps = Vec::new();
        pool.alloc_many(&mut smps, 4);
        let accepted = node.write(&smps).unwrap();
        assert_eq!(accepted, 2);
    }

    #[test]
    fn test_read_times_out_when_empty() {
        let node = prepared(4, 1);
        let pool = Pool::new(4, 1, MemoryType::Heap).unwrap();
        let mut batch = Vec::new();
        pool.alloc_many(&mut batch, 1);

        let r = node.read(&mut batch).unwrap();
        assert_eq!(r.count, 0);
    }
}
