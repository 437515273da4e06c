//! Sample records and their reference-counted handles.
//!
//! Samples live in fixed slots owned by a [`Pool`](crate::pool::Pool) and are
//! passed around as [`SampleRef`] handles. A sample is mutable only while its
//! handle is unique; the first extra `clone` freezes it.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::pool::PoolInner;
use crate::signal::{SignalData, SignalList};
use crate::timing::Timestamp;

/// Bits of `Sample::flags` enumerating populated optional fields.
pub mod flags {
    pub const HAS_SEQUENCE: u32 = 1 << 0;
    pub const HAS_TS_ORIGIN: u32 = 1 << 1;
    pub const HAS_TS_RECEIVED: u32 = 1 << 2;
    pub const HAS_OFFSET: u32 = 1 << 3;
    pub const HAS_DATA: u32 = 1 << 4;

    pub const HAS_ALL: u32 =
        HAS_SEQUENCE | HAS_TS_ORIGIN | HAS_TS_RECEIVED | HAS_OFFSET | HAS_DATA;
}

/// A fixed-capacity measurement record.
///
/// The value storage lives in the owning pool's memory region; `capacity` is
/// fixed at pool construction and survives reuse, `length` is reset when the
/// slot returns to the pool.
pub struct Sample {
    /// Producer-scoped monotonic counter.
    pub sequence: u64,
    /// Wall-clock timestamp at the upstream source.
    pub ts_origin: Timestamp,
    /// Timestamp taken when the sample entered this process.
    pub ts_received: Timestamp,
    /// Bit set of populated optional fields, see [`flags`].
    pub flags: u32,
    /// Type descriptors for the value slots; `signals.len() >= length`.
    pub signals: Option<SignalList>,

    length: u32,
    capacity: u32,
    pub(crate) refcnt: AtomicU32,
    data: NonNull<SignalData>,
}

// A sample slot is handed between threads through queues; the refcount
// protocol serializes mutation.
unsafe impl Send for Sample {}
unsafe impl Sync for Sample {}

impl Sample {
    /// Construct a free slot whose value storage starts at `data`.
    pub(crate) fn new_in(data: NonNull<SignalData>, capacity: usize) -> Self {
        Sample {
            sequence: 0,
            ts_origin: Timestamp::default(),
            ts_received: Timestamp::default(),
            flags: 0,
            signals: None,
            length: 0,
            capacity: capacity as u32,
            refcnt: AtomicU32::new(0),
            data,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Set the number of valid values. Clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        self.length = (len as u32).min(self.capacity);
    }

    /// The valid values.
    pub fn data(&self) -> &[SignalData] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.length as usize) }
    }

    /// The full value storage, up to capacity.
    pub fn data_mut(&mut self) -> &mut [SignalData] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.capacity as usize) }
    }

    /// Copy header and values from `src`. Signal references are shared by
    /// identity, not deep-copied.
    pub fn shallow_copy_from(&mut self, src: &Sample) {
        self.sequence = src.sequence;
        self.ts_origin = src.ts_origin;
        self.ts_received = src.ts_received;
        self.flags = src.flags;
        self.signals = src.signals.clone();
        let n = (src.length).min(self.capacity) as usize;
        self.length = n as u32;
        self.data_mut()[..n].copy_from_slice(&src.data()[..n]);
    }

    /// Reset transient fields when the slot returns to the pool.
    pub(crate) fn reset(&mut self) {
        self.sequence = 0;
        self.ts_origin = Timestamp::default();
        self.ts_received = Timestamp::default();
        self.flags = 0;
        self.signals = None;
        self.length = 0;
    }
}

/// Reference-counted handle to a pooled sample.
///
/// `clone` increments the sample's refcount; dropping the last handle returns
/// the slot to its originating pool.
pub struct SampleRef {
    pool: Arc<PoolInner>,
    idx: u32,
}

impl SampleRef {
    pub(crate) fn from_slot(pool: Arc<PoolInner>, idx: u32) -> Self {
        SampleRef { pool, idx }
    }

    fn slot(&self) -> *mut Sample {
        self.pool.slot(self.idx)
    }

    /// Exclusive access while this is the only handle. Returns `None` once
    /// the sample has been shared.
    pub fn try_mut(&mut self) -> Option<&mut Sample> {
        if self.refcnt.load(Ordering::Acquire) == 1 {
            Some(unsafe { &mut *self.slot() })
        } else {
            None
        }
    }

    /// Exclusive access; panics when the sample is shared. Mutating a shared
    /// sample is a protocol violation, not a recoverable error.
    #[track_caller]
    pub fn as_mut(&mut self) -> &mut Sample {
        match self.try_mut() {
            Some(s) => s,
            None => panic!("mutable access to a shared sample"),
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }
}

impl std::ops::Deref for SampleRef {
    type Target = Sample;

    fn deref(&self) -> &Sample {
        unsafe { &*self.slot() }
    }
}

impl Clone for SampleRef {
    fn clone(&self) -> Self {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
        SampleRef {
            pool: Arc::clone(&self.pool),
            idx: self.idx,
        }
    }
}

impl Drop for SampleRef {
    fn drop(&mut self) {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        match prev {
            1 => {
                // Last handle: reset the slot and hand it back.
                unsafe { (*self.slot()).reset() };
                self.pool.release(self.idx);
            }
            0 => {
                // Refcount underflow means a double decref happened somewhere
                // in the unsafe internals. Not recoverable.
                std::process::abort();
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for SampleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRef")
            .field("sequence", &self.sequence)
            .field("length", &self.len())
            .field("flags", &self.flags)
            .field("refcnt", &self.refcount())
            .finish()
    }
}
