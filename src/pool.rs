//! Fixed-count sample pools.
//!
//! A pool owns a slab of equally sized sample slots plus a lock-free free
//! ring of slot indices. The value storage for all slots comes from one
//! contiguous region whose backing is chosen by [`MemoryType`].

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::sample::{Sample, SampleRef};
use crate::signal::SignalData;

/// Backing allocation for pool value storage. Hugepage and managed regions
/// are a performance concern, not a correctness one; both fall back to plain
/// pages when unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryType {
    #[default]
    Heap,
    MmapHugepage,
    ManagedRegion,
}

enum RegionBacking {
    Heap(#[allow(dead_code)] Box<[SignalData]>),
    #[cfg(unix)]
    Mmap {
        len: usize,
    },
}

/// Aligned storage for `elems` signal values.
struct Region {
    ptr: NonNull<SignalData>,
    backing: RegionBacking,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn alloc(memory: MemoryType, elems: usize) -> Result<Region> {
        match memory {
            MemoryType::Heap => Ok(Self::alloc_heap(elems)),
            #[cfg(unix)]
            MemoryType::MmapHugepage => Self::alloc_mmap(elems, true),
            #[cfg(unix)]
            MemoryType::ManagedRegion => Self::alloc_mmap(elems, false),
            #[cfg(not(unix))]
            _ => Ok(Self::alloc_heap(elems)),
        }
    }

    fn alloc_heap(elems: usize) -> Region {
        let mut storage: Box<[SignalData]> =
            vec![SignalData::from_bits(0); elems.max(1)].into_boxed_slice();
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
        Region {
            ptr,
            backing: RegionBacking::Heap(storage),
        }
    }

    #[cfg(unix)]
    fn alloc_mmap(elems: usize, hugepages: bool) -> Result<Region> {
        let len = elems.max(1) * std::mem::size_of::<SignalData>();

        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if hugepages {
            flags |= libc::MAP_HUGETLB;
        }

        let mut ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED && hugepages {
            warn!("hugepage mapping failed, falling back to normal pages");
            ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
        }

        if ptr == libc::MAP_FAILED {
            return Err(Error::resource("mmap for pool region failed"));
        }

        Ok(Region {
            ptr: NonNull::new(ptr as *mut SignalData).unwrap(),
            backing: RegionBacking::Mmap { len },
        })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match &self.backing {
            RegionBacking::Heap(_) => {}
            #[cfg(unix)]
            RegionBacking::Mmap { len } => unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, *len);
            },
        }
    }
}

pub(crate) struct SampleSlot(std::cell::UnsafeCell<Sample>);

// Slots are only touched through the refcount protocol.
unsafe impl Sync for SampleSlot {}

/// Shared pool state. Kept alive by the pool handle and by every outstanding
/// [`SampleRef`], so the value region outlives all samples pointing into it.
pub(crate) struct PoolInner {
    slots: Box<[SampleSlot]>,
    free: Queue<u32>,
    capacity: usize,
    allocated_total: AtomicU64,
    freed_total: AtomicU64,
    underrun_total: AtomicU64,
    _region: Region,
}

impl PoolInner {
    pub(crate) fn slot(&self, idx: u32) -> *mut Sample {
        self.slots[idx as usize].0.get()
    }

    /// Return a slot to the free ring. Called from `SampleRef::drop` once the
    /// refcount hits zero.
    pub(crate) fn release(&self, idx: u32) {
        self.freed_total.fetch_add(1, Ordering::Relaxed);
        if self.free.push(idx).is_err() {
            // The free ring is sized for every slot; this cannot fill up
            // unless the refcount protocol is broken.
            std::process::abort();
        }
    }
}

/// Counter snapshot for the pool balance invariant:
/// `allocated - freed == outstanding`.
#[derive(Debug, Clone, Copy)]
pub struct PoolCounters {
    pub allocated_total: u64,
    pub freed_total: u64,
    pub underrun_total: u64,
}

pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool of `count` slots with `capacity` values each.
    pub fn new(count: usize, capacity: usize, memory: MemoryType) -> Result<Pool> {
        if count == 0 {
            return Err(Error::validation("pool needs at least one slot"));
        }

        let region = Region::alloc(memory, count * capacity.max(1))?;

        let slots: Box<[SampleSlot]> = (0..count)
            .map(|i| {
                let data = unsafe {
                    NonNull::new_unchecked(region.ptr.as_ptr().add(i * capacity.max(1)))
                };
                SampleSlot(std::cell::UnsafeCell::new(Sample::new_in(data, capacity)))
            })
            .collect();

        let free = Queue::new(count);
        for i in 0..count as u32 {
            if free.push(i).is_err() {
                return Err(Error::resource("pool free ring underprovisioned"));
            }
        }

        debug!(
            "pool created: {} slots x {} values, memory {:?}",
            count, capacity, memory
        );

        Ok(Pool {
            inner: Arc::new(PoolInner {
                slots,
                free,
                capacity,
                allocated_total: AtomicU64::new(0),
                freed_total: AtomicU64::new(0),
                underrun_total: AtomicU64::new(0),
                _region: region,
            }),
        })
    }

    /// Pull one free slot. `None` under starvation.
    pub fn alloc_one(&self) -> Option<SampleRef> {
        match self.inner.free.pull() {
            Ok(idx) => {
                // The slot is unreferenced; we own it exclusively until the
                // handle is shared.
                unsafe {
                    let s = &mut *self.inner.slot(idx);
                    s.refcnt.store(1, Ordering::Release);
                }
                self.inner.allocated_total.fetch_add(1, Ordering::Relaxed);
                Some(SampleRef::from_slot(Arc::clone(&self.inner), idx))
            }
            Err(_) => {
                self.inner.underrun_total.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Pull up to `n` slots into `out`; returns the count obtained, possibly
    /// zero under starvation. The caller handles the underrun.
    pub fn alloc_many(&self, out: &mut Vec<SampleRef>, n: usize) -> usize {
        let mut k = 0;
        for _ in 0..n {
            match self.alloc_one() {
                Some(smp) => {
                    out.push(smp);
                    k += 1;
                }
                None => break,
            }
        }
        k
    }

    /// Values per slot.
    pub fn sample_capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Total slots.
    pub fn slot_count(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner.free.available()
    }

    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            allocated_total: self.inner.allocated_total.load(Ordering::Relaxed),
            freed_total: self.inner.freed_total.load(Ordering::Relaxed),
            underrun_total: self.inner.underrun_total.load(Ordering::Relaxed),
        }
    }

    /// Outstanding samples as observed through the balance counters.
    pub fn outstanding(&self) -> u64 {
        let c = self.counters();
        c.allocated_total - c.freed_total
    }
}

impl Clone for Pool {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_invariant() {
        let pool = Pool::new(8, 4, MemoryType::Heap).unwrap();

        let mut held = Vec::new();
        assert_eq!(pool.alloc_many(&mut held, 5), 5);
        let c = pool.counters();
        assert_eq!(c.allocated_total - c.freed_total, 5);
        assert_eq!(pool.outstanding(), 5);

        held.truncate(2);
        let c = pool.counters();
        assert_eq!(c.allocated_total, 5);
        assert_eq!(c.freed_total, 3);
        assert_eq!(pool.outstanding(), 2);

        drop(held);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_starvation_returns_partial() {
        let pool = Pool::new(4, 2, MemoryType::Heap).unwrap();
        let mut out = Vec::new();
        assert_eq!(pool.alloc_many(&mut out, 10), 4);
        assert!(pool.alloc_one().is_none());
        assert_eq!(pool.counters().underrun_total, 1);

        out.clear();
        assert!(pool.alloc_one().is_some());
    }

    #[test]
    fn test_clone_keeps_refcount() {
        let pool = Pool::new(2, 2, MemoryType::Heap).unwrap();
        let a = pool.alloc_one().unwrap();
        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        drop(a);
        assert_eq!(b.refcount(), 1);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_mmap_region_pool() {
        // Hugepages are usually unavailable in test environments; the pool
        // must fall back and still work.
        let pool = Pool::new(4, 8, MemoryType::MmapHugepage).unwrap();
        let mut smp = pool.alloc_one().unwrap();
        let s = smp.as_mut();
        s.set_len(8);
        for (i, v) in s.data_mut().iter_mut().enumerate() {
            *v = SignalData::float(i as f64);
        }
        assert_eq!(smp.data()[7].f(), 7.0);
    }
}
