//! Lock-free bounded multi-producer multi-consumer ring.
//!
//! Based on Dmitry Vyukov's bounded MPMC queue: every cell carries a sequence
//! counter; producers claim a cell when `cell.seq == pos`, consumers when
//! `cell.seq == pos + 1`. Cell sequence loads are acquire, stores release,
//! head/tail increments relaxed.
//!
//! The ring can be closed; a closed ring returns a distinguished verdict to
//! both endpoints without corrupting in-flight operations.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::warn;

/// Returned by `push` when the value could not be enqueued. The value is
/// handed back to the caller.
#[derive(Debug)]
pub enum PushError<T> {
    Full(T),
    Closed(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullError {
    Empty,
    Closed,
}

/// Verdict of a batch operation on a closed ring that made no progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

/// Conservation counters; see `Queue::counters`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounters {
    pub push_ok: u64,
    pub push_full: u64,
    pub pull_ok: u64,
    pub pull_empty: u64,
}

struct Cell<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct Queue<T> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    /// Producer cursor.
    tail: AtomicUsize,
    /// Consumer cursor.
    head: AtomicUsize,
    closed: AtomicBool,
    push_ok: AtomicU64,
    push_full: AtomicU64,
    pull_ok: AtomicU64,
    pull_empty: AtomicU64,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Create a ring with at least `size` slots. Non-power-of-two sizes are
    /// rounded up.
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        let cap = if size.is_power_of_two() {
            size
        } else {
            let cap = size.next_power_of_two();
            warn!("queue size changed from {} to {}", size, cap);
            cap
        };

        let buffer: Box<[Cell<T>]> = (0..cap)
            .map(|i| Cell {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Queue {
            buffer,
            mask: cap - 1,
            tail: AtomicUsize::new(0),
            head: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            push_ok: AtomicU64::new(0),
            push_full: AtomicU64::new(0),
            pull_ok: AtomicU64::new(0),
            pull_empty: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Approximate number of queued items.
    pub fn available(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head)
    }

    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PushError::Closed(value));
        }

        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                match self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        unsafe { (*cell.value.get()).write(value) };
                        cell.seq.store(pos + 1, Ordering::Release);
                        self.push_ok.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                self.push_full.fetch_add(1, Ordering::Relaxed);
                return Err(PushError::Full(value));
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    pub fn pull(&self) -> Result<T, PullError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PullError::Closed);
        }

        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;

            if diff == 0 {
                match self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.seq.store(pos + self.mask + 1, Ordering::Release);
                        self.pull_ok.fetch_add(1, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                self.pull_empty.fetch_add(1, Ordering::Relaxed);
                return Err(PullError::Empty);
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Push from the front of `items` until the ring is full or closed.
    /// Partial success is expected; pushed items are removed from `items`.
    pub fn push_many(&self, items: &mut VecDeque<T>) -> Result<usize, Closed> {
        let mut n = 0;
        while let Some(item) = items.pop_front() {
            match self.push(item) {
                Ok(()) => n += 1,
                Err(PushError::Full(item)) => {
                    items.push_front(item);
                    break;
                }
                Err(PushError::Closed(item)) => {
                    items.push_front(item);
                    if n == 0 {
                        return Err(Closed);
                    }
                    break;
                }
            }
        }
        Ok(n)
    }

    /// Pull up to `max` items into `out`. Stops at the first cell that cannot
    /// be claimed. Returns `Closed` only when nothing was pulled.
    pub fn pull_many(&self, out: &mut Vec<T>, max: usize) -> Result<usize, Closed> {
        let mut n = 0;
        while n < max {
            match self.pull() {
                Ok(v) => {
                    out.push(v);
                    n += 1;
                }
                Err(PullError::Empty) => break,
                Err(PullError::Closed) => {
                    if n == 0 {
                        return Err(Closed);
                    }
                    break;
                }
            }
        }
        Ok(n)
    }

    /// Poison the ring. Idempotent; every producer and consumer observes the
    /// closed verdict from here on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            push_ok: self.push_ok.load(Ordering::Relaxed),
            push_full: self.push_full.load(Ordering::Relaxed),
            pull_ok: self.pull_ok.load(Ordering::Relaxed),
            pull_empty: self.pull_empty.load(Ordering::Relaxed),
        }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Exclusive access: walk the occupied range and drop what is left.
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mask = self.mask;
        for pos in head..tail {
            let cell = &mut self.buffer[pos & mask];
            if *cell.seq.get_mut() == pos + 1 {
                unsafe { cell.value.get_mut().assume_init_drop() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pull_order() {
        let q: Queue<u32> = Queue::new(8);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.pull().unwrap(), i);
        }
        assert_eq!(q.pull(), Err(PullError::Empty));
    }

    #[test]
    fn test_full() {
        let q: Queue<u32> = Queue::new(4);
        for i in 0..4 {
            q.push(i).unwrap();
        }
        match q.push(99) {
            Err(PushError::Full(v)) => assert_eq!(v, 99),
            _ => panic!("expected full"),
        }
    }

    #[test]
    fn test_rounds_up_to_power_of_two() {
        let q: Queue<u32> = Queue::new(6);
        assert_eq!(q.capacity(), 8);
    }

    #[test]
    fn test_closed_poisons_both_ends() {
        let q: Queue<u32> = Queue::new(4);
        q.push(1).unwrap();
        q.close();
        q.close(); // idempotent
        assert!(matches!(q.push(2), Err(PushError::Closed(2))));
        assert_eq!(q.pull(), Err(PullError::Closed));
    }

    #[test]
    fn test_conservation_counters() {
        let q: Queue<u32> = Queue::new(4);
        let mut attempts = 0u64;
        for i in 0..10 {
            let _ = q.push(i);
            attempts += 1;
        }
        let c = q.counters();
        assert_eq!(c.push_ok + c.push_full, attempts);
        assert_eq!(c.push_ok, 4);
        assert_eq!(c.push_full, 6);
    }

    #[test]
    fn test_push_many_partial() {
        let q: Queue<u32> = Queue::new(4);
        let mut items: VecDeque<u32> = (0..7).collect();
        let n = q.push_many(&mut items).unwrap();
        assert_eq!(n, 4);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], 4);
    }

    #[test]
    fn test_pull_many_partial() {
        let q: Queue<u32> = Queue::new(8);
        for i in 0..3 {
            q.push(i).unwrap();
        }
        let mut out = Vec::new();
        let n = q.pull_many(&mut out, 8).unwrap();
        assert_eq!(n, 3);
        assert_eq!(out, vec![0, 1, 2]);
    }

    #[test]
    fn test_drop_releases_queued_items() {
        let marker = Arc::new(());
        {
            let q: Queue<Arc<()>> = Queue::new(8);
            for _ in 0..5 {
                q.push(marker.clone()).unwrap();
            }
            assert_eq!(Arc::strong_count(&marker), 6);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_mpmc_stress() {
        let q = Arc::new(Queue::<u64>::new(64));
        let producers = 4;
        let per_producer = 10_000u64;

        let mut handles = Vec::new();
        for p in 0..producers {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    let v = (p as u64) << 32 | i;
                    loop {
                        match q.push(v) {
                            Ok(()) => break,
                            Err(PushError::Full(_)) => thread::yield_now(),
                            Err(PushError::Closed(_)) => panic!("closed"),
                        }
                    }
                }
            }));
        }

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut last_seen = vec![None::<u64>; producers];
                let mut total = 0u64;
                while total < producers as u64 * per_producer {
                    match q.pull() {
                        Ok(v) => {
                            let p = (v >> 32) as usize;
                            let i = v & 0xffff_ffff;
                            // Per-producer order is preserved.
                            if let Some(prev) = last_seen[p] {
                                assert!(i > prev);
                            }
                            last_seen[p] = Some(i);
                            total += 1;
                        }
                        Err(PullError::Empty) => thread::yield_now(),
                        Err(PullError::Closed) => panic!("closed"),
                    }
                }
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        consumer.join().unwrap();
    }

    #[test]
    fn test_close_race() {
        // Closing while producers push must hand back the closed verdict to
        // in-flight callers without losing or corrupting values.
        let q = Arc::new(Queue::<u64>::new(16));
        let pusher = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut pushed = 0u64;
                for i in 0..100_000u64 {
                    match q.push(i) {
                        Ok(()) => pushed += 1,
                        Err(PushError::Closed(_)) => break,
                        Err(PushError::Full(_)) => {}
                    }
                }
                pushed
            })
        };

        thread::sleep(std::time::Duration::from_millis(1));
        q.close();
        let _pushed = pusher.join().unwrap();
        assert_eq!(q.pull(), Err(PullError::Closed));
    }
}
