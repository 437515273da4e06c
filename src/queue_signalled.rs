//! Wakeup-capable wrapper around the MPMC ring.
//!
//! Producers stay non-blocking; consumers may poll, wait with a timeout or
//! block until data or close. The condvar handshake re-checks the ring under
//! the lock so wakeups cannot be missed.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::queue::{Closed, PullError, PushError, Queue, QueueCounters};

pub struct SignalledQueue<T> {
    queue: Queue<T>,
    lock: Mutex<()>,
    avail: Condvar,
}

impl<T> SignalledQueue<T> {
    pub fn new(size: usize) -> Self {
        SignalledQueue {
            queue: Queue::new(size),
            lock: Mutex::new(()),
            avail: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn available(&self) -> usize {
        self.queue.available()
    }

    /// Non-blocking push; wakes one waiting consumer on success.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        let r = self.queue.push(value);
        if r.is_ok() {
            let _guard = self.lock.lock();
            self.avail.notify_one();
        }
        r
    }

    /// Non-blocking pull.
    pub fn pull(&self) -> Result<T, PullError> {
        self.queue.pull()
    }

    /// Block until one item is available or the queue is closed.
    pub fn pull_blocking(&self) -> Result<T, Closed> {
        loop {
            match self.queue.pull() {
                Ok(v) => return Ok(v),
                Err(PullError::Closed) => return Err(Closed),
                Err(PullError::Empty) => {
                    let mut guard = self.lock.lock();
                    // Re-check under the lock: a producer that pushed between
                    // our pull and this point also took the lock to notify.
                    match self.queue.pull() {
                        Ok(v) => return Ok(v),
                        Err(PullError::Closed) => return Err(Closed),
                        Err(PullError::Empty) => {
                            self.avail.wait(&mut guard);
                        }
                    }
                }
            }
        }
    }

    /// Wait up to `timeout` for one item. `Ok(None)` on timeout.
    pub fn pull_timeout(&self, timeout: Duration) -> Result<Option<T>, Closed> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.queue.pull() {
                Ok(v) => return Ok(Some(v)),
                Err(PullError::Closed) => return Err(Closed),
                Err(PullError::Empty) => {
                    let mut guard = self.lock.lock();
                    match self.queue.pull() {
                        Ok(v) => return Ok(Some(v)),
                        Err(PullError::Closed) => return Err(Closed),
                        Err(PullError::Empty) => {
                            let now = std::time::Instant::now();
                            if now >= deadline {
                                return Ok(None);
                            }
                            if self.avail.wait_until(&mut guard, deadline).timed_out() {
                                // One final non-blocking look after the wait.
                                drop(guard);
                                return match self.queue.pull() {
                                    Ok(v) => Ok(Some(v)),
                                    Err(PullError::Closed) => Err(Closed),
                                    Err(PullError::Empty) => Ok(None),
                                };
                            }
                        }
                    }
                }
            }
        }
    }

    /// Block until at least one item, then drain up to `max` into `out`.
    pub fn pull_many_blocking(&self, out: &mut Vec<T>, max: usize) -> Result<usize, Closed> {
        if max == 0 {
            return Ok(0);
        }
        let first = self.pull_blocking()?;
        out.push(first);
        let mut n = 1;
        n += self.queue.pull_many(out, max - 1).unwrap_or(0);
        Ok(n)
    }

    /// Close the ring and wake every sleeper.
    pub fn close(&self) {
        self.queue.close();
        let _guard = self.lock.lock();
        self.avail.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn counters(&self) -> QueueCounters {
        self.queue.counters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_blocking_wakeup() {
        let q = Arc::new(SignalledQueue::<u32>::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pull_blocking())
        };

        thread::sleep(Duration::from_millis(20));
        q.push(42).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(42));
    }

    #[test]
    fn test_timeout_elapses() {
        let q = SignalledQueue::<u32>::new(4);
        let start = std::time::Instant::now();
        let r = q.pull_timeout(Duration::from_millis(30)).unwrap();
        assert!(r.is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_close_wakes_sleeper() {
        let q = Arc::new(SignalledQueue::<u32>::new(4));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pull_blocking())
        };

        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), Err(Closed));
    }

    #[test]
    fn test_pull_many_blocking_drains_burst() {
        let q = Arc::new(SignalledQueue::<u32>::new(16));
        for i in 0..5 {
            q.push(i).unwrap();
        }
        let mut out = Vec::new();
        let n = q.pull_many_blocking(&mut out, 8).unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }
}
