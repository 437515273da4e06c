//! Wall-clock timestamps with nanosecond resolution.

use std::time::{SystemTime, UNIX_EPOCH};

pub const NSEC_PER_SEC: u32 = 1_000_000_000;

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn new(sec: i64, nsec: u32) -> Self {
        Timestamp { sec, nsec }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos(),
        }
    }

    /// Difference `other - self` in seconds.
    pub fn delta(&self, other: &Timestamp) -> f64 {
        (other.sec - self.sec) as f64 + (other.nsec as f64 - self.nsec as f64) * 1e-9
    }

    pub fn as_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 * 1e-9
    }

    pub fn from_f64(t: f64) -> Self {
        let sec = t.floor();
        Timestamp {
            sec: sec as i64,
            nsec: ((t - sec) * 1e9).round().min((NSEC_PER_SEC - 1) as f64) as u32,
        }
    }

    /// Add a (possibly negative) offset in seconds.
    pub fn add_secs(&self, offset: f64) -> Self {
        Timestamp::from_f64(self.as_f64() + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta() {
        let a = Timestamp::new(100, 500_000_000);
        let b = Timestamp::new(101, 750_000_000);
        assert!((a.delta(&b) - 1.25).abs() < 1e-9);
        assert!((b.delta(&a) + 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_f64_roundtrip() {
        let a = Timestamp::new(42, 125_000_000);
        let b = Timestamp::from_f64(a.as_f64());
        assert_eq!(a.sec, b.sec);
        assert!((a.nsec as i64 - b.nsec as i64).abs() < 1000);
    }

    #[test]
    fn test_add_secs() {
        let a = Timestamp::new(10, 900_000_000);
        let b = a.add_secs(0.2);
        assert_eq!(b.sec, 11);
        assert!((b.nsec as i64 - 100_000_000).abs() < 1000);
    }
}
