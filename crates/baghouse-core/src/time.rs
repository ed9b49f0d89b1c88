//! Bag Timestamps
//!
//! Messages are stamped with a `(sec, nsec)` pair. On disk a time is eight
//! bytes: `sec` as a little-endian u32 followed by `nsec` as a little-endian
//! u32. Ordering is lexicographic on `(sec, nsec)`, which the derived `Ord`
//! provides since the fields are declared in that order.
//!
//! `Time::MIN` is `(0, 1)` — the smallest timestamp a message may carry.
//! `(0, 0)` is reserved as "unset" and the writer rejects it.

use serde::{Deserialize, Serialize};

/// A `(sec, nsec)` timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Time {
    pub sec: u32,
    pub nsec: u32,
}

impl Time {
    /// Smallest timestamp a recorded message may carry.
    pub const MIN: Time = Time { sec: 0, nsec: 1 };

    /// Largest representable timestamp.
    pub const MAX: Time = Time {
        sec: u32::MAX,
        nsec: u32::MAX,
    };

    pub const fn new(sec: u32, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Whole-second timestamp.
    pub const fn from_sec(sec: u32) -> Self {
        Self { sec, nsec: 0 }
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_by_sec_then_nsec() {
        assert!(Time::new(1, 0) < Time::new(2, 0));
        assert!(Time::new(1, 5) < Time::new(1, 6));
        assert!(Time::new(1, 999_999_999) < Time::new(2, 0));
        assert_eq!(Time::new(3, 3), Time::new(3, 3));
    }

    #[test]
    fn test_min_is_just_above_zero() {
        assert!(Time::new(0, 0) < Time::MIN);
        assert!(Time::MIN <= Time::new(0, 1));
        assert!(Time::MIN < Time::new(0, 2));
    }

    #[test]
    fn test_max_dominates() {
        assert!(Time::new(u32::MAX, 0) < Time::MAX);
        assert!(Time::from_sec(1_700_000_000) < Time::MAX);
    }

    #[test]
    fn test_display() {
        assert_eq!(Time::new(12, 34).to_string(), "12.000000034");
    }

    #[test]
    fn test_serde_roundtrip() {
        let t = Time::new(10, 20);
        let json = serde_json::to_string(&t).expect("serialize");
        let back: Time = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(t, back);
    }
}
