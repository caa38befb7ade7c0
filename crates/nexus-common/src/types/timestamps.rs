//! Timestamp type for on-disk records.
//!
//! Record headers, temp log entries and backup descriptors store wall-clock
//! time as 32-bit seconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, as stored on disk.
///
/// # Example
///
/// ```rust
/// use nexus_common::types::Timestamp;
///
/// let ts = Timestamp::from_secs(100);
/// assert!(ts.add_secs(60).has_passed(Timestamp::from_secs(160)));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(u32);

impl Timestamp {
    /// Zero timestamp (epoch).
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from seconds since the Unix epoch.
    #[inline]
    #[must_use]
    pub const fn from_secs(secs: u32) -> Self {
        Self(secs)
    }

    /// Creates a timestamp from the current system time.
    #[must_use]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(u32::try_from(duration.as_secs()).unwrap_or(u32::MAX))
    }

    /// Returns the timestamp as seconds since the Unix epoch.
    #[inline]
    #[must_use]
    pub const fn as_secs(self) -> u32 {
        self.0
    }

    /// Adds a number of seconds, saturating.
    #[inline]
    #[must_use]
    pub fn add_secs(self, secs: u64) -> Self {
        let secs = u32::try_from(secs).unwrap_or(u32::MAX);
        Self(self.0.saturating_add(secs))
    }

    /// Returns true if `now` is at or after this timestamp.
    #[inline]
    #[must_use]
    pub fn has_passed(self, now: Self) -> bool {
        now.0 >= self.0
    }

    /// Returns the time left until this timestamp, measured from `now`.
    #[must_use]
    pub fn remaining(self, now: Self) -> Duration {
        Duration::from_secs(u64::from(self.0.saturating_sub(now.0)))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}s)", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Timestamp {
    #[inline]
    fn from(secs: u32) -> Self {
        Self::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(Timestamp::now().as_secs() > 1_577_836_800);
    }

    #[test]
    fn test_expiry_arithmetic() {
        let queued = Timestamp::from_secs(1_000);
        let expiry = queued.add_secs(600);
        assert!(!expiry.has_passed(Timestamp::from_secs(1_599)));
        assert!(expiry.has_passed(Timestamp::from_secs(1_600)));
        assert_eq!(expiry.remaining(Timestamp::from_secs(1_500)), Duration::from_secs(100));
        assert_eq!(expiry.remaining(Timestamp::from_secs(2_000)), Duration::ZERO);
        assert_eq!(Timestamp::from_secs(u32::MAX).add_secs(5).as_secs(), u32::MAX);
    }
}
