//! Injectable time source.
//!
//! Every timeout, retry, epoch derivation, and freshness check in the
//! runtime reads time through [`Clock`], so tests substitute a
//! [`MockClock`] and step it explicitly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// Current UNIX time in seconds.
    fn now_unix(&self) -> u64;

    /// Monotonic milliseconds for timers and backoff schedules.
    fn now_millis(&self) -> u64;
}

/// The real clock.
pub struct SystemClock {
    started: std::time::Instant,
}

impl SystemClock {
    /// Create a system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Deterministic clock for tests.
///
/// Starts at a fixed UNIX time and only moves when advanced.
pub struct MockClock {
    unix_ms: AtomicU64,
}

impl MockClock {
    /// Create a mock clock at the given UNIX time.
    #[must_use]
    pub fn at_unix(unix_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            unix_ms: AtomicU64::new(unix_secs * 1000),
        })
    }

    /// Advance the clock.
    pub fn advance(&self, by: Duration) {
        self.unix_ms
            .fetch_add(u64::try_from(by.as_millis()).unwrap_or(0), Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_unix(&self) -> u64 {
        self.unix_ms.load(Ordering::SeqCst) / 1000
    }

    fn now_millis(&self) -> u64 {
        self.unix_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_progresses() {
        let clock = SystemClock::new();
        assert!(clock.now_unix() > 1_600_000_000);
        let first = clock.now_millis();
        assert!(clock.now_millis() >= first);
    }

    #[test]
    fn test_mock_clock_fixed_until_advanced() {
        let clock = MockClock::at_unix(1_700_000_000);
        assert_eq!(clock.now_unix(), 1_700_000_000);
        assert_eq!(clock.now_unix(), 1_700_000_000);

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now_unix(), 1_700_000_005);
        assert_eq!(clock.now_millis(), 1_700_000_005_000);
    }

    #[test]
    fn test_mock_clock_subsecond() {
        let clock = MockClock::at_unix(100);
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now_unix(), 100);
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now_unix(), 101);
    }
}
