/// Jiffies timekeeping.
///
/// The timer interrupt advances a process-wide monotonic counter at
/// `SYS_HZ`; every deadline in the kernel is an absolute jiffies value.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt frequency: one jiffy per millisecond.
pub const SYS_HZ: u64 = 1000;

pub type Jiffies = u64;

static JIFFIES: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn jiffies() -> Jiffies {
    JIFFIES.load(Ordering::Relaxed)
}

/// Advance the counter by one tick. Called from the timer interrupt.
pub fn jiffies_update() -> Jiffies {
    JIFFIES.fetch_add(1, Ordering::Relaxed) + 1
}

#[cfg(test)]
pub fn advance(n: Jiffies) {
    JIFFIES.fetch_add(n, Ordering::Relaxed);
}

/// Wrapping "a after b" comparison, safe across counter rollover.
#[inline]
pub fn time_after(a: Jiffies, b: Jiffies) -> bool {
    (a.wrapping_sub(b) as i64) > 0
}

#[inline]
pub fn time_before(a: Jiffies, b: Jiffies) -> bool {
    time_after(b, a)
}

#[inline]
pub fn time_after_eq(a: Jiffies, b: Jiffies) -> bool {
    !time_before(a, b)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

impl TimeSpec {
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    pub const ZERO: TimeSpec = TimeSpec::new(0, 0);

    pub fn is_valid(&self) -> bool {
        self.sec >= 0 && self.nsec >= 0 && self.nsec < NSEC_PER_SEC
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

pub fn jiffies_from_timespec(ts: &TimeSpec) -> Jiffies {
    (ts.sec as u64) * SYS_HZ + (ts.nsec as u64) / 1_000_000
}

pub fn jiffies_to_timespec(j: Jiffies) -> TimeSpec {
    TimeSpec {
        sec: (j / SYS_HZ) as i64,
        nsec: ((j % SYS_HZ) * 1_000_000) as i64,
    }
}

/// Clock resolution: one jiffy.
pub fn resolution() -> TimeSpec {
    TimeSpec {
        sec: 0,
        nsec: NSEC_PER_SEC / SYS_HZ as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_roundtrip() {
        let ts = TimeSpec::new(2, 250_000_000);
        let j = jiffies_from_timespec(&ts);
        assert_eq!(j, 2250);
        assert_eq!(jiffies_to_timespec(j), ts);
    }

    #[test]
    fn sub_jiffy_resolution_truncates() {
        let ts = TimeSpec::new(0, 999_999);
        assert_eq!(jiffies_from_timespec(&ts), 0);
    }

    #[test]
    fn wrapping_comparisons() {
        assert!(time_after(5, 3));
        assert!(time_before(3, 5));
        assert!(time_after(2, u64::MAX - 1)); // across rollover
        assert!(time_after_eq(7, 7));
    }

    #[test]
    fn validation() {
        assert!(TimeSpec::new(0, 0).is_valid());
        assert!(!TimeSpec::new(-1, 0).is_valid());
        assert!(!TimeSpec::new(0, NSEC_PER_SEC).is_valid());
    }
}
