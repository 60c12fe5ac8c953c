/// Await-event: a counting event in the semaphore family.
///
/// `await_event` blocks until the count is positive and consumes one
/// unit; `signal` adds a unit and releases one waiter; `broadcast`
/// releases everyone without adding units (their predicate re-check
/// decides).

use crate::error::{Errno, Result};
use crate::process::thread::{self, ThreadState, WakeupReason};
use crate::process::wait::{self, WaitQueue, Whence};
use crate::sync::spinlock::SpinLock;
use crate::time::TimeSpec;
use core::sync::atomic::{AtomicI64, Ordering};

pub struct AwaitEvent {
    count: AtomicI64,
    waiters: WaitQueue,
    lock: SpinLock<()>,
}

impl AwaitEvent {
    pub fn new() -> Self {
        Self::with_count(0)
    }

    pub fn with_count(count: i64) -> Self {
        Self {
            count: AtomicI64::new(count),
            waiters: WaitQueue::new(),
            lock: SpinLock::new(()),
        }
    }

    /// Wait until a unit is available, then take it.
    pub fn await_event(&self) -> Result<()> {
        let raw = self.lock.raw();
        raw.lock();
        while self.count.load(Ordering::Acquire) <= 0 {
            if let Err(err) =
                wait::sched_wait(&self.waiters, ThreadState::Sleep, Whence::Tail, Some(raw))
            {
                raw.unlock();
                return Err(err);
            }
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        raw.unlock();
        Ok(())
    }

    /// `await_event` with a jiffies deadline; `ETIMEDOUT` when it
    /// passes first.
    pub fn await_event_timed(&self, timeout: &TimeSpec) -> Result<()> {
        if !timeout.is_valid() {
            return Err(Errno::EINVAL);
        }
        let current = thread::current().ok_or(Errno::EINVAL)?;
        let timer = crate::timer::arm_wake(current.tid, timeout)?;

        let res = self.await_event();
        crate::timer::cancel(timer);
        res
    }

    /// Take a unit only if one is available right now.
    pub fn try_await(&self) -> bool {
        let raw = self.lock.raw();
        raw.lock();
        let ok = self.count.load(Ordering::Acquire) > 0;
        if ok {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        raw.unlock();
        ok
    }

    /// Add a unit and release one waiter.
    pub fn signal(&self) {
        let raw = self.lock.raw();
        raw.lock();
        self.count.fetch_add(1, Ordering::AcqRel);
        let _ = wait::sched_wakeup(&self.waiters, WakeupReason::Normal, Whence::Head);
        raw.unlock();
    }

    /// Release every waiter.
    pub fn broadcast(&self) {
        let raw = self.lock.raw();
        raw.lock();
        wait::sched_wakeup_all(&self.waiters, WakeupReason::Normal);
        raw.unlock();
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for AwaitEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn signal_then_await_consumes_unit() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("ev");

        let ev = AwaitEvent::new();
        ev.signal();
        assert_eq!(ev.count(), 1);

        test_utils::as_current(&th, || {
            ev.await_event().unwrap();
        });
        assert_eq!(ev.count(), 0);

        test_utils::retire_thread(&th);
    }

    #[test]
    fn try_await_refuses_empty() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("ev-try");

        let ev = AwaitEvent::new();
        test_utils::as_current(&th, || {
            assert!(!ev.try_await());
            ev.signal();
            assert!(ev.try_await());
            assert!(!ev.try_await());
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn cancellation_interrupts_wait() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("ev-cancel");

        let ev = AwaitEvent::new();
        th.set_flags(crate::process::thread::ThreadFlags::CANCELED);
        test_utils::as_current(&th, || {
            assert_eq!(ev.await_event(), Err(Errno::EINTR));
        });
        th.clear_flags(crate::process::thread::ThreadFlags::CANCELED);

        test_utils::retire_thread(&th);
    }
}
