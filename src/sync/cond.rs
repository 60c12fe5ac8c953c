/// Condition variable built on the scheduler's wait/wakeup contract.
///
/// The counter tracks outstanding waits: `wait` increments and blocks
/// while the previous value was non-negative, `signal` wakes one and
/// decrements, `broadcast` wakes all and resets to 0 (or -1 when nobody
/// was there, which lets the next `wait` fall straight through).

use crate::error::Result;
use crate::process::thread::{ThreadState, WakeupReason};
use crate::process::wait::{self, WaitQueue, Whence};
use crate::sync::spinlock::{RawLock, SpinLock};
use core::sync::atomic::{AtomicI64, Ordering};

pub struct CondVar {
    count: AtomicI64,
    waiters: WaitQueue,
    lock: SpinLock<()>,
}

impl CondVar {
    pub fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            waiters: WaitQueue::new(),
            lock: SpinLock::new(()),
        }
    }

    /// Block until signalled. An external lock, when given, is released
    /// on suspend and re-acquired before returning; a wait that never
    /// suspends leaves it held throughout.
    pub fn wait(&self, external: Option<&RawLock>) -> Result<()> {
        self.lock.raw().lock();
        let suspend = self.count.fetch_add(1, Ordering::AcqRel) >= 0;
        let res = if suspend {
            if let Some(ext) = external {
                ext.unlock();
            }
            wait::sched_wait(
                &self.waiters,
                ThreadState::Sleep,
                Whence::Tail,
                Some(self.lock.raw()),
            )
        } else {
            // a broadcast ran with nobody waiting: consume it without
            // giving up the CPU or the caller's lock
            Ok(())
        };
        self.lock.raw().unlock();

        if suspend {
            if let Some(ext) = external {
                ext.lock();
            }
        }
        res
    }

    /// Wake the oldest waiter.
    pub fn signal(&self) {
        self.lock.raw().lock();
        let _ = wait::sched_wakeup(&self.waiters, WakeupReason::Normal, Whence::Head);
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.lock.raw().unlock();
    }

    /// Wake everyone; a broadcast into an empty queue pre-arms the next
    /// wait.
    pub fn broadcast(&self) {
        self.lock.raw().lock();
        let woken = wait::sched_wakeup_all(&self.waiters, WakeupReason::Normal);
        let reset = if woken == 0 { -1 } else { 0 };
        self.count.store(reset, Ordering::Release);
        self.lock.raw().unlock();
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
