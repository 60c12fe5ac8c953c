/// Blocking mutex with a recursive variant.
///
/// A spinning guard protects the fields; contended lockers sleep on the
/// wait queue with the guard released and re-checked on wake. Taking
/// the non-recursive lock twice from the same thread is a fatal
/// invariant violation.

use crate::process::thread::{self, ThreadState, Tid, WakeupReason};
use crate::process::wait::{self, WaitQueue, Whence};
use crate::sync::spinlock::SpinLock;

struct MutexInner {
    locked: bool,
    recursion: u32,
    owner: Option<Tid>,
}

pub struct Mutex {
    guard: SpinLock<MutexInner>,
    waiters: WaitQueue,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            guard: SpinLock::new(MutexInner {
                locked: false,
                recursion: 0,
                owner: None,
            }),
            waiters: WaitQueue::new(),
        }
    }

    fn owner_is_current(inner: &MutexInner) -> bool {
        match (inner.owner, thread::current_tid()) {
            (Some(owner), Some(me)) => owner == me,
            _ => false,
        }
    }

    fn lock_common(&self, recursive: bool) {
        let raw = self.guard.raw();
        raw.lock();
        loop {
            let inner = unsafe { self.guard.data_unchecked() };

            if inner.locked && Self::owner_is_current(inner) {
                if recursive {
                    inner.recursion += 1;
                    break;
                }
                panic!("mutex relock by owner (tid {:?})", inner.owner);
            }

            if !inner.locked {
                inner.locked = true;
                inner.recursion = 1;
                inner.owner = thread::current_tid();
                break;
            }

            // held by someone else: sleep with the guard released, then
            // re-check the predicate (wakeups may be spurious)
            let _ = wait::sched_wait(
                &self.waiters,
                ThreadState::Sleep,
                Whence::Tail,
                Some(raw),
            );
        }
        raw.unlock();
    }

    pub fn lock(&self) {
        self.lock_common(false);
    }

    /// Owner re-entry bumps the recursion depth instead of deadlocking.
    pub fn recursive_lock(&self) {
        self.lock_common(true);
    }

    pub fn try_lock(&self) -> bool {
        let raw = self.guard.raw();
        raw.lock();
        let inner = unsafe { self.guard.data_unchecked() };
        let taken = if inner.locked {
            assert!(
                !Self::owner_is_current(inner),
                "mutex try_lock by its owner"
            );
            false
        } else {
            inner.locked = true;
            inner.recursion = 1;
            inner.owner = thread::current_tid();
            true
        };
        raw.unlock();
        taken
    }

    pub fn unlock(&self) {
        let raw = self.guard.raw();
        raw.lock();
        let inner = unsafe { self.guard.data_unchecked() };

        assert!(
            inner.locked && Self::owner_is_current(inner),
            "mutex unlock while not holding it"
        );
        assert!(inner.recursion > 0, "mutex recursion underflow");

        inner.recursion -= 1;
        if inner.recursion == 0 {
            inner.locked = false;
            inner.owner = None;
            let _ = wait::sched_wakeup(&self.waiters, WakeupReason::Normal, Whence::Head);
        }
        raw.unlock();
    }

    pub fn is_locked(&self) -> bool {
        let raw = self.guard.raw();
        raw.lock();
        let locked = unsafe { self.guard.data_unchecked() }.locked;
        raw.unlock();
        locked
    }

    pub fn held_by_current(&self) -> bool {
        let raw = self.guard.raw();
        raw.lock();
        let held = {
            let inner = unsafe { self.guard.data_unchecked() };
            inner.locked && Self::owner_is_current(inner)
        };
        raw.unlock();
        held
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
