/// Owner-tracking spinlock with per-CPU preemption-depth nesting.
///
/// `lock` disables local interrupts (bumping the CPU's preemption depth),
/// spins on a test-and-set, then records the owner (thread id when a
/// thread exists, CPU id otherwise) and the acquisition site. Double
/// acquire by the same owner is a fatal invariant violation; the
/// `recursive_lock` variant exists only for idempotent re-entry and tells
/// the caller whether the matching unlock must be skipped.

use crate::smp;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::panic::Location;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

const OWNER_NONE: u64 = u64::MAX;
const OWNER_THREAD_BIT: u64 = 1 << 63;

/// Identity of the would-be owner: the current thread if one is
/// installed on this CPU, the CPU itself during early boot and inside
/// the scheduler loop.
fn owner_key() -> u64 {
    match crate::process::thread::current_tid() {
        Some(tid) => OWNER_THREAD_BIT | tid as u64,
        None => smp::cpu_id() as u64,
    }
}

pub struct RawLock {
    locked: AtomicBool,
    owner: AtomicU64,
    site: AtomicPtr<Location<'static>>,
}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(OWNER_NONE),
            site: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Whether the calling thread/CPU holds this lock. Only meaningful
    /// with interrupts off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == owner_key()
    }

    #[track_caller]
    pub fn lock(&self) {
        smp::push_off();
        assert!(
            !self.holding(),
            "spinlock double acquire at {} (first at {:?})",
            Location::caller(),
            self.site_str()
        );
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        self.owner.store(owner_key(), Ordering::Relaxed);
        self.site.store(
            Location::caller() as *const _ as *mut _,
            Ordering::Relaxed,
        );
    }

    pub fn unlock(&self) {
        assert!(self.holding(), "spinlock unlock of a lock not held");
        self.owner.store(OWNER_NONE, Ordering::Relaxed);
        self.site.store(core::ptr::null_mut(), Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        smp::pop_off();
    }

    /// Idempotent re-entry: acquires unless already held by this owner.
    /// Returns `true` when this call took the lock (the caller owes the
    /// unlock) and `false` when it was already held (skip the unlock).
    #[track_caller]
    pub fn recursive_lock(&self) -> bool {
        smp::push_off();
        let held = self.holding();
        smp::pop_off();
        if held {
            return false;
        }
        self.lock();
        true
    }

    #[track_caller]
    pub fn try_lock(&self) -> bool {
        smp::push_off();
        if self.holding() {
            smp::pop_off();
            return false;
        }
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(owner_key(), Ordering::Relaxed);
            self.site.store(
                Location::caller() as *const _ as *mut _,
                Ordering::Relaxed,
            );
            true
        } else {
            smp::pop_off();
            false
        }
    }

    pub fn assert_held(&self) {
        assert!(self.holding(), "caller must hold the lock");
    }

    /// Retag the recorded owner to the caller's identity. Used on the
    /// two edges of the scheduler handoff, where a lock acquired on one
    /// stack is released from another.
    ///
    /// # Safety
    /// The lock must be held, and the previous owner must have ceded it
    /// (it is suspended or has not started running).
    pub unsafe fn adopt(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.owner.store(owner_key(), Ordering::Relaxed);
    }

    fn site_str(&self) -> Option<&'static Location<'static>> {
        let p = self.site.load(Ordering::Relaxed);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Data-carrying spinlock. `lock()` hands out an RAII guard; the raw
/// handle is exposed for the blocking primitives, which release the
/// guard lock around a `sched_wait`.
pub struct SpinLock<T: ?Sized> {
    raw: RawLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawLock::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    pub fn raw(&self) -> &RawLock {
        &self.raw
    }

    pub fn is_held(&self) -> bool {
        smp::push_off();
        let held = self.raw.holding();
        smp::pop_off();
        held
    }

    /// Access the protected data while the raw lock is held manually.
    ///
    /// # Safety
    /// The caller must hold `self.raw()`.
    pub unsafe fn data_unchecked(&self) -> &mut T {
        debug_assert!(self.raw.holding());
        &mut *self.data.get()
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
