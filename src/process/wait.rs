/// Wait queues: ordered sets of blocked threads with node-level detach.
///
/// The queue owns the entries; a queued thread stores only a back-pointer
/// that is cleared on detach, so `back-pointer set <=> linked` holds at
/// every step. The queue lock is always taken before the thread lock of
/// an entry being detached.

use crate::error::{Errno, Result};
use crate::process::scheduler;
use crate::process::thread::{Thread, ThreadFlags, ThreadState, Tid, WakeupReason};
use crate::sync::spinlock::{RawLock, SpinLock};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// Insertion/selection end of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Head,
    Tail,
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

pub struct WaitQueueInner {
    pub id: u64,
    q: SpinLock<VecDeque<Arc<Thread>>>,
}

#[derive(Clone)]
pub struct WaitQueue {
    inner: Arc<WaitQueueInner>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitQueueInner {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                q: SpinLock::new(VecDeque::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.q.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether `thread` is currently linked into this queue.
    pub fn contains(&self, thread: &Arc<Thread>) -> bool {
        self.inner.q.lock().iter().any(|t| Arc::ptr_eq(t, thread))
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Interruption check: consumes a pending wakeup reason and reports how
/// the blocked call should return. Cancellation and signal wakes map to
/// `EINTR`, deadline wakes to `ETIMEDOUT`. For interruptible sleeps a
/// deliverable pending signal interrupts even before the thread parks,
/// which is what makes `sigsuspend` atomic.
///
/// The caller must hold the thread lock.
pub fn check_interruption(thread: &Arc<Thread>, interruptible: bool) -> Result<()> {
    let inner = unsafe { thread.inner_locked() };

    let reason = inner.wakeup;
    if reason != WakeupReason::None {
        inner.wakeup = WakeupReason::None;
    }

    if thread.test_flags(ThreadFlags::CANCELED) {
        return Err(Errno::EINTR);
    }

    match reason {
        WakeupReason::Signal => return Err(Errno::EINTR),
        WakeupReason::Timeout => return Err(Errno::ETIMEDOUT),
        _ => {}
    }

    if interruptible && crate::process::signal::has_deliverable(thread) {
        return Err(Errno::EINTR);
    }

    Ok(())
}

/// Block the calling thread on `queue`.
///
/// Inserts at `whence`, transitions to `state` (SLEEP or STOPPED), drops
/// the external lock if one was passed, and yields the CPU. On resume
/// the external lock is re-acquired and the interruption status of the
/// wake is returned. Spurious wakeups are possible; callers re-check
/// their predicate.
pub fn sched_wait(
    queue: &WaitQueue,
    state: ThreadState,
    whence: Whence,
    external: Option<&RawLock>,
) -> Result<()> {
    if !state.is_blocked() {
        return Err(Errno::EINVAL);
    }
    let current = crate::smp::current().ok_or(Errno::EINVAL)?;
    let interruptible = state == ThreadState::Sleep;

    let mut q = queue.inner.q.lock();
    current.lock.lock();

    if let Err(err) = check_interruption(&current, interruptible) {
        current.lock.unlock();
        drop(q);
        return Err(err);
    }

    debug_assert!(
        !q.iter().any(|t| Arc::ptr_eq(t, &current)),
        "thread {} already linked into wait queue {}",
        current.tid,
        queue.id()
    );

    match whence {
        Whence::Head => q.push_front(current.clone()),
        Whence::Tail => q.push_back(current.clone()),
    }

    {
        let inner = unsafe { current.inner_locked() };
        inner.wait_queue = Some(Arc::downgrade(&queue.inner));
        inner.state = state;
    }

    drop(q);

    if let Some(lock) = external {
        lock.unlock();
    }

    scheduler::sched();

    if let Some(lock) = external {
        lock.lock();
    }

    let res = check_interruption(&current, interruptible);
    current.lock.unlock();
    res
}

/// Detach `thread` (whose lock is held, as is the queue lock via `q`)
/// and hand it back to the run queue.
fn detach_and_wake_locked(
    q: &mut VecDeque<Arc<Thread>>,
    thread: &Arc<Thread>,
    reason: WakeupReason,
) -> Result<()> {
    let state = unsafe { thread.inner_locked() }.state;
    if !state.is_blocked() {
        crate::debug!(
            "thread {}: on a wait queue but {} rather than blocked",
            thread.tid,
            state.name()
        );
        return Err(Errno::EINVAL);
    }

    let pos = q
        .iter()
        .position(|t| Arc::ptr_eq(t, thread))
        .ok_or(Errno::ESRCH)?;
    q.remove(pos);

    let inner = unsafe { thread.inner_locked() };
    inner.wait_queue = None;

    if thread.test_flags(ThreadFlags::PARK) {
        thread.clear_flags(ThreadFlags::PARK);
        thread.set_flags(ThreadFlags::WAKE);
    }
    inner.wakeup = reason;

    scheduler::sched_enqueue(thread);
    Ok(())
}

/// Wake one thread from `whence`. `ESRCH` when the queue is empty.
pub fn sched_wakeup(queue: &WaitQueue, reason: WakeupReason, whence: Whence) -> Result<()> {
    let mut q = queue.inner.q.lock();

    let candidate = match whence {
        Whence::Head => q.front().cloned(),
        Whence::Tail => q.back().cloned(),
    };
    let thread = candidate.ok_or(Errno::ESRCH)?;

    thread.lock.lock();
    let res = detach_and_wake_locked(&mut q, &thread, reason);
    thread.lock.unlock();
    res
}

/// Wake a specific tid if it is on this queue.
pub fn sched_wakeup_specific(queue: &WaitQueue, reason: WakeupReason, tid: Tid) -> Result<()> {
    if tid <= 0 {
        return Err(Errno::EINVAL);
    }
    let mut q = queue.inner.q.lock();
    let thread = q
        .iter()
        .find(|t| t.tid == tid)
        .cloned()
        .ok_or(Errno::ESRCH)?;

    thread.lock.lock();
    let res = detach_and_wake_locked(&mut q, &thread, reason);
    thread.lock.unlock();
    res
}

/// Wake every thread on the queue, returning how many were released.
pub fn sched_wakeup_all(queue: &WaitQueue, reason: WakeupReason) -> usize {
    let mut count = 0;
    loop {
        let mut q = queue.inner.q.lock();
        let thread = match q.front().cloned() {
            Some(t) => t,
            None => break,
        };
        thread.lock.lock();
        let res = detach_and_wake_locked(&mut q, &thread, reason);
        thread.lock.unlock();
        drop(q);
        match res {
            Ok(()) => count += 1,
            Err(_) => break,
        }
    }
    count
}

/// Wake a thread wherever it is blocked. Honors the queue-before-thread
/// lock order by re-validating queue membership after the locks are
/// re-taken in canonical order.
pub fn thread_wakeup(thread: &Arc<Thread>, reason: WakeupReason) -> Result<()> {
    loop {
        thread.lock.lock();
        let inner = unsafe { thread.inner_locked() };

        if !inner.state.is_blocked() {
            // running or already runnable: mark the wake so an imminent
            // park returns immediately
            if inner.state == ThreadState::Running || inner.state == ThreadState::Ready {
                if thread.test_flags(ThreadFlags::PARK) {
                    thread.clear_flags(ThreadFlags::PARK);
                    thread.set_flags(ThreadFlags::WAKE);
                }
            }
            thread.lock.unlock();
            return Ok(());
        }

        let wq = inner.wait_queue.as_ref().and_then(|w| w.upgrade());
        match wq {
            None => {
                // blocked off-queue (parked)
                if thread.test_flags(ThreadFlags::PARK) {
                    thread.clear_flags(ThreadFlags::PARK);
                    thread.set_flags(ThreadFlags::WAKE);
                }
                inner.wakeup = reason;
                scheduler::sched_enqueue(thread);
                thread.lock.unlock();
                return Ok(());
            }
            Some(qinner) => {
                thread.lock.unlock();

                let mut q = qinner.q.lock();
                thread.lock.lock();
                let still_here = unsafe { thread.inner_locked() }
                    .wait_queue
                    .as_ref()
                    .and_then(|w| w.upgrade())
                    .map_or(false, |cur| Arc::ptr_eq(&cur, &qinner));
                if still_here {
                    let res = detach_and_wake_locked(&mut q, thread, reason);
                    thread.lock.unlock();
                    return res;
                }
                // migrated or woken concurrently; retry from scratch
                thread.lock.unlock();
            }
        }
    }
}
