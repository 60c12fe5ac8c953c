/// Per-CPU multi-level feedback queue scheduler.
///
/// Each CPU owns `NLEVELS` run queues with their own locks and quanta;
/// selection takes the head of the highest non-empty level. A thread
/// that gives up the CPU with quantum remaining drops one priority
/// level, a thread preempted by the tick stays where it is.
///
/// `sched()` is called with exactly one lock held (the current thread's)
/// and returns with that same lock held; the scheduler loop adopts and
/// releases it on the far side of the context switch.

use crate::arch;
use crate::process::thread::{Thread, ThreadFlags, ThreadState};
use crate::smp;
use crate::sync::spinlock::SpinLock;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

pub const NLEVELS: usize = 4;
pub const MLFQ_HIGHEST: usize = NLEVELS - 1;
pub const MLFQ_LOWEST: usize = 0;

/// Quantum per level, in jiffies. Low-priority levels run longer
/// stretches, high-priority levels respond faster.
pub const QUANTA: [u64; NLEVELS] = [16, 8, 4, 2];

struct SchedLevel {
    q: SpinLock<VecDeque<Arc<Thread>>>,
}

impl SchedLevel {
    const fn new() -> Self {
        Self {
            q: SpinLock::new(VecDeque::new()),
        }
    }
}

struct Mlfq {
    levels: [SchedLevel; NLEVELS],
}

impl Mlfq {
    const fn new() -> Self {
        const LEVEL: SchedLevel = SchedLevel::new();
        Self {
            levels: [LEVEL; NLEVELS],
        }
    }
}

const MLFQ_INIT: Mlfq = Mlfq::new();
static MLFQS: [Mlfq; smp::MAX_CPUS] = [MLFQ_INIT; smp::MAX_CPUS];

fn runqueue_len(cpu: usize) -> usize {
    MLFQS[cpu].levels.iter().map(|l| l.q.lock().len()).sum()
}

/// Where a newly runnable thread should go: the least loaded online CPU,
/// falling back to the caller's.
fn target_cpu() -> usize {
    let mut best = smp::cpu_id();
    let mut best_load = usize::MAX;
    let mut any_online = false;
    for id in 0..smp::MAX_CPUS {
        if !smp::cpu(id).online.load(Ordering::Relaxed) {
            continue;
        }
        any_online = true;
        let load = runqueue_len(id);
        if load < best_load {
            best_load = load;
            best = id;
        }
    }
    if any_online {
        best
    } else {
        smp::cpu_id()
    }
}

/// Make a thread runnable: clamp its priority into the MLFQ bands,
/// refill its quantum, and queue it at the tail of its level.
///
/// The caller holds the thread lock.
pub fn sched_enqueue(thread: &Arc<Thread>) {
    thread.lock.assert_held();
    let inner = unsafe { thread.inner_locked() };

    let level = inner.prio.min(MLFQ_HIGHEST);
    inner.prio = level;
    inner.state = ThreadState::Ready;
    thread.timeslice.store(QUANTA[level], Ordering::Relaxed);

    let cpu = target_cpu();
    MLFQS[cpu].levels[level].q.lock().push_back(thread.clone());
}

/// Dequeue the head of the highest non-empty level on this CPU.
fn pick_next() -> Option<Arc<Thread>> {
    let mlfq = &MLFQS[smp::cpu_id()];
    for level in (0..NLEVELS).rev() {
        let mut q = mlfq.levels[level].q.lock();
        if let Some(th) = q.pop_front() {
            return Some(th);
        }
    }
    None
}

/// Give up the CPU. Called with the current thread's lock held; returns
/// with it held once the thread is dispatched again.
pub fn sched() {
    let current = smp::current().expect("sched() without a current thread");
    current.lock.assert_held();

    // woken before we managed to switch out: the wake already happened
    if current.test_flags(ThreadFlags::WAKE) {
        current.clear_flags(ThreadFlags::WAKE | ThreadFlags::PARK);
        return;
    }

    current.set_flags(ThreadFlags::NO_PREEMPT);

    // the scheduler stack always runs at preemption depth one
    let mut ncli = 1i32;
    let mut intena = false;
    smp::swap_preempt(&mut ncli, &mut intena);

    // unspent quantum means the thread blocked early: bias it down one
    // level so interactive threads drift toward the top bands
    if current.timeslice.load(Ordering::Relaxed) > 0 {
        let inner = unsafe { current.inner_locked() };
        if inner.prio > 0 {
            inner.prio -= 1;
        }
    }

    let ctx_slot = {
        let inner = unsafe { current.inner_locked() };
        &mut inner.ctx as *mut u64
    };
    let target = smp::this_cpu().sched_ctx.load(Ordering::Relaxed);
    unsafe { arch::switch_context(ctx_slot, target) };

    smp::swap_preempt(&mut ncli, &mut intena);
    current.clear_flags(ThreadFlags::NO_PREEMPT);
}

/// Voluntarily yield the CPU, staying runnable.
pub fn yield_now() {
    let current = match smp::current() {
        Some(c) => c,
        None => return,
    };
    current.clear_flags(ThreadFlags::YIELD_PENDING);
    smp::this_cpu().need_resched.store(false, Ordering::Relaxed);

    current.lock.lock();
    unsafe { current.inner_locked() }.state = ThreadState::Ready;
    sched();
    current.lock.unlock();
}

/// Preemption tick. Burns one jiffy of the running thread's quantum;
/// exhaustion marks the thread for yield, observed at the next
/// trap-return or voluntary block.
pub fn scheduler_tick() {
    let cpu = smp::this_cpu();
    cpu.timer_ticks.fetch_add(1, Ordering::Relaxed);

    let current = match smp::current() {
        Some(c) => c,
        None => return,
    };

    let left = current.timeslice.load(Ordering::Relaxed);
    let left = left.saturating_sub(1);
    current.timeslice.store(left, Ordering::Relaxed);
    if left == 0 {
        current.set_flags(ThreadFlags::YIELD_PENDING);
        cpu.need_resched.store(true, Ordering::Relaxed);
    }
}

pub fn need_resched() -> bool {
    smp::this_cpu().need_resched.load(Ordering::Relaxed)
}

/// First instruction of every thread's first quantum: release the lock
/// the scheduler dispatched us with, then fall through into the
/// bootstrap frame.
pub extern "C" fn thread_start() {
    if let Some(current) = smp::current() {
        current.lock.unlock();
    }
}

/// Where a kernel thread lands when its entry function returns. The
/// entry's return value is still in rax.
pub extern "C" fn thread_stop() {
    #[allow(unused_assignments)]
    let mut code: u64 = 0;
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("mov {0}, rax", out(reg) code, options(nomem, preserves_flags));
    }
    crate::process::exit::thread_exit(code as usize);
}

/// Per-CPU dispatch loop. Owns the CPU whenever no thread is runnable
/// and brokers the lock handoff around every context switch.
pub fn scheduler_loop() -> ! {
    let cpu = smp::this_cpu();
    cpu.online.store(true, Ordering::Relaxed);
    crate::info!("scheduler: cpu {} online", smp::cpu_id());

    loop {
        arch::intr_on();

        let next = match pick_next() {
            Some(th) => th,
            None => {
                cpu.idle.store(true, Ordering::Relaxed);
                arch::wait_for_interrupt();
                continue;
            }
        };

        cpu.idle.store(false, Ordering::Relaxed);
        next.lock.lock();
        unsafe { next.inner_locked() }.state = ThreadState::Running;
        let next_ctx = unsafe { next.inner_locked() }.ctx;
        smp::set_current(Some(next.clone()));
        // the dispatched thread releases this lock (thread_start on its
        // first quantum, sched_wait/yield afterwards)
        unsafe { next.lock.adopt() };
        cpu.context_switches.fetch_add(1, Ordering::Relaxed);

        let slot = &cpu.sched_ctx as *const _ as *mut u64;
        unsafe { arch::switch_context(slot, next_ctx) };

        // back on the scheduler stack: the outgoing thread's lock came
        // with us
        if let Some(prev) = smp::take_current() {
            unsafe { prev.lock.adopt() };
            let state = unsafe { prev.inner_locked() }.state;
            if state == ThreadState::Ready {
                sched_enqueue(&prev);
            }
            prev.lock.unlock();
        }
    }
}

/// Bring the scheduler up on the boot CPU and start the builtin worker
/// threads.
pub fn init() {
    crate::timer::spawn_worker();
    crate::info!(
        "scheduler: {} levels, quanta {:?} jiffies",
        NLEVELS,
        QUANTA
    );
}

#[cfg(test)]
pub(crate) fn with_runqueue<R>(cpu: usize, level: usize, f: impl FnOnce(&mut VecDeque<Arc<Thread>>) -> R) -> R {
    let mut q = MLFQS[cpu].levels[level].q.lock();
    f(&mut q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    fn drain_runqueues() {
        for level in 0..NLEVELS {
            with_runqueue(smp::cpu_id(), level, |q| q.clear());
        }
    }

    #[test]
    fn enqueue_places_thread_at_its_level() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        drain_runqueues();

        let th = test_utils::spawn_thread("rq");
        th.with_inner(|i| i.prio = 2);
        th.lock.lock();
        sched_enqueue(&th);
        th.lock.unlock();

        assert_eq!(th.state(), ThreadState::Ready);
        assert_eq!(th.timeslice.load(Ordering::Relaxed), QUANTA[2]);
        assert_eq!(with_runqueue(smp::cpu_id(), 2, |q| q.len()), 1);

        drain_runqueues();
        test_utils::retire_thread(&th);
    }

    #[test]
    fn enqueue_clamps_out_of_range_priority() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        drain_runqueues();

        let th = test_utils::spawn_thread("clamp");
        th.with_inner(|i| i.prio = 99);
        th.lock.lock();
        sched_enqueue(&th);
        th.lock.unlock();

        assert_eq!(th.with_inner(|i| i.prio), MLFQ_HIGHEST);

        drain_runqueues();
        test_utils::retire_thread(&th);
    }

    #[test]
    fn pick_next_prefers_the_highest_level() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        drain_runqueues();

        let low = test_utils::spawn_thread("low");
        let high = test_utils::spawn_thread("high");
        low.with_inner(|i| i.prio = MLFQ_LOWEST);
        high.with_inner(|i| i.prio = MLFQ_HIGHEST);

        for th in [&low, &high] {
            th.lock.lock();
            sched_enqueue(th);
            th.lock.unlock();
        }

        let first = pick_next().unwrap();
        assert!(Arc::ptr_eq(&first, &high));
        let second = pick_next().unwrap();
        assert!(Arc::ptr_eq(&second, &low));
        assert!(pick_next().is_none());

        test_utils::retire_thread(&low);
        test_utils::retire_thread(&high);
    }

    #[test]
    fn tick_burns_quantum_and_requests_yield() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("tick");
        th.timeslice.store(2, Ordering::Relaxed);
        test_utils::as_current(&th, || {
            scheduler_tick();
            assert!(!th.test_flags(ThreadFlags::YIELD_PENDING));
            scheduler_tick();
            assert!(th.test_flags(ThreadFlags::YIELD_PENDING));
            assert!(need_resched());
        });

        th.clear_flags(ThreadFlags::YIELD_PENDING);
        smp::this_cpu().need_resched.store(false, Ordering::Relaxed);
        test_utils::retire_thread(&th);
    }

    #[test]
    fn early_block_decays_one_level() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("decay");
        th.with_inner(|i| i.prio = 3);
        th.timeslice.store(5, Ordering::Relaxed); // quantum left: blocked early

        test_utils::as_current(&th, || {
            th.lock.lock();
            sched();
            th.lock.unlock();
        });
        assert_eq!(th.with_inner(|i| i.prio), 2);

        test_utils::retire_thread(&th);
    }

    #[test]
    fn exhausted_quantum_keeps_level() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("keeps");
        th.with_inner(|i| i.prio = 3);
        th.timeslice.store(0, Ordering::Relaxed); // preempted by the tick

        test_utils::as_current(&th, || {
            th.lock.lock();
            sched();
            th.lock.unlock();
        });
        assert_eq!(th.with_inner(|i| i.prio), 3);

        test_utils::retire_thread(&th);
    }

    #[test]
    fn priority_floor_is_zero() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("floor");
        th.with_inner(|i| i.prio = 0);
        th.timeslice.store(5, Ordering::Relaxed);

        test_utils::as_current(&th, || {
            th.lock.lock();
            sched();
            th.lock.unlock();
        });
        assert_eq!(th.with_inner(|i| i.prio), 0);

        test_utils::retire_thread(&th);
    }

    #[test]
    fn wake_flag_short_circuits_sched() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("wake");
        th.set_flags(ThreadFlags::WAKE | ThreadFlags::PARK);
        th.with_inner(|i| i.prio = 3);
        th.timeslice.store(5, Ordering::Relaxed);

        test_utils::as_current(&th, || {
            th.lock.lock();
            sched();
            th.lock.unlock();
        });

        // returned before the decay point, flags consumed
        assert!(!th.test_flags(ThreadFlags::WAKE | ThreadFlags::PARK));
        assert_eq!(th.with_inner(|i| i.prio), 3);

        test_utils::retire_thread(&th);
    }
}
