/// Per-CPU state.
///
/// Each logical CPU owns a preemption-disable depth (`ncli`) with the
/// interrupt-enable state captured at depth 1 (`intena`), its current
/// thread slot, and scheduler bookkeeping. Cross-CPU data lives behind
/// spinlocks; everything here is only touched by its owning CPU or by
/// atomics.

use crate::arch;
use crate::process::thread::Thread;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

pub const MAX_CPUS: usize = 8;

pub struct CpuLocal {
    /// Preemption-disable nesting depth.
    pub ncli: AtomicI32,
    /// Interrupt-enable state captured when `ncli` went 0 -> 1.
    pub intena: AtomicBool,
    pub need_resched: AtomicBool,
    pub idle: AtomicBool,
    /// Set once this CPU's scheduler loop is running.
    pub online: AtomicBool,
    pub timer_ticks: AtomicU64,
    pub context_switches: AtomicU64,
    /// Saved context of this CPU's scheduler loop.
    pub sched_ctx: AtomicU64,
    current: spin::Mutex<Option<Arc<Thread>>>,
}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            ncli: AtomicI32::new(0),
            intena: AtomicBool::new(false),
            need_resched: AtomicBool::new(false),
            idle: AtomicBool::new(true),
            online: AtomicBool::new(false),
            timer_ticks: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            sched_ctx: AtomicU64::new(0),
            current: spin::Mutex::new(None),
        }
    }
}

const CPU_INIT: CpuLocal = CpuLocal::new();
static CPUS: [CpuLocal; MAX_CPUS] = [CPU_INIT; MAX_CPUS];

#[inline]
pub fn cpu_id() -> usize {
    arch::cpu_id()
}

#[inline]
pub fn this_cpu() -> &'static CpuLocal {
    &CPUS[cpu_id()]
}

#[inline]
pub fn cpu(id: usize) -> &'static CpuLocal {
    &CPUS[id]
}

/// Disable local interrupts and bump the preemption-disable depth.
/// The pre-existing interrupt state is captured only at depth 1.
pub fn push_off() {
    let was_enabled = arch::intr_enabled();
    arch::intr_off();
    let cpu = this_cpu();
    if cpu.ncli.load(Ordering::Relaxed) == 0 {
        cpu.intena.store(was_enabled, Ordering::Relaxed);
    }
    cpu.ncli.fetch_add(1, Ordering::Relaxed);
}

/// Drop one level of preemption-disable depth; re-enable interrupts when
/// the depth reaches zero and they were enabled at capture time.
pub fn pop_off() {
    let cpu = this_cpu();
    assert!(
        !arch::intr_enabled(),
        "pop_off with interrupts enabled on cpu {}",
        cpu_id()
    );
    let depth = cpu.ncli.fetch_sub(1, Ordering::Relaxed) - 1;
    assert!(depth >= 0, "pop_off underflow: ncli {}", depth);
    if depth == 0 && cpu.intena.load(Ordering::Relaxed) {
        cpu.intena.store(false, Ordering::Relaxed);
        arch::intr_on();
    }
}

/// Swap the CPU's `(ncli, intena)` pair with the caller's. The scheduler
/// stack enters with a clean depth of one and restores the outgoing
/// thread's nesting on the way back.
pub fn swap_preempt(ncli: &mut i32, intena: &mut bool) {
    let cpu = this_cpu();
    let old_ncli = cpu.ncli.swap(*ncli, Ordering::Relaxed);
    let old_intena = cpu.intena.swap(*intena, Ordering::Relaxed);
    *ncli = old_ncli;
    *intena = old_intena;
}

pub fn current() -> Option<Arc<Thread>> {
    this_cpu().current.lock().clone()
}

pub fn set_current(thread: Option<Arc<Thread>>) {
    *this_cpu().current.lock() = thread;
}

pub fn take_current() -> Option<Arc<Thread>> {
    this_cpu().current.lock().take()
}
