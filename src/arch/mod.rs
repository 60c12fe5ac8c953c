/// x86-64 thread contexts and the few hardware leaves the core touches.
///
/// Everything that requires privileged instructions is gated on bare
/// metal; portable fallbacks keep the rest of the crate buildable and
/// testable on a host.

use crate::error::Result;
use crate::hal;
use crate::mm::page::PhysAddr;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64;

/// GDT selector indices.
pub const SEG_KCODE: u64 = 1;
pub const SEG_KDATA: u64 = 2;
pub const SEG_UCODE: u64 = 3;
pub const SEG_UDATA: u64 = 4;
pub const DPL_USER: u64 = 3;

pub const RFLAGS_IF: u64 = 1 << 9;

/// Sentinel pushed as the bottom return address of a fresh user stack.
/// Returning through it faults, which is how a user entry that falls off
/// the end is caught.
pub const MAGIC_RETADDR: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Kernel-mapped fixed stub whose only instruction sequence invokes the
/// `sigreturn` syscall. Signal frames push this as the handler's return
/// address; the address is ABI-stable.
pub const SIGRETURN_TRAMPOLINE: u64 = 0x0000_7FFF_FFFF_F000;

/// Saved callee-saved register set. Lives at the bottom of a suspended
/// thread's kernel stack; `switch_context` pushes/pops exactly this
/// layout, with `rip` consumed by its `ret`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
    /// Chain to the previously saved context; null for bootstrap frames.
    pub link: u64,
}

pub const CONTEXT_SIZE: usize = core::mem::size_of::<Context>();

/// Machine context captured at trap entry and consumed by `trap_return`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mcontext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub fs: u64,
    pub ds: u64,
    pub trapno: u64,
    pub errno: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub const MCONTEXT_SIZE: usize = core::mem::size_of::<Mcontext>();

/// Alternate / user stack descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UcStack {
    pub sp: u64,
    pub size: u64,
    pub flags: u32,
    _pad: u32,
}

pub const SS_ONSTACK: u32 = 1;
pub const SS_DISABLE: u32 = 2;
pub const MIN_SIGSTACK: u64 = 2048;

impl UcStack {
    pub fn new(sp: u64, size: u64, flags: u32) -> Self {
        Self {
            sp,
            size,
            flags,
            _pad: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0, SS_DISABLE)
    }

    pub fn contains(&self, sp: u64) -> bool {
        self.flags & SS_DISABLE == 0 && sp >= self.sp && sp < self.sp + self.size
    }
}

/// User-visible context: what `sigreturn` restores.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ucontext {
    pub link: u64,
    pub stack: UcStack,
    pub mcontext: Mcontext,
    pub sigmask: u64,
}

pub const UCONTEXT_SIZE: usize = core::mem::size_of::<Ucontext>();

/// View a repr(C) register record as raw bytes for physical-memory writes.
pub fn as_bytes<T>(v: &T) -> &[u8] {
    unsafe { core::slice::from_raw_parts(v as *const T as *const u8, core::mem::size_of::<T>()) }
}

#[inline]
pub const fn align16_down(v: u64) -> u64 {
    v & !15
}

// ---------------------------------------------------------------------
// CPU identity
// ---------------------------------------------------------------------

static CPU_ID_FN: spin::Once<fn() -> usize> = spin::Once::new();

/// Install the CPU-identity accessor (LAPIC-id based) during SMP
/// bring-up. Before installation everything runs on the boot CPU.
pub fn install_cpu_id(f: fn() -> usize) {
    CPU_ID_FN.call_once(|| f);
}

#[inline]
pub fn cpu_id() -> usize {
    match CPU_ID_FN.get() {
        Some(f) => f(),
        None => 0,
    }
}

// ---------------------------------------------------------------------
// Interrupt control
// ---------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use x86_64::{intr_enabled, intr_off, intr_on, wait_for_interrupt};

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod portable {
    use core::sync::atomic::{AtomicBool, Ordering};

    // Hosted builds model the interrupt flag so the preemption-depth
    // logic stays observable.
    static INTR: AtomicBool = AtomicBool::new(true);

    pub fn intr_enabled() -> bool {
        INTR.load(Ordering::Relaxed)
    }

    pub fn intr_off() {
        INTR.store(false, Ordering::Relaxed);
    }

    pub fn intr_on() {
        INTR.store(true, Ordering::Relaxed);
    }

    pub fn wait_for_interrupt() {
        core::hint::spin_loop();
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub use portable::{intr_enabled, intr_off, intr_on, wait_for_interrupt};

// ---------------------------------------------------------------------
// Context switch
// ---------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use x86_64::switch_context;

/// Hosted stand-in: records the call and returns as if the thread had
/// been rescheduled.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe fn switch_context(old: *mut u64, _new: u64) {
    use core::sync::atomic::{AtomicU64, Ordering};
    static SWITCHES: AtomicU64 = AtomicU64::new(0);
    SWITCHES.fetch_add(1, Ordering::Relaxed);
    if !old.is_null() {
        // the slot would receive the suspended stack pointer
        *old = 0;
    }
}

// ---------------------------------------------------------------------
// Thread bootstrap frames
// ---------------------------------------------------------------------

fn fn_addr(f: extern "C" fn()) -> u64 {
    f as usize as u64
}

fn write_u64(phys: PhysAddr, val: u64) -> Result<()> {
    hal::paging().memcpy_pv(phys, &val.to_le_bytes())
}

struct FrameLayout {
    stop_slot: PhysAddr,
    mctx_at: PhysAddr,
    ctx_at: PhysAddr,
}

/// Carve the synthetic first-dispatch frame out of a kernel stack:
///
/// ```text
///   kstack_top - 8              thread_stop          (entry's return)
///   mctx_at .. +MCONTEXT_SIZE   Mcontext             (trap_return pops)
///   mctx_at - 8                 trap_return          (thread_start's return)
///   ctx_at  .. +CONTEXT_SIZE    Context {rip = thread_start}
/// ```
fn carve_frame(kstack_top: PhysAddr) -> FrameLayout {
    let stop_slot = align16_down(kstack_top) - 8;
    let mctx_at = align16_down(stop_slot - MCONTEXT_SIZE as u64);
    let ctx_at = mctx_at - 8 - CONTEXT_SIZE as u64;
    FrameLayout {
        stop_slot,
        mctx_at,
        ctx_at,
    }
}

fn commit_frame(layout: &FrameLayout, mctx: &Mcontext) -> Result<u64> {
    write_u64(layout.stop_slot, fn_addr(crate::process::scheduler::thread_stop))?;
    hal::paging().memcpy_pv(layout.mctx_at, as_bytes(mctx))?;
    write_u64(layout.mctx_at - 8, crate::trap::trap_return_addr())?;

    let ctx = Context {
        rip: fn_addr(crate::process::scheduler::thread_start),
        rbp: mctx.rsp,
        link: 0,
        ..Context::default()
    };
    hal::paging().memcpy_pv(layout.ctx_at, as_bytes(&ctx))?;
    Ok(layout.ctx_at)
}

/// First-dispatch frame for a kernel thread: unwinds through
/// `trap_return` into `entry(arg)` in the kernel segments, with `ret`
/// from `entry` landing in `thread_stop`.
pub fn kernel_frame(kstack_top: PhysAddr, entry: u64, arg: u64) -> Result<u64> {
    let layout = carve_frame(kstack_top);
    let mctx = Mcontext {
        ss: SEG_KDATA << 3,
        cs: SEG_KCODE << 3,
        ds: SEG_KDATA << 3,
        fs: SEG_KDATA << 3,
        rip: entry,
        rdi: arg,
        rsp: layout.stop_slot,
        rbp: layout.stop_slot,
        rflags: RFLAGS_IF,
        ..Mcontext::default()
    };
    commit_frame(&layout, &mctx)
}

/// First-dispatch frame for a user thread. Maps the top stack page,
/// pushes the magic return-address sentinel, and targets the user
/// segments with interrupts enabled.
pub fn user_frame(kstack_top: PhysAddr, ustack_top: u64, ustack_flags: u32, entry: u64, arg: u64) -> Result<u64> {
    let ustack_top = align16_down(ustack_top);
    hal::paging().map_n(ustack_top - crate::mm::page::PAGE_SIZE as u64, crate::mm::page::PAGE_SIZE, ustack_flags)?;

    let usp = ustack_top - 8;
    hal::paging().copy_to_user(usp, &MAGIC_RETADDR.to_le_bytes())?;

    let layout = carve_frame(kstack_top);
    let mctx = Mcontext {
        ss: (SEG_UDATA << 3) | DPL_USER,
        cs: (SEG_UCODE << 3) | DPL_USER,
        ds: (SEG_UDATA << 3) | DPL_USER,
        fs: (SEG_UDATA << 3) | DPL_USER,
        rip: entry,
        rdi: arg,
        rsp: usp,
        rbp: usp,
        rflags: RFLAGS_IF,
        ..Mcontext::default()
    };
    commit_frame(&layout, &mctx)
}

/// execve variant of the user frame: a fresh stack with
/// `(argc, argv, envp)` in the argument registers.
pub fn execve_frame(
    kstack_top: PhysAddr,
    ustack_top: u64,
    ustack_flags: u32,
    entry: u64,
    argc: u64,
    argv: u64,
    envp: u64,
) -> Result<u64> {
    let ustack_top = align16_down(ustack_top);
    hal::paging().map_n(ustack_top - crate::mm::page::PAGE_SIZE as u64, crate::mm::page::PAGE_SIZE, ustack_flags)?;

    let usp = ustack_top - 8;
    hal::paging().copy_to_user(usp, &MAGIC_RETADDR.to_le_bytes())?;

    let layout = carve_frame(kstack_top);
    let mctx = Mcontext {
        ss: (SEG_UDATA << 3) | DPL_USER,
        cs: (SEG_UCODE << 3) | DPL_USER,
        ds: (SEG_UDATA << 3) | DPL_USER,
        fs: (SEG_UDATA << 3) | DPL_USER,
        rip: entry,
        rdi: argc,
        rsi: argv,
        rdx: envp,
        rsp: usp,
        rbp: usp,
        rflags: RFLAGS_IF,
        ..Mcontext::default()
    };
    commit_frame(&layout, &mctx)
}

/// Fork frame: the child resumes from the parent's saved user context
/// with `rax = 0`.
pub fn fork_frame(kstack_top: PhysAddr, parent_mctx: &Mcontext) -> Result<u64> {
    let layout = carve_frame(kstack_top);
    let mut mctx = *parent_mctx;
    mctx.rax = 0;
    commit_frame(&layout, &mctx)
}
