/// Trap entry glue: the path from a CPU exception or IRQ into the
/// scheduler, timers, and signal delivery.
///
/// Each trap captures an `Mcontext`, links it as the innermost entry of
/// the current thread's user-context chain, dispatches by vector, then
/// runs the event tail: deliver pending signals, then yield if the
/// quantum ran out. On the way out the (possibly redirected) context is
/// unlinked and resumed.

use crate::arch::{Mcontext, Ucontext};
use crate::process::exit;
use crate::process::scheduler;
use crate::process::signal::{self, Delivered};
use crate::process::thread::{self, ThreadFlags};
use spin::Once;

/// IRQ numbers after remap, relative to the IRQ base vector.
pub const IRQ_TIMER: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapVector {
    /// CPU exception (vectors 0..32).
    Exception(u8),
    /// Remapped hardware interrupt.
    Irq(u8),
    /// Software syscall entry.
    Syscall,
}

pub const X86_TRAP_PF: u8 = 14;
pub const X86_TRAP_GP: u8 = 13;
pub const X86_TRAP_DF: u8 = 8;
pub const X86_TRAP_DE: u8 = 0;
pub const X86_TRAP_UD: u8 = 6;

static EOI_FN: Once<fn(u8)> = Once::new();

/// The interrupt-controller layer installs its end-of-interrupt hook
/// here during bring-up.
pub fn install_eoi(f: fn(u8)) {
    EOI_FN.call_once(|| f);
}

fn eoi(irq: u8) {
    if let Some(f) = EOI_FN.get() {
        f(irq);
    }
}

/// Address of the register-restore stub the bootstrap frames return
/// through.
pub fn trap_return_addr() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        extern "C" {
            fn trap_return();
        }
        trap_return as usize as u64
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        trap_return_stub as usize as u64
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
extern "C" fn trap_return_stub() {}

/// Exceptions that fault the offending thread rather than the kernel.
fn exception_signal(vector: u8) -> Option<i32> {
    match vector {
        X86_TRAP_PF => Some(signal::SIGSEGV),
        X86_TRAP_GP => Some(signal::SIGSEGV),
        X86_TRAP_DE => Some(signal::SIGFPE),
        X86_TRAP_UD => Some(signal::SIGILL),
        _ => None,
    }
}

/// Full trap path. The caller passes the captured context; on return it
/// holds whatever the tail decided the thread should resume into.
pub fn trap_dispatch(vector: TrapVector, mctx: &mut Mcontext) {
    let current = thread::current();

    // link the saved context as the innermost chain entry
    if let Some(cur) = &current {
        cur.with_inner(|i| {
            let link = i.uctx_chain.len() as u64;
            i.uctx_chain.push(Ucontext {
                link,
                mcontext: *mctx,
                ..Ucontext::default()
            });
        });
    }

    match vector {
        TrapVector::Irq(IRQ_TIMER) => {
            crate::time::jiffies_update();
            crate::timer::on_tick();
            scheduler::scheduler_tick();
            eoi(IRQ_TIMER);
        }
        TrapVector::Irq(irq) => {
            // device IRQs are routed by the driver layer; the core only
            // acknowledges
            eoi(irq);
        }
        TrapVector::Exception(vec) => match (&current, exception_signal(vec)) {
            (Some(cur), Some(signo)) => {
                let info = signal::SigInfo {
                    signo,
                    code: signal::SI_KERNEL,
                    addr: mctx.rip,
                    ..signal::SigInfo::default()
                };
                let _ = signal::kill_thread(cur, info);
            }
            _ => {
                panic!(
                    "unhandled exception {} at rip {:#x}",
                    vec, mctx.rip
                );
            }
        },
        TrapVector::Syscall => {
            // decoded by the syscall layer before we get here
        }
    }

    if let Some(cur) = &current {
        event_tail(cur);

        // unlink the innermost context, carrying any signal redirect
        cur.with_inner(|i| {
            if let Some(uctx) = i.uctx_chain.pop() {
                *mctx = uctx.mcontext;
            }
        });
    }
}

/// The tail every trap runs before returning: dispatch signals, then
/// honor an exhausted quantum.
fn event_tail(current: &alloc::sync::Arc<thread::Thread>) {
    use core::sync::atomic::Ordering;

    if current.group().exiting.load(Ordering::Acquire) {
        let status = current.group().exit_status.load(Ordering::Acquire);
        exit::thread_exit(status as usize);
    }

    loop {
        match signal::deliver_one(current) {
            Delivered::None | Delivered::Handled(_) => break,
            Delivered::Ignored(_) | Delivered::Continued => continue,
            Delivered::Terminated(status) => exit::group_exit(status),
            Delivered::Stopped(_) => {
                signal::stop_current(&current.group());
                continue;
            }
        }
    }

    if current.test_flags(ThreadFlags::YIELD_PENDING)
        || current.timeslice.load(Ordering::Relaxed) == 0
    {
        scheduler::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static EOIS: AtomicUsize = AtomicUsize::new(0);

    fn count_eoi(_irq: u8) {
        EOIS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn timer_irq_advances_jiffies_and_burns_quantum() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        install_eoi(count_eoi);

        let th = test_utils::spawn_thread("trap-tick");
        th.timeslice.store(3, Ordering::Relaxed);

        let before = crate::time::jiffies();
        let eois = EOIS.load(Ordering::Relaxed);

        test_utils::as_current(&th, || {
            let mut mctx = Mcontext {
                rip: 0x4000_0000,
                ..Mcontext::default()
            };
            trap_dispatch(TrapVector::Irq(IRQ_TIMER), &mut mctx);
        });

        assert_eq!(crate::time::jiffies(), before + 1);
        assert_eq!(th.timeslice.load(Ordering::Relaxed), 2);
        assert_eq!(EOIS.load(Ordering::Relaxed), eois + 1);
        // chain unwound on the way out
        th.with_inner(|i| assert!(i.uctx_chain.is_empty()));

        test_utils::retire_thread(&th);
    }

    #[test]
    fn trap_return_redirects_into_pending_handler() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("trap-signal");
        th.timeslice.store(10, Ordering::Relaxed);
        let usp = test_utils::user_stack_top();

        test_utils::as_current(&th, || {
            let act = signal::SigAction {
                handler: signal::SigHandler::Handler(0x7000_0000),
                ..signal::SigAction::default()
            };
            signal::sigaction(signal::SIGUSR1, Some(&act), None).unwrap();
            signal::pthread_kill(th.tid, signal::SIGUSR1).unwrap();

            let mut mctx = Mcontext {
                rip: 0x4000_0000,
                rsp: usp,
                ..Mcontext::default()
            };
            trap_dispatch(TrapVector::Syscall, &mut mctx);

            // the returned context enters the handler, not the
            // interrupted code
            assert_eq!(mctx.rip, 0x7000_0000);
            assert_eq!(mctx.rdi, signal::SIGUSR1 as u64);
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn fault_on_user_thread_posts_sigsegv() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("trap-fault");
        th.timeslice.store(10, Ordering::Relaxed);
        let usp = test_utils::user_stack_top();

        test_utils::as_current(&th, || {
            // a handler keeps the fault from terminating the group
            let act = signal::SigAction {
                handler: signal::SigHandler::Handler(0x7100_0000),
                ..signal::SigAction::default()
            };
            signal::sigaction(signal::SIGSEGV, Some(&act), None).unwrap();

            let mut mctx = Mcontext {
                rip: 0x4100_0000,
                rsp: usp,
                ..Mcontext::default()
            };
            trap_dispatch(TrapVector::Exception(X86_TRAP_PF), &mut mctx);
            assert_eq!(mctx.rip, 0x7100_0000);
        });

        test_utils::retire_thread(&th);
    }
}
