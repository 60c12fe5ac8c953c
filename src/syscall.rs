/// System-call surface of the core.
///
/// Numbers are decoded by the trap layer; every handler returns the
/// negative-errno convention. Pointer arguments cross the user boundary
/// through the paging contract, never by direct dereference.

use crate::arch::UcStack;
use crate::error::{errno_or, Errno, Result};
use crate::hal;
use crate::process::exit;
use crate::process::scheduler;
use crate::process::signal::{self, SaFlags, SigAction, SigHandler, SigHow, SigSet};
use crate::process::thread::{self, CreateFlags, ThreadEntry};
use crate::time::TimeSpec;
use crate::timer;

pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_EXECVE: u64 = 3;
pub const SYS_WAITPID: u64 = 4;
pub const SYS_GETTID: u64 = 5;
pub const SYS_GETPID: u64 = 6;
pub const SYS_GETPPID: u64 = 7;
pub const SYS_SCHED_YIELD: u64 = 8;
pub const SYS_NANOSLEEP: u64 = 9;
pub const SYS_KILL: u64 = 10;
pub const SYS_PTHREAD_KILL: u64 = 11;
pub const SYS_SIGACTION: u64 = 12;
pub const SYS_SIGPROCMASK: u64 = 13;
pub const SYS_SIGPENDING: u64 = 14;
pub const SYS_SIGSUSPEND: u64 = 15;
pub const SYS_SIGTIMEDWAIT: u64 = 16;
pub const SYS_SIGALTSTACK: u64 = 17;
pub const SYS_SIGRETURN: u64 = 18;
pub const SYS_THREAD_CREATE: u64 = 19;
pub const SYS_THREAD_JOIN: u64 = 20;
pub const SYS_THREAD_CANCEL: u64 = 21;
pub const SYS_UNAME: u64 = 22;
pub const SYS_MMAP: u64 = 23;
pub const SYS_MUNMAP: u64 = 24;
pub const SYS_MPROTECT: u64 = 25;
pub const SYS_SBRK: u64 = 26;

/// User-ABI sigaction record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawSigaction {
    handler: u64,
    mask: u64,
    flags: u32,
    _pad: u32,
    restorer: u64,
}

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

#[repr(C)]
struct Utsname {
    sysname: [u8; 65],
    nodename: [u8; 65],
    release: [u8; 65],
    version: [u8; 65],
    machine: [u8; 65],
}

fn read_user<T: Copy + Default>(uvaddr: u64) -> Result<T> {
    if uvaddr == 0 {
        return Err(Errno::EFAULT);
    }
    let mut val = T::default();
    let buf = unsafe {
        core::slice::from_raw_parts_mut(&mut val as *mut T as *mut u8, core::mem::size_of::<T>())
    };
    hal::paging().copy_from_user(buf, uvaddr)?;
    Ok(val)
}

fn write_user<T>(uvaddr: u64, val: &T) -> Result<()> {
    if uvaddr == 0 {
        return Err(Errno::EFAULT);
    }
    hal::paging().copy_to_user(uvaddr, crate::arch::as_bytes(val))
}

fn raw_to_action(raw: &RawSigaction) -> SigAction {
    SigAction {
        handler: match raw.handler {
            SIG_DFL => SigHandler::Default,
            SIG_IGN => SigHandler::Ignore,
            addr => SigHandler::Handler(addr),
        },
        mask: SigSet(raw.mask),
        flags: SaFlags::from_bits_truncate(raw.flags),
    }
}

fn action_to_raw(act: &SigAction) -> RawSigaction {
    RawSigaction {
        handler: match act.handler {
            SigHandler::Default => SIG_DFL,
            SigHandler::Ignore => SIG_IGN,
            SigHandler::Handler(addr) => addr,
        },
        mask: act.mask.0,
        flags: act.flags.bits(),
        _pad: 0,
        restorer: crate::arch::SIGRETURN_TRAMPOLINE,
    }
}

fn fill(field: &mut [u8; 65], s: &str) {
    let n = s.len().min(64);
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn sys_uname(buf: u64) -> Result<()> {
    let mut uts = Utsname {
        sysname: [0; 65],
        nodename: [0; 65],
        release: [0; 65],
        version: [0; 65],
        machine: [0; 65],
    };
    fill(&mut uts.sysname, "Vesper");
    fill(&mut uts.nodename, "vesper");
    fill(&mut uts.release, env!("CARGO_PKG_VERSION"));
    fill(&mut uts.version, "preemptive mlfq core");
    fill(&mut uts.machine, "x86_64");
    write_user(buf, &uts)
}

fn sys_nanosleep(req: u64, rem: u64) -> Result<()> {
    if req == 0 {
        return Err(Errno::EFAULT);
    }
    let duration: TimeSpec = read_user(req)?;
    let mut left = TimeSpec::ZERO;
    let res = timer::nanosleep(&duration, Some(&mut left));
    if rem != 0 {
        write_user(rem, &left)?;
    }
    res
}

fn sys_sigaction(signo: i32, act_ptr: u64, oact_ptr: u64) -> Result<()> {
    let act = if act_ptr != 0 {
        Some(raw_to_action(&read_user::<RawSigaction>(act_ptr)?))
    } else {
        None
    };
    let mut old = SigAction::default();
    let oact = if oact_ptr != 0 { Some(&mut old) } else { None };

    signal::sigaction(signo, act.as_ref(), oact)?;

    if oact_ptr != 0 {
        write_user(oact_ptr, &action_to_raw(&old))?;
    }
    Ok(())
}

fn sys_sigprocmask(how: i32, set_ptr: u64, oset_ptr: u64) -> Result<()> {
    let how = SigHow::from_raw(how)?;
    let set = if set_ptr != 0 {
        Some(SigSet(read_user::<u64>(set_ptr)?))
    } else {
        None
    };
    let mut old = SigSet::EMPTY;
    let oset = if oset_ptr != 0 { Some(&mut old) } else { None };

    signal::sigprocmask(how, set.as_ref(), oset)?;

    if oset_ptr != 0 {
        write_user(oset_ptr, &old.0)?;
    }
    Ok(())
}

fn sys_sigtimedwait(set_ptr: u64, info_ptr: u64, timeout_ptr: u64) -> Result<i32> {
    let set = SigSet(read_user::<u64>(set_ptr)?);
    let timeout = if timeout_ptr != 0 {
        Some(read_user::<TimeSpec>(timeout_ptr)?)
    } else {
        None
    };
    let info = signal::sigtimedwait(&set, timeout.as_ref())?;
    if info_ptr != 0 {
        write_user(info_ptr, &info)?;
    }
    Ok(info.signo)
}

fn sys_sigaltstack(ss_ptr: u64, oss_ptr: u64) -> Result<()> {
    let ss = if ss_ptr != 0 {
        Some(read_user::<UcStack>(ss_ptr)?)
    } else {
        None
    };
    let old = signal::sigaltstack(ss.as_ref())?;
    if oss_ptr != 0 {
        write_user(oss_ptr, &old)?;
    }
    Ok(())
}

fn sys_waitpid(pid: i32, stat_ptr: u64, options: i32) -> Result<i32> {
    let (child, status) = exit::waitpid(pid, options)?;
    if stat_ptr != 0 {
        write_user(stat_ptr, &status)?;
    }
    Ok(child)
}

fn sys_thread_create(entry: u64, arg: u64, ustack_top: u64) -> Result<i32> {
    let current = thread::current().ok_or(Errno::EINVAL)?;
    if entry == 0 || ustack_top == 0 {
        return Err(Errno::EINVAL);
    }
    let th = thread::thread_create(
        &current.name,
        ThreadEntry::User {
            entry,
            arg,
            ustack_top,
            ustack_flags: 0,
        },
        CreateFlags::SCHED,
        Some(current.group()),
    )?;
    Ok(th.tid)
}

/// Decode and run one system call.
pub fn dispatch(num: u64, args: [u64; 6]) -> isize {
    match num {
        SYS_EXIT => exit::group_exit(exit::w_exitcode(args[0] as i32, 0)),
        SYS_FORK => errno_or(thread::fork_current(), |t| t.tid as isize),
        SYS_WAITPID => errno_or(
            sys_waitpid(args[0] as i32, args[1], args[2] as i32),
            |pid| pid as isize,
        ),
        SYS_GETTID => thread::current_tid().unwrap_or(0) as isize,
        SYS_GETPID => thread::current().map_or(0, |t| t.pid()) as isize,
        SYS_GETPPID => thread::current().map_or(0, |t| t.group().ppid()) as isize,
        SYS_SCHED_YIELD => {
            scheduler::yield_now();
            0
        }
        SYS_NANOSLEEP => errno_or(sys_nanosleep(args[0], args[1]), |_| 0),
        SYS_KILL => errno_or(signal::kill(args[0] as i32, args[1] as i32), |_| 0),
        SYS_PTHREAD_KILL => errno_or(
            signal::pthread_kill(args[0] as i32, args[1] as i32),
            |_| 0,
        ),
        SYS_SIGACTION => errno_or(sys_sigaction(args[0] as i32, args[1], args[2]), |_| 0),
        SYS_SIGPROCMASK => errno_or(sys_sigprocmask(args[0] as i32, args[1], args[2]), |_| 0),
        SYS_SIGPENDING => errno_or(
            signal::sigpending().and_then(|set| write_user(args[0], &set.0)),
            |_| 0,
        ),
        SYS_SIGSUSPEND => errno_or(
            read_user::<u64>(args[0]).and_then(|m| signal::sigsuspend(&SigSet(m))),
            |_| 0,
        ),
        SYS_SIGTIMEDWAIT => errno_or(sys_sigtimedwait(args[0], args[1], args[2]), |s| s as isize),
        SYS_SIGALTSTACK => errno_or(sys_sigaltstack(args[0], args[1]), |_| 0),
        SYS_SIGRETURN => errno_or(signal::sigreturn(), |rax| rax as isize),
        SYS_THREAD_CREATE => errno_or(sys_thread_create(args[0], args[1], args[2]), |tid| {
            tid as isize
        }),
        SYS_THREAD_JOIN => errno_or(exit::thread_join(args[0] as i32), |code| code as isize),
        SYS_THREAD_CANCEL => errno_or(exit::thread_cancel(args[0] as i32), |_| 0),
        SYS_UNAME => errno_or(sys_uname(args[0]), |_| 0),
        // the mapping layer owns the address-space calls
        SYS_EXECVE | SYS_MMAP | SYS_MUNMAP | SYS_MPROTECT | SYS_SBRK => Errno::ENOSYS.as_isize(),
        _ => {
            crate::warn!("unknown syscall {}", num);
            Errno::ENOSYS.as_isize()
        }
    }
}
