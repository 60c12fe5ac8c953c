/// Kernel timers and sleeping.
///
/// One expiry-sorted queue holds every armed timer; a due entry either
/// runs its callback, signals its owner, or wakes a sleeper. Periodic
/// timers re-arm by their interval. `nanosleep` rides a separate
/// sorted sleeper-clock queue serviced by the same worker.

use crate::error::{Errno, Result};
use crate::process::signal::{SigInfo, SI_TIMER};
use crate::process::thread::{self, ThreadEntry, ThreadState, Tid, WakeupReason};
use crate::process::wait::{self, WaitQueue, Whence};
use crate::sync::cond::CondVar;
use crate::sync::spinlock::SpinLock;
use crate::time::{self, Jiffies, TimeSpec};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

pub type TimerId = u64;

/// What firing a timer does.
pub enum TimerKind {
    Callback(fn(usize), usize),
    /// Send `signo` to the owning thread.
    Signal { tid: Tid, signo: i32 },
    /// Wake the owner with a timeout reason wherever it is blocked.
    Wake { tid: Tid },
}

struct Timer {
    id: TimerId,
    kind: TimerKind,
    interval: Jiffies,
    expiry: Jiffies,
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

lazy_static::lazy_static! {
    /// Armed timers, sorted by expiry.
    static ref TIMERS: SpinLock<Vec<Timer>> = SpinLock::new(Vec::new());
    /// Sleeper clocks (deadline, tid), sorted by deadline.
    static ref SLEEPER_CLOCKS: SpinLock<Vec<(Jiffies, Tid)>> = SpinLock::new(Vec::new());
    static ref SLEEPER_WAITQ: WaitQueue = WaitQueue::new();
    /// The tick pokes the worker through this.
    static ref TICK_EVENT: CondVar = CondVar::new();
}

fn insert_sorted(timers: &mut Vec<Timer>, timer: Timer) {
    let pos = timers
        .iter()
        .position(|t| time::time_after(t.expiry, timer.expiry))
        .unwrap_or(timers.len());
    timers.insert(pos, timer);
}

/// Arm a timer. `expiry` is relative jiffies; `interval > 0` makes it
/// periodic.
pub fn timer_create(kind: TimerKind, expiry: Jiffies, interval: Jiffies) -> Result<TimerId> {
    let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
    let timer = Timer {
        id,
        kind,
        interval,
        expiry: time::jiffies() + expiry,
    };
    insert_sorted(&mut TIMERS.lock(), timer);
    Ok(id)
}

/// Disarm. Missing ids are fine (the timer may have just fired).
pub fn cancel(id: TimerId) {
    TIMERS.lock().retain(|t| t.id != id);
}

/// Jiffies until a timer fires.
pub fn timer_getremaining(id: TimerId) -> Result<Jiffies> {
    let timers = TIMERS.lock();
    let timer = timers.iter().find(|t| t.id == id).ok_or(Errno::ENOENT)?;
    let now = time::jiffies();
    Ok(if time::time_after(timer.expiry, now) {
        timer.expiry - now
    } else {
        0
    })
}

/// One-shot convenience used by timed blocking primitives: wake `tid`
/// with a timeout reason when the timespec elapses.
pub fn arm_wake(tid: Tid, timeout: &TimeSpec) -> Result<TimerId> {
    timer_create(
        TimerKind::Wake { tid },
        time::jiffies_from_timespec(timeout),
        0,
    )
}

/// Fire every due timer. Runs on the timer worker thread (or directly
/// from a polling caller).
pub fn process_due() {
    let now = time::jiffies();
    let mut due = Vec::new();
    {
        let mut timers = TIMERS.lock();
        while let Some(first) = timers.first() {
            if time::time_after(first.expiry, now) {
                break;
            }
            due.push(timers.remove(0));
        }
    }

    for mut timer in due {
        match timer.kind {
            TimerKind::Callback(f, arg) => f(arg),
            TimerKind::Signal { tid, signo } => {
                if let Some(target) = thread::thread_by_tid(tid) {
                    let info = SigInfo {
                        signo,
                        code: SI_TIMER,
                        ..SigInfo::default()
                    };
                    let _ = crate::process::signal::kill_thread(&target, info);
                }
            }
            TimerKind::Wake { tid } => {
                if let Some(target) = thread::thread_by_tid(tid) {
                    let _ = wait::thread_wakeup(&target, WakeupReason::Timeout);
                }
            }
        }

        if timer.interval > 0 {
            timer.expiry += timer.interval;
            insert_sorted(&mut TIMERS.lock(), timer);
        }
    }
}

/// Release every sleeper whose clock has run down.
pub fn process_clocks() {
    let now = time::jiffies();
    let mut due = Vec::new();
    {
        let mut clocks = SLEEPER_CLOCKS.lock();
        while let Some(&(deadline, tid)) = clocks.first() {
            if time::time_after(deadline, now) {
                break;
            }
            clocks.remove(0);
            due.push(tid);
        }
    }
    for tid in due {
        let _ = wait::sched_wakeup_specific(&SLEEPER_WAITQ, WakeupReason::Normal, tid);
    }
}

/// Timer-interrupt hook: nudge the worker.
pub fn on_tick() {
    TICK_EVENT.signal();
}

extern "C" fn timer_worker(_arg: usize) -> usize {
    loop {
        let _ = TICK_EVENT.wait(None);
        process_due();
        process_clocks();
    }
}

/// Spawn the expiry worker. Called once from scheduler init.
pub fn spawn_worker() {
    let res = thread::thread_create(
        "ktimerd",
        ThreadEntry::Kernel {
            entry: timer_worker,
            arg: 0,
        },
        thread::CreateFlags::SCHED | thread::CreateFlags::DETACHED,
        None,
    );
    match res {
        Ok(th) => crate::info!("timer: worker tid {}", th.tid),
        Err(err) => crate::error!("timer: worker spawn failed: {:?}", err),
    }
}

/// Sleep for a number of jiffies, reporting the unslept remainder when
/// interrupted.
pub fn jiffies_sleep(duration: Jiffies, rem: Option<&mut Jiffies>) -> Result<()> {
    let current = thread::current().ok_or(Errno::EINVAL)?;
    let deadline = time::jiffies() + duration;
    let mut res = Ok(());

    while time::time_before(time::jiffies(), deadline) {
        {
            let mut clocks = SLEEPER_CLOCKS.lock();
            let pos = clocks
                .iter()
                .position(|&(d, _)| time::time_after(d, deadline))
                .unwrap_or(clocks.len());
            clocks.insert(pos, (deadline, current.tid));
        }

        let r = wait::sched_wait(&SLEEPER_WAITQ, ThreadState::Sleep, Whence::Head, None);

        if let Err(err) = r {
            SLEEPER_CLOCKS
                .lock()
                .retain(|&(d, t)| !(t == current.tid && d == deadline));
            res = Err(err);
            break;
        }
        // woken by the clock worker or spuriously; the loop re-checks
        // the deadline
    }

    if let Some(rem) = rem {
        let now = time::jiffies();
        *rem = if time::time_before(now, deadline) {
            deadline - now
        } else {
            0
        };
    }
    res
}

/// `nanosleep`: block the caller until the duration elapses.
pub fn nanosleep(duration: &TimeSpec, rem: Option<&mut TimeSpec>) -> Result<()> {
    if duration.nsec > 999_999_999 || duration.nsec < 0 || duration.sec < 0 {
        return Err(Errno::EINVAL);
    }

    let jiffies = time::jiffies_from_timespec(duration);
    let mut left: Jiffies = 0;
    let res = jiffies_sleep(jiffies, Some(&mut left));

    if let Some(rem) = rem {
        *rem = time::jiffies_to_timespec(left);
    }
    res
}
