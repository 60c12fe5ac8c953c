/// Thread teardown: exit, reaping, join, cancellation, waitpid.
///
/// A thread dies in two steps: `ZOMBIE` (exit code published, joiners
/// woken) and `TERMINATED` (reaped, dropped from the group and tables).
/// The group dies when its last member is reaped; the parent learns
/// about it through SIGCHLD and `waitpid`.

use crate::error::{Errno, Result};
use crate::process::scheduler;
use crate::process::signal::{self, SigInfo, SIGCHLD};
use crate::process::thread::{self, Thread, ThreadFlags, ThreadGroup, ThreadState, Tid, WakeupReason};
use crate::process::wait::{self, Whence};
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

/// wait-status encoding: exit code in the high byte, killing signal in
/// the low bits.
pub fn w_exitcode(code: i32, signo: i32) -> i32 {
    (code << 8) | (signo & 0x7f)
}

pub fn w_exitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}

pub fn w_termsig(status: i32) -> i32 {
    status & 0x7f
}

pub const WNOHANG: i32 = 1;

/// Publish a thread's death: state, exit code, joiner wakeup, group
/// accounting and parent notification. Everything `thread_exit` does
/// short of the final reschedule.
pub fn finish_thread(thread: &Arc<Thread>, code: usize) {
    thread.with_inner(|i| {
        i.exit_code = code;
        i.state = ThreadState::Zombie;
    });

    crate::debug!("thread {} ({}) exited with {:#x}", thread.tid, thread.name, code);

    // joiners re-check the zombie state
    thread.join_event.broadcast();

    let group = thread.group();
    let all_dead = group.members.lock().iter().all(|t| t.is_zombie());
    if all_dead && !group.zombie.swap(true, Ordering::AcqRel) {
        if !group.exiting.load(Ordering::Acquire) {
            group
                .exit_status
                .store(w_exitcode(code as i32, 0), Ordering::Release);
        }

        // orphaned children fall to init
        reparent_children(&group);

        if let Some(parent) = group.parent.lock().upgrade() {
            let info = SigInfo {
                signo: SIGCHLD,
                code: signal::SI_KERNEL,
                pid: group.tgid,
                status: group.exit_status.load(Ordering::Acquire),
                ..SigInfo::default()
            };
            let _ = signal::kill_group(&parent, info);
            wait::sched_wakeup_all(&parent.child_waitq, WakeupReason::Normal);
        }
    }
}

fn reparent_children(group: &Arc<ThreadGroup>) {
    let orphans: alloc::vec::Vec<_> = group.children.lock().drain(..).collect();
    if orphans.is_empty() {
        return;
    }
    let init = thread::group_by_pid(1).filter(|g| !Arc::ptr_eq(g, group));
    for child in orphans {
        match &init {
            Some(init) => {
                *child.parent.lock() = Arc::downgrade(init);
                init.children.lock().push(child);
            }
            None => {
                *child.parent.lock() = alloc::sync::Weak::new();
            }
        }
    }
}

/// Terminate the calling thread. Never returns.
pub fn thread_exit(code: usize) -> ! {
    let current = thread::current().expect("thread_exit without a current thread");
    finish_thread(&current, code);

    current.lock.lock();
    scheduler::sched();

    // a zombie must never be dispatched again
    unreachable!("zombie thread {} rescheduled", current.tid);
}

/// Terminate the whole group: stamp the status, cancel every other
/// member, then exit the caller.
pub fn group_exit(status: i32) -> ! {
    let current = thread::current().expect("group_exit without a current thread");
    let group = current.group();

    group.exiting.store(true, Ordering::Release);
    group.exit_status.store(status, Ordering::Release);

    let others: alloc::vec::Vec<_> = group
        .members
        .lock()
        .iter()
        .filter(|t| t.tid != current.tid)
        .cloned()
        .collect();
    for member in others {
        member.set_flags(ThreadFlags::CANCELED);
        let _ = wait::thread_wakeup(&member, WakeupReason::Signal);
    }

    thread_exit(status as usize)
}

/// Remove a zombie from its group and the global table, releasing its
/// pid slot when it was the last member.
pub fn thread_reap(target: &Arc<Thread>) -> Result<usize> {
    let code = target.with_inner(|i| {
        if i.state != ThreadState::Zombie {
            return Err(Errno::EINVAL);
        }
        i.state = ThreadState::Terminated;
        Ok(i.exit_code)
    })?;

    let group = target.group();
    group.members.lock().retain(|t| t.tid != target.tid);
    thread::unregister_thread(target.tid);

    if group.member_count() == 0 && group.zombie.load(Ordering::Acquire) {
        // a live parent reaps the group through waitpid instead
        if group.parent.lock().upgrade().is_none() {
            thread::unregister_group(group.tgid);
        }
    }

    Ok(code)
}

/// Wait for a thread in the caller's group to exit and reap it.
/// Interruptible: cancellation of the waiter surfaces as `EINTR`.
pub fn thread_join(tid: Tid) -> Result<usize> {
    let current = thread::current().ok_or(Errno::EINVAL)?;
    if tid == current.tid {
        return Err(Errno::EDEADLK);
    }

    let target = current.group().member_by_tid(tid).ok_or(Errno::ESRCH)?;

    while !target.is_zombie() {
        target.join_event.wait(None)?;
    }

    thread_reap(&target)
}

/// Request cancellation of a sibling thread. A blocked target is pulled
/// off its wait queue with a signal wake; it observes the flag at its
/// next interruption check and returns `EINTR` from the blocking call.
pub fn thread_cancel(tid: Tid) -> Result<()> {
    let current = thread::current().ok_or(Errno::EINVAL)?;
    let target = current.group().member_by_tid(tid).ok_or(Errno::ESRCH)?;

    target.set_flags(ThreadFlags::CANCELED);
    wait::thread_wakeup(&target, WakeupReason::Signal)
}

/// Reap a dead child process.
///
/// pid semantics: `> 0` a specific child, `-1` any child; process-group
/// waits (`0`, `< -1`) are not part of the core. Returns `(pid, status)`
/// of the reaped child, or `(0, 0)` with `WNOHANG` when nothing died
/// yet.
pub fn waitpid(pid: i32, options: i32) -> Result<(Tid, i32)> {
    if pid == 0 || pid < -1 {
        return Err(Errno::EINVAL);
    }
    let current = thread::current().ok_or(Errno::EINVAL)?;
    let parent = current.group();

    loop {
        let children = parent.children.lock().clone();
        let matching: alloc::vec::Vec<_> = children
            .iter()
            .filter(|c| pid == -1 || c.tgid == pid)
            .cloned()
            .collect();

        if matching.is_empty() {
            return Err(Errno::ECHILD);
        }

        if let Some(dead) = matching
            .iter()
            .find(|c| c.zombie.load(Ordering::Acquire))
        {
            let status = dead.exit_status.load(Ordering::Acquire);
            parent.children.lock().retain(|c| c.tgid != dead.tgid);
            thread::unregister_group(dead.tgid);
            // drop the zombie's remaining member records
            let members: alloc::vec::Vec<_> = dead.members.lock().drain(..).collect();
            for m in members {
                thread::unregister_thread(m.tid);
            }
            return Ok((dead.tgid, status));
        }

        if options & WNOHANG != 0 {
            return Ok((0, 0));
        }

        wait::sched_wait(
            &parent.child_waitq,
            ThreadState::Sleep,
            Whence::Tail,
            None,
        )?;
    }
}
