/// Signal delivery.
///
/// Pending state lives at two scopes: each thread owns a mask, a pending
/// set and per-signal FIFO queues; the thread group owns the shared
/// action table plus a group mask, pending set and queues. Pending bits
/// and masks are atomic words so senders and the eligibility scan stay
/// lock-free; the queues and the action table sit behind their own
/// locks, held briefly.

use crate::arch::{self, UcStack, SIGRETURN_TRAMPOLINE, SS_DISABLE, SS_ONSTACK};
use crate::error::{Errno, Result};
use crate::hal;
use crate::process::thread::{self, Thread, ThreadGroup, ThreadState, Tid, WakeupReason};
use crate::process::wait::{self, WaitQueue, Whence};
use crate::sync::spinlock::SpinLock;
use crate::time::{self, TimeSpec};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

pub const NSIG: usize = 32;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGURG: i32 = 23;
pub const SIGWINCH: i32 = 28;

/// Handler nesting bound; exceeding it terminates the thread.
pub const NSIG_NESTED_MAX: u32 = 16;

#[inline]
pub fn sig_valid(signo: i32) -> bool {
    signo >= 1 && (signo as usize) < NSIG
}

#[inline]
pub fn sig_catchable(signo: i32) -> bool {
    signo != SIGKILL && signo != SIGSTOP
}

/// What an unhandled signal does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

pub fn default_action(signo: i32) -> DefaultAction {
    match signo {
        SIGCHLD | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        _ => DefaultAction::Terminate,
    }
}

// ---------------------------------------------------------------------
// Signal sets
// ---------------------------------------------------------------------

/// Bitset over signal numbers 1..NSIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(pub u64);

impl SigSet {
    pub const EMPTY: SigSet = SigSet(0);

    pub fn single(signo: i32) -> SigSet {
        debug_assert!(sig_valid(signo));
        SigSet(1 << (signo - 1))
    }

    pub fn contains(&self, signo: i32) -> bool {
        sig_valid(signo) && self.0 & (1 << (signo - 1)) != 0
    }

    pub fn add(&mut self, signo: i32) {
        if sig_valid(signo) {
            self.0 |= 1 << (signo - 1);
        }
    }

    pub fn del(&mut self, signo: i32) {
        if sig_valid(signo) {
            self.0 &= !(1 << (signo - 1));
        }
    }

    pub fn union(self, other: SigSet) -> SigSet {
        SigSet(self.0 | other.0)
    }

    pub fn minus(self, other: SigSet) -> SigSet {
        SigSet(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest pending signal number, if any.
    pub fn first(&self) -> Option<i32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as i32 + 1)
        }
    }
}

/// Atomic signal-set word.
pub struct SigSetCell(AtomicU64);

impl SigSetCell {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self) -> SigSet {
        SigSet(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, set: SigSet) {
        self.0.store(set.0, Ordering::Release);
    }

    pub fn add(&self, signo: i32) {
        if sig_valid(signo) {
            self.0.fetch_or(1 << (signo - 1), Ordering::AcqRel);
        }
    }

    pub fn del(&self, signo: i32) {
        if sig_valid(signo) {
            self.0.fetch_and(!(1 << (signo - 1)), Ordering::AcqRel);
        }
    }
}

// ---------------------------------------------------------------------
// Queued signal payloads
// ---------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: i32,
    pub code: i32,
    pub pid: Tid,
    pub uid: u32,
    pub addr: u64,
    pub status: i32,
    pub value: u64,
}

pub const SIGINFO_SIZE: usize = core::mem::size_of::<SigInfo>();

/// siginfo si_code values used by the core.
pub const SI_USER: i32 = 0;
pub const SI_KERNEL: i32 = 0x80;
pub const SI_TIMER: i32 = -2;

impl SigInfo {
    pub fn user(signo: i32, sender: Tid, uid: u32) -> Self {
        Self {
            signo,
            code: SI_USER,
            pid: sender,
            uid,
            ..Self::default()
        }
    }

    pub fn kernel(signo: i32) -> Self {
        Self {
            signo,
            code: SI_KERNEL,
            ..Self::default()
        }
    }
}

/// One scope's pending state: the atomic bit word plus the per-signal
/// FIFO queues.
pub struct SigPending {
    bits: SigSetCell,
    queues: SpinLock<[VecDeque<SigInfo>; NSIG]>,
}

impl SigPending {
    pub fn new() -> Self {
        Self {
            bits: SigSetCell::new(),
            queues: SpinLock::new(core::array::from_fn(|_| VecDeque::new())),
        }
    }

    pub fn pending(&self) -> SigSet {
        self.bits.load()
    }

    pub fn post(&self, info: SigInfo) {
        debug_assert!(sig_valid(info.signo));
        let mut queues = self.queues.lock();
        queues[(info.signo - 1) as usize].push_back(info);
        self.bits.add(info.signo);
    }

    /// Dequeue one payload for `signo`; the pending bit clears when the
    /// queue drains. A bare pending bit with no payload yields a
    /// synthesized record.
    pub fn take(&self, signo: i32) -> Option<SigInfo> {
        if !self.bits.load().contains(signo) {
            return None;
        }
        let mut queues = self.queues.lock();
        let q = &mut queues[(signo - 1) as usize];
        match q.pop_front() {
            Some(info) => {
                if q.is_empty() {
                    self.bits.del(signo);
                }
                Some(info)
            }
            None => {
                self.bits.del(signo);
                Some(SigInfo::kernel(signo))
            }
        }
    }

    /// Dequeue the lowest pending signal that is a member of `set`.
    pub fn take_first_in(&self, set: SigSet) -> Option<SigInfo> {
        let candidates = SigSet(self.bits.load().0 & set.0);
        let signo = candidates.first()?;
        self.take(signo)
    }

    /// Discard every queued payload for `signo` and clear its bit.
    pub fn flush(&self, signo: i32) {
        if !sig_valid(signo) {
            return;
        }
        let mut queues = self.queues.lock();
        queues[(signo - 1) as usize].clear();
        self.bits.del(signo);
    }
}

// ---------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    /// User-space handler address.
    Handler(u64),
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaFlags: u32 {
        const SIGINFO = 0x0000_0004;
        const ONSTACK = 0x0800_0000;
        const RESTART = 0x1000_0000;
        const NODEFER = 0x4000_0000;
        const RESETHAND = 0x8000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigAction {
    pub handler: SigHandler,
    pub mask: SigSet,
    pub flags: SaFlags,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SigHandler::Default,
            mask: SigSet::EMPTY,
            flags: SaFlags::empty(),
        }
    }
}

impl SigAction {
    fn ignores(&self, signo: i32) -> bool {
        match self.handler {
            SigHandler::Ignore => true,
            SigHandler::Default => default_action(signo) == DefaultAction::Ignore,
            SigHandler::Handler(_) => false,
        }
    }
}

/// Group-scope signal descriptor: shared dispositions plus the group
/// pending state.
pub struct SignalDesc {
    actions: SpinLock<[SigAction; NSIG]>,
    pub mask: SigSetCell,
    pub pending: SigPending,
}

impl SignalDesc {
    pub fn new() -> Self {
        Self {
            actions: SpinLock::new([SigAction::default(); NSIG]),
            mask: SigSetCell::new(),
            pending: SigPending::new(),
        }
    }

    pub fn action(&self, signo: i32) -> SigAction {
        self.actions.lock()[(signo - 1) as usize]
    }

    fn set_action(&self, signo: i32, act: SigAction) {
        self.actions.lock()[(signo - 1) as usize] = act;
    }

    pub fn copy_actions_from(&self, other: &SignalDesc) {
        let src = *other.actions.lock();
        *self.actions.lock() = src;
    }
}

/// Thread-scope signal state.
pub struct ThreadSignals {
    pub mask: SigSetCell,
    pub pending: SigPending,
}

impl ThreadSignals {
    pub fn new() -> Self {
        Self {
            mask: SigSetCell::new(),
            pending: SigPending::new(),
        }
    }
}

// ---------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------

/// Anything deliverable right now at either scope?
pub fn has_deliverable(thread: &Thread) -> bool {
    let pending = thread
        .sigs
        .pending
        .pending()
        .union(thread.group().signals.pending.pending());
    !pending.minus(thread.sigs.mask.load()).is_empty()
}

/// Queue a signal directly on a thread and kick it out of an
/// interruptible block.
pub fn kill_thread(thread: &Arc<Thread>, info: SigInfo) -> Result<()> {
    if !sig_valid(info.signo) {
        return Err(Errno::EINVAL);
    }

    thread.sigs.pending.post(info);

    if info.signo == SIGCONT {
        wait::sched_wakeup_all(&thread.group().stopq, WakeupReason::Normal);
    }

    wait::thread_wakeup(thread, WakeupReason::Signal)
}

/// Group send: mark the signal pending at group scope and wake an
/// eligible member (one that does not mask it).
pub fn kill_group(group: &Arc<ThreadGroup>, info: SigInfo) -> Result<()> {
    if !sig_valid(info.signo) {
        return Err(Errno::EINVAL);
    }

    group.signals.pending.post(info);

    if info.signo == SIGCONT {
        wait::sched_wakeup_all(&group.stopq, WakeupReason::Normal);
    }

    let eligible = group
        .members
        .lock()
        .iter()
        .find(|t| !t.sigs.mask.load().contains(info.signo) && !t.is_zombie())
        .cloned();

    if let Some(target) = eligible {
        wait::thread_wakeup(&target, WakeupReason::Signal)?;
    }
    Ok(())
}

fn sender_identity() -> (Tid, u32) {
    match thread::current() {
        Some(cur) => (cur.pid(), cur.group().cred.lock().uid),
        None => (0, 0),
    }
}

/// `kill(pid, signo)`: signal a process.
pub fn kill(pid: Tid, signo: i32) -> Result<()> {
    if !sig_valid(signo) {
        return Err(Errno::EINVAL);
    }
    let group = thread::group_by_pid(pid).ok_or(Errno::ESRCH)?;
    let (spid, suid) = sender_identity();
    kill_group(&group, SigInfo::user(signo, spid, suid))
}

/// `pthread_kill(tid, signo)`: signal a specific thread.
pub fn pthread_kill(tid: Tid, signo: i32) -> Result<()> {
    if !sig_valid(signo) {
        return Err(Errno::EINVAL);
    }
    let target = thread::thread_by_tid(tid).ok_or(Errno::ESRCH)?;
    let (spid, suid) = sender_identity();
    kill_thread(&target, SigInfo::user(signo, spid, suid))
}

// ---------------------------------------------------------------------
// Masks
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHow {
    Block,
    Unblock,
    SetMask,
}

impl SigHow {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(SigHow::Block),
            1 => Ok(SigHow::Unblock),
            2 => Ok(SigHow::SetMask),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// Shared mask-edit primitive. SIGKILL and SIGSTOP can never enter a
/// mask.
pub fn sigmask_apply(
    cell: &SigSetCell,
    how: SigHow,
    set: Option<&SigSet>,
    oset: Option<&mut SigSet>,
) -> Result<()> {
    if let Some(old) = oset {
        *old = cell.load();
    }

    let set = match set {
        Some(s) => s,
        None => return Ok(()),
    };

    if set.contains(SIGKILL) || set.contains(SIGSTOP) {
        return Err(Errno::EINVAL);
    }

    match how {
        SigHow::SetMask => cell.store(*set),
        SigHow::Block => cell.store(cell.load().union(*set)),
        SigHow::Unblock => cell.store(cell.load().minus(*set)),
    }
    Ok(())
}

/// Edit a specific thread's mask.
pub fn thread_sigmask(
    thread: &Thread,
    how: SigHow,
    set: Option<&SigSet>,
    oset: Option<&mut SigSet>,
) -> Result<()> {
    sigmask_apply(&thread.sigs.mask, how, set, oset)
}

/// Edit the calling thread's mask.
pub fn pthread_sigmask(how: SigHow, set: Option<&SigSet>, oset: Option<&mut SigSet>) -> Result<()> {
    let current = thread::current().ok_or(Errno::EINVAL)?;
    thread_sigmask(&current, how, set, oset)
}

/// Edit the group-wide mask.
pub fn sigprocmask(how: SigHow, set: Option<&SigSet>, oset: Option<&mut SigSet>) -> Result<()> {
    let current = thread::current().ok_or(Errno::EINVAL)?;
    sigmask_apply(&current.group().signals.mask, how, set, oset)
}

// ---------------------------------------------------------------------
// Action install
// ---------------------------------------------------------------------

/// Install a disposition. SIGKILL/SIGSTOP reconfiguration is refused;
/// installing an ignoring disposition flushes queued payloads for that
/// signal at both scopes.
pub fn sigaction(signo: i32, act: Option<&SigAction>, oact: Option<&mut SigAction>) -> Result<()> {
    if !sig_valid(signo) || !sig_catchable(signo) {
        return Err(Errno::EINVAL);
    }

    let current = thread::current().ok_or(Errno::EINVAL)?;
    let group = current.group();

    if let Some(old) = oact {
        *old = group.signals.action(signo);
    }

    let act = match act {
        Some(a) => a,
        None => return Ok(()),
    };

    let mut cleaned = *act;
    cleaned.mask.del(SIGKILL);
    cleaned.mask.del(SIGSTOP);
    group.signals.set_action(signo, cleaned);

    if cleaned.ignores(signo) {
        group.signals.pending.flush(signo);
        for member in group.members.lock().iter() {
            member.sigs.pending.flush(signo);
        }
    }

    Ok(())
}

/// Pending-but-blocked signals of the calling thread (both scopes).
pub fn sigpending() -> Result<SigSet> {
    let current = thread::current().ok_or(Errno::EINVAL)?;
    let pending = current
        .sigs
        .pending
        .pending()
        .union(current.group().signals.pending.pending());
    Ok(SigSet(pending.0 & current.sigs.mask.load().0))
}

/// Install or query the alternate signal stack.
pub fn sigaltstack(ss: Option<&UcStack>) -> Result<UcStack> {
    let current = thread::current().ok_or(Errno::EINVAL)?;
    current.lock.lock();
    let inner = unsafe { current.inner_locked() };

    // the stack in use cannot be replaced from on top of it
    if inner.altstack.flags & SS_ONSTACK != 0 {
        current.lock.unlock();
        return Err(Errno::EPERM);
    }

    let old = inner.altstack;
    if let Some(ss) = ss {
        if ss.flags & !SS_DISABLE != 0 || (ss.flags & SS_DISABLE == 0 && ss.size < arch::MIN_SIGSTACK)
        {
            current.lock.unlock();
            return Err(Errno::EINVAL);
        }
        inner.altstack = *ss;
    }
    current.lock.unlock();
    Ok(old)
}

// ---------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    /// Nothing deliverable.
    None,
    /// A user handler frame was built; resume user mode to run it.
    Handled(i32),
    /// Disposition was ignore; more may be pending.
    Ignored(i32),
    /// Default action: terminate the group with this status.
    Terminated(i32),
    /// Default action: stop the thread.
    Stopped(i32),
    /// SIGCONT with no handler.
    Continued,
}

/// Deliver the lowest deliverable signal to the calling thread, building
/// a handler frame when a handler is installed. One signal per call;
/// the trap tail loops until `None` or a handler frame is ready.
pub fn deliver_one(current: &Arc<Thread>) -> Delivered {
    let group = current.group();

    let mask = current.sigs.mask.load();
    let deliverable = current
        .sigs
        .pending
        .pending()
        .union(group.signals.pending.pending())
        .minus(mask);

    let signo = match deliverable.first() {
        Some(s) => s,
        None => return Delivered::None,
    };

    // thread-scope payloads first, then group scope
    let info = current
        .sigs
        .pending
        .take(signo)
        .or_else(|| group.signals.pending.take(signo))
        .unwrap_or_else(|| SigInfo::kernel(signo));

    let action = group.signals.action(signo);

    match action.handler {
        SigHandler::Ignore => Delivered::Ignored(signo),
        SigHandler::Default => match default_action(signo) {
            DefaultAction::Ignore => Delivered::Ignored(signo),
            DefaultAction::Terminate => {
                Delivered::Terminated(crate::process::exit::w_exitcode(0, signo))
            }
            DefaultAction::Stop => Delivered::Stopped(signo),
            DefaultAction::Continue => Delivered::Continued,
        },
        SigHandler::Handler(addr) => match build_handler_frame(current, signo, &info, addr, &action)
        {
            Ok(()) => Delivered::Handled(signo),
            Err(err) => {
                crate::warn!(
                    "thread {}: handler frame for signal {} failed ({:?}), killing",
                    current.tid,
                    signo,
                    err
                );
                Delivered::Terminated(crate::process::exit::w_exitcode(0, signo))
            }
        },
    }
}

/// User-stack frame, from high to low addresses:
///
/// ```text
///   saved Ucontext            (restored by sigreturn)
///   SigInfo
///   sigreturn trampoline      (handler's return address; final rsp)
/// ```
fn build_handler_frame(
    current: &Arc<Thread>,
    signo: i32,
    info: &SigInfo,
    handler: u64,
    action: &SigAction,
) -> Result<()> {
    current.lock.lock();
    let res = (|| {
        let inner = unsafe { current.inner_locked() };

        let uctx = inner.uctx_chain.last_mut().ok_or(Errno::EINVAL)?;
        let prev_mask = current.sigs.mask.load();

        if inner.sig_nested >= NSIG_NESTED_MAX {
            return Err(Errno::EOVERFLOW);
        }

        // stack selection
        let on_alt = inner.altstack.contains(uctx.mcontext.rsp);
        let use_alt = action.flags.contains(SaFlags::ONSTACK)
            && inner.altstack.flags & SS_DISABLE == 0
            && !on_alt;
        let mut sp = if use_alt {
            inner.altstack.sp + inner.altstack.size
        } else {
            uctx.mcontext.rsp
        };

        // saved context: what sigreturn will restore
        let mut saved = *uctx;
        saved.sigmask = prev_mask.0;
        saved.stack = inner.altstack;
        saved.link = inner.sig_frames.last().copied().unwrap_or(0);

        sp = arch::align16_down(sp - arch::UCONTEXT_SIZE as u64);
        let uctx_addr = sp;
        hal::paging().copy_to_user(uctx_addr, arch::as_bytes(&saved))?;

        sp = arch::align16_down(sp - SIGINFO_SIZE as u64);
        let info_addr = sp;
        hal::paging().copy_to_user(info_addr, arch::as_bytes(info))?;

        sp -= 8;
        hal::paging().copy_to_user(sp, &SIGRETURN_TRAMPOLINE.to_le_bytes())?;

        // redirect the interrupted context into the handler
        uctx.mcontext.rip = handler;
        uctx.mcontext.rsp = sp;
        uctx.mcontext.rbp = sp;
        uctx.mcontext.rdi = signo as u64;
        if action.flags.contains(SaFlags::SIGINFO) {
            uctx.mcontext.rsi = info_addr;
            uctx.mcontext.rdx = uctx_addr;
        }

        if use_alt {
            inner.altstack.flags |= SS_ONSTACK;
        }

        // handler runs with: old mask + action mask + the signal itself
        // unless SA_NODEFER
        let mut new_mask = prev_mask.union(action.mask);
        if !action.flags.contains(SaFlags::NODEFER) {
            new_mask.add(signo);
        }
        new_mask.del(SIGKILL);
        new_mask.del(SIGSTOP);
        current.sigs.mask.store(new_mask);

        inner.sig_frames.push(uctx_addr);
        inner.sig_nested += 1;

        if action.flags.contains(SaFlags::RESETHAND) {
            // one-shot disposition
            let group = current.group();
            let mut reset = group.signals.action(signo);
            reset.handler = SigHandler::Default;
            group.signals.set_action(signo, reset);
        }

        Ok(())
    })();
    current.lock.unlock();
    res
}

/// Restore the context saved by the innermost handler frame.
pub fn sigreturn() -> Result<u64> {
    let current = thread::current().ok_or(Errno::EINVAL)?;
    current.lock.lock();
    let res = (|| {
        let inner = unsafe { current.inner_locked() };

        let uctx_addr = inner.sig_frames.pop().ok_or(Errno::EINVAL)?;
        let mut saved = arch::Ucontext::default();
        let mut buf = [0u8; arch::UCONTEXT_SIZE];
        hal::paging().copy_from_user(&mut buf, uctx_addr)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                &mut saved as *mut arch::Ucontext as *mut u8,
                arch::UCONTEXT_SIZE,
            );
        }

        let uctx = inner.uctx_chain.last_mut().ok_or(Errno::EINVAL)?;
        uctx.mcontext = saved.mcontext;
        current.sigs.mask.store(SigSet(saved.sigmask));

        // leaving the alternate stack re-arms it
        inner.altstack.flags &= !SS_ONSTACK;
        inner.sig_nested = inner.sig_nested.saturating_sub(1);

        Ok(saved.mcontext.rax)
    })();
    current.lock.unlock();
    res
}

lazy_static::lazy_static! {
    static ref SIGWAITERS: WaitQueue = WaitQueue::new();
}

/// Atomically swap the mask and block until an unmasked signal arrives;
/// the previous mask is restored on the way out. Always returns `EINTR`.
pub fn sigsuspend(mask: &SigSet) -> Result<()> {
    let current = thread::current().ok_or(Errno::EINVAL)?;

    let mut old = SigSet::EMPTY;
    sigmask_apply(
        &current.sigs.mask,
        SigHow::SetMask,
        Some(mask),
        Some(&mut old),
    )?;

    loop {
        // a signal that slipped in between the swap and the block is
        // caught by the interruption check inside sched_wait
        match wait::sched_wait(&SIGWAITERS, ThreadState::Sleep, Whence::Tail, None) {
            Err(Errno::EINTR) => break,
            Err(_) | Ok(()) => {
                if has_deliverable(&current) {
                    break;
                }
            }
        }
    }

    sigmask_apply(&current.sigs.mask, SigHow::SetMask, Some(&old), None)?;
    Err(Errno::EINTR)
}

/// Wait for a member of `set`, dequeueing its payload. A zero timeout
/// polls once; no timeout waits forever.
pub fn sigtimedwait(set: &SigSet, timeout: Option<&TimeSpec>) -> Result<SigInfo> {
    if let Some(ts) = timeout {
        if !ts.is_valid() {
            return Err(Errno::EINVAL);
        }
    }

    let current = thread::current().ok_or(Errno::EINVAL)?;
    let wanted = set.minus(SigSet::single(SIGKILL).union(SigSet::single(SIGSTOP)));

    let check = |current: &Arc<Thread>| -> Option<SigInfo> {
        current
            .sigs
            .pending
            .take_first_in(wanted)
            .or_else(|| current.group().signals.pending.take_first_in(wanted))
    };

    match timeout {
        Some(ts) => {
            let deadline = time::jiffies() + time::jiffies_from_timespec(ts);
            loop {
                if let Some(info) = check(&current) {
                    return Ok(info);
                }
                if !time::time_before(time::jiffies(), deadline) {
                    return Err(Errno::EAGAIN);
                }
                crate::process::scheduler::yield_now();
            }
        }
        None => loop {
            if let Some(info) = check(&current) {
                return Ok(info);
            }
            crate::process::scheduler::yield_now();
        },
    }
}

/// `sigtimedwait` without a deadline.
pub fn sigwaitinfo(set: &SigSet) -> Result<SigInfo> {
    sigtimedwait(set, None)
}

/// Senders park threads here while a stop disposition is in force; the
/// timer worker and trap tail call this to let a stopped thread actually
/// stop.
pub fn stop_current(group: &Arc<ThreadGroup>) {
    let _ = wait::sched_wait(&group.stopq, ThreadState::Stopped, Whence::Tail, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn sigset_basics() {
        let mut set = SigSet::EMPTY;
        set.add(SIGUSR1);
        set.add(SIGTERM);
        assert!(set.contains(SIGUSR1));
        assert_eq!(set.first(), Some(SIGUSR1));
        set.del(SIGUSR1);
        assert_eq!(set.first(), Some(SIGTERM));
        assert!(!SigSet::EMPTY.contains(SIGHUP));
    }

    #[test]
    fn pending_queue_fifo_and_bit_clearing() {
        let p = SigPending::new();
        p.post(SigInfo::user(SIGUSR1, 7, 0));
        p.post(SigInfo::user(SIGUSR1, 8, 0));
        assert!(p.pending().contains(SIGUSR1));

        assert_eq!(p.take(SIGUSR1).unwrap().pid, 7);
        assert!(p.pending().contains(SIGUSR1)); // second payload queued
        assert_eq!(p.take(SIGUSR1).unwrap().pid, 8);
        assert!(!p.pending().contains(SIGUSR1));
        assert!(p.take(SIGUSR1).is_none());
    }

    #[test]
    fn sigaction_rejects_kill_and_stop() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-act");

        test_utils::as_current(&th, || {
            let act = SigAction::default();
            assert_eq!(sigaction(SIGKILL, Some(&act), None), Err(Errno::EINVAL));
            assert_eq!(sigaction(SIGSTOP, Some(&act), None), Err(Errno::EINVAL));
            assert_eq!(sigaction(0, Some(&act), None), Err(Errno::EINVAL));
            assert_eq!(sigaction(NSIG as i32, Some(&act), None), Err(Errno::EINVAL));
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn sigaction_strips_kill_stop_from_handler_mask() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-mask-strip");

        test_utils::as_current(&th, || {
            let mut act = SigAction {
                handler: SigHandler::Handler(0x5000),
                ..SigAction::default()
            };
            act.mask.add(SIGKILL);
            act.mask.add(SIGUSR2);
            sigaction(SIGUSR1, Some(&act), None).unwrap();

            let mut old = SigAction::default();
            sigaction(SIGUSR1, None, Some(&mut old)).unwrap();
            assert!(!old.mask.contains(SIGKILL));
            assert!(old.mask.contains(SIGUSR2));
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn ignore_install_flushes_queued_payloads() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-flush");

        th.sigs.pending.post(SigInfo::user(SIGUSR1, 1, 0));
        th.group().signals.pending.post(SigInfo::user(SIGUSR1, 1, 0));

        test_utils::as_current(&th, || {
            let act = SigAction {
                handler: SigHandler::Ignore,
                ..SigAction::default()
            };
            sigaction(SIGUSR1, Some(&act), None).unwrap();
        });

        assert!(!th.sigs.pending.pending().contains(SIGUSR1));
        assert!(!th.group().signals.pending.pending().contains(SIGUSR1));

        test_utils::retire_thread(&th);
    }

    #[test]
    fn sigprocmask_never_masks_kill_or_stop() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-procmask");

        test_utils::as_current(&th, || {
            let mut set = SigSet::EMPTY;
            set.add(SIGKILL);
            assert_eq!(
                sigprocmask(SigHow::Block, Some(&set), None),
                Err(Errno::EINVAL)
            );

            let mut set = SigSet::EMPTY;
            set.add(SIGSTOP);
            assert_eq!(
                sigprocmask(SigHow::SetMask, Some(&set), None),
                Err(Errno::EINVAL)
            );

            // group mask untouched on failure
            assert!(th.group().signals.mask.load().is_empty());
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn masked_signal_stays_pending_until_unblocked() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-masked");

        // A masks SIGUSR1; B sends it
        test_utils::as_current(&th, || {
            let mut set = SigSet::EMPTY;
            set.add(SIGUSR1);
            pthread_sigmask(SigHow::Block, Some(&set), None).unwrap();
        });
        pthread_kill(th.tid, SIGUSR1).unwrap();

        assert!(th.sigs.pending.pending().contains(SIGUSR1));
        assert_eq!(deliver_one(&th), Delivered::None); // handler must not run

        // A clears the mask: next dispatch delivers exactly once
        test_utils::as_current(&th, || {
            let mut set = SigSet::EMPTY;
            set.add(SIGUSR1);
            pthread_sigmask(SigHow::Unblock, Some(&set), None).unwrap();

            let act = SigAction {
                handler: SigHandler::Ignore,
                ..SigAction::default()
            };
            sigaction(SIGUSR1, Some(&act), None).unwrap();
        });

        // flushed by the ignore install: deliver reports nothing left
        assert_eq!(deliver_one(&th), Delivered::None);

        test_utils::retire_thread(&th);
    }

    #[test]
    fn lowest_signo_delivers_first_thread_scope_preferred() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-order");

        th.sigs.pending.post(SigInfo::user(SIGTERM, 1, 0));
        th.group().signals.pending.post(SigInfo::user(SIGUSR1, 2, 0));

        test_utils::as_current(&th, || {
            // both default-terminate; the lower signo (SIGUSR1) wins
            match deliver_one(&th) {
                Delivered::Terminated(status) => {
                    assert_eq!(status & 0x7f, SIGUSR1);
                }
                other => panic!("unexpected delivery {:?}", other),
            }
        });

        th.sigs.pending.flush(SIGTERM);
        test_utils::retire_thread(&th);
    }

    #[test]
    fn default_ignore_signals_are_discarded() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-chld");

        th.sigs.pending.post(SigInfo::user(SIGCHLD, 1, 0));
        test_utils::as_current(&th, || {
            assert_eq!(deliver_one(&th), Delivered::Ignored(SIGCHLD));
            assert_eq!(deliver_one(&th), Delivered::None);
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn handler_frame_redirects_user_context() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-frame");
        let usp = test_utils::user_stack_top();

        th.with_inner(|i| {
            i.uctx_chain.push(arch::Ucontext {
                mcontext: arch::Mcontext {
                    rip: 0x4000_0000,
                    rsp: usp,
                    rax: 77,
                    ..arch::Mcontext::default()
                },
                ..arch::Ucontext::default()
            });
        });

        test_utils::as_current(&th, || {
            let act = SigAction {
                handler: SigHandler::Handler(0x5000_0000),
                flags: SaFlags::SIGINFO,
                ..SigAction::default()
            };
            sigaction(SIGUSR1, Some(&act), None).unwrap();
            pthread_kill(th.tid, SIGUSR1).unwrap();

            assert_eq!(deliver_one(&th), Delivered::Handled(SIGUSR1));

            th.with_inner(|i| {
                let uctx = i.uctx_chain.last().unwrap();
                assert_eq!(uctx.mcontext.rip, 0x5000_0000);
                assert_eq!(uctx.mcontext.rdi, SIGUSR1 as u64);
                assert!(uctx.mcontext.rsp < usp);
                // SA_SIGINFO passes (signo, siginfo*, ucontext*)
                assert_ne!(uctx.mcontext.rsi, 0);
                assert_ne!(uctx.mcontext.rdx, 0);
                assert_eq!(i.sig_nested, 1);
            });

            // handler mask: previous mask + the signal itself
            assert!(th.sigs.mask.load().contains(SIGUSR1));

            // the frame's return address is the sigreturn trampoline
            let rsp = th.with_inner(|i| i.uctx_chain.last().unwrap().mcontext.rsp);
            let mut buf = [0u8; 8];
            hal::paging().copy_from_user(&mut buf, rsp).unwrap();
            assert_eq!(u64::from_le_bytes(buf), SIGRETURN_TRAMPOLINE);

            // sigreturn unwinds: rip/rsp/mask restored
            let rax = sigreturn().unwrap();
            assert_eq!(rax, 77);
            th.with_inner(|i| {
                let uctx = i.uctx_chain.last().unwrap();
                assert_eq!(uctx.mcontext.rip, 0x4000_0000);
                assert_eq!(uctx.mcontext.rsp, usp);
                assert_eq!(i.sig_nested, 0);
            });
            assert!(!th.sigs.mask.load().contains(SIGUSR1));
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn handler_honors_alt_stack() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-altstack");
        let usp = test_utils::user_stack_top();
        let alt_base = test_utils::alt_stack_base();
        let alt_size = 0x2000u64;

        th.with_inner(|i| {
            i.uctx_chain.push(arch::Ucontext {
                mcontext: arch::Mcontext {
                    rsp: usp,
                    ..arch::Mcontext::default()
                },
                ..arch::Ucontext::default()
            });
        });

        test_utils::as_current(&th, || {
            sigaltstack(Some(&UcStack::new(alt_base, alt_size, 0))).unwrap();

            let act = SigAction {
                handler: SigHandler::Handler(0x6000_0000),
                flags: SaFlags::ONSTACK,
                ..SigAction::default()
            };
            sigaction(SIGUSR2, Some(&act), None).unwrap();
            pthread_kill(th.tid, SIGUSR2).unwrap();

            assert_eq!(deliver_one(&th), Delivered::Handled(SIGUSR2));
            th.with_inner(|i| {
                let rsp = i.uctx_chain.last().unwrap().mcontext.rsp;
                assert!(rsp >= alt_base && rsp < alt_base + alt_size);
                assert!(i.altstack.flags & SS_ONSTACK != 0);
            });

            // replacing the stack from on top of it is refused
            assert_eq!(
                sigaltstack(Some(&UcStack::new(alt_base, alt_size, 0))),
                Err(Errno::EPERM)
            );

            sigreturn().unwrap();
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn sigtimedwait_zero_timeout_polls() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-timedwait");

        test_utils::as_current(&th, || {
            let mut set = SigSet::EMPTY;
            set.add(SIGUSR1);

            // nothing pending: immediate EAGAIN
            assert_eq!(
                sigtimedwait(&set, Some(&TimeSpec::ZERO)).unwrap_err(),
                Errno::EAGAIN
            );

            // pending member: dequeued and returned
            pthread_kill(th.tid, SIGUSR1).unwrap();
            let info = sigtimedwait(&set, Some(&TimeSpec::ZERO)).unwrap();
            assert_eq!(info.signo, SIGUSR1);
            assert!(!th.sigs.pending.pending().contains(SIGUSR1));

            // SIGKILL/SIGSTOP are silently excluded from the watch set
            let mut set = SigSet::EMPTY;
            set.add(SIGKILL);
            assert_eq!(
                sigtimedwait(&set, Some(&TimeSpec::ZERO)).unwrap_err(),
                Errno::EAGAIN
            );

            // invalid timeout
            let bad = TimeSpec::new(0, crate::time::NSEC_PER_SEC);
            assert_eq!(
                sigtimedwait(&SigSet::EMPTY, Some(&bad)).unwrap_err(),
                Errno::EINVAL
            );
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn sigsuspend_observes_signal_arriving_before_block() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-suspend");

        // mask SIGUSR1, make it pending, then suspend with a mask that
        // unblocks it: the pending signal must be observed immediately
        test_utils::as_current(&th, || {
            let mut blocked = SigSet::EMPTY;
            blocked.add(SIGUSR1);
            pthread_sigmask(SigHow::Block, Some(&blocked), None).unwrap();

            pthread_kill(th.tid, SIGUSR1).unwrap();

            let suspend_mask = SigSet::EMPTY; // unblocks everything
            assert_eq!(sigsuspend(&suspend_mask), Err(Errno::EINTR));

            // previous mask restored
            assert!(th.sigs.mask.load().contains(SIGUSR1));
        });

        th.sigs.pending.flush(SIGUSR1);
        test_utils::retire_thread(&th);
    }

    #[test]
    fn sigpending_reports_blocked_pending() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("sig-pending");

        test_utils::as_current(&th, || {
            let mut set = SigSet::EMPTY;
            set.add(SIGUSR2);
            pthread_sigmask(SigHow::Block, Some(&set), None).unwrap();
            pthread_kill(th.tid, SIGUSR2).unwrap();

            let pending = sigpending().unwrap();
            assert!(pending.contains(SIGUSR2));
        });

        th.sigs.pending.flush(SIGUSR2);
        test_utils::retire_thread(&th);
    }

    #[test]
    fn group_send_prefers_unmasking_member() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let main = test_utils::spawn_thread("grp-main");
        let helper = crate::process::thread::thread_create(
            "grp-helper",
            crate::process::thread::ThreadEntry::Kernel {
                entry: test_utils::nop_entry,
                arg: 0,
            },
            crate::process::thread::CreateFlags::empty(),
            Some(main.group()),
        )
        .unwrap();

        // main masks SIGUSR1; the group send must pick the helper
        let mut set = SigSet::EMPTY;
        set.add(SIGUSR1);
        thread_sigmask(&main, SigHow::Block, Some(&set), None).unwrap();

        kill(main.pid(), SIGUSR1).unwrap();
        assert!(main.group().signals.pending.pending().contains(SIGUSR1));

        // helper is eligible and sees the group-scope signal
        assert!(has_deliverable(&helper));
        assert!(!has_deliverable(&main));

        main.group().signals.pending.flush(SIGUSR1);
        test_utils::retire_thread(&helper);
        test_utils::retire_thread(&main);
    }

    #[test]
    fn kill_unknown_pid_is_esrch() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        assert_eq!(kill(999_999, SIGTERM), Err(Errno::ESRCH));
        assert_eq!(pthread_kill(999_999, SIGTERM), Err(Errno::ESRCH));
        assert_eq!(kill(1, 0), Err(Errno::EINVAL));
    }
}
