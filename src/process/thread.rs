/// Thread control blocks and thread groups.
///
/// A `Thread` is the unit of scheduling: its own spinlock guards the
/// mutable scheduling state, the flag word and timeslice are atomics so
/// the tick and cross-thread signalling stay lock-free. A `ThreadGroup`
/// is the unit of resource sharing (address space, files, credentials,
/// signal descriptor); the group with tgid == pid is what user space
/// calls a process.

use crate::arch::{self, UcStack, Ucontext};
use crate::error::{Errno, Result};
use crate::mm::page::PAGE_SIZE;
use crate::mm::zone::{self, Gfp, PageRun};
use crate::process::signal::{SigInfo, SignalDesc, ThreadSignals};
use crate::process::wait::WaitQueue;
use crate::sync::cond::CondVar;
use crate::sync::spinlock::{RawLock, SpinLock};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

pub type Tid = i32;

/// Kernel stacks are 16 KiB (order-2 runs).
pub const KSTACK_ORDER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Embryo,
    Ready,
    Running,
    Sleep,
    Stopped,
    Zombie,
    Terminated,
}

impl ThreadState {
    pub fn name(self) -> &'static str {
        match self {
            ThreadState::Embryo => "EMBRYO",
            ThreadState::Ready => "READY",
            ThreadState::Running => "RUNNING",
            ThreadState::Sleep => "SLEEP",
            ThreadState::Stopped => "STOPPED",
            ThreadState::Zombie => "ZOMBIE",
            ThreadState::Terminated => "TERMINATED",
        }
    }

    /// Blocked states a wakeup may pull a thread out of.
    pub fn is_blocked(self) -> bool {
        matches!(self, ThreadState::Sleep | ThreadState::Stopped)
    }
}

/// Why a blocked thread was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupReason {
    None,
    Normal,
    Signal,
    Timeout,
    Error,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u64 {
        /// Cancellation requested; observed at interruption checks.
        const CANCELED = 1 << 0;
        /// Parked outside any wait queue.
        const PARK = 1 << 1;
        /// Woken before it managed to switch out; the next `sched()`
        /// returns immediately.
        const WAKE = 1 << 2;
        const NO_PREEMPT = 1 << 3;
        /// Group leader.
        const MAIN = 1 << 4;
        const USER = 1 << 5;
        const DETACHED = 1 << 6;
        /// Quantum exhausted; yield on the next trap-return.
        const YIELD_PENDING = 1 << 7;
    }
}

/// Scheduling-relevant mutable state, guarded by the thread's own lock.
pub struct ThreadInner {
    pub state: ThreadState,
    pub prio: usize,
    pub wakeup: WakeupReason,
    /// Back-pointer to the wait queue this thread is linked into.
    pub wait_queue: Option<Weak<crate::process::wait::WaitQueueInner>>,
    pub exit_code: usize,
    /// Saved context pointer, live while the thread is switched out.
    pub ctx: u64,
    /// Chain of saved user contexts, innermost trap last.
    pub uctx_chain: Vec<Ucontext>,
    pub altstack: UcStack,
    pub sig_nested: u32,
    /// User addresses of live handler frames, innermost last.
    pub sig_frames: Vec<u64>,
}

pub struct Thread {
    pub tid: Tid,
    pub name: String,
    flags: AtomicU64,
    /// Remaining quantum in jiffies; decremented from the tick.
    pub timeslice: AtomicU64,
    pub lock: RawLock,
    inner: UnsafeCell<ThreadInner>,
    pub sigs: ThreadSignals,
    group: spin::Mutex<Option<Arc<ThreadGroup>>>,
    pub kstack: PageRun,
    /// Joiners block here until the thread turns zombie.
    pub join_event: CondVar,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Run `f` with the thread lock held.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut ThreadInner) -> R) -> R {
        self.lock.lock();
        let r = f(unsafe { &mut *self.inner.get() });
        self.lock.unlock();
        r
    }

    /// Access the inner state while the thread lock is already held.
    ///
    /// # Safety
    /// The caller must hold `self.lock`.
    pub unsafe fn inner_locked(&self) -> &mut ThreadInner {
        debug_assert!(self.lock.holding(), "thread inner access without lock");
        &mut *self.inner.get()
    }

    pub fn state(&self) -> ThreadState {
        self.with_inner(|i| i.state)
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn test_flags(&self, f: ThreadFlags) -> bool {
        self.flags().contains(f)
    }

    pub fn set_flags(&self, f: ThreadFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, f: ThreadFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    pub fn group(&self) -> Arc<ThreadGroup> {
        self.group.lock().clone().expect("thread without a group")
    }

    pub fn pid(&self) -> Tid {
        self.group().tgid
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self.state(), ThreadState::Zombie | ThreadState::Terminated)
    }

    pub fn kstack_top(&self) -> u64 {
        self.kstack.phys() + ((1usize << KSTACK_ORDER) * PAGE_SIZE) as u64
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("state", &self.state().name())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Process credentials, shared across the group.
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

/// Handle to the group's address space. The mapping layer owns the
/// contents; the core only shares and duplicates the handle.
#[derive(Debug, Default)]
pub struct Mmap {
    pub pdbr: AtomicU64,
    pub brk: AtomicU64,
}

/// Handle to the group's open-file context, owned by the VFS layer.
#[derive(Debug, Default)]
pub struct FileCtx {
    _opaque: (),
}

pub struct ThreadGroup {
    pub tgid: Tid,
    pub members: SpinLock<Vec<Arc<Thread>>>,
    pub signals: SignalDesc,
    pub mmap: Arc<Mmap>,
    pub files: Arc<FileCtx>,
    pub cred: spin::Mutex<Credentials>,
    pub exiting: AtomicBool,
    pub exit_status: AtomicI32,
    /// All members dead; the group awaits reaping by `waitpid`.
    pub zombie: AtomicBool,
    /// Members stopped by a stop signal sleep here until SIGCONT.
    pub stopq: WaitQueue,
    /// Parents block here in `waitpid`.
    pub child_waitq: WaitQueue,
    pub parent: spin::Mutex<Weak<ThreadGroup>>,
    pub children: spin::Mutex<Vec<Arc<ThreadGroup>>>,
}

impl ThreadGroup {
    fn new(tgid: Tid) -> Arc<Self> {
        Arc::new(Self {
            tgid,
            members: SpinLock::new(Vec::new()),
            signals: SignalDesc::new(),
            mmap: Arc::new(Mmap::default()),
            files: Arc::new(FileCtx::default()),
            cred: spin::Mutex::new(Credentials::default()),
            exiting: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
            zombie: AtomicBool::new(false),
            stopq: WaitQueue::new(),
            child_waitq: WaitQueue::new(),
            parent: spin::Mutex::new(Weak::new()),
            children: spin::Mutex::new(Vec::new()),
        })
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.members
            .lock()
            .iter()
            .find(|t| t.test_flags(ThreadFlags::MAIN))
            .cloned()
    }

    pub fn member_by_tid(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.members.lock().iter().find(|t| t.tid == tid).cloned()
    }

    pub fn ppid(&self) -> Tid {
        self.parent.lock().upgrade().map_or(0, |p| p.tgid)
    }
}

impl core::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("tgid", &self.tgid)
            .field("members", &self.member_count())
            .finish()
    }
}

// ---------------------------------------------------------------------
// Global tables
// ---------------------------------------------------------------------

static NEXT_TID: AtomicI32 = AtomicI32::new(1);

lazy_static::lazy_static! {
    static ref THREAD_TABLE: SpinLock<BTreeMap<Tid, Arc<Thread>>> =
        SpinLock::new(BTreeMap::new());
    static ref GROUP_TABLE: SpinLock<BTreeMap<Tid, Arc<ThreadGroup>>> =
        SpinLock::new(BTreeMap::new());
}

pub fn alloc_tid() -> Tid {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

pub fn thread_by_tid(tid: Tid) -> Option<Arc<Thread>> {
    THREAD_TABLE.lock().get(&tid).cloned()
}

pub fn group_by_pid(pid: Tid) -> Option<Arc<ThreadGroup>> {
    GROUP_TABLE.lock().get(&pid).cloned()
}

pub(crate) fn unregister_thread(tid: Tid) {
    THREAD_TABLE.lock().remove(&tid);
}

pub(crate) fn unregister_group(tgid: Tid) {
    GROUP_TABLE.lock().remove(&tgid);
}

pub fn current() -> Option<Arc<Thread>> {
    crate::smp::current()
}

pub fn current_tid() -> Option<Tid> {
    crate::smp::current().map(|t| t.tid)
}

// ---------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------

/// What the thread starts executing after its first dispatch.
pub enum ThreadEntry {
    Kernel {
        entry: extern "C" fn(usize) -> usize,
        arg: usize,
    },
    User {
        entry: u64,
        arg: u64,
        ustack_top: u64,
        ustack_flags: u32,
    },
    Execve {
        entry: u64,
        argc: u64,
        argv: u64,
        envp: u64,
        ustack_top: u64,
        ustack_flags: u32,
    },
    /// Resume the parent's saved user context with rax = 0.
    Fork {
        parent_mctx: arch::Mcontext,
    },
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// Enqueue into the run queue right away.
        const SCHED = 1 << 0;
        const DETACHED = 1 << 1;
    }
}

/// Create a thread. With `group == None` the thread becomes the main
/// thread of a fresh group (a new process); otherwise it joins the given
/// group and shares its resources.
pub fn thread_create(
    name: &str,
    entry: ThreadEntry,
    flags: CreateFlags,
    group: Option<Arc<ThreadGroup>>,
) -> Result<Arc<Thread>> {
    let tid = alloc_tid();
    let kstack = zone::alloc_order(Gfp::KERNEL_ZERO, KSTACK_ORDER)?;
    let kstack_top = kstack.phys() + ((1usize << KSTACK_ORDER) * PAGE_SIZE) as u64;

    let (ctx, is_user) = match &entry {
        ThreadEntry::Kernel { entry, arg } => {
            let addr = *entry as usize as u64;
            (arch::kernel_frame(kstack_top, addr, *arg as u64)?, false)
        }
        ThreadEntry::User {
            entry,
            arg,
            ustack_top,
            ustack_flags,
        } => (
            arch::user_frame(kstack_top, *ustack_top, *ustack_flags, *entry, *arg)?,
            true,
        ),
        ThreadEntry::Execve {
            entry,
            argc,
            argv,
            envp,
            ustack_top,
            ustack_flags,
        } => (
            arch::execve_frame(
                kstack_top,
                *ustack_top,
                *ustack_flags,
                *entry,
                *argc,
                *argv,
                *envp,
            )?,
            true,
        ),
        ThreadEntry::Fork { parent_mctx } => (arch::fork_frame(kstack_top, parent_mctx)?, true),
    };

    let thread = Arc::new(Thread {
        tid,
        name: String::from(name),
        flags: AtomicU64::new(0),
        timeslice: AtomicU64::new(0),
        lock: RawLock::new(),
        inner: UnsafeCell::new(ThreadInner {
            state: ThreadState::Embryo,
            prio: crate::process::scheduler::MLFQ_HIGHEST,
            wakeup: WakeupReason::None,
            wait_queue: None,
            exit_code: 0,
            ctx,
            uctx_chain: Vec::new(),
            altstack: UcStack::disabled(),
            sig_nested: 0,
            sig_frames: Vec::new(),
        }),
        sigs: ThreadSignals::new(),
        group: spin::Mutex::new(None),
        kstack,
        join_event: CondVar::new(),
    });

    if is_user {
        thread.set_flags(ThreadFlags::USER);
    }
    if flags.contains(CreateFlags::DETACHED) {
        thread.set_flags(ThreadFlags::DETACHED);
    }

    match group {
        None => {
            let group = ThreadGroup::new(tid);
            thread.set_flags(ThreadFlags::MAIN);
            group.members.lock().push(thread.clone());
            *thread.group.lock() = Some(group.clone());
            GROUP_TABLE.lock().insert(tid, group);
        }
        Some(group) => {
            group.members.lock().push(thread.clone());
            *thread.group.lock() = Some(group);
        }
    }

    THREAD_TABLE.lock().insert(tid, thread.clone());

    crate::debug!("thread {} ({}) created", tid, thread.name);

    if flags.contains(CreateFlags::SCHED) {
        thread.lock.lock();
        crate::process::scheduler::sched_enqueue(&thread);
        thread.lock.unlock();
    }

    Ok(thread)
}

/// Duplicate the calling thread into a fresh group: the `fork` half the
/// core owns. The caller's most recent user context seeds the child,
/// which resumes with rax = 0. Address-space duplication belongs to the
/// mapping layer; here the new group starts with its own handle.
pub fn fork_current() -> Result<Arc<Thread>> {
    let current = current().ok_or(Errno::EINVAL)?;
    let parent_mctx = current.with_inner(|i| {
        i.uctx_chain
            .last()
            .map(|uc| uc.mcontext)
            .ok_or(Errno::EINVAL)
    })?;

    let child = thread_create(
        &current.name,
        ThreadEntry::Fork { parent_mctx },
        CreateFlags::empty(),
        None,
    )?;

    // inherit identity and link the process tree
    let parent_group = current.group();
    let child_group = child.group();
    *child_group.cred.lock() = *parent_group.cred.lock();
    *child_group.parent.lock() = Arc::downgrade(&parent_group);
    parent_group.children.lock().push(child_group.clone());

    // the child observes the parent's signal dispositions
    child_group.signals.copy_actions_from(&parent_group.signals);

    child.lock.lock();
    crate::process::scheduler::sched_enqueue(&child);
    child.lock.unlock();

    Ok(child)
}

/// Deliver-a-signal bookkeeping handle: push `info` onto this thread's
/// queue and mark it pending. Wakes the thread when it is blocked
/// interruptibly.
pub fn post_signal(thread: &Arc<Thread>, info: SigInfo) -> Result<()> {
    crate::process::signal::kill_thread(thread, info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn create_assigns_group_and_table_entries() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("worker");
        assert_eq!(th.state(), ThreadState::Embryo);
        assert!(th.test_flags(ThreadFlags::MAIN));
        assert_eq!(th.group().tgid, th.tid);
        assert!(thread_by_tid(th.tid).is_some());
        assert!(group_by_pid(th.tid).is_some());

        test_utils::retire_thread(&th);
    }

    #[test]
    fn secondary_thread_shares_group_resources() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let main = test_utils::spawn_thread("main");
        let worker = thread_create(
            "helper",
            ThreadEntry::Kernel {
                entry: test_utils::nop_entry,
                arg: 0,
            },
            CreateFlags::empty(),
            Some(main.group()),
        )
        .unwrap();

        assert!(!worker.test_flags(ThreadFlags::MAIN));
        assert_eq!(worker.pid(), main.tid);
        assert!(Arc::ptr_eq(&worker.group().mmap, &main.group().mmap));
        assert_eq!(main.group().member_count(), 2);

        test_utils::retire_thread(&worker);
        test_utils::retire_thread(&main);
    }

    #[test]
    fn user_thread_gets_sentinel_return_address() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let ustack_top = test_utils::user_stack_top();
        let th = thread_create(
            "user",
            ThreadEntry::User {
                entry: 0x4000_0000,
                arg: 7,
                ustack_top,
                ustack_flags: 0,
            },
            CreateFlags::empty(),
            None,
        )
        .unwrap();

        assert!(th.test_flags(ThreadFlags::USER));

        // the fresh user stack carries the magic return-address sentinel
        let mut buf = [0u8; 8];
        crate::hal::paging()
            .copy_from_user(&mut buf, crate::arch::align16_down(ustack_top) - 8)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), crate::arch::MAGIC_RETADDR);

        test_utils::retire_thread(&th);
    }

    #[test]
    fn execve_frame_carries_argument_registers() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let ustack_top = test_utils::user_stack_top();
        let th = thread_create(
            "execved",
            ThreadEntry::Execve {
                entry: 0x4000_2000,
                argc: 2,
                argv: 0x5000_0000,
                envp: 0x5000_1000,
                ustack_top,
                ustack_flags: 0,
            },
            CreateFlags::empty(),
            None,
        )
        .unwrap();

        // the bootstrap mcontext sits between the context record and the
        // stop slot; read back (argc, argv, envp) from rdi/rsi/rdx
        let ctx = th.with_inner(|i| i.ctx);
        let mctx_at = ctx + crate::arch::CONTEXT_SIZE as u64 + 8;
        let mut buf = [0u8; crate::arch::MCONTEXT_SIZE];
        crate::hal::paging().memcpy_vp(&mut buf, mctx_at).unwrap();
        let mctx: crate::arch::Mcontext =
            unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const _) };

        assert_eq!(mctx.rip, 0x4000_2000);
        assert_eq!(mctx.rdi, 2);
        assert_eq!(mctx.rsi, 0x5000_0000);
        assert_eq!(mctx.rdx, 0x5000_1000);
        assert_ne!(mctx.rflags & crate::arch::RFLAGS_IF, 0);

        test_utils::retire_thread(&th);
    }

    #[test]
    fn fork_duplicates_the_caller_into_a_new_group() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let parent = test_utils::spawn_thread("forker");
        parent.with_inner(|i| {
            i.uctx_chain.push(crate::arch::Ucontext {
                mcontext: crate::arch::Mcontext {
                    rip: 0x4000_1000,
                    rsp: test_utils::user_stack_top(),
                    rax: 1234,
                    ..crate::arch::Mcontext::default()
                },
                ..crate::arch::Ucontext::default()
            });
        });

        test_utils::as_current(&parent, || {
            let child = fork_current().unwrap();

            assert_ne!(child.tid, parent.tid);
            assert_ne!(child.group().tgid, parent.group().tgid);
            assert_eq!(child.group().ppid(), parent.pid());
            assert!(parent
                .group()
                .children
                .lock()
                .iter()
                .any(|g| g.tgid == child.tid));
            // resources are duplicated handles, not shared
            assert!(!Arc::ptr_eq(&child.group().mmap, &parent.group().mmap));

            // runnable right away
            assert_eq!(child.state(), ThreadState::Ready);

            crate::process::scheduler::with_runqueue(crate::smp::cpu_id(), 3, |q| {
                q.retain(|t| t.tid != child.tid)
            });
            test_utils::retire_thread(&child);
        });

        test_utils::retire_thread(&parent);
    }

    #[test]
    fn fork_without_user_context_is_refused() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("forkless");
        test_utils::as_current(&th, || {
            assert_eq!(fork_current().unwrap_err(), crate::error::Errno::EINVAL);
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn kernel_stack_frame_is_prepared() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let th = test_utils::spawn_thread("frames");
        let ctx = th.with_inner(|i| i.ctx);
        // the bootstrap context lives inside the kernel stack run
        assert!(ctx > th.kstack.phys());
        assert!(ctx < th.kstack.phys() + th.kstack.len_bytes() as u64);

        // top-of-stack carries the stop trampoline
        let mut buf = [0u8; 8];
        let top = th.kstack_top();
        crate::hal::paging()
            .memcpy_vp(&mut buf, crate::arch::align16_down(top) - 8)
            .unwrap();
        assert_ne!(u64::from_le_bytes(buf), 0);

        test_utils::retire_thread(&th);
    }
}
