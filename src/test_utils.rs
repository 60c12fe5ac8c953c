//! Shared unit-test fixtures: a flat-buffer paging mock, a Vec-backed
//! inode, one-shot bring-up, and the serialization guard protecting the
//! per-CPU globals.

use crate::error::{Errno, Result};
use crate::hal::{BootInfo, InodeOps, MemRange, PagingOps};
use crate::mm::page::PhysAddr;
use crate::process::thread::{self, CreateFlags, Thread, ThreadEntry};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Once;

/// Mock physical space: 32 MiB, so the DMA and NORMAL zones both exist.
pub const TOTAL_MEMORY: usize = 32 << 20;
pub const KERNEL_BASE: PhysAddr = 0x10_0000;
pub const KERNEL_SIZE: usize = 0x8_0000;

/// Addresses at and above this are kept out of the zones and double as
/// "user" memory for copy_to_user/copy_from_user.
const USER_REGION: u64 = 24 << 20;

struct MockPaging {
    base: *mut u8,
    len: usize,
}

unsafe impl Sync for MockPaging {}
unsafe impl Send for MockPaging {}

impl MockPaging {
    fn check(&self, addr: u64, len: usize) -> Result<usize> {
        let addr = addr as usize;
        if addr.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(Errno::EFAULT);
        }
        Ok(addr)
    }
}

impl PagingOps for MockPaging {
    fn map_n(&self, vaddr: u64, size: usize, _flags: u32) -> Result<()> {
        self.check(vaddr, size)?;
        Ok(())
    }

    fn unmap_n(&self, vaddr: u64, size: usize) -> Result<()> {
        self.check(vaddr, size)?;
        Ok(())
    }

    fn mount(&self, phys: PhysAddr) -> Result<u64> {
        self.check(phys, 1)?;
        Ok(phys)
    }

    fn unmount(&self, _vaddr: u64) {}

    fn memcpy_pv(&self, dst: PhysAddr, src: &[u8]) -> Result<()> {
        let off = self.check(dst, src.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(off), src.len());
        }
        Ok(())
    }

    fn memcpy_vp(&self, dst: &mut [u8], src: PhysAddr) -> Result<()> {
        let off = self.check(src, dst.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(self.base.add(off), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn memcpy_pp(&self, dst: PhysAddr, src: PhysAddr, n: usize) -> Result<()> {
        let doff = self.check(dst, n)?;
        let soff = self.check(src, n)?;
        unsafe {
            core::ptr::copy(self.base.add(soff), self.base.add(doff), n);
        }
        Ok(())
    }

    fn memset_v(&self, vaddr: u64, byte: u8, n: usize) -> Result<()> {
        let off = self.check(vaddr, n)?;
        unsafe {
            core::ptr::write_bytes(self.base.add(off), byte, n);
        }
        Ok(())
    }

    fn copy_to_user(&self, uvaddr: u64, src: &[u8]) -> Result<()> {
        self.memcpy_pv(uvaddr, src)
    }

    fn copy_from_user(&self, dst: &mut [u8], uvaddr: u64) -> Result<()> {
        self.memcpy_vp(dst, uvaddr)
    }

    fn tlb_shootdown(&self, _pdbr: u64, _vaddr: u64) {}

    fn active_pdbr(&self) -> bool {
        false
    }
}

static INIT: Once<()> = Once::new();
static PAGING: Once<MockPaging> = Once::new();

/// One-shot kernel bring-up for tests: mock paging plus zones over the
/// mock memory map.
pub fn init_kernel() {
    INIT.call_once(|| {
        let mem = vec![0u8; TOTAL_MEMORY].leak();
        let paging = PAGING.call_once(|| MockPaging {
            base: mem.as_mut_ptr(),
            len: TOTAL_MEMORY,
        });
        crate::hal::install_paging(paging);

        let bootinfo = BootInfo {
            total_memory: TOTAL_MEMORY,
            memmap: vec![
                // null page unusable, user region carved out
                MemRange {
                    start: 0x1000,
                    size: (USER_REGION as usize) - 0x1000,
                    usable: true,
                },
                MemRange {
                    start: USER_REGION,
                    size: TOTAL_MEMORY - USER_REGION as usize,
                    usable: false,
                },
            ],
            kernel_base: KERNEL_BASE,
            kernel_size: KERNEL_SIZE,
        };
        crate::mm::zone::init(&bootinfo);
    });
}

static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

pub struct TestGuard {
    _guard: spin::MutexGuard<'static, ()>,
}

/// Serialize tests that touch the per-CPU globals, resetting any state
/// a previous (possibly panicked) test left behind.
pub fn serialize() -> TestGuard {
    let guard = TEST_LOCK.lock();
    let cpu = crate::smp::this_cpu();
    cpu.ncli.store(0, Ordering::Relaxed);
    cpu.intena.store(false, Ordering::Relaxed);
    cpu.need_resched.store(false, Ordering::Relaxed);
    crate::arch::intr_on();
    crate::smp::set_current(None);
    TestGuard { _guard: guard }
}

pub extern "C" fn nop_entry(_arg: usize) -> usize {
    0
}

/// A fresh kernel thread leading its own group.
pub fn spawn_thread(name: &str) -> Arc<Thread> {
    thread::thread_create(
        name,
        ThreadEntry::Kernel {
            entry: nop_entry,
            arg: 0,
        },
        CreateFlags::empty(),
        None,
    )
    .expect("test thread creation")
}

/// Run `f` with `thread` installed as the CPU's current thread.
pub fn as_current(thread: &Arc<Thread>, f: impl FnOnce()) {
    crate::smp::set_current(Some(thread.clone()));
    f();
    crate::smp::set_current(None);
}

/// Tear a test thread out of the global tables.
pub fn retire_thread(thread: &Arc<Thread>) {
    let group = thread.group();
    group.members.lock().retain(|t| t.tid != thread.tid);
    thread::unregister_thread(thread.tid);
    if group.member_count() == 0 {
        thread::unregister_group(group.tgid);
    }
    crate::smp::set_current(None);
}

static SCRATCH: AtomicU64 = AtomicU64::new(0);

/// A fresh page-sized scratch slot in the mock user region.
pub fn user_scratch() -> u64 {
    let slot = SCRATCH.fetch_add(1, Ordering::Relaxed) % 256;
    USER_REGION + slot * 4096
}

/// Top of a mock user stack (grows down into the user region).
pub fn user_stack_top() -> u64 {
    USER_REGION + (2 << 20)
}

/// Base of a mock alternate signal stack.
pub fn alt_stack_base() -> u64 {
    USER_REGION + (3 << 20)
}

/// Vec-backed inode for page-cache tests.
pub struct MockInode {
    data: spin::Mutex<Vec<u8>>,
}

impl MockInode {
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: spin::Mutex::new(data),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl InodeOps for MockInode {
    fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let off = off as usize;
        if off >= data.len() {
            return Ok(0);
        }
        let n = (data.len() - off).min(buf.len());
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn write(&self, off: u64, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        let off = off as usize;
        if off + buf.len() > data.len() {
            data.resize(off + buf.len(), 0);
        }
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn update_size(&self, new: u64) {
        self.data.lock().resize(new as usize, 0);
    }
}
