/// External collaborator contracts.
///
/// The core never touches page tables or on-disk data directly; a single
/// `PagingOps` implementation is installed at boot and everything physical
/// goes through it. Inodes reach the page cache as `InodeOps` handles.

use crate::error::Result;
use crate::mm::page::PhysAddr;
use spin::Once;

/// Paging / physical-memory access contract.
///
/// `mount`/`unmount` provide short-lived kernel mappings for frames above
/// the identity-mapped range (HOLE/HIGH zones); the `memcpy_*` family moves
/// bytes between physical frames and kernel buffers; `copy_to_user`/
/// `copy_from_user` cross the user boundary for signal frames and thread
/// bootstrap.
pub trait PagingOps: Sync {
    fn map_n(&self, vaddr: u64, size: usize, flags: u32) -> Result<()>;
    fn unmap_n(&self, vaddr: u64, size: usize) -> Result<()>;

    /// Temporarily map a physical frame, returning the virtual address.
    fn mount(&self, phys: PhysAddr) -> Result<u64>;
    fn unmount(&self, vaddr: u64);

    /// Copy a kernel buffer into physical memory.
    fn memcpy_pv(&self, dst: PhysAddr, src: &[u8]) -> Result<()>;
    /// Copy physical memory into a kernel buffer.
    fn memcpy_vp(&self, dst: &mut [u8], src: PhysAddr) -> Result<()>;
    /// Physical-to-physical copy.
    fn memcpy_pp(&self, dst: PhysAddr, src: PhysAddr, n: usize) -> Result<()>;

    /// Fill a mounted virtual range with a byte value.
    fn memset_v(&self, vaddr: u64, byte: u8, n: usize) -> Result<()>;

    /// Copy a kernel buffer out to a user virtual address.
    fn copy_to_user(&self, uvaddr: u64, src: &[u8]) -> Result<()>;
    /// Copy user memory into a kernel buffer.
    fn copy_from_user(&self, dst: &mut [u8], uvaddr: u64) -> Result<()>;

    fn tlb_shootdown(&self, pdbr: u64, vaddr: u64);
    fn active_pdbr(&self) -> bool;
}

/// Backing-store contract consumed by the page cache.
pub trait InodeOps: Send + Sync {
    /// Read up to `buf.len()` bytes at `off`; short reads signal EOF.
    fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, off: u64, buf: &[u8]) -> Result<usize>;
    fn size(&self) -> u64;
    fn update_size(&self, new: u64);
}

/// A physical memory range reported by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct MemRange {
    pub start: PhysAddr,
    pub size: usize,
    pub usable: bool,
}

/// Boot-time facts the frame allocator consumes. Populated once, immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub total_memory: usize,
    pub memmap: alloc::vec::Vec<MemRange>,
    pub kernel_base: PhysAddr,
    pub kernel_size: usize,
}

static PAGING: Once<&'static dyn PagingOps> = Once::new();

/// Install the paging collaborator. Called exactly once during bring-up,
/// before the zones are initialized.
pub fn install_paging(ops: &'static dyn PagingOps) {
    PAGING.call_once(|| ops);
}

/// The installed paging collaborator. Panics if bring-up skipped
/// `install_paging`, which is an init-order violation.
pub fn paging() -> &'static dyn PagingOps {
    *PAGING.get().expect("paging ops not installed")
}

/// Zero a physical range through the paging contract.
pub fn zero_phys(phys: PhysAddr, len: usize) -> Result<()> {
    const ZEROS: [u8; 512] = [0u8; 512];
    let mut off = 0usize;
    while off < len {
        let n = core::cmp::min(ZEROS.len(), len - off);
        paging().memcpy_pv(phys + off as u64, &ZEROS[..n])?;
        off += n;
    }
    Ok(())
}
