/// Physical page metadata.
///
/// One `Page` record per frame, indexed by position within its zone.
/// Reference counts and flags are atomic; the allocation bitmap and the
/// zone geometry live behind the zone lock.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub type PhysAddr = u64;
pub type Pfn = usize;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Orders `0..MAX_ORDER` are allocatable (up to 2 MiB contiguous).
pub const MAX_ORDER: usize = 10;

#[inline]
pub const fn pa_to_pfn(pa: PhysAddr) -> Pfn {
    (pa as usize) >> PAGE_SHIFT
}

#[inline]
pub const fn pfn_to_pa(pfn: Pfn) -> PhysAddr {
    (pfn << PAGE_SHIFT) as PhysAddr
}

#[inline]
pub const fn page_align_down(pa: PhysAddr) -> PhysAddr {
    pa & !(PAGE_SIZE as u64 - 1)
}

#[inline]
pub const fn page_align_up(pa: PhysAddr) -> PhysAddr {
    (pa + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Smallest order whose run covers `size_in_bytes`.
pub fn get_page_order(size_in_bytes: usize) -> usize {
    let pages_needed = (size_in_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    let mut order = 0;
    while (1usize << order) < pages_needed {
        order += 1;
    }
    order
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Contents are valid in physical memory.
        const VALID = 1 << 0;
        const DIRTY = 1 << 1;
        const WRITEBACK = 1 << 2;
        const SWAPPABLE = 1 << 3;
        const SWAPPED = 1 << 4;
        /// Locked in memory.
        const LOCKED = 1 << 5;
        /// Indexed by a page cache.
        const CACHED = 1 << 6;
        const SHARED = 1 << 7;
        const USER = 1 << 8;
        /// Never allocatable (kernel image, holes in the memory map).
        const RESERVED = 1 << 9;
    }
}

pub struct Page {
    flags: AtomicU32,
    refcount: AtomicU32,
    mapcount: AtomicU32,
    /// Back-index of the owning page cache; zero when uncached.
    cache_tag: AtomicU64,
    /// Most recent kernel virtual mapping, advisory only.
    virtual_hint: AtomicU64,
}

impl Page {
    pub const fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            refcount: AtomicU32::new(0),
            mapcount: AtomicU32::new(0),
            cache_tag: AtomicU64::new(0),
            virtual_hint: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.refcount() == 0
    }

    /// Take an additional reference.
    pub fn get(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference, returning the new count. Dropping below zero is
    /// a use-after-free in the zone.
    pub fn put(&self) -> u32 {
        let old = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "page refcount underflow");
        old - 1
    }

    pub fn set_refcount(&self, count: u32) {
        self.refcount.store(count, Ordering::Release);
    }

    pub fn mapcount(&self) -> u32 {
        self.mapcount.load(Ordering::Relaxed)
    }

    pub fn map_inc(&self) -> u32 {
        self.mapcount.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn map_dec(&self) -> u32 {
        self.mapcount.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn test_flags(&self, f: PageFlags) -> bool {
        self.flags().contains(f)
    }

    pub fn set_flags(&self, f: PageFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    pub fn mask_flags(&self, f: PageFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    pub fn reset_flags(&self) {
        self.flags.store(0, Ordering::Release);
    }

    pub fn cache_tag(&self) -> u64 {
        self.cache_tag.load(Ordering::Acquire)
    }

    pub fn set_cache_tag(&self, tag: u64) {
        self.cache_tag.store(tag, Ordering::Release);
    }

    pub fn virtual_hint(&self) -> u64 {
        self.virtual_hint.load(Ordering::Relaxed)
    }

    pub fn set_virtual_hint(&self, va: u64) {
        self.virtual_hint.store(va, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("refcount", &self.refcount())
            .field("mapcount", &self.mapcount())
            .field("flags", &self.flags())
            .finish()
    }
}
