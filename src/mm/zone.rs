/// Zone-partitioned physical frame allocator.
///
/// Four zones split the physical address space: DMA (0-16 MiB), NORMAL
/// (16 MiB-2 GiB), HOLE (2-4 GiB), HIGH (4 GiB and up). Each zone pairs a
/// page array with an allocation bitmap; a page is allocated exactly when
/// its refcount is nonzero and its bitmap bit is set. Zone locks are leaf
/// locks and are never held across a page-cache or inode operation.

use crate::ds::bitmap::Bitmap;
use crate::error::{Errno, Result};
use crate::hal::{self, BootInfo};
use crate::mm::page::{Page, PageFlags, PhysAddr, MAX_ORDER, PAGE_SIZE};
use crate::sync::SpinLock;
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Once;

pub const NZONES: usize = 4;

const ZONE_DMA: usize = 0;
const ZONE_NORMAL: usize = 1;
const ZONE_HOLE: usize = 2;
const ZONE_HIGH: usize = 3;

const DMA_END: u64 = 16 << 20;
const NORMAL_END: u64 = 2 << 30;
const HOLE_END: u64 = 4 << 30;

const ZONE_NAMES: [&str; NZONES] = ["DMA", "NORMAL", "HOLE", "HIGH"];

/// Allocation placement selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Any,
    Dma,
    Normal,
    Hole,
    High,
}

impl Whence {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Whence::Any),
            1 => Ok(Whence::Dma),
            2 => Ok(Whence::Normal),
            3 => Ok(Whence::Hole),
            4 => Ok(Whence::High),
            _ => Err(Errno::EINVAL),
        }
    }

    fn zone_index(self) -> usize {
        match self {
            Whence::Any | Whence::Normal => ZONE_NORMAL,
            Whence::Dma => ZONE_DMA,
            Whence::Hole => ZONE_HOLE,
            Whence::High => ZONE_HIGH,
        }
    }
}

/// Allocation flags: a whence plus the zero-fill bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gfp {
    pub whence: Whence,
    pub zero: bool,
}

impl Gfp {
    pub const KERNEL: Gfp = Gfp {
        whence: Whence::Normal,
        zero: false,
    };
    pub const KERNEL_ZERO: Gfp = Gfp {
        whence: Whence::Normal,
        zero: true,
    };
    pub const DMA: Gfp = Gfp {
        whence: Whence::Dma,
        zero: false,
    };

    pub fn zeroed(whence: Whence) -> Self {
        Gfp { whence, zero: true }
    }
}

struct ZoneGeo {
    start: PhysAddr,
    npages: usize,
}

struct ZoneMeta {
    bitmap: Bitmap,
    used: usize,
    valid: bool,
}

struct Zone {
    geo: Once<ZoneGeo>,
    pages: Once<Box<[Page]>>,
    meta: SpinLock<ZoneMeta>,
}

impl Zone {
    const fn new() -> Self {
        Self {
            geo: Once::new(),
            pages: Once::new(),
            meta: SpinLock::new(ZoneMeta {
                bitmap: Bitmap::empty(),
                used: 0,
                valid: false,
            }),
        }
    }
}

const ZONE_INIT: Zone = Zone::new();
static ZONES: [Zone; NZONES] = [ZONE_INIT; NZONES];

static KERNEL_IMAGE: Once<(PhysAddr, usize)> = Once::new();

fn zone_bounds(zi: usize, total_memory: u64) -> (u64, u64) {
    let (lo, hi) = match zi {
        ZONE_DMA => (0, DMA_END),
        ZONE_NORMAL => (DMA_END, NORMAL_END),
        ZONE_HOLE => (NORMAL_END, HOLE_END),
        _ => (HOLE_END, u64::MAX),
    };
    (lo.min(total_memory), hi.min(total_memory))
}

fn overlaps(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}

fn kernel_overlaps(phys: PhysAddr, len: usize) -> bool {
    match KERNEL_IMAGE.get() {
        Some(&(base, size)) => overlaps(phys, len as u64, base, size as u64),
        None => false,
    }
}

/// Carve the boot memory map into zones. Pages outside usable ranges and
/// pages of the kernel image are reserved up front so no allocation can
/// ever return them.
pub fn init(bootinfo: &BootInfo) {
    KERNEL_IMAGE.call_once(|| (bootinfo.kernel_base, bootinfo.kernel_size));

    for zi in 0..NZONES {
        let (zstart, zend) = zone_bounds(zi, bootinfo.total_memory as u64);
        if zend <= zstart {
            continue;
        }
        let npages = ((zend - zstart) as usize) / PAGE_SIZE;
        if npages == 0 {
            continue;
        }

        let zone = &ZONES[zi];
        zone.geo.call_once(|| ZoneGeo {
            start: zstart,
            npages,
        });
        zone.pages.call_once(|| {
            let mut v = Vec::with_capacity(npages);
            for _ in 0..npages {
                v.push(Page::new());
            }
            v.into_boxed_slice()
        });

        let pages = zone.pages.get().unwrap();
        let mut meta = zone.meta.lock();
        meta.bitmap = Bitmap::new(npages);

        let mut reserved = 0usize;
        for idx in 0..npages {
            let pa = zstart + (idx * PAGE_SIZE) as u64;
            let usable = bootinfo
                .memmap
                .iter()
                .any(|r| r.usable && overlaps(pa, PAGE_SIZE as u64, r.start, r.size as u64));
            if !usable || kernel_overlaps(pa, PAGE_SIZE) {
                meta.bitmap.set(idx, 1).expect("reserve within bitmap");
                pages[idx].set_refcount(1);
                pages[idx].set_flags(PageFlags::RESERVED);
                reserved += 1;
            }
        }
        meta.used = reserved;
        meta.valid = true;

        crate::info!(
            "zone {}: {:#x}..{:#x}, {} pages ({} reserved)",
            ZONE_NAMES[zi],
            zstart,
            zend,
            npages,
            reserved
        );
    }
}

/// An allocated run of `1 << order` frames. Dropping the run releases
/// the allocation reference on every covered page.
#[derive(Debug)]
pub struct PageRun {
    phys: PhysAddr,
    order: usize,
}

impl PageRun {
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        (1usize << self.order) * PAGE_SIZE
    }

    pub fn page(&self) -> &'static Page {
        addr_to_page(self.phys).expect("page run without backing zone")
    }

    /// Give up ownership without releasing the references.
    pub fn leak(self) -> PhysAddr {
        let phys = self.phys;
        core::mem::forget(self);
        phys
    }
}

impl Drop for PageRun {
    fn drop(&mut self) {
        free_order(self.phys, self.order);
    }
}

fn zero_fill(zi: usize, phys: PhysAddr) -> Result<()> {
    if zi == ZONE_HOLE || zi == ZONE_HIGH {
        // no identity mapping up there: mount a temporary window per page
        let va = hal::paging().mount(phys)?;
        let res = hal::paging().memset_v(va, 0, PAGE_SIZE);
        hal::paging().unmount(va);
        res
    } else {
        hal::zero_phys(phys, PAGE_SIZE)
    }
}

/// Allocate a naturally aligned run of `1 << order` frames.
pub fn alloc_order(gfp: Gfp, order: usize) -> Result<PageRun> {
    if order >= MAX_ORDER {
        return Err(Errno::ENOMEM);
    }

    let zi = gfp.whence.zone_index();
    let zone = &ZONES[zi];
    let geo = zone.geo.get().ok_or(Errno::ENOMEM)?;
    let pages = zone.pages.get().ok_or(Errno::ENOMEM)?;
    let npages = 1usize << order;

    let mut meta = zone.meta.lock();
    if !meta.valid {
        return Err(Errno::ENOMEM);
    }

    let index = meta
        .bitmap
        .alloc_range_aligned(npages, npages)
        .map_err(|_| Errno::ENOMEM)?;
    let phys = geo.start + (index * PAGE_SIZE) as u64;

    assert!(
        !kernel_overlaps(phys, npages * PAGE_SIZE),
        "allocation run {:#x}+{} overlaps the kernel image",
        phys,
        npages * PAGE_SIZE
    );

    for i in 0..npages {
        let page = &pages[index + i];
        assert!(
            page.is_free(),
            "page {:#x} already has a live refcount",
            phys + (i * PAGE_SIZE) as u64
        );
        page.get();
    }
    meta.used += npages;

    if gfp.zero {
        for i in 0..npages {
            if let Err(err) = zero_fill(zi, phys + (i * PAGE_SIZE) as u64) {
                // reverse the partial setup
                for j in 0..npages {
                    pages[index + j].put();
                }
                meta.bitmap.unset(index, npages).expect("unset within bitmap");
                meta.used -= npages;
                crate::warn!("zone {}: zero-fill failed at {:#x}", ZONE_NAMES[zi], phys);
                return Err(err);
            }
        }
    }

    crate::debug!(
        "zone {}: alloc order {} at {:#x}",
        ZONE_NAMES[zi],
        order,
        phys
    );
    Ok(PageRun { phys, order })
}

fn zone_by_addr(phys: PhysAddr) -> Option<(usize, &'static Zone)> {
    for (zi, zone) in ZONES.iter().enumerate() {
        if let Some(geo) = zone.geo.get() {
            let end = geo.start + (geo.npages * PAGE_SIZE) as u64;
            if phys >= geo.start && phys < end {
                return Some((zi, zone));
            }
        }
    }
    None
}

/// Release one allocation reference on each frame of a run. A frame whose
/// refcount reaches zero returns to the zone: its bitmap bit clears, its
/// flags reset to SWAPPABLE, and it detaches from any page cache.
pub fn free_order(phys: PhysAddr, order: usize) {
    let (zi, zone) = match zone_by_addr(phys) {
        Some(z) => z,
        None => panic!("free of {:#x} outside any zone", phys),
    };
    assert!(order < MAX_ORDER, "free with order {} out of range", order);
    assert!(
        !kernel_overlaps(phys, (1usize << order) * PAGE_SIZE),
        "freeing a kernel-image page at {:#x}",
        phys
    );

    let geo = zone.geo.get().unwrap();
    let pages = zone.pages.get().unwrap();
    let index = ((phys - geo.start) as usize) / PAGE_SIZE;
    let npages = 1usize << order;

    let mut meta = zone.meta.lock();
    if index + npages > geo.npages {
        crate::warn!(
            "zone {}: out-of-zone deallocation at {:#x}, nothing freed",
            ZONE_NAMES[zi],
            phys
        );
        return;
    }

    for i in 0..npages {
        let page = &pages[index + i];
        assert!(
            page.refcount() > 0,
            "double free of page {:#x}",
            phys + (i * PAGE_SIZE) as u64
        );
        if page.put() > 0 {
            // still referenced elsewhere, stays allocated
            continue;
        }
        meta.bitmap.unset(index + i, 1).expect("unset within bitmap");
        page.reset_flags();
        page.set_flags(PageFlags::SWAPPABLE);
        page.set_cache_tag(0);
        page.set_virtual_hint(0);
        meta.used -= 1;
    }
}

/// Page metadata for a physical address, if it belongs to a zone.
pub fn addr_to_page(phys: PhysAddr) -> Option<&'static Page> {
    let (_, zone) = zone_by_addr(phys)?;
    let geo = zone.geo.get()?;
    let index = ((phys - geo.start) as usize) / PAGE_SIZE;
    zone.pages.get()?.get(index)
}

/// Take an extra reference on an allocated frame.
pub fn page_get(phys: PhysAddr) -> Result<()> {
    let page = addr_to_page(phys).ok_or(Errno::EINVAL)?;
    assert!(
        !page.is_free(),
        "taking a reference to a free page at {:#x}",
        phys
    );
    page.get();
    Ok(())
}

/// Drop one reference on a single frame.
pub fn page_put(phys: PhysAddr) {
    free_order(phys, 0);
}

/// Allocated-page count of the zone serving `whence`.
pub fn used_count(whence: Whence) -> usize {
    let zone = &ZONES[whence.zone_index()];
    zone.meta.lock().used
}
