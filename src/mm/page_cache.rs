/// Per-inode page cache.
///
/// Pages are indexed by page number in a balanced tree, filled lazily
/// from the inode, and owned by the cache: one allocation reference per
/// indexed page, released when the cache flushes. A VALID page mirrors
/// its inode range; writes mark DIRTY and extend the inode size.

use crate::error::{Errno, Result};
use crate::hal::{self, InodeOps};
use crate::mm::page::{PageFlags, PhysAddr, PAGE_SIZE};
use crate::mm::zone::{self, Gfp, PageRun};
use crate::sync::spinlock::SpinLock;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_CACHE_TAG: AtomicU64 = AtomicU64::new(1);

struct CacheInner {
    tree: BTreeMap<u64, PageRun>,
    /// Recency order, most recent at the back.
    lru: VecDeque<u64>,
}

pub struct PageCache {
    /// Back-index stamped on owned pages.
    tag: u64,
    inode: Arc<dyn InodeOps>,
    inner: SpinLock<CacheInner>,
}

impl PageCache {
    pub fn new(inode: Arc<dyn InodeOps>) -> Self {
        Self {
            tag: NEXT_CACHE_TAG.fetch_add(1, Ordering::Relaxed),
            inode,
            inner: SpinLock::new(CacheInner {
                tree: BTreeMap::new(),
                lru: VecDeque::new(),
            }),
        }
    }

    pub fn cached_pages(&self) -> usize {
        self.inner.lock().tree.len()
    }

    fn touch(lru: &mut VecDeque<u64>, pgno: u64) {
        if let Some(pos) = lru.iter().position(|&p| p == pgno) {
            lru.remove(pos);
        }
        lru.push_back(pgno);
    }

    /// Look up (or fault in) the frame backing page `pgno`.
    pub fn get_page(&self, pgno: u64) -> Result<PhysAddr> {
        {
            let mut inner = self.inner.lock();
            if let Some(run) = inner.tree.get(&pgno) {
                let phys = run.phys();
                if run.page().test_flags(PageFlags::VALID) {
                    Self::touch(&mut inner.lru, pgno);
                    return Ok(phys);
                }
            }
        }

        // miss: build the page outside the tree lock, then insert
        let run = zone::alloc_order(Gfp::KERNEL_ZERO, 0)?;
        let phys = run.phys();

        let mut buf = vec![0u8; PAGE_SIZE];
        let filled = self.inode.read(pgno * PAGE_SIZE as u64, &mut buf)?;
        // short read: the tail stays zero
        debug_assert!(filled <= PAGE_SIZE);
        hal::paging().memcpy_pv(phys, &buf)?;

        let page = run.page();
        page.set_flags(PageFlags::VALID | PageFlags::CACHED);
        page.mask_flags(PageFlags::DIRTY);
        page.set_cache_tag(self.tag);

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.tree.get(&pgno) {
            // raced with another filler; keep the indexed page
            let phys = existing.phys();
            Self::touch(&mut inner.lru, pgno);
            return Ok(phys);
        }
        inner.tree.insert(pgno, run);
        Self::touch(&mut inner.lru, pgno);
        Ok(phys)
    }

    /// Read through the cache. Returns the byte count up to end of
    /// file; the tail of a partially backed page reads as zeros.
    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.inode.size();
        if off >= size || buf.is_empty() {
            return Ok(0);
        }

        let mut done = 0usize;
        while done < buf.len() {
            let offset = off + done as u64;
            let pgno = offset / PAGE_SIZE as u64;
            let inpage = (offset % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - inpage).min(buf.len() - done);

            let phys = self.get_page(pgno)?;
            hal::paging().memcpy_vp(&mut buf[done..done + n], phys + inpage as u64)?;
            done += n;
        }

        Ok(((size - off).min(buf.len() as u64)) as usize)
    }

    /// Write through the cache: pages are marked DIRTY, the inode size
    /// grows to cover the write, and a failed allocation past EOF is
    /// retried once before giving up.
    pub fn write(&self, off: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut done = 0usize;
        while done < buf.len() {
            let offset = off + done as u64;
            let pgno = offset / PAGE_SIZE as u64;
            let inpage = (offset % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - inpage).min(buf.len() - done);

            let phys = match self.get_page(pgno) {
                Ok(p) => p,
                Err(Errno::ENOMEM) => self.get_page(pgno).map_err(|_| Errno::ENOMEM)?,
                Err(err) => return Err(err),
            };

            hal::paging().memcpy_pv(phys + inpage as u64, &buf[done..done + n])?;
            if let Some(page) = zone::addr_to_page(phys) {
                page.set_flags(PageFlags::DIRTY);
            }
            done += n;
        }

        let end = off + done as u64;
        if end > self.inode.size() {
            self.inode.update_size(end);
        }
        Ok(done)
    }

    /// Write every DIRTY page back to the inode.
    pub fn sync(&self) -> Result<()> {
        let pages: alloc::vec::Vec<(u64, PhysAddr)> = {
            let inner = self.inner.lock();
            inner
                .tree
                .iter()
                .filter(|(_, run)| run.page().test_flags(PageFlags::DIRTY))
                .map(|(&pgno, run)| (pgno, run.phys()))
                .collect()
        };

        let size = self.inode.size();
        for (pgno, phys) in pages {
            let base = pgno * PAGE_SIZE as u64;
            if base >= size {
                continue;
            }
            let n = ((size - base) as usize).min(PAGE_SIZE);
            let mut buf = vec![0u8; n];
            hal::paging().memcpy_vp(&mut buf, phys)?;
            self.inode.write(base, &buf)?;
            if let Some(page) = zone::addr_to_page(phys) {
                page.mask_flags(PageFlags::DIRTY);
            }
        }
        Ok(())
    }

    /// Drop every owned reference; pages with no other users return to
    /// their zone. Dirty contents are written back first.
    pub fn flush(&self) -> Result<()> {
        self.sync()?;
        let mut inner = self.inner.lock();
        for (_, run) in inner.tree.iter() {
            let page = run.page();
            page.mask_flags(PageFlags::CACHED);
            page.set_cache_tag(0);
        }
        inner.tree.clear(); // dropping the runs releases the references
        inner.lru.clear();
        Ok(())
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if self.flush().is_err() {
            crate::warn!("page cache {}: flush on drop failed", self.tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, MockInode};
    use crate::mm::zone::Whence;

    #[test]
    fn read_past_eof_returns_short_with_zero_tail() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let inode = Arc::new(MockInode::with_data(b"0123456789".to_vec()));
        let cache = PageCache::new(inode);

        let mut buf = vec![0xAAu8; PAGE_SIZE];
        let n = cache.read(0, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..10], b"0123456789");
        assert!(buf[10..].iter().all(|&b| b == 0));

        // the page is indexed and VALID
        assert_eq!(cache.cached_pages(), 1);
        let phys = cache.get_page(0).unwrap();
        assert!(zone::addr_to_page(phys)
            .unwrap()
            .test_flags(PageFlags::VALID));
    }

    #[test]
    fn read_at_or_beyond_size_is_empty() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let inode = Arc::new(MockInode::with_data(b"abc".to_vec()));
        let cache = PageCache::new(inode);

        let mut buf = [0u8; 16];
        assert_eq!(cache.read(3, &mut buf).unwrap(), 0);
        assert_eq!(cache.read(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn cache_hit_reuses_the_same_frame() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let inode = Arc::new(MockInode::with_data(vec![7u8; 100]));
        let cache = PageCache::new(inode);

        let a = cache.get_page(0).unwrap();
        let b = cache.get_page(0).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.cached_pages(), 1);
    }

    #[test]
    fn write_marks_dirty_and_extends_size() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let inode = Arc::new(MockInode::with_data(b"hello".to_vec()));
        let cache = PageCache::new(inode.clone());

        let n = cache.write(3, b"XYZZY").unwrap();
        assert_eq!(n, 5);
        assert_eq!(inode.size(), 8); // extended past the old EOF

        let phys = cache.get_page(0).unwrap();
        assert!(zone::addr_to_page(phys)
            .unwrap()
            .test_flags(PageFlags::DIRTY));

        let mut buf = [0u8; 8];
        assert_eq!(cache.read(0, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"helXYZZY");
    }

    #[test]
    fn sync_writes_back_and_clears_dirty() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let inode = Arc::new(MockInode::with_data(b"aaaaaaaa".to_vec()));
        let cache = PageCache::new(inode.clone());

        cache.write(0, b"bbbb").unwrap();
        // backing store still stale until sync
        assert_eq!(&inode.snapshot()[..4], b"aaaa");

        cache.sync().unwrap();
        assert_eq!(&inode.snapshot()[..4], b"bbbb");

        let phys = cache.get_page(0).unwrap();
        assert!(!zone::addr_to_page(phys)
            .unwrap()
            .test_flags(PageFlags::DIRTY));
    }

    #[test]
    fn flush_returns_pages_to_the_zone() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let inode = Arc::new(MockInode::with_data(vec![1u8; 3 * PAGE_SIZE]));
        let cache = PageCache::new(inode);

        let before = zone::used_count(Whence::Normal);
        let mut buf = vec![0u8; 3 * PAGE_SIZE];
        cache.read(0, &mut buf).unwrap();
        assert_eq!(cache.cached_pages(), 3);
        assert_eq!(zone::used_count(Whence::Normal), before + 3);

        // the cache holds exactly one reference per indexed page
        let phys = cache.get_page(0).unwrap();
        assert_eq!(zone::addr_to_page(phys).unwrap().refcount(), 1);

        cache.flush().unwrap();
        assert_eq!(cache.cached_pages(), 0);
        assert_eq!(zone::used_count(Whence::Normal), before);
    }

    #[test]
    fn write_spanning_pages() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();

        let inode = Arc::new(MockInode::with_data(Vec::new()));
        let cache = PageCache::new(inode.clone());

        let data = vec![0x5Au8; PAGE_SIZE + 100];
        let n = cache.write(PAGE_SIZE as u64 - 50, &data).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(cache.cached_pages(), 3); // pages 0, 1, 2 touched
        assert_eq!(
            inode.size(),
            PAGE_SIZE as u64 - 50 + data.len() as u64
        );

        let mut rb = vec![0u8; data.len()];
        let got = cache.read(PAGE_SIZE as u64 - 50, &mut rb).unwrap();
        assert_eq!(got, data.len());
        assert_eq!(rb, data);
    }
}
