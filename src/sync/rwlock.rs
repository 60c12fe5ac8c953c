/// Reader/writer lock with writer preference.
///
/// Readers stand aside while a writer is active or queued; the last
/// reader out hands the lock to a waiting writer, and a releasing
/// writer prefers the next writer over the reader herd.

use crate::process::thread::{ThreadState, WakeupReason};
use crate::process::wait::{self, WaitQueue, Whence};
use crate::sync::spinlock::SpinLock;
use core::sync::atomic::{AtomicI64, Ordering};

pub struct RwLock {
    readers: AtomicI64,
    writer: AtomicI64,
    readersq: WaitQueue,
    writersq: WaitQueue,
    guard: SpinLock<()>,
}

impl RwLock {
    pub fn new() -> Self {
        Self {
            readers: AtomicI64::new(0),
            writer: AtomicI64::new(0),
            readersq: WaitQueue::new(),
            writersq: WaitQueue::new(),
            guard: SpinLock::new(()),
        }
    }

    pub fn read_lock(&self) {
        let raw = self.guard.raw();
        raw.lock();
        while self.writer.load(Ordering::Acquire) != 0 || self.writersq.len() > 0 {
            let _ = wait::sched_wait(&self.readersq, ThreadState::Sleep, Whence::Tail, Some(raw));
        }
        self.readers.fetch_add(1, Ordering::AcqRel);
        raw.unlock();
    }

    pub fn try_read_lock(&self) -> bool {
        let raw = self.guard.raw();
        raw.lock();
        let ok = self.writer.load(Ordering::Acquire) == 0 && self.writersq.len() == 0;
        if ok {
            self.readers.fetch_add(1, Ordering::AcqRel);
        }
        raw.unlock();
        ok
    }

    pub fn read_unlock(&self) {
        let raw = self.guard.raw();
        raw.lock();
        let remaining = self.readers.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(remaining >= 0, "read_unlock without a read lock");
        if remaining == 0 && self.writersq.len() >= 1 {
            let _ = wait::sched_wakeup(&self.writersq, WakeupReason::Normal, Whence::Head);
        }
        raw.unlock();
    }

    pub fn write_lock(&self) {
        let raw = self.guard.raw();
        raw.lock();
        // wait only while a reader or writer is actually present; a
        // woken head writer must not re-park behind the queue it was
        // just handed the lock from
        while self.readers.load(Ordering::Acquire) != 0
            || self.writer.load(Ordering::Acquire) != 0
        {
            let _ = wait::sched_wait(&self.writersq, ThreadState::Sleep, Whence::Tail, Some(raw));
        }
        self.writer.fetch_add(1, Ordering::AcqRel);
        raw.unlock();
    }

    pub fn try_write_lock(&self) -> bool {
        let raw = self.guard.raw();
        raw.lock();
        let ok = self.readers.load(Ordering::Acquire) == 0
            && self.writer.load(Ordering::Acquire) == 0
            && self.writersq.len() == 0;
        if ok {
            self.writer.fetch_add(1, Ordering::AcqRel);
        }
        raw.unlock();
        ok
    }

    pub fn write_unlock(&self) {
        let raw = self.guard.raw();
        raw.lock();
        let was = self.writer.fetch_sub(1, Ordering::AcqRel);
        assert!(was > 0, "write_unlock without the write lock");

        // writer preference: hand off to a queued writer first
        if self.writersq.len() > 0 {
            let _ = wait::sched_wakeup(&self.writersq, WakeupReason::Normal, Whence::Head);
            raw.unlock();
            return;
        }
        wait::sched_wakeup_all(&self.readersq, WakeupReason::Normal);
        raw.unlock();
    }

    pub fn reader_count(&self) -> i64 {
        self.readers.load(Ordering::Acquire)
    }

    pub fn writer_active(&self) -> bool {
        self.writer.load(Ordering::Acquire) != 0
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn readers_share_writers_exclude() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let th = test_utils::spawn_thread("rw");

        let rw = RwLock::new();
        test_utils::as_current(&th, || {
            rw.read_lock();
            assert!(rw.try_read_lock()); // shared
            assert!(!rw.try_write_lock()); // excluded
            rw.read_unlock();
            rw.read_unlock();

            rw.write_lock();
            assert!(rw.writer_active());
            assert!(!rw.try_read_lock());
            assert!(!rw.try_write_lock());
            rw.write_unlock();
        });

        test_utils::retire_thread(&th);
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let reader = test_utils::spawn_thread("rw-reader");
        let writer = test_utils::spawn_thread("rw-writer");

        let rw = RwLock::new();
        test_utils::as_current(&reader, || rw.read_lock());

        // a writer parks in the writers queue
        test_utils::as_current(&writer, || {
            let _ = wait::sched_wait(&rw.writersq, ThreadState::Sleep, Whence::Tail, None);
        });
        assert_eq!(rw.writersq.len(), 1);

        // new readers are refused while a writer waits
        test_utils::as_current(&reader, || {
            assert!(!rw.try_read_lock());
        });

        // last reader out hands the lock to the writer
        test_utils::as_current(&reader, || rw.read_unlock());
        assert!(rw.writersq.is_empty());
        assert_eq!(writer.state(), ThreadState::Ready);

        test_utils::retire_thread(&reader);
        test_utils::retire_thread(&writer);
    }

    #[test]
    fn writer_handoff_drains_the_queue() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let w1 = test_utils::spawn_thread("rw-w1");
        let w2 = test_utils::spawn_thread("rw-w2");
        let w3 = test_utils::spawn_thread("rw-w3");

        let rw = RwLock::new();
        test_utils::as_current(&w1, || rw.write_lock());

        // two writers park behind the active one
        for w in [&w2, &w3] {
            test_utils::as_current(w, || {
                let _ = wait::sched_wait(&rw.writersq, ThreadState::Sleep, Whence::Tail, None);
            });
        }
        assert_eq!(rw.writersq.len(), 2);

        // release hands off to the head writer only
        test_utils::as_current(&w1, || rw.write_unlock());
        assert_eq!(w2.state(), ThreadState::Ready);
        assert_eq!(w3.state(), ThreadState::Sleep);
        assert_eq!(rw.writersq.len(), 1);

        // the woken writer acquires even though another is still queued
        test_utils::as_current(&w2, || {
            rw.write_lock();
            assert!(rw.writer_active());
            rw.write_unlock();
        });

        // and its release wakes the next in line, who acquires in turn
        assert_eq!(w3.state(), ThreadState::Ready);
        assert!(rw.writersq.is_empty());
        test_utils::as_current(&w3, || {
            rw.write_lock();
            assert!(rw.writer_active());
            rw.write_unlock();
        });
        assert!(!rw.writer_active());

        test_utils::retire_thread(&w1);
        test_utils::retire_thread(&w2);
        test_utils::retire_thread(&w3);
    }

    #[test]
    fn write_unlock_releases_reader_herd() {
        let _g = test_utils::serialize();
        test_utils::init_kernel();
        let w = test_utils::spawn_thread("rw-w");
        let r1 = test_utils::spawn_thread("rw-r1");
        let r2 = test_utils::spawn_thread("rw-r2");

        let rw = RwLock::new();
        test_utils::as_current(&w, || rw.write_lock());

        for r in [&r1, &r2] {
            test_utils::as_current(r, || {
                let _ = wait::sched_wait(&rw.readersq, ThreadState::Sleep, Whence::Tail, None);
            });
        }
        assert_eq!(rw.readersq.len(), 2);

        test_utils::as_current(&w, || rw.write_unlock());
        assert!(rw.readersq.is_empty());
        assert_eq!(r1.state(), ThreadState::Ready);
        assert_eq!(r2.state(), ThreadState::Ready);

        test_utils::retire_thread(&w);
        test_utils::retire_thread(&r1);
        test_utils::retire_thread(&r2);
    }
}
