//! Offset-keyed page cache (§4.F), grounded in the teacher's
//! `mm::page_cache::Vmo`-style object but generalized to a pluggable
//! read/write backend instead of being hard-wired to the block layer, since
//! the same type here backs anonymous, file-shared, and file-private
//! sources (§4.G).

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::arch::{self, PhysAddr};
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};
use crate::mm::arena::Constraints;
use crate::mm::page::{self, QueueTag};
use crate::sync::spinlock::Spinlock;

/// Backing store a cache reads through and writes back to. `None`/omitted
/// methods mean "anonymous": no read-through, no writeback.
pub trait CacheBackend: Send + Sync {
    fn read_page(&self, _offset: u64, _phys: PhysAddr) -> Result<()> {
        Err(KernelError::NotSupported)
    }
    fn write_page(&self, _offset: u64, _phys: PhysAddr) -> Result<()> {
        Err(KernelError::NotSupported)
    }
    fn has_read(&self) -> bool {
        false
    }
    fn has_write(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy)]
struct Entry {
    phys: PhysAddr,
}

struct Inner {
    size: u64,
    deleted: bool,
    pages: BTreeMap<u64, Entry>,
    backend: Option<Arc<dyn CacheBackend>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub page_count: usize,
    pub modified_count: usize,
}

pub struct PageCache {
    inner: Spinlock<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl PageCache {
    pub fn new(size: u64, backend: Option<Arc<dyn CacheBackend>>) -> Self {
        Self {
            inner: Spinlock::new(Inner {
                size,
                deleted: false,
                pages: BTreeMap::new(),
                backend,
            }),
        }
    }

    fn page_aligned_offset(offset: u64) -> u64 {
        offset & !((PAGE_SIZE as u64) - 1)
    }

    /// Fetch (materializing if absent) the physical page backing `offset`,
    /// incrementing its reference count. `overwrite` skips the
    /// read-through fill for pages the caller is about to write in full
    /// (§4.F step 4).
    pub fn get(&self, offset: u64, overwrite: bool) -> Result<PhysAddr> {
        let offset = Self::page_aligned_offset(offset);
        let backend = {
            let inner = self.inner.lock_irqsave();
            if offset >= inner.size {
                return Err(KernelError::InvalidAddr);
            }
            if let Some(entry) = inner.pages.get(&offset) {
                let phys = entry.phys;
                drop(inner);
                page::incref(phys);
                return Ok(phys);
            }
            inner.backend.clone()
        };

        // Allocate and fill the page outside the lock so a blocking
        // read-through backend call can never be held across this cache's
        // own lock (it may recurse back into a different offset of it).
        // A page not filled from the backend (no readable backend, or the
        // caller is about to overwrite it wholesale) still needs a defined
        // zero-initialized state rather than whatever the frame previously
        // held.
        let fill_from_backend = !overwrite && backend.as_ref().is_some_and(|b| b.has_read());
        let phys = page::alloc(1, Constraints::NONE, false, !fill_from_backend)?;
        if fill_from_backend {
            if let Err(e) = backend.as_ref().unwrap().read_page(offset, phys) {
                page::free(phys, 1);
                return Err(e);
            }
        }

        let mut inner = self.inner.lock_irqsave();
        if let Some(entry) = inner.pages.get(&offset) {
            // Lost the race against a concurrent filler; use their page.
            let winner = entry.phys;
            drop(inner);
            page::free(phys, 1);
            page::incref(winner);
            return Ok(winner);
        }
        page::incref(phys);
        inner.pages.insert(offset, Entry { phys });
        Ok(phys)
    }

    /// Like [`release`], but a no-op (returning `false`) instead of fatal
    /// when `offset` has no resident page. For callers that cannot promise
    /// every offset in a range was ever faulted in, e.g. an address space
    /// unmapping a region it never touched (§4.G "Region operations").
    pub fn release_if_present(&self, offset: u64, dirty: bool) -> bool {
        let offset = Self::page_aligned_offset(offset);
        let resident = self.inner.lock_irqsave().pages.contains_key(&offset);
        if resident {
            self.release(offset, dirty);
        }
        resident
    }

    /// Release a reference taken by [`get`]. `dirty` marks the page
    /// modified. Fatal if `offset` has no resident page: that indicates a
    /// caller released something it never acquired.
    pub fn release(&self, offset: u64, dirty: bool) {
        let offset = Self::page_aligned_offset(offset);
        let mut inner = self.inner.lock_irqsave();
        let phys = match inner.pages.get(&offset) {
            Some(e) => e.phys,
            None => crate::error::panic("page cache: release of an offset with no resident page"),
        };
        if dirty {
            page::with_mut(phys, |p| p.modified = true);
        }
        let remaining = page::decref(phys);
        if remaining == 0 {
            if offset >= inner.size {
                inner.pages.remove(&offset);
                page::free(phys, 1);
                return;
            }
            let modified = page::with(phys, |p| p.modified).unwrap_or(false);
            let has_write = inner.backend.as_ref().map(|b| b.has_write()).unwrap_or(false);
            let tag = if modified && has_write { QueueTag::Modified } else { QueueTag::Cached };
            if tag == QueueTag::Cached {
                page::with_mut(phys, |p| p.modified = false);
            }
            page::with_mut(phys, |p| p.queue = tag);
        }
    }

    /// Scatter/gather read or write against one contiguous in-memory
    /// buffer, clamped to the cache's size.
    pub fn io(&self, offset: u64, op: IoOp, buf: &mut [u8]) -> Result<usize> {
        let size = self.inner.lock_irqsave().size;
        if offset >= size {
            return Ok(0);
        }
        let to_transfer = core::cmp::min(buf.len() as u64, size - offset) as usize;
        let mut done = 0usize;
        while done < to_transfer {
            let cur_offset = offset + done as u64;
            let page_off = Self::page_aligned_offset(cur_offset);
            let in_page = (cur_offset - page_off) as usize;
            let chunk = core::cmp::min(PAGE_SIZE - in_page, to_transfer - done);
            let whole_page_write = op == IoOp::Write && in_page == 0 && chunk == PAGE_SIZE;
            let phys = self.get(cur_offset, whole_page_write)?;
            let virt = arch::arch().direct_map_offset() + phys;
            unsafe {
                let page_ptr = virt as *mut u8;
                match op {
                    IoOp::Read => core::ptr::copy_nonoverlapping(page_ptr.add(in_page), buf[done..done + chunk].as_mut_ptr(), chunk),
                    IoOp::Write => core::ptr::copy_nonoverlapping(buf[done..done + chunk].as_ptr(), page_ptr.add(in_page), chunk),
                }
            }
            self.release(cur_offset, op == IoOp::Write);
            done += chunk;
        }
        Ok(done)
    }

    /// Write back every modified page within bounds; clears `modified` and
    /// requeues as cached only for pages with no live references.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock_irqsave();
        let size = inner.size;
        let offsets: alloc::vec::Vec<u64> = inner.pages.keys().copied().filter(|&o| o < size).collect();
        let backend = inner.backend.clone();
        drop(inner);
        let Some(backend) = backend.filter(|b| b.has_write()) else {
            return Ok(());
        };
        for offset in offsets {
            let phys = {
                let inner = self.inner.lock_irqsave();
                inner.pages.get(&offset).map(|e| e.phys)
            };
            let Some(phys) = phys else { continue };
            let modified = page::with(phys, |p| p.modified).unwrap_or(false);
            if !modified {
                continue;
            }
            backend.write_page(offset, phys)?;
            page::with_mut(phys, |p| p.modified = false);
            if page::with(phys, |p| p.refcount()).unwrap_or(1) == 0 {
                page::with_mut(phys, |p| p.queue = QueueTag::Cached);
            }
        }
        Ok(())
    }

    /// Shrink or grow the logical size. Shrinking drops unreferenced pages
    /// beyond the new bound immediately; referenced pages are dropped on
    /// their next [`release`].
    pub fn resize(&self, new_size: u64) {
        let mut inner = self.inner.lock_irqsave();
        if new_size < inner.size {
            let doomed: alloc::vec::Vec<u64> = inner.pages.keys().copied().filter(|&o| o >= new_size).collect();
            for offset in doomed {
                let phys = inner.pages[&offset].phys;
                if page::with(phys, |p| p.refcount()).unwrap_or(0) == 0 {
                    inner.pages.remove(&offset);
                    page::free(phys, 1);
                }
            }
        }
        inner.size = new_size;
    }

    /// Tear the cache down. Fatal if any page still has live references.
    /// `discard` skips the writeback flush.
    pub fn destroy(&self, discard: bool) {
        if !discard {
            let _ = self.flush();
        }
        let mut inner = self.inner.lock_irqsave();
        inner.deleted = true;
        let offsets: alloc::vec::Vec<u64> = inner.pages.keys().copied().collect();
        for offset in offsets {
            let phys = inner.pages[&offset].phys;
            if page::with(phys, |p| p.refcount()).unwrap_or(0) != 0 {
                crate::error::panic("page cache: destroy with a still-referenced page");
            }
            inner.pages.remove(&offset);
            page::free(phys, 1);
        }
        // Toggle the lock once more so a concurrent flusher/evictor racing
        // with destruction observes `deleted` before touching a freed page.
        drop(inner);
        let _ = self.inner.lock_irqsave().deleted;
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock_irqsave().deleted
    }

    pub fn size(&self) -> u64 {
        self.inner.lock_irqsave().size
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock_irqsave();
        let mut modified = 0;
        for entry in inner.pages.values() {
            if page::with(entry.phys, |p| p.modified).unwrap_or(false) {
                modified += 1;
            }
        }
        CacheStats {
            page_count: inner.pages.len(),
            modified_count: modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::tests_support::install_test_arch;
    use crate::config::PAGE_SHIFT;
    use core::sync::atomic::{AtomicBool, Ordering};

    fn setup() {
        install_test_arch();
        let _ = page::range_add(0, 4096 << PAGE_SHIFT);
    }

    struct RecordingBackend {
        written: AtomicBool,
    }
    impl CacheBackend for RecordingBackend {
        fn has_read(&self) -> bool {
            true
        }
        fn has_write(&self) -> bool {
            true
        }
        fn read_page(&self, _offset: u64, phys: PhysAddr) -> Result<()> {
            page::zero(phys);
            Ok(())
        }
        fn write_page(&self, _offset: u64, _phys: PhysAddr) -> Result<()> {
            self.written.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn get_beyond_size_is_invalid_addr() {
        setup();
        let cache = PageCache::new(PAGE_SIZE as u64, None);
        assert_eq!(cache.get(PAGE_SIZE as u64, false), Err(KernelError::InvalidAddr));
    }

    #[test]
    #[should_panic(expected = "no resident page")]
    fn release_of_unknown_offset_is_fatal() {
        setup();
        let cache = PageCache::new(4 * PAGE_SIZE as u64, None);
        cache.release(0, false);
    }

    #[test]
    fn dirty_page_flushes_through_backend() {
        setup();
        let backend = Arc::new(RecordingBackend { written: AtomicBool::new(false) });
        let cache = PageCache::new(PAGE_SIZE as u64, Some(backend.clone()));
        let _phys = cache.get(0, false).unwrap();
        cache.release(0, true);
        cache.flush().unwrap();
        assert!(backend.written.load(Ordering::SeqCst));
    }

    #[test]
    fn io_read_write_round_trips() {
        setup();
        let cache = PageCache::new(PAGE_SIZE as u64, None);
        let payload = [0xABu8; 16];
        let mut scratch = payload;
        cache.io(0, IoOp::Write, &mut scratch).unwrap();
        let mut read_back = [0u8; 16];
        cache.io(0, IoOp::Read, &mut read_back).unwrap();
        assert_eq!(read_back, payload);
    }
}
