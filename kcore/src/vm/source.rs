//! Page source backends (§4.G "Source backends"). The anonymous/
//! file-shared/file-private split has no teacher analog: the teacher's
//! own COW fault path (`mm/fault.rs::handle_cow_fault`) is an
//! unimplemented stub (a chain of `// TODO: Walk page table...` comments
//! ending in `"COW setup for fork (stub)"`), so there is no working
//! shared-vs-private source mechanism to ground this in. This module is
//! an original design for §4.G's source contract, built atop this
//! crate's own [`PageCache`] rather than a bespoke refcounted page list.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::PhysAddr;
use crate::error::Result;
use crate::handle::{handle_types, HandleType, KernelObject};
use crate::mm::page_cache::{CacheBackend, PageCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Anonymous,
    FileShared,
    FilePrivate,
}

/// Wraps a caller-supplied backend but reports `has_write() == false`, so a
/// private mapping's writes are cached but never propagate to the file
/// (§4.G "File-private").
struct ReadOnlyBackend(Arc<dyn CacheBackend>);

impl CacheBackend for ReadOnlyBackend {
    fn read_page(&self, offset: u64, phys: PhysAddr) -> Result<()> {
        self.0.read_page(offset, phys)
    }
    fn has_read(&self) -> bool {
        self.0.has_read()
    }
    fn has_write(&self) -> bool {
        false
    }
}

/// Source of pages for one or more [`crate::vm::region::Region`]s.
pub struct PageSource {
    kind: SourceKind,
    /// Private sources are referenced by exactly one address space at a
    /// time; shared sources may be referenced by many (§3 invariant).
    private: bool,
    read_only: bool,
    refcount: AtomicU32,
    cache: PageCache,
}

impl PageSource {
    pub fn anonymous(size: u64) -> Arc<Self> {
        Arc::new(Self {
            kind: SourceKind::Anonymous,
            private: true,
            read_only: false,
            refcount: AtomicU32::new(0),
            cache: PageCache::new(size, None),
        })
    }

    pub fn file_shared(size: u64, backend: Arc<dyn CacheBackend>, read_only: bool) -> Arc<Self> {
        Arc::new(Self {
            kind: SourceKind::FileShared,
            private: false,
            read_only,
            refcount: AtomicU32::new(0),
            cache: PageCache::new(size, Some(backend)),
        })
    }

    pub fn file_private(size: u64, backend: Arc<dyn CacheBackend>) -> Arc<Self> {
        Arc::new(Self {
            kind: SourceKind::FilePrivate,
            private: true,
            read_only: false,
            refcount: AtomicU32::new(0),
            cache: PageCache::new(size, Some(Arc::new(ReadOnlyBackend(backend)))),
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Rejects a writeable mapping of a read-only file-shared source
    /// (§4.G "`map` hook rejects writeable mappings of read-only files").
    pub fn check_writable_map(&self) -> bool {
        !(self.kind == SourceKind::FileShared && self.read_only)
    }

    pub fn get(&self, offset: u64, overwrite: bool) -> Result<PhysAddr> {
        self.cache.get(offset, overwrite)
    }

    pub fn release(&self, offset: u64, dirty: bool) {
        self.cache.release(offset, dirty);
    }

    /// Like [`release`], but tolerant of an offset that was never faulted
    /// in (never resident), returning whether a page was actually there.
    pub fn release_if_present(&self, offset: u64, dirty: bool) -> bool {
        self.cache.release_if_present(offset, dirty)
    }

    pub fn incref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the reference count; once it reaches zero the backing
    /// cache is torn down (flushed unless `discard_on_zero`).
    pub fn decref(&self, discard_on_zero: bool) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.cache.destroy(discard_on_zero);
        }
        prev - 1
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }
}

/// Lets a page source live behind a process handle (§4.L). `decref`'s own
/// cache teardown already serves as the close hook, so `on_close` has
/// nothing left to do.
impl KernelObject for PageSource {
    fn type_tag(&self) -> HandleType {
        handle_types::VM_OBJECT
    }

    fn incref(&self) -> u32 {
        PageSource::incref(self)
    }

    fn decref(&self) -> u32 {
        PageSource::decref(self, false)
    }
}
