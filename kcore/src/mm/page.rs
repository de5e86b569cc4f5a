//! Physical page allocator and page struct (§4.D), grounded in the
//! teacher's `mm::buddy::BuddyAllocator` and `mm::page::Page` for the base
//! refcount/physical-address bookkeeping, rebuilt on top of the generic
//! [`RangeArena`](super::arena::RangeArena) instead of a dedicated buddy
//! tree so the same allocator primitive also backs process ids (§4.E).
//! The cache back-pointer and Allocated/Modified/Cached queue-tag state
//! machine have no teacher counterpart — the teacher's `Page` carries
//! only `order`/`PageFlags`, with no page cache ever wired to it — and
//! are original to this crate per §3's page invariants.

use alloc::vec::Vec;

use crate::arch::{self, PhysAddr};
use crate::config::PAGE_SHIFT;
use crate::error::{KernelError, Result};
use crate::mm::arena::{Constraints, RangeArena};
use crate::sched::{scheduler, thread};
use crate::sync::spinlock::Spinlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTag {
    Free,
    Allocated,
    Modified,
    Cached,
    Pageable,
}

/// One physical page-sized frame's bookkeeping. Indexed by frame number
/// (`phys >> PAGE_SHIFT`) in the global frame table, never moved or
/// reallocated once the table has grown to cover it.
pub struct Page {
    pub phys: PhysAddr,
    refcount: u32,
    cache_offset: u64,
    has_cache: bool,
    pub modified: bool,
    pub queue: QueueTag,
}

impl Page {
    fn new(phys: PhysAddr) -> Self {
        Self {
            phys,
            refcount: 0,
            cache_offset: 0,
            has_cache: false,
            modified: false,
            queue: QueueTag::Free,
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn cache_offset(&self) -> Option<u64> {
        self.has_cache.then_some(self.cache_offset)
    }

    pub fn attach_cache(&mut self, offset: u64) {
        self.has_cache = true;
        self.cache_offset = offset;
    }

    pub fn detach_cache(&mut self) {
        self.has_cache = false;
        self.cache_offset = 0;
    }
}

fn frame_of(phys: PhysAddr) -> usize {
    phys >> PAGE_SHIFT
}

static ARENA: RangeArena = RangeArena::new(1, 0);

struct FrameTable {
    frames: Vec<Page>,
}

static FRAMES: Spinlock<FrameTable> = Spinlock::new(FrameTable { frames: Vec::new() });

fn ensure_capacity(frames: &mut FrameTable, up_to_frame: usize) {
    while frames.frames.len() <= up_to_frame {
        let phys = frames.frames.len() << PAGE_SHIFT;
        frames.frames.push(Page::new(phys));
    }
}

/// At boot only: add `[start,end)` (page-aligned, byte addresses) as
/// allocatable physical memory.
pub fn range_add(start: PhysAddr, end: PhysAddr) -> Result<()> {
    if start % (1 << PAGE_SHIFT) != 0 || end % (1 << PAGE_SHIFT) != 0 || end <= start {
        return Err(KernelError::InvalidArg);
    }
    let start_unit = (start >> PAGE_SHIFT) as u64;
    let count = ((end - start) >> PAGE_SHIFT) as u64;
    ARENA.add(start_unit, count)?;
    let mut frames = FRAMES.lock_irqsave();
    ensure_capacity(&mut frames, frame_of(end) - 1);
    Ok(())
}

/// At boot only: pin `[start,end)` as in-use-but-releasable-later (e.g.
/// the kernel image's bootstrap scratch space). Released with
/// [`release_reclaimable`].
static RECLAIMABLE: Spinlock<Vec<(u64, u64)>> = Spinlock::new(Vec::new());

pub fn mark_reclaimable(start: PhysAddr, end: PhysAddr) -> Result<()> {
    let start_unit = (start >> PAGE_SHIFT) as u64;
    let count = ((end - start) >> PAGE_SHIFT) as u64;
    let base = ARENA.alloc_constrained(count, Constraints { min_addr: Some(start_unit), max_addr: Some(start_unit + count), ..Constraints::NONE }, false)?;
    RECLAIMABLE.lock_irqsave().push((base, count));
    Ok(())
}

/// At boot only: permanently withhold `[start,end)` from the allocator
/// (MMIO holes, firmware-reserved regions).
pub fn mark_reserved(start: PhysAddr, end: PhysAddr) -> Result<()> {
    let start_unit = (start >> PAGE_SHIFT) as u64;
    let count = ((end - start) >> PAGE_SHIFT) as u64;
    ARENA
        .alloc_constrained(count, Constraints { min_addr: Some(start_unit), max_addr: Some(start_unit + count), ..Constraints::NONE }, false)
        .map(|_| ())
}

/// Release memory previously pinned with [`mark_reclaimable`], once boot-time
/// bookkeeping no longer needs it.
pub fn release_reclaimable() {
    let pinned = core::mem::take(&mut *RECLAIMABLE.lock_irqsave());
    for (base, count) in pinned {
        ARENA.free(base, count);
    }
}

/// Reserve a contiguous run of `count` pages. `must_succeed` makes failure
/// fatal rather than returned. `zero_on_return` zeroes the whole run before
/// handing it back, so callers that need a clean page (anonymous faults)
/// don't have to remember a separate [`zero`] call (§4.D "optional
/// zero-on-return").
pub fn alloc(count: usize, constraints: Constraints, must_succeed: bool, zero_on_return: bool) -> Result<PhysAddr> {
    let base_unit = ARENA.alloc_constrained(count as u64, constraints, must_succeed)?;
    let phys = (base_unit as usize) << PAGE_SHIFT;
    let mut frames = FRAMES.lock_irqsave();
    ensure_capacity(&mut frames, frame_of(phys) + count - 1);
    for i in 0..count {
        let page = &mut frames.frames[frame_of(phys) + i];
        page.queue = QueueTag::Allocated;
        page.refcount = 0;
    }
    drop(frames);
    if zero_on_return {
        for i in 0..count {
            zero(phys + (i << PAGE_SHIFT));
        }
    }
    Ok(phys)
}

/// `base` and `count` must exactly match a prior [`alloc`].
pub fn free(base: PhysAddr, count: usize) {
    {
        let mut frames = FRAMES.lock_irqsave();
        for i in 0..count {
            let page = &mut frames.frames[frame_of(base) + i];
            if page.refcount != 0 {
                crate::error::panic("page: free of a page with live references");
            }
            page.queue = QueueTag::Free;
            page.modified = false;
            page.detach_cache();
        }
    }
    ARENA.free((base >> PAGE_SHIFT) as u64, count as u64);
}

pub fn with<R>(phys: PhysAddr, f: impl FnOnce(&Page) -> R) -> Option<R> {
    let frames = FRAMES.lock_irqsave();
    frames.frames.get(frame_of(phys)).map(f)
}

pub fn with_mut<R>(phys: PhysAddr, f: impl FnOnce(&mut Page) -> R) -> Option<R> {
    let mut frames = FRAMES.lock_irqsave();
    frames.frames.get_mut(frame_of(phys)).map(f)
}

/// Increment a page's reference count, returning the new value. Moves the
/// page to `Allocated` on a 0→1 transition.
pub fn incref(phys: PhysAddr) -> u32 {
    with_mut(phys, |p| {
        p.refcount += 1;
        if p.refcount == 1 {
            p.queue = QueueTag::Allocated;
        }
        p.refcount
    })
    .unwrap_or_else(|| crate::error::panic("page: incref on an unmapped frame"))
}

/// Decrement a page's reference count, returning the new value. Does not by
/// itself move the page's queue off `Allocated`; callers (the page cache)
/// decide the post-0 destination per §4.F.
pub fn decref(phys: PhysAddr) -> u32 {
    with_mut(phys, |p| {
        if p.refcount == 0 {
            crate::error::panic("page: decref below zero");
        }
        p.refcount -= 1;
        p.refcount
    })
    .unwrap_or_else(|| crate::error::panic("page: decref on an unmapped frame"))
}

/// Zero a freshly allocated page through a scoped kernel mapping, wiring the
/// calling thread for the duration so it cannot migrate off a CPU mid-copy.
pub fn zero(phys: PhysAddr) {
    let tid = scheduler::current_thread();
    thread::wire(tid);
    let virt = arch::arch().direct_map_offset() + phys;
    unsafe {
        core::ptr::write_bytes(virt as *mut u8, 0, 1 << PAGE_SHIFT);
    }
    let _ = thread::unwire(tid);
}

pub fn copy(dst: PhysAddr, src: PhysAddr) {
    let tid = scheduler::current_thread();
    thread::wire(tid);
    let offset = arch::arch().direct_map_offset();
    unsafe {
        core::ptr::copy_nonoverlapping((offset + src) as *const u8, (offset + dst) as *mut u8, 1 << PAGE_SHIFT);
    }
    let _ = thread::unwire(tid);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub allocated_pages: u64,
}

pub fn stats() -> AllocStats {
    let s = ARENA.stats();
    AllocStats {
        total_pages: s.total_units,
        free_pages: s.free_units,
        allocated_pages: s.allocated_units,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::tests_support::install_test_arch;

    fn setup() {
        install_test_arch();
        range_add(0, 64 << PAGE_SHIFT).ok();
    }

    #[test]
    fn alloc_zero_free_round_trips() {
        setup();
        let phys = alloc(4, Constraints::NONE, false, false).unwrap();
        zero(phys);
        with(phys, |p| assert_eq!(p.queue, QueueTag::Allocated)).unwrap();
        free(phys, 4);
        with(phys, |p| assert_eq!(p.queue, QueueTag::Free)).unwrap();
    }

    #[test]
    #[should_panic(expected = "live references")]
    fn free_with_live_refcount_is_fatal() {
        setup();
        let phys = alloc(1, Constraints::NONE, false, false).unwrap();
        incref(phys);
        free(phys, 1);
    }

    #[test]
    fn incref_moves_page_to_allocated_queue() {
        setup();
        let phys = alloc(1, Constraints::NONE, false, false).unwrap();
        // simulate a clean cached page (refcount 0) being looked up again
        with_mut(phys, |p| p.queue = QueueTag::Cached).unwrap();
        assert_eq!(incref(phys), 1);
        with(phys, |p| assert_eq!(p.queue, QueueTag::Allocated)).unwrap();
    }
}
