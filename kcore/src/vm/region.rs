//! A contiguous mapped range inside one address space (§3 "Region").

use alloc::sync::Arc;

use crate::arch::{AccessFlags, VirtAddr};
use crate::vm::source::PageSource;

pub struct Region {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub protection: AccessFlags,
    pub reserved: bool,
    pub source: Option<Arc<PageSource>>,
    /// Source offset corresponding to `start`.
    pub source_offset: u64,
}

impl Region {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Source offset for an arbitrary address inside this region.
    pub fn offset_for(&self, addr: VirtAddr) -> u64 {
        self.source_offset + (addr - self.start) as u64
    }
}
