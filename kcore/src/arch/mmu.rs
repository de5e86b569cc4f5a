//! MMU context vtable (§4.H): install/modify/query virtual→physical
//! mappings, with batched TLB invalidation.
//!
//! Recast from the teacher's function-pointer `mmu_ops` struct into a trait
//! object per the design notes ("vtables via function-pointer structs").
//! Each [`MmuContext`] implementation owns one architecture page table plus
//! its own bounded invalidation queue.

use alloc::boxed::Box;

use bitflags::bitflags;

use super::{PhysAddr, VirtAddr};
use crate::error::Result;

bitflags! {
    /// Protection/placement bits for a leaf mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXEC    = 1 << 2;
        const USER    = 1 << 3;
        /// Global entry: not tagged by ASID, never invalidated on context
        /// switch. Used for the kernel context's own mappings.
        const GLOBAL  = 1 << 4;
    }
}

/// Subset of [`MapFlags`] meaningful to a protection change (`remap`) or a
/// region/page-source access check; kept as a distinct type so a caller
/// cannot accidentally pass `GLOBAL`/`USER` through `region.protection`.
pub type AccessFlags = MapFlags;

/// One queued TLB invalidation, batched until `flush()`.
#[derive(Debug, Clone, Copy)]
pub struct TlbOp {
    pub virt: VirtAddr,
}

/// Architecture-specific virtual address space. One instance per
/// [`crate::vm::address_space::AddressSpace`] plus one process-wide instance
/// for the kernel itself.
///
/// Implementation notes the spec requires be honored in any port (§4.H):
/// the invalidation queue is bounded; overflow degrades to a whole-ASID
/// flush for user contexts, or a forced flush of the queued entries for the
/// kernel context (which uses global entries instead of an ASID). The flush
/// sequence is DSB → broadcast invalidate → DSB, represented here as the
/// three `Arch` barrier/broadcast hooks a concrete port would call from
/// `flush()`.
pub trait MmuContext: Send {
    /// Install a leaf mapping. Fatal (via [`crate::error::panic`]) if the
    /// virtual address is already mapped — §4.H contracts a hard failure,
    /// not a silent overwrite.
    fn map(&mut self, virt: VirtAddr, phys: PhysAddr, flags: MapFlags) -> Result<()>;

    /// Change protection bits over `[virt, virt+size)`. Every page in the
    /// range must already be mapped.
    fn remap(&mut self, virt: VirtAddr, size: usize, access: AccessFlags) -> Result<()>;

    /// Clear the leaf entry at `virt`, queue its invalidation, and return
    /// what was mapped there (if anything).
    fn unmap(&mut self, virt: VirtAddr) -> (bool, Option<PhysAddr>);

    /// Read back a mapping without side effects.
    fn query(&self, virt: VirtAddr) -> Option<(PhysAddr, MapFlags)>;

    /// Flush queued TLB invalidations. A no-op if the queue is empty.
    fn flush(&mut self);

    /// Install this context on the current CPU (e.g. load a new `satp`/`ttbr`/`cr3`).
    fn load(&mut self);

    /// Uninstall this context from the current CPU.
    fn unload(&mut self);

    /// Architecture-specific ASID, if any. `None` for contexts (like the
    /// kernel's) that rely on global entries instead.
    fn asid(&self) -> Option<u16> {
        None
    }
}

/// Constructs fresh [`MmuContext`]s. Installed once at boot like [`super::Arch`]
/// and [`super::Timer`], since `MmuContext` itself has no `new()` — the
/// concrete page-table layout is entirely architecture-specific.
pub trait MmuFactory: Sync {
    /// A context using global entries and no ASID, for the kernel's own
    /// address space (§4.H: "kernel context uses a reserved ASID and global
    /// bit").
    fn create_kernel_context(&self) -> Box<dyn MmuContext>;
    /// A fresh per-process context with its own ASID.
    fn create_user_context(&self) -> Box<dyn MmuContext>;
}

static MMU_FACTORY: spin::Mutex<Option<&'static dyn MmuFactory>> = spin::Mutex::new(None);

pub fn set_mmu_factory(factory: &'static dyn MmuFactory) {
    *MMU_FACTORY.lock() = Some(factory);
}

pub fn mmu_factory() -> &'static dyn MmuFactory {
    MMU_FACTORY
        .lock()
        .unwrap_or_else(|| crate::error::panic("arch: no MMU factory installed"))
}
