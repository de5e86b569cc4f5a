//! Architecture adapter (§4.H, §6): the fixed interface the core consumes
//! from a per-architecture layer that is itself out of scope here.
//!
//! Everything in this module is a trait plus small value types. Production
//! builds install one `&'static dyn Arch` (mirroring [`crate::log::set_sink`]);
//! host-side tests install a software fake from `kcore-tests`.

use crate::config::MAX_CPUS;

pub mod mmu;

#[cfg(test)]
pub mod tests_support;

pub use mmu::{AccessFlags, MapFlags, MmuContext, MmuFactory, TlbOp};

/// Physical address. Opaque to the core beyond ordering and page alignment.
pub type PhysAddr = usize;
/// Virtual address, always within one address space's range.
pub type VirtAddr = usize;

/// Saved local-IRQ enable state, as returned by [`Arch::irq_disable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub bool);

/// Opaque per-thread CPU context save area.
///
/// The architecture layer owns the real register file; the core only needs
/// to allocate a slot, hand it to `context_save`/`thread_switch`, and move it
/// around with the owning [`crate::sched::thread::Thread`]. A fixed-size
/// buffer is enough for a portable core that never interprets the contents.
#[derive(Clone)]
pub struct ArchContext {
    bytes: [usize; 32],
}

impl ArchContext {
    pub const fn new() -> Self {
        Self { bytes: [0; 32] }
    }

    pub fn raw_mut(&mut self) -> &mut [usize; 32] {
        &mut self.bytes
    }

    pub fn raw(&self) -> &[usize; 32] {
        &self.bytes
    }
}

impl Default for ArchContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A resumable snapshot taken before an interruptible or timed sleep
/// (design notes: "coroutine-style sleep" recast as an explicit
/// continuation rather than a magic twice-returning function).
#[derive(Clone, Default)]
pub struct ResumeContext {
    pub(crate) inner: ArchContext,
}

/// CPU & IRQ primitives (§6) supplied by the architecture layer.
pub trait Arch: Sync {
    /// Disable local IRQs, returning whether they were enabled before.
    fn irq_disable(&self) -> IrqState;
    /// Restore local IRQs to a previously captured state.
    fn irq_restore(&self, state: IrqState);
    /// True if local IRQs are currently enabled.
    fn irqs_enabled(&self) -> bool;
    /// A relax/pause hint for spin loops.
    fn cpu_spin_hint(&self);
    /// Enter the architecture's idle instruction (wfi/hlt/...), returning
    /// when an interrupt arrives.
    fn cpu_idle(&self);
    /// Identifier of the CPU executing this call, in `0..num_cpus()`.
    fn current_cpu_id(&self) -> usize;
    /// Number of schedulable CPUs actually present, `<= MAX_CPUS`.
    fn num_cpus(&self) -> usize;
    /// Save the current context into `ctx`. Returns `true` if this call is
    /// the resumption of a context saved earlier (the "did we just wake up"
    /// half of the coroutine-style handoff the design notes call out).
    fn context_save(&self, ctx: &mut ResumeContext) -> bool;
    /// Restore execution at a previously saved resume context. Does not
    /// return on the calling side; execution continues from the
    /// `context_save` call site with a `true` return.
    fn context_resume(&self, ctx: &ResumeContext) -> !;
    /// Perform a kernel-thread context switch, saving `old`'s register file
    /// and loading `new`'s.
    fn thread_switch(&self, new: &ArchContext, old: &mut ArchContext);
    /// Transfer control to userspace at `entry` with stack pointer `sp` and
    /// a single argument register. Never returns.
    fn enter_userspace(&self, entry: VirtAddr, sp: VirtAddr, arg: usize) -> !;

    /// Constant offset such that `direct_map_offset() + phys` is a valid
    /// kernel-virtual alias of physical address `phys`. Lets the page
    /// allocator's `zero`/`copy` avoid a real temporary-mapping dance on
    /// architectures that keep all of physical memory linearly mapped.
    /// Defaults to 0 (identity mapping), the common case for a hosted test
    /// double.
    fn direct_map_offset(&self) -> usize {
        0
    }
}

static ARCH: spin::Mutex<Option<&'static dyn Arch>> = spin::Mutex::new(None);

/// Install the platform's architecture adapter. Like [`crate::log::set_sink`],
/// a later call simply replaces the previous one.
pub fn set_arch(arch: &'static dyn Arch) {
    *ARCH.lock() = Some(arch);
}

/// Fetch the installed architecture adapter.
///
/// # Panics
/// Fatal (via [`crate::error::panic`]) if no adapter has been installed —
/// every caller above boot runs after architecture init.
pub fn arch() -> &'static dyn Arch {
    ARCH.lock()
        .unwrap_or_else(|| crate::error::panic("arch: no architecture adapter installed"))
}

/// `true` when the system has more than one schedulable CPU. On UP,
/// spinlock contention is a bug (§4.A) rather than something to spin out.
pub fn is_smp() -> bool {
    arch().num_cpus() > 1
}

/// Timer adapter (§6): arms a one-shot callback on the CPU that requested it.
pub trait Timer: Sync {
    /// One-time setup, called once at boot.
    fn timer_init(&self);
    /// Arm a one-shot timer firing after `delay_us` microseconds. `token`
    /// identifies the armed timer so it can be cancelled with `timer_stop`.
    fn timer_start(&self, delay_us: u64, callback: fn(usize), arg: usize) -> usize;
    /// Cancel a previously armed timer. A no-op if it already fired.
    fn timer_stop(&self, token: usize);
}

static TIMER: spin::Mutex<Option<&'static dyn Timer>> = spin::Mutex::new(None);

pub fn set_timer(timer: &'static dyn Timer) {
    *TIMER.lock() = Some(timer);
}

pub fn timer() -> &'static dyn Timer {
    TIMER
        .lock()
        .unwrap_or_else(|| crate::error::panic("arch: no timer adapter installed"))
}

/// Cap used to size fixed per-CPU arrays throughout `sched`; the runtime CPU
/// count from `arch().num_cpus()` is always `<= MAX_CPUS`.
pub const fn max_cpus() -> usize {
    MAX_CPUS
}
