//! Minimal software `Arch` fake used only by this crate's own `#[cfg(test)]`
//! unit tests (spinlock/waitqueue/dpc). The richer fakes that drive the
//! end-to-end scenarios in §8 live in the `kcore-tests` host crate instead,
//! since they need to simulate more than one CPU.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::mmu::{MapFlags, MmuContext, MmuFactory};
use super::{Arch, ArchContext, IrqState, PhysAddr, ResumeContext, VirtAddr};

thread_local! {
    static IRQ_ENABLED: Cell<bool> = Cell::new(true);
}

/// Stand-in "physical memory" backing `direct_map_offset` for tests that
/// exercise `mm::page::zero`/`copy`: real physical addresses aren't valid
/// host pointers, so page-allocator tests in this crate only ever touch
/// addresses inside this buffer.
const FAKE_PHYS_MEM_SIZE: usize = 1 << 20;
static mut FAKE_PHYS_MEM: [u8; FAKE_PHYS_MEM_SIZE] = [0; FAKE_PHYS_MEM_SIZE];

struct TestArch;

impl Arch for TestArch {
    fn irq_disable(&self) -> IrqState {
        IRQ_ENABLED.with(|f| {
            let prior = f.get();
            f.set(false);
            IrqState(prior)
        })
    }

    fn irq_restore(&self, state: IrqState) {
        IRQ_ENABLED.with(|f| f.set(state.0));
    }

    fn irqs_enabled(&self) -> bool {
        IRQ_ENABLED.with(|f| f.get())
    }

    fn cpu_spin_hint(&self) {
        std::hint::spin_loop();
    }

    fn cpu_idle(&self) {
        std::thread::yield_now();
    }

    fn current_cpu_id(&self) -> usize {
        0
    }

    fn num_cpus(&self) -> usize {
        1
    }

    fn context_save(&self, _ctx: &mut ResumeContext) -> bool {
        false
    }

    fn context_resume(&self, _ctx: &ResumeContext) -> ! {
        crate::error::panic("test arch: context_resume is unsupported")
    }

    fn thread_switch(&self, _new: &ArchContext, _old: &mut ArchContext) {}

    fn enter_userspace(&self, _entry: usize, _sp: usize, _arg: usize) -> ! {
        crate::error::panic("test arch: enter_userspace is unsupported")
    }

    fn direct_map_offset(&self) -> usize {
        core::ptr::addr_of!(FAKE_PHYS_MEM) as usize
    }
}

static TEST_ARCH: TestArch = TestArch;
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the single-CPU test fake exactly once per process. Safe to call
/// from every test; later calls are no-ops.
pub fn install_test_arch() {
    if INSTALLED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
    {
        super::set_arch(&TEST_ARCH);
        super::mmu::set_mmu_factory(&TEST_MMU_FACTORY);
    }
}

/// A trivial MMU context backed by a host `BTreeMap` instead of real page
/// tables, for `vm::address_space` unit tests.
struct TestMmuContext {
    mappings: Mutex<BTreeMap<VirtAddr, (PhysAddr, MapFlags)>>,
}

impl TestMmuContext {
    fn new() -> Self {
        Self {
            mappings: Mutex::new(BTreeMap::new()),
        }
    }
}

impl MmuContext for TestMmuContext {
    fn map(&mut self, virt: VirtAddr, phys: PhysAddr, flags: MapFlags) -> crate::error::Result<()> {
        let mut m = self.mappings.lock().unwrap();
        if m.contains_key(&virt) {
            crate::error::panic("test mmu: double map");
        }
        m.insert(virt, (phys, flags));
        Ok(())
    }

    fn remap(&mut self, virt: VirtAddr, size: usize, access: MapFlags) -> crate::error::Result<()> {
        let mut m = self.mappings.lock().unwrap();
        let page = 1usize << crate::config::PAGE_SHIFT;
        let mut addr = virt;
        while addr < virt + size {
            if let Some(entry) = m.get_mut(&addr) {
                entry.1 = access;
            }
            addr += page;
        }
        Ok(())
    }

    fn unmap(&mut self, virt: VirtAddr) -> (bool, Option<PhysAddr>) {
        match self.mappings.lock().unwrap().remove(&virt) {
            Some((phys, _)) => (true, Some(phys)),
            None => (false, None),
        }
    }

    fn query(&self, virt: VirtAddr) -> Option<(PhysAddr, MapFlags)> {
        self.mappings.lock().unwrap().get(&virt).copied()
    }

    fn flush(&mut self) {}
    fn load(&mut self) {}
    fn unload(&mut self) {}
}

struct TestMmuFactory;

impl MmuFactory for TestMmuFactory {
    fn create_kernel_context(&self) -> Box<dyn MmuContext> {
        Box::new(TestMmuContext::new())
    }

    fn create_user_context(&self) -> Box<dyn MmuContext> {
        Box::new(TestMmuContext::new())
    }
}

static TEST_MMU_FACTORY: TestMmuFactory = TestMmuFactory;
