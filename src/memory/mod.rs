//! Virtual memory
//!
//! Owns the coremap, physical RAM and the TLB bridge. Page tables and
//! address spaces hang off the `Vm` through `&mut` borrows held by their
//! owners; the `Vm` itself is shared and internally locked.
//!
//! The whole coremap sits behind one lock, so every frame allocation on
//! every core serialises on it.
//!
//! Lock order: the coremap lock is always dropped before RAM is touched,
//! and neither is held across a TLB operation.

pub mod boot_frame_allocator;
pub mod coremap;
pub mod error;
pub mod fault;
pub mod paging;
pub mod physical;
pub mod tlb;

#[cfg(test)]
pub(crate) mod test_support;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info, warn};
use spin::{Mutex, Once};
use x86_64::{
    structures::paging::{Page, PhysFrame, Size4KiB},
    VirtAddr,
};

use crate::constants::memory::KERNEL_DIRECT_MAP_BASE;
use crate::devices::Clock;
use crate::interrupts::InterruptControl;
use crate::processes::address_space::AsId;
use boot_frame_allocator::BootFrameAllocator;
use coremap::{Coremap, CoremapStats, FrameDescriptor, FrameState};
use paging::FrameSource;
use physical::{kvaddr_to_paddr, paddr_to_kvaddr, PhysicalMemory};
use tlb::{TlbBridge, TlbHardware, TlbShootdown};

pub use error::VmError;

/// Machine-dependent pieces the core drives but does not implement.
pub struct Machine {
    pub tlb: Arc<dyn TlbHardware>,
    pub interrupts: Arc<dyn InterruptControl>,
    pub clock: Arc<dyn Clock>,
}

/// Virtual memory state of the whole machine.
pub struct Vm {
    coremap: Mutex<Coremap>,
    ram: Mutex<PhysicalMemory>,
    tlb: TlbBridge,
    clock: Arc<dyn Clock>,
    next_asid: AtomicU32,
}

static VM: Once<Vm> = Once::new();

/// Hand physical memory over from the boot allocator to the coremap.
///
/// Consuming the boot allocator makes it impossible to steal frames after
/// the coremap exists.
pub fn bootstrap_virtual_memory(boot: BootFrameAllocator, machine: Machine) -> Vm {
    let stolen = boot.stolen_frames();
    let (ram, first, last) = boot.into_ram();
    let now = machine.clock.now();
    let coremap = Coremap::bootstrap(first, last, now);

    info!(
        "vm: {} frames, {} fixed ({} stolen at boot)",
        coremap.frame_count(),
        coremap.first_free_frame(),
        stolen
    );

    Vm {
        coremap: Mutex::new(coremap),
        ram: Mutex::new(ram),
        tlb: TlbBridge::new(machine.tlb, machine.interrupts, now.as_nanos()),
        clock: machine.clock,
        next_asid: AtomicU32::new(1),
    }
}

/// Bootstrap the global instance. Only the first call does anything.
pub fn init(boot: BootFrameAllocator, machine: Machine) -> Result<&'static Vm, VmError> {
    let mut ran = false;
    let vm = VM.call_once(|| {
        ran = true;
        bootstrap_virtual_memory(boot, machine)
    });
    if ran {
        Ok(vm)
    } else {
        warn!("vm: bootstrap requested twice");
        Err(VmError::AlreadyBootstrapped)
    }
}

/// The global instance.
///
/// # Panics
/// If `init` has not run yet.
pub fn vm() -> &'static Vm {
    VM.get().expect("Virtual memory not bootstrapped")
}

pub fn try_vm() -> Option<&'static Vm> {
    VM.get()
}

impl Vm {
    /// Allocate `npages` contiguous zeroed kernel pages.
    ///
    /// # Returns
    /// The direct-mapped address of the first page, or None if no run of
    /// that length is free.
    pub fn allocate_kernel_pages(&self, npages: usize) -> Option<VirtAddr> {
        let frame = self.allocate_run(npages)?;
        Some(paddr_to_kvaddr(frame.start_address()))
    }

    /// Free a run returned by `allocate_kernel_pages`.
    ///
    /// Addresses outside the direct map, fixed frames, frames backing user
    /// pages and addresses inside a run are ignored.
    pub fn free_kernel_pages(&self, vaddr: VirtAddr) {
        if vaddr.as_u64() < KERNEL_DIRECT_MAP_BASE {
            warn!("vm: free_kernel_pages({:#x}) outside the direct map", vaddr.as_u64());
            return;
        }
        let frame = PhysFrame::containing_address(kvaddr_to_paddr(vaddr));
        let freed = self.coremap.lock().free_run(frame);
        debug!("vm: freed {} kernel frames at {:#x}", freed, vaddr.as_u64());
    }

    /// Invalidate every cached translation on this core.
    pub fn invalidate_all_translations(&self) {
        self.tlb.shootdown_all();
    }

    /// Invalidate the cached translation of `vaddr` on this core, if any.
    pub fn invalidate_translation(&self, vaddr: VirtAddr) {
        self.tlb.shootdown_one(vaddr);
    }

    /// Handle a shootdown delivered from another core.
    pub fn tlb_shootdown(&self, request: &TlbShootdown) {
        self.tlb.shootdown_one(request.vaddr);
    }

    pub fn stats(&self) -> CoremapStats {
        self.coremap.lock().stats()
    }

    pub fn frame_state(&self, frame: PhysFrame<Size4KiB>) -> FrameState {
        self.coremap.lock().state(frame)
    }

    pub fn frame_descriptor(&self, frame: PhysFrame<Size4KiB>) -> FrameDescriptor {
        *self.coremap.lock().descriptor(frame)
    }

    /// Oldest in-use frame seen by the last failed page allocation.
    pub fn eviction_hint(&self) -> Option<PhysFrame<Size4KiB>> {
        self.coremap.lock().eviction_hint()
    }

    /// Run `f` over the contents of `frame`.
    pub fn with_frame<R>(&self, frame: PhysFrame<Size4KiB>, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.ram.lock().frame(frame))
    }

    pub fn with_frame_mut<R>(
        &self,
        frame: PhysFrame<Size4KiB>,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        f(self.ram.lock().frame_mut(frame))
    }

    pub(crate) fn tlb(&self) -> &TlbBridge {
        &self.tlb
    }

    pub(crate) fn next_asid(&self) -> AsId {
        AsId::new(self.next_asid.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn release_frame(&self, frame: PhysFrame<Size4KiB>) {
        self.coremap.lock().release(frame);
    }

    /// Give back a page-table frame taken through `FrameSource::table_frame`.
    pub(crate) fn release_table_frame(&self, frame: PhysFrame<Size4KiB>) {
        self.coremap.lock().free_run(frame);
    }

    pub(crate) fn copy_frame(&self, from: PhysFrame<Size4KiB>, to: PhysFrame<Size4KiB>) {
        self.ram.lock().copy_frame(from, to);
    }

    fn allocate_run(&self, npages: usize) -> Option<PhysFrame<Size4KiB>> {
        let now = self.clock.now();
        let frame = self.coremap.lock().allocate_run(npages, now)?;
        self.ram.lock().zero(frame, npages);
        Some(frame)
    }
}

impl FrameSource for Vm {
    fn table_frame(&self) -> Option<PhysFrame<Size4KiB>> {
        self.allocate_run(1)
    }

    fn page_frame(&self, owner: AsId, page: Page<Size4KiB>) -> Option<PhysFrame<Size4KiB>> {
        let now = self.clock.now();
        let frame = self.coremap.lock().allocate_one(owner, page, now)?;
        self.ram.lock().zero(frame, 1);
        Some(frame)
    }
}
