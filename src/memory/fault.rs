//! Page fault handling
//!
//! Misses are resolved from the current address space's page table, which
//! allocates frames on first touch. Writes through a clean cached
//! translation arrive as read-only faults and are either upgraded or
//! refused.

use log::{error, trace};
use spin::Mutex;
use x86_64::VirtAddr;

use crate::constants::memory::{VM_FAULT_READ, VM_FAULT_READONLY, VM_FAULT_WRITE};
use crate::memory::{
    paging::{user_page, Permissions},
    tlb::{TlbEntry, TlbFlags},
    Vm, VmError,
};
use crate::processes::address_space::AddressSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// TLB miss on a load.
    Read,
    /// TLB miss on a store.
    Write,
    /// Store through a translation cached without the dirty bit.
    ReadOnly,
}

impl TryFrom<u32> for FaultKind {
    type Error = VmError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            VM_FAULT_READ => Ok(FaultKind::Read),
            VM_FAULT_WRITE => Ok(FaultKind::Write),
            VM_FAULT_READONLY => Ok(FaultKind::ReadOnly),
            _ => Err(VmError::InvalidFaultKind(code)),
        }
    }
}

/// Gives the fault handler the address space of the running thread.
pub trait CurrentAddressSpace {
    fn with_current(&self, f: &mut dyn FnMut(Option<&mut AddressSpace>));
}

/// A single per-core slot holding whatever space is active.
impl CurrentAddressSpace for Mutex<Option<AddressSpace>> {
    fn with_current(&self, f: &mut dyn FnMut(Option<&mut AddressSpace>)) {
        f(self.lock().as_mut())
    }
}

/// Entry-lo bits for a page with `perms`. The dirty bit is what makes a
/// cached translation writable.
fn tlb_flags(perms: Permissions, loading: bool) -> TlbFlags {
    if perms.contains(Permissions::WRITE) || loading {
        TlbFlags::VALID | TlbFlags::DIRTY
    } else {
        TlbFlags::VALID
    }
}

impl Vm {
    /// Trap entry: resolve a fault at `vaddr` in the current address space.
    pub fn handle_fault(
        &self,
        current: &dyn CurrentAddressSpace,
        code: u32,
        vaddr: VirtAddr,
    ) -> Result<(), VmError> {
        let mut result = Err(VmError::NoAddressSpace);
        current.with_current(&mut |space: Option<&mut AddressSpace>| {
            result = self.fault(space, code, vaddr);
        });
        result
    }

    /// Resolve a fault of kind `code` at `vaddr` in `space`.
    ///
    /// Protection violations are returned, never fixed up; the caller is
    /// expected to terminate the faulting thread.
    pub fn fault(
        &self,
        space: Option<&mut AddressSpace>,
        code: u32,
        vaddr: VirtAddr,
    ) -> Result<(), VmError> {
        let space = space.ok_or(VmError::NoAddressSpace)?;
        let kind = FaultKind::try_from(code)?;
        let page = user_page(vaddr)?;
        let loading = space.is_loading();

        match kind {
            FaultKind::ReadOnly => {
                let entry = *space.page_table_mut().walk(page, false, self)?;
                let Some(frame) = entry.frame() else {
                    error!(
                        "vm: {:?} read-only fault on unbacked page {:#x}",
                        space.id(),
                        vaddr.as_u64()
                    );
                    return Err(VmError::BadAddress(vaddr));
                };
                if !entry.permissions().contains(Permissions::WRITE) && !loading {
                    error!(
                        "vm: {:?} wrote to read-only page {:#x}",
                        space.id(),
                        vaddr.as_u64()
                    );
                    return Err(VmError::ProtectionViolation(vaddr));
                }
                self.tlb()
                    .update(TlbEntry::new(page, frame, TlbFlags::VALID | TlbFlags::DIRTY));
                trace!("vm: {:?} upgraded {:#x} to writable", space.id(), vaddr.as_u64());
            }
            FaultKind::Read | FaultKind::Write => {
                let entry = *space.page_table_mut().walk(page, true, self)?;
                let Some(frame) = entry.frame() else {
                    panic!("allocating walk left {:#x} unbacked", vaddr.as_u64());
                };
                let flags = tlb_flags(entry.permissions(), loading);
                if self.tlb().refill(TlbEntry::new(page, frame, flags)) {
                    trace!("vm: {:#x} already cached", vaddr.as_u64());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::USERSTACK;
    use crate::memory::test_support::test_vm;
    use crate::memory::tlb::{entry_hi, TlbHardware};
    use x86_64::structures::paging::{Page, PhysFrame};

    const MIB: u64 = 1024 * 1024;

    fn vaddr(addr: u64) -> VirtAddr {
        VirtAddr::new(addr)
    }

    #[test]
    fn test_fault_kind_codes() {
        assert_eq!(FaultKind::try_from(0), Ok(FaultKind::Read));
        assert_eq!(FaultKind::try_from(1), Ok(FaultKind::Write));
        assert_eq!(FaultKind::try_from(2), Ok(FaultKind::ReadOnly));
        assert_eq!(FaultKind::try_from(7), Err(VmError::InvalidFaultKind(7)));
    }

    #[test]
    fn test_read_miss_backs_page_once() {
        let (vm, tlb, irq) = test_vm(0x20000, 8 * MIB);
        let mut space = vm.create_address_space().expect("create failed");
        let before = vm.stats();

        vm.fault(Some(&mut space), VM_FAULT_READ, vaddr(0x40_0123))
            .expect("fault failed");
        // Root leaf table plus the page itself.
        assert_eq!(vm.stats().in_use, before.in_use + 2);
        let cached = tlb.lookup(entry_hi(vaddr(0x40_0000))).expect("not cached");
        let paddr = vm.translate(&space, vaddr(0x40_0000)).expect("not backed");
        assert_eq!(cached.frame().start_address(), paddr);
        assert!(cached.flags().contains(TlbFlags::DIRTY));
        assert!(irq.enabled());

        // A second fault on the same page changes nothing.
        vm.fault(Some(&mut space), VM_FAULT_WRITE, vaddr(0x40_0fff))
            .expect("fault failed");
        assert_eq!(vm.stats().in_use, before.in_use + 2);
        assert_eq!(tlb.valid_count(), 1);
        vm.destroy_address_space(space);
    }

    #[test]
    fn test_declared_page_backed_once() {
        let (vm, tlb, _) = test_vm(0x20000, 8 * MIB);
        let mut space = vm.create_address_space().expect("create failed");
        vm.define_region(&mut space, vaddr(0x50_0000), 0x1000, true, true, false)
            .expect("define failed");
        let before = vm.stats();
        assert_eq!(vm.translate(&space, vaddr(0x50_0000)), None);

        vm.fault(Some(&mut space), VM_FAULT_READ, vaddr(0x50_0040))
            .expect("fault failed");
        let paddr = vm.translate(&space, vaddr(0x50_0000)).expect("not backed");
        assert_eq!(vm.stats().in_use, before.in_use + 1);

        // The same trap delivered twice.
        vm.fault(Some(&mut space), VM_FAULT_READ, vaddr(0x50_0040))
            .expect("fault failed");
        assert_eq!(vm.stats().in_use, before.in_use + 1);
        assert_eq!(vm.translate(&space, vaddr(0x50_0000)), Some(paddr));
        assert_eq!(tlb.valid_count(), 1);
        assert_eq!(
            space.page_table().entry(Page::containing_address(vaddr(0x50_0000))).permissions(),
            Permissions::READ | Permissions::WRITE
        );
        vm.destroy_address_space(space);
    }

    #[test]
    fn test_read_only_fault_on_unbacked_page() {
        let (vm, _, _) = test_vm(0x20000, 8 * MIB);
        let mut space = vm.create_address_space().expect("create failed");
        vm.define_region(&mut space, vaddr(0x6000), 0x1000, true, true, false)
            .expect("define failed");

        assert_eq!(
            vm.fault(Some(&mut space), VM_FAULT_READONLY, vaddr(0x6000)),
            Err(VmError::BadAddress(vaddr(0x6000)))
        );
        assert_eq!(space.mapped_pages(), 0);
        vm.destroy_address_space(space);
    }

    #[test]
    fn test_read_only_page_cached_clean() {
        let (vm, tlb, _) = test_vm(0x20000, 8 * MIB);
        let mut space = vm.create_address_space().expect("create failed");
        vm.define_region(&mut space, vaddr(0x40_0000), 0x1000, true, false, true)
            .expect("define failed");

        vm.fault(Some(&mut space), VM_FAULT_READ, vaddr(0x40_0000))
            .expect("fault failed");
        let cached = tlb.lookup(entry_hi(vaddr(0x40_0000))).expect("not cached");
        assert_eq!(cached.flags(), TlbFlags::VALID);

        assert_eq!(
            vm.fault(Some(&mut space), VM_FAULT_READONLY, vaddr(0x40_0010)),
            Err(VmError::ProtectionViolation(vaddr(0x40_0010)))
        );
        assert_eq!(tlb.lookup(entry_hi(vaddr(0x40_0000))), Some(cached));
        vm.destroy_address_space(space);
    }

    #[test]
    fn test_loading_makes_read_only_pages_writable() {
        let (vm, tlb, _) = test_vm(0x20000, 8 * MIB);
        let mut space = vm.create_address_space().expect("create failed");
        vm.define_region(&mut space, vaddr(0x40_0000), 0x2000, true, false, false)
            .expect("define failed");
        vm.prepare_load(&mut space);

        vm.fault(Some(&mut space), VM_FAULT_WRITE, vaddr(0x40_0000))
            .expect("fault failed");
        let cached = tlb.lookup(entry_hi(vaddr(0x40_0000))).expect("not cached");
        assert!(cached.flags().contains(TlbFlags::DIRTY));

        vm.complete_load(&mut space);
        assert_eq!(tlb.valid_count(), 0);
        vm.fault(Some(&mut space), VM_FAULT_READ, vaddr(0x40_0000))
            .expect("fault failed");
        let cached = tlb.lookup(entry_hi(vaddr(0x40_0000))).expect("not cached");
        assert!(!cached.flags().contains(TlbFlags::DIRTY));
        vm.destroy_address_space(space);
    }

    #[test]
    fn test_read_only_fault_refreshes_stale_entry() {
        let (vm, tlb, _) = test_vm(0x20000, 8 * MIB);
        let mut space = vm.create_address_space().expect("create failed");
        vm.define_region(&mut space, vaddr(0x1000), 0x1000, true, false, false)
            .expect("define failed");
        vm.fault(Some(&mut space), VM_FAULT_READ, vaddr(0x1000))
            .expect("fault failed");
        let slot = tlb.probe(entry_hi(vaddr(0x1000))).expect("not cached");

        // The page became writable after its clean translation was cached.
        vm.define_region(&mut space, vaddr(0x1000), 0x1000, true, true, false)
            .expect("define failed");
        assert!(tlb.lookup(entry_hi(vaddr(0x1000))).is_none());
        let frame = PhysFrame::containing_address(
            vm.translate(&space, vaddr(0x1000)).expect("not backed"),
        );
        let clean = TlbEntry::new(Page::containing_address(vaddr(0x1000)), frame, TlbFlags::VALID);
        tlb.write(slot, clean);

        vm.fault(Some(&mut space), VM_FAULT_READONLY, vaddr(0x1000))
            .expect("fault failed");
        let cached = tlb.read(slot);
        assert_eq!(cached.flags(), TlbFlags::VALID | TlbFlags::DIRTY);
        assert_eq!(tlb.valid_count(), 1);
        vm.destroy_address_space(space);
    }

    #[test]
    fn test_read_only_fault_after_eviction_reinserts() {
        let (vm, tlb, _) = test_vm(0x20000, 8 * MIB);
        let mut space = vm.create_address_space().expect("create failed");
        vm.fault(Some(&mut space), VM_FAULT_READ, vaddr(0x3000))
            .expect("fault failed");
        vm.invalidate_all_translations();

        vm.fault(Some(&mut space), VM_FAULT_READONLY, vaddr(0x3000))
            .expect("fault failed");
        assert!(tlb.lookup(entry_hi(vaddr(0x3000))).is_some());
        vm.destroy_address_space(space);
    }

    #[test]
    fn test_rejected_faults_allocate_nothing() {
        let (vm, _, _) = test_vm(0x20000, 8 * MIB);
        let mut space = vm.create_address_space().expect("create failed");
        let before = vm.stats();

        assert_eq!(
            vm.fault(None, VM_FAULT_READ, vaddr(0x1000)),
            Err(VmError::NoAddressSpace)
        );
        assert_eq!(
            vm.fault(Some(&mut space), 9, vaddr(0x1000)),
            Err(VmError::InvalidFaultKind(9))
        );
        assert_eq!(
            vm.fault(Some(&mut space), VM_FAULT_WRITE, vaddr(USERSTACK)),
            Err(VmError::BadAddress(vaddr(USERSTACK)))
        );
        assert_eq!(vm.stats(), before);
        vm.destroy_address_space(space);
    }

    #[test]
    fn test_out_of_memory_leaves_state_consistent() {
        let (vm, tlb, _) = test_vm(0x20000, MIB);
        let mut space = vm.create_address_space().expect("create failed");
        let mut addr = 0;
        while vm.stats().free > 0 {
            vm.fault(Some(&mut space), VM_FAULT_WRITE, vaddr(addr))
                .expect("fault failed");
            addr += 0x1000;
        }
        let before = vm.stats();
        let valid = tlb.valid_count();

        assert_eq!(
            vm.fault(Some(&mut space), VM_FAULT_WRITE, vaddr(addr)),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(vm.stats(), before);
        assert_eq!(tlb.valid_count(), valid);
        assert!(vm.eviction_hint().is_some());
        assert_eq!(vm.translate(&space, vaddr(addr)), None);
        vm.destroy_address_space(space);
    }

    #[test]
    fn test_handle_fault_uses_current_space() {
        let (vm, tlb, _) = test_vm(0x20000, 8 * MIB);
        let current: Mutex<Option<AddressSpace>> = Mutex::new(None);

        assert_eq!(
            vm.handle_fault(&current, VM_FAULT_READ, vaddr(0x1000)),
            Err(VmError::NoAddressSpace)
        );

        let space = vm.create_address_space().expect("create failed");
        vm.activate(&space);
        *current.lock() = Some(space);
        vm.handle_fault(&current, VM_FAULT_WRITE, vaddr(0x1000))
            .expect("fault failed");
        assert!(tlb.lookup(entry_hi(vaddr(0x1000))).is_some());

        let space = current.lock().take().expect("space vanished");
        vm.destroy_address_space(space);
    }
}
