use alloc::sync::Arc;
use x86_64::PhysAddr;

use super::boot_frame_allocator::BootFrameAllocator;
use super::{bootstrap_virtual_memory, Machine, Vm};
use crate::devices::{SoftTlb, TickClock};
use crate::interrupts::SimulatedInterrupts;

/// A hosted machine plus handles on its TLB and interrupt flag.
pub(crate) fn machine() -> (Machine, Arc<SoftTlb>, Arc<SimulatedInterrupts>) {
    let tlb = Arc::new(SoftTlb::new());
    let interrupts = Arc::new(SimulatedInterrupts::new());
    let machine = Machine {
        tlb: tlb.clone(),
        interrupts: interrupts.clone(),
        clock: Arc::new(TickClock::default()),
    };
    (machine, tlb, interrupts)
}

/// A bootstrapped `Vm` over RAM `[first, last)`.
pub(crate) fn test_vm(first: u64, last: u64) -> (Vm, Arc<SoftTlb>, Arc<SimulatedInterrupts>) {
    let (machine, tlb, interrupts) = machine();
    let boot = BootFrameAllocator::new(PhysAddr::new(first), PhysAddr::new(last));
    (bootstrap_virtual_memory(boot, machine), tlb, interrupts)
}
