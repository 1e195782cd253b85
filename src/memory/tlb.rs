//! TLB bridge
//!
//! Keeps the per-core translation cache coherent with the page tables.
//! Entries carry no address-space tag, so switching spaces flushes
//! everything and every removed or replaced mapping is shot down.

use alloc::sync::Arc;

use bitflags::bitflags;
use log::trace;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use spin::Mutex;
use x86_64::{
    structures::paging::{Page, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::constants::tlb::{TLBHI_INVALID_BASE, TLBHI_VPAGE, TLBLO_PPAGE};
use crate::interrupts::{splhigh, InterruptControl};

bitflags! {
    /// Control bits of an entry-lo word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlbFlags: u32 {
        const NOCACHE = 0x800;
        /// Writes allowed; a write through a clean entry raises a read-only fault.
        const DIRTY = 0x400;
        const VALID = 0x200;
        const GLOBAL = 0x100;
    }
}

/// One translation cache slot: entry-hi holds the virtual page, entry-lo the
/// physical frame and control bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub hi: u32,
    pub lo: u32,
}

impl TlbEntry {
    /// Invalid entry for `slot`. Entry-hi points into the unmapped kernel
    /// segment and differs per slot, so it never matches a probe.
    pub const fn invalid(slot: usize) -> Self {
        TlbEntry {
            hi: (TLBHI_INVALID_BASE + slot as u32) << 12,
            lo: 0,
        }
    }

    pub fn new(page: Page<Size4KiB>, frame: PhysFrame<Size4KiB>, flags: TlbFlags) -> Self {
        TlbEntry {
            hi: entry_hi(page.start_address()),
            lo: (frame.start_address().as_u64() as u32 & TLBLO_PPAGE) | flags.bits(),
        }
    }

    pub fn vpage(&self) -> u32 {
        self.hi & TLBHI_VPAGE
    }

    pub fn frame(&self) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(PhysAddr::new((self.lo & TLBLO_PPAGE) as u64))
    }

    pub fn flags(&self) -> TlbFlags {
        TlbFlags::from_bits_truncate(self.lo)
    }
}

/// Entry-hi value for the page containing `vaddr`.
pub fn entry_hi(vaddr: VirtAddr) -> u32 {
    vaddr.as_u64() as u32 & TLBHI_VPAGE
}

/// Hardware primitives of the translation cache.
///
/// Callers serialise access by masking interrupts; implementations need no
/// lock of their own on real hardware.
pub trait TlbHardware: Send + Sync {
    /// Number of slots.
    fn slots(&self) -> usize;

    /// Slot whose entry-hi matches, valid or not.
    fn probe(&self, entry_hi: u32) -> Option<usize>;

    fn read(&self, slot: usize) -> TlbEntry;

    fn write(&self, slot: usize, entry: TlbEntry);
}

/// Shootdown request for one virtual address, as delivered by the
/// cross-core notification path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbShootdown {
    pub vaddr: VirtAddr,
}

pub struct TlbBridge {
    hardware: Arc<dyn TlbHardware>,
    interrupts: Arc<dyn InterruptControl>,
    rng: Mutex<SmallRng>,
}

impl TlbBridge {
    pub fn new(
        hardware: Arc<dyn TlbHardware>,
        interrupts: Arc<dyn InterruptControl>,
        seed: u64,
    ) -> Self {
        TlbBridge {
            hardware,
            interrupts,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    pub fn probe(&self, vaddr: VirtAddr) -> Option<usize> {
        let _spl = splhigh(&*self.interrupts);
        self.hardware.probe(entry_hi(vaddr))
    }

    pub fn write(&self, slot: usize, entry: TlbEntry) {
        let _spl = splhigh(&*self.interrupts);
        self.hardware.write(slot, entry);
    }

    /// Write `entry` into a randomly chosen slot, returning the slot.
    pub fn write_random(&self, entry: TlbEntry) -> usize {
        let _spl = splhigh(&*self.interrupts);
        self.write_random_masked(entry)
    }

    pub fn invalidate(&self, slot: usize) {
        let _spl = splhigh(&*self.interrupts);
        self.hardware.write(slot, TlbEntry::invalid(slot));
    }

    /// Invalidate every slot.
    pub fn shootdown_all(&self) {
        let _spl = splhigh(&*self.interrupts);
        for slot in 0..self.hardware.slots() {
            self.hardware.write(slot, TlbEntry::invalid(slot));
        }
    }

    /// Invalidate the slot caching `vaddr`, if any. Returns whether one was found.
    pub fn shootdown_one(&self, vaddr: VirtAddr) -> bool {
        let _spl = splhigh(&*self.interrupts);
        match self.hardware.probe(entry_hi(vaddr)) {
            Some(slot) => {
                self.hardware.write(slot, TlbEntry::invalid(slot));
                trace!("tlb: shot down {:#x} in slot {}", vaddr.as_u64(), slot);
                true
            }
            None => false,
        }
    }

    /// Install `entry` unless its page is already cached. Returns true when
    /// an entry was already present and nothing was written.
    pub fn refill(&self, entry: TlbEntry) -> bool {
        let _spl = splhigh(&*self.interrupts);
        if self.hardware.probe(entry.hi).is_some() {
            return true;
        }
        self.write_random_masked(entry);
        false
    }

    /// Replace the cached entry for the page, or insert it when it has
    /// already been evicted.
    pub fn update(&self, entry: TlbEntry) {
        let _spl = splhigh(&*self.interrupts);
        match self.hardware.probe(entry.hi) {
            Some(slot) => self.hardware.write(slot, entry),
            None => {
                self.write_random_masked(entry);
            }
        }
    }

    fn write_random_masked(&self, entry: TlbEntry) -> usize {
        let slot = self.rng.lock().gen_range(0..self.hardware.slots());
        self.hardware.write(slot, entry);
        slot
    }
}
