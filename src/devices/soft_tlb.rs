//! Software model of the translation cache.
//!
//! Behaves like a fully associative MIPS-style TLB: a probe matches on the
//! virtual page bits of entry-hi whether or not the slot is valid, so the
//! invalid encoding must keep every slot's entry-hi unique.

use spin::Mutex;

use crate::constants::tlb::NUM_TLB;
use crate::memory::tlb::{TlbEntry, TlbFlags, TlbHardware};

pub struct SoftTlb {
    slots: Mutex<[TlbEntry; NUM_TLB]>,
}

impl SoftTlb {
    pub fn new() -> Self {
        let mut slots = [TlbEntry::invalid(0); NUM_TLB];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = TlbEntry::invalid(i);
        }
        SoftTlb {
            slots: Mutex::new(slots),
        }
    }

    /// The valid entry translating `entry_hi`, if cached.
    pub fn lookup(&self, entry_hi: u32) -> Option<TlbEntry> {
        self.slots
            .lock()
            .iter()
            .find(|e| e.vpage() == entry_hi && e.flags().contains(TlbFlags::VALID))
            .copied()
    }

    pub fn valid_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|e| e.flags().contains(TlbFlags::VALID))
            .count()
    }
}

impl Default for SoftTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl TlbHardware for SoftTlb {
    fn slots(&self) -> usize {
        NUM_TLB
    }

    fn probe(&self, entry_hi: u32) -> Option<usize> {
        self.slots.lock().iter().position(|e| e.vpage() == entry_hi)
    }

    fn read(&self, slot: usize) -> TlbEntry {
        self.slots.lock()[slot]
    }

    fn write(&self, slot: usize, entry: TlbEntry) {
        self.slots.lock()[slot] = entry;
    }
}
