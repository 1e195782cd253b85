//! Software-managed TLB layout.

/// Number of slots in the translation cache.
pub const NUM_TLB: usize = 64;

/// Virtual page number bits of an entry-hi word.
pub const TLBHI_VPAGE: u32 = 0xffff_f000;
/// Physical frame bits of an entry-lo word.
pub const TLBLO_PPAGE: u32 = 0xffff_f000;

/// Base page number used to build unique invalid entry-hi values.
pub const TLBHI_INVALID_BASE: u32 = 0x80000;
