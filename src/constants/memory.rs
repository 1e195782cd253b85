pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Offset mask inside a page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

// Two-level table: 10 bits root, 10 bits leaf, 12 bits offset
pub const ROOT_SHIFT: u32 = 22;
pub const LEAF_SHIFT: u32 = 12;
pub const ENTRIES_PER_TABLE: usize = 1024;
pub const TABLE_INDEX_MASK: u64 = 0x3ff;

/// Frame number bits of a packed leaf entry.
pub const PAGE_NUMBER: u32 = 0xffff_f000;
/// The entry has a frame assigned.
pub const PAGE_EXIST: u32 = 0x0000_0800;
pub const PAGE_READ: u32 = 0x4;
pub const PAGE_WRITE: u32 = 0x2;
pub const PAGE_EXEC: u32 = 0x1;

/// Start of the kernel direct-mapped segment. Everything below is user space.
pub const KERNEL_DIRECT_MAP_BASE: u64 = 0x8000_0000;
/// Top of user space, also the initial user stack pointer.
pub const USERSTACK: u64 = KERNEL_DIRECT_MAP_BASE;

/// Fault codes handed over by the trap path.
pub const VM_FAULT_READ: u32 = 0;
pub const VM_FAULT_WRITE: u32 = 1;
/// Write through a translation cached without the dirty bit.
pub const VM_FAULT_READONLY: u32 = 2;
