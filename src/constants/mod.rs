//! System-wide constants and hardware-specific values.

pub mod errno;
pub mod memory;
pub mod tlb;
