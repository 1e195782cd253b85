//! Hosted models of the hardware the virtual-memory core drives.
//!
//! A machine port supplies its own implementations of the same traits.

pub mod clock;
pub mod soft_tlb;

pub use clock::{Clock, TickClock, Timestamp};
pub use soft_tlb::SoftTlb;
