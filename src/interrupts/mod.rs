//! Local interrupt masking.
//!
//! The TLB is a per-core resource touched without a lock, so every
//! probe/write sequence runs with interrupts disabled on the local core.

pub mod spl;

pub use spl::{splhigh, InterruptControl, SimulatedInterrupts, SplGuard};
