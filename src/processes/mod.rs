//! User address spaces and their lifecycle.

pub mod address_space;

pub use address_space::{AddressSpace, AsId};
