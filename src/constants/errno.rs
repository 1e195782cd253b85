//! Kernel errno values returned across the trap boundary.

pub const ENOMEM: i32 = 3;
pub const EFAULT: i32 = 6;
pub const EINVAL: i32 = 8;
