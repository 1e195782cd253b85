use x86_64::VirtAddr;

use crate::constants::errno::{EFAULT, EINVAL, ENOMEM};

/// Errors surfaced by the virtual-memory core.
///
/// None of these are retried internally; every one reaches the immediate
/// caller synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A fault arrived while no address space was current.
    NoAddressSpace,
    /// No physical frame was available.
    OutOfMemory,
    /// The trap path handed over an unknown fault code.
    InvalidFaultKind(u32),
    /// A write hit a page whose table entry is read-only.
    ProtectionViolation(VirtAddr),
    /// The faulting address is outside user space.
    BadAddress(VirtAddr),
    /// Virtual memory was already bootstrapped.
    AlreadyBootstrapped,
}

impl VmError {
    /// Errno value reported back through the trap or syscall path.
    pub fn errno(&self) -> i32 {
        match self {
            VmError::NoAddressSpace | VmError::ProtectionViolation(_) | VmError::BadAddress(_) => {
                EFAULT
            }
            VmError::OutOfMemory => ENOMEM,
            VmError::InvalidFaultKind(_) | VmError::AlreadyBootstrapped => EINVAL,
        }
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::NoAddressSpace => write!(f, "No current address space"),
            VmError::OutOfMemory => write!(f, "Out of physical memory"),
            VmError::InvalidFaultKind(code) => write!(f, "Invalid fault kind {}", code),
            VmError::ProtectionViolation(addr) => {
                write!(f, "Write to read-only page at {:#x}", addr.as_u64())
            }
            VmError::BadAddress(addr) => write!(f, "Bad fault address {:#x}", addr.as_u64()),
            VmError::AlreadyBootstrapped => write!(f, "Virtual memory already bootstrapped"),
        }
    }
}
