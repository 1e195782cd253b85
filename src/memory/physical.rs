//! Physical RAM
//!
//! The backing store for every frame, indexed by frame number. Frame `n`
//! starts at physical address `n * FRAME_SIZE`.

use alloc::{boxed::Box, vec};
use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::{FRAME_SIZE, KERNEL_DIRECT_MAP_BASE, PAGE_SIZE};

/// Frame number of `frame`.
pub fn frame_number(frame: PhysFrame<Size4KiB>) -> usize {
    (frame.start_address().as_u64() / PAGE_SIZE) as usize
}

/// Frame with number `number`.
pub fn frame_at(number: usize) -> PhysFrame<Size4KiB> {
    PhysFrame::containing_address(PhysAddr::new(number as u64 * PAGE_SIZE))
}

/// Kernel direct-mapped address of a physical address.
pub fn paddr_to_kvaddr(paddr: PhysAddr) -> VirtAddr {
    VirtAddr::new(paddr.as_u64() + KERNEL_DIRECT_MAP_BASE)
}

/// Physical address behind a kernel direct-mapped address.
pub fn kvaddr_to_paddr(vaddr: VirtAddr) -> PhysAddr {
    debug_assert!(vaddr.as_u64() >= KERNEL_DIRECT_MAP_BASE);
    PhysAddr::new(vaddr.as_u64() - KERNEL_DIRECT_MAP_BASE)
}

pub struct PhysicalMemory {
    bytes: Box<[u8]>,
}

impl PhysicalMemory {
    /// RAM covering physical addresses `[0, size)`, rounded down to whole frames.
    pub fn new(size: u64) -> Self {
        let frames = size as usize / FRAME_SIZE;
        Self {
            bytes: vec![0u8; frames * FRAME_SIZE].into_boxed_slice(),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.bytes.len() / FRAME_SIZE
    }

    pub fn frame(&self, frame: PhysFrame<Size4KiB>) -> &[u8] {
        let start = frame_number(frame) * FRAME_SIZE;
        &self.bytes[start..start + FRAME_SIZE]
    }

    pub fn frame_mut(&mut self, frame: PhysFrame<Size4KiB>) -> &mut [u8] {
        let start = frame_number(frame) * FRAME_SIZE;
        &mut self.bytes[start..start + FRAME_SIZE]
    }

    /// Zero `count` frames starting at `first`.
    pub fn zero(&mut self, first: PhysFrame<Size4KiB>, count: usize) {
        let start = frame_number(first) * FRAME_SIZE;
        self.bytes[start..start + count * FRAME_SIZE].fill(0);
    }

    /// Copy the full contents of `from` into `to`.
    pub fn copy_frame(&mut self, from: PhysFrame<Size4KiB>, to: PhysFrame<Size4KiB>) {
        let src = frame_number(from) * FRAME_SIZE;
        let dst = frame_number(to) * FRAME_SIZE;
        self.bytes.copy_within(src..src + FRAME_SIZE, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_number_round_trip() {
        let frame = frame_at(17);
        assert_eq!(frame.start_address().as_u64(), 17 * PAGE_SIZE);
        assert_eq!(frame_number(frame), 17);
    }

    #[test]
    fn test_copy_and_zero() {
        let mut ram = PhysicalMemory::new(8 * PAGE_SIZE + 100);
        assert_eq!(ram.frame_count(), 8);

        ram.frame_mut(frame_at(2)).fill(0xAA);
        ram.copy_frame(frame_at(2), frame_at(5));
        assert!(ram.frame(frame_at(5)).iter().all(|&b| b == 0xAA));

        ram.zero(frame_at(2), 1);
        assert!(ram.frame(frame_at(2)).iter().all(|&b| b == 0));
        assert!(ram.frame(frame_at(5)).iter().all(|&b| b == 0xAA));
    }
}
