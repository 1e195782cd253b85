//! Boot Frame Allocator
//!
//! - Provides a method to allocate memory before the coremap is set up
//! - Bumps linearly through RAM; stolen frames are never given back

use log::debug;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::constants::memory::{PAGE_OFFSET_MASK, PAGE_SIZE};
use crate::memory::physical::PhysicalMemory;

/// Boot frame allocator, the only legal allocator before `bootstrap_virtual_memory`
///
/// * `ram`: the physical memory being handed out
/// * `first_free`: the next unstolen physical address
/// * `last`: the end of physical memory
/// * `stolen`: the number of frames stolen so far
pub struct BootFrameAllocator {
    ram: PhysicalMemory,
    first_free: PhysAddr,
    last: PhysAddr,
    stolen: usize,
}

impl BootFrameAllocator {
    /// Creates the allocator over the RAM extent reported by the boot code
    ///
    /// `first` is rounded up and `last` rounded down to frame boundaries.
    pub fn new(first: PhysAddr, last: PhysAddr) -> Self {
        let first = PhysAddr::new((first.as_u64() + PAGE_OFFSET_MASK) & !PAGE_OFFSET_MASK);
        let last = PhysAddr::new(last.as_u64() & !PAGE_OFFSET_MASK);
        assert!(first <= last, "Invalid memory range for boot allocator");

        BootFrameAllocator {
            ram: PhysicalMemory::new(last.as_u64()),
            first_free: first,
            last,
            stolen: 0,
        }
    }

    /// The RAM still unclaimed: `(first usable address, end of RAM)`
    ///
    /// Stealing memory moves the first address up, so the coremap lands
    /// right after whatever was stolen.
    pub fn report_ram_extent(&self) -> (PhysAddr, PhysAddr) {
        (self.first_free, self.last)
    }

    /// Steal `npages` contiguous frames
    ///
    /// # Returns
    /// The first frame, or None if RAM is exhausted
    pub fn steal(&mut self, npages: usize) -> Option<PhysFrame> {
        let size = npages as u64 * PAGE_SIZE;
        if npages == 0 || self.first_free.as_u64() + size > self.last.as_u64() {
            return None;
        }

        let frame = PhysFrame::containing_address(self.first_free);
        self.first_free += size;
        self.stolen += npages;
        debug!("boot: stole {} frames at {:#x}", npages, frame.start_address().as_u64());
        Some(frame)
    }

    /// Number of frames stolen so far
    pub fn stolen_frames(&self) -> usize {
        self.stolen
    }

    /// Contents of a stolen frame, for boot code that fills it in place
    pub fn frame_mut(&mut self, frame: PhysFrame) -> &mut [u8] {
        self.ram.frame_mut(frame)
    }

    pub(crate) fn into_ram(self) -> (PhysicalMemory, PhysAddr, PhysAddr) {
        (self.ram, self.first_free, self.last)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootFrameAllocator {
    /// Allocate the single next available frame
    ///
    /// # Returns
    /// Either a PhysFrame or None (if out of frames)
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.steal(1)
    }
}

impl FrameDeallocator<Size4KiB> for BootFrameAllocator {
    /// FrameDeallocator must be created for generalization,
    /// even though BootFrameAllocator does not support
    /// deallocation
    unsafe fn deallocate_frame(&mut self, _frame: PhysFrame<Size4KiB>) {
        panic!("Cannot deallocate frames for boot frame allocator")
    }
}
