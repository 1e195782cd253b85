//! Coremap
//!
//! One descriptor per physical frame, the ground truth for which frames are
//! fixed, free or owned. The table logically sits at the start of usable
//! RAM; the frames covering it (and everything below) are fixed forever.
//!
//! Only bookkeeping lives here. Zeroing frames, page tables and the TLB are
//! handled by the caller after the coremap lock is released.

use alloc::{boxed::Box, vec};
use core::mem::size_of;

use log::{debug, warn};
use x86_64::{
    structures::paging::{Page, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::PAGE_SIZE;
use crate::devices::Timestamp;
use crate::memory::physical::{frame_at, frame_number, paddr_to_kvaddr};
use crate::processes::address_space::AsId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Reserved for the kernel, never reclaimed.
    Fixed,
    Free,
    /// In use and unmodified since it was last written out. Nothing produces
    /// this state until eviction exists.
    Clean,
    /// In use.
    Dirty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub owner: Option<AsId>,
    pub vaddr: Option<VirtAddr>,
    pub state: FrameState,
    /// Position inside a contiguous run, counting down to 1 at its last frame.
    pub run_length: usize,
    /// Refreshed on allocation; the recency signal for a future eviction policy.
    pub last_touched: Timestamp,
}

impl FrameDescriptor {
    const FREE: FrameDescriptor = FrameDescriptor {
        owner: None,
        vaddr: None,
        state: FrameState::Free,
        run_length: 0,
        last_touched: Timestamp::ZERO,
    };

    pub fn in_use(&self) -> bool {
        matches!(self.state, FrameState::Clean | FrameState::Dirty)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoremapStats {
    pub total: usize,
    pub fixed: usize,
    pub free: usize,
    pub in_use: usize,
}

pub struct Coremap {
    frames: Box<[FrameDescriptor]>,
    freeppn: usize,
    eviction_hint: Option<usize>,
}

impl Coremap {
    /// First frame not covered by the coremap itself, for RAM reported as
    /// `[first, last)`.
    pub fn fixed_boundary(first: PhysAddr, last: PhysAddr) -> usize {
        let pagenum = (last.as_u64() / PAGE_SIZE) as usize;
        let freepaddr = first.as_u64() + (pagenum * size_of::<FrameDescriptor>()) as u64;
        freepaddr.div_ceil(PAGE_SIZE) as usize
    }

    /// Lay the coremap over `[first, last)`: frames below the fixed boundary
    /// are fixed, the rest free.
    pub fn bootstrap(first: PhysAddr, last: PhysAddr, now: Timestamp) -> Self {
        let pagenum = (last.as_u64() / PAGE_SIZE) as usize;
        let freeppn = Self::fixed_boundary(first, last).min(pagenum);

        let mut frames = vec![FrameDescriptor::FREE; pagenum].into_boxed_slice();
        for desc in frames[..freeppn].iter_mut() {
            desc.state = FrameState::Fixed;
            desc.run_length = 1;
            desc.last_touched = now;
        }

        debug!(
            "coremap: {} frames, {} fixed, descriptor size {}",
            pagenum,
            freeppn,
            size_of::<FrameDescriptor>()
        );

        Coremap {
            frames,
            freeppn,
            eviction_hint: None,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of the first frame the allocator may hand out.
    pub fn first_free_frame(&self) -> usize {
        self.freeppn
    }

    pub fn descriptor(&self, frame: PhysFrame<Size4KiB>) -> &FrameDescriptor {
        &self.frames[frame_number(frame)]
    }

    pub fn state(&self, frame: PhysFrame<Size4KiB>) -> FrameState {
        self.descriptor(frame).state
    }

    /// Oldest in-use frame seen by the last failed single-frame scan.
    pub fn eviction_hint(&self) -> Option<PhysFrame<Size4KiB>> {
        self.eviction_hint.map(frame_at)
    }

    /// Reserve `n` physically contiguous frames, first fit.
    ///
    /// The frames are marked dirty with run counters `n, n-1, ..., 1` so
    /// `free_run` can find the end of the run. The caller zeroes them.
    pub fn allocate_run(&mut self, n: usize, now: Timestamp) -> Option<PhysFrame<Size4KiB>> {
        if n == 0 {
            return None;
        }

        let mut start = self.freeppn;
        let mut count = 0;
        for i in self.freeppn..self.frames.len() {
            if self.frames[i].state != FrameState::Free {
                count = 0;
                start = i + 1;
                continue;
            }
            count += 1;
            if count == n {
                for (offset, desc) in self.frames[start..=i].iter_mut().enumerate() {
                    let paddr = PhysAddr::new((start + offset) as u64 * PAGE_SIZE);
                    *desc = FrameDescriptor {
                        owner: None,
                        vaddr: Some(paddr_to_kvaddr(paddr)),
                        state: FrameState::Dirty,
                        run_length: n - offset,
                        last_touched: now,
                    };
                }
                return Some(frame_at(start));
            }
        }

        warn!("coremap: no run of {} contiguous frames", n);
        None
    }

    /// Reserve one frame backing `page` of `owner`.
    ///
    /// The scan also remembers the least recently touched in-use frame;
    /// it is only reported, nothing is evicted.
    pub fn allocate_one(
        &mut self,
        owner: AsId,
        page: Page<Size4KiB>,
        now: Timestamp,
    ) -> Option<PhysFrame<Size4KiB>> {
        let mut oldest: Option<usize> = None;
        for i in self.freeppn..self.frames.len() {
            if self.frames[i].state == FrameState::Free {
                self.frames[i] = FrameDescriptor {
                    owner: Some(owner),
                    vaddr: Some(page.start_address()),
                    state: FrameState::Dirty,
                    run_length: 1,
                    last_touched: now,
                };
                return Some(frame_at(i));
            }
            let desc = &self.frames[i];
            if desc.in_use()
                && oldest.map_or(true, |o| desc.last_touched < self.frames[o].last_touched)
            {
                oldest = Some(i);
            }
        }

        self.eviction_hint = oldest;
        warn!(
            "coremap: out of frames for {:?} at {:#x} (oldest frame {:?})",
            owner,
            page.start_address().as_u64(),
            oldest
        );
        None
    }

    /// Release the run starting at `base`. Returns how many frames were freed.
    ///
    /// Fixed, already free and user-owned frames are ignored. `base` must be
    /// the first frame of its run: a frame whose predecessor continues the
    /// same run is refused, since releasing part of a run is not supported.
    pub fn free_run(&mut self, base: PhysFrame<Size4KiB>) -> usize {
        let ppn = frame_number(base);
        if ppn < self.freeppn || ppn >= self.frames.len() {
            return 0;
        }
        let desc = self.frames[ppn];
        if desc.state == FrameState::Free {
            return 0;
        }
        if let Some(owner) = desc.owner {
            warn!(
                "coremap: {:#x} belongs to {:?}, not freed",
                base.start_address().as_u64(),
                owner
            );
            return 0;
        }

        let n = desc.run_length;
        let pred = self.frames[ppn - 1];
        if pred.in_use() && pred.run_length == n + 1 {
            warn!("coremap: {:#x} is inside a run, not freed", base.start_address().as_u64());
            return 0;
        }

        let end = (ppn + n).min(self.frames.len());
        for desc in self.frames[ppn..end].iter_mut() {
            *desc = FrameDescriptor::FREE;
        }
        end - ppn
    }

    /// Mark a single in-use frame free and forget its owner.
    pub fn release(&mut self, frame: PhysFrame<Size4KiB>) {
        let ppn = frame_number(frame);
        assert!(ppn != 0, "releasing frame zero");
        assert!(ppn >= self.freeppn, "releasing fixed frame {}", ppn);
        assert!(
            self.frames[ppn].state != FrameState::Free,
            "double free of frame {}",
            ppn
        );
        self.frames[ppn] = FrameDescriptor::FREE;
    }

    pub fn stats(&self) -> CoremapStats {
        let mut stats = CoremapStats {
            total: self.frames.len(),
            ..CoremapStats::default()
        };
        for desc in self.frames.iter() {
            match desc.state {
                FrameState::Fixed => stats.fixed += 1,
                FrameState::Free => stats.free += 1,
                FrameState::Clean | FrameState::Dirty => stats.in_use += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn now(secs: u64) -> Timestamp {
        Timestamp { secs, nanos: 0 }
    }

    fn coremap() -> Coremap {
        Coremap::bootstrap(PhysAddr::new(0x2_0000), PhysAddr::new(8 * MIB), now(1))
    }

    fn page(addr: u64) -> Page {
        Page::containing_address(VirtAddr::new(addr))
    }

    #[test]
    fn test_bootstrap_fixed_boundary() {
        let map = coremap();
        let freeppn = map.first_free_frame();
        let expected = (0x2_0000 + 2048 * size_of::<FrameDescriptor>() as u64).div_ceil(PAGE_SIZE);

        assert_eq!(map.frame_count(), 2048);
        assert_eq!(freeppn as u64, expected);
        for i in 0..map.frame_count() {
            let state = map.state(frame_at(i));
            if i < freeppn {
                assert_eq!(state, FrameState::Fixed);
            } else {
                assert_eq!(state, FrameState::Free);
            }
        }
        assert_eq!(
            map.stats(),
            CoremapStats {
                total: 2048,
                fixed: freeppn,
                free: 2048 - freeppn,
                in_use: 0
            }
        );
    }

    #[test]
    fn test_allocate_run_counters_and_free() {
        let mut map = coremap();
        let base = map.allocate_run(3, now(2)).expect("run failed");
        let ppn = frame_number(base);
        assert_eq!(ppn, map.first_free_frame());

        for (offset, expected) in [3, 2, 1].into_iter().enumerate() {
            let desc = map.descriptor(frame_at(ppn + offset));
            assert_eq!(desc.state, FrameState::Dirty);
            assert_eq!(desc.run_length, expected);
            assert_eq!(desc.last_touched, now(2));
            assert_eq!(desc.owner, None);
        }
        let neighbour = map.allocate_run(1, now(3)).expect("run failed");
        assert_eq!(frame_number(neighbour), ppn + 3);

        assert_eq!(map.free_run(base), 3);
        for offset in 0..3 {
            assert_eq!(map.state(frame_at(ppn + offset)), FrameState::Free);
        }
        assert_eq!(map.state(neighbour), FrameState::Dirty);

        // The same range is reused.
        assert_eq!(map.allocate_run(3, now(4)), Some(base));
    }

    #[test]
    fn test_free_run_refuses_partial_release() {
        let mut map = coremap();
        let base = map.allocate_run(4, now(2)).expect("run failed");
        let middle = frame_at(frame_number(base) + 1);

        assert_eq!(map.free_run(middle), 0);
        assert_eq!(map.stats().in_use, 4);
        assert_eq!(map.free_run(frame_at(1)), 0);
        assert_eq!(map.free_run(base), 4);
        assert_eq!(map.free_run(base), 0);
    }

    #[test]
    fn test_free_run_ignores_user_frames() {
        let mut map = coremap();
        let frame = map
            .allocate_one(AsId::new(3), page(0x1000), now(2))
            .expect("allocate failed");

        assert_eq!(map.free_run(frame), 0);
        assert_eq!(map.descriptor(frame).owner, Some(AsId::new(3)));
        assert_eq!(map.state(frame), FrameState::Dirty);
    }

    #[test]
    fn test_run_skips_holes() {
        let mut map = coremap();
        let first = map.first_free_frame();
        let a = map.allocate_run(2, now(1)).expect("run failed");
        let b = map.allocate_run(1, now(1)).expect("run failed");
        map.free_run(a);

        // Two free frames then a used one: a run of three starts after it.
        let c = map.allocate_run(3, now(1)).expect("run failed");
        assert_eq!(frame_number(c), first + 3);
        assert_eq!(frame_number(b), first + 2);
        assert_eq!(map.allocate_run(0, now(1)), None);
    }

    #[test]
    fn test_allocate_one_stamps_owner() {
        let mut map = coremap();
        let owner = AsId::new(9);
        let frame = map
            .allocate_one(owner, page(0x40_0000), now(5))
            .expect("allocate failed");
        let desc = map.descriptor(frame);
        assert_eq!(desc.owner, Some(owner));
        assert_eq!(desc.vaddr, Some(VirtAddr::new(0x40_0000)));
        assert_eq!(desc.state, FrameState::Dirty);
        assert_eq!(desc.run_length, 1);

        map.release(frame);
        assert_eq!(*map.descriptor(frame), FrameDescriptor::FREE);
    }

    #[test]
    fn test_exhaustion_reports_oldest() {
        let mut map = Coremap::bootstrap(PhysAddr::new(0x1000), PhysAddr::new(0x10000), now(0));
        let free = map.stats().free;
        let owner = AsId::new(1);
        for i in 0..free {
            map.allocate_one(owner, page(0x1000 * (i as u64 + 1)), now(10 + i as u64))
                .expect("allocate failed");
        }
        assert_eq!(map.allocate_one(owner, page(0x7000_0000), now(99)), None);
        assert_eq!(
            map.eviction_hint().map(frame_number),
            Some(map.first_free_frame())
        );
        assert_eq!(map.allocate_run(1, now(99)), None);
    }

    #[test]
    #[should_panic]
    fn test_release_fixed_frame_panics() {
        let mut map = coremap();
        map.release(frame_at(1));
    }
}
