//! Two-level page tables
//!
//! A root directory of 1024 slots indexed by virtual address bits 31..22,
//! each owning a leaf table of 1024 entries indexed by bits 21..12. The
//! directory and every leaf table are charged one kernel frame each.

use alloc::{boxed::Box, vec::Vec};

use bitflags::bitflags;
use log::trace;
use x86_64::{
    structures::paging::{Page, PhysFrame, Size4KiB},
    VirtAddr,
};

use crate::constants::memory::{
    ENTRIES_PER_TABLE, LEAF_SHIFT, PAGE_EXEC, PAGE_EXIST, PAGE_NUMBER, PAGE_READ, PAGE_WRITE,
    ROOT_SHIFT, TABLE_INDEX_MASK, USERSTACK,
};
use crate::memory::{error::VmError, physical::frame_number};
use crate::processes::address_space::AsId;

bitflags! {
    /// Access rights recorded in a leaf entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const READ = PAGE_READ;
        const WRITE = PAGE_WRITE;
        const EXEC = PAGE_EXEC;
    }
}

impl Permissions {
    pub fn from_flags(readable: bool, writable: bool, executable: bool) -> Self {
        let mut perms = Permissions::empty();
        perms.set(Permissions::READ, readable);
        perms.set(Permissions::WRITE, writable);
        perms.set(Permissions::EXEC, executable);
        perms
    }
}

/// A leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageTableEntry {
    /// No frame and no declared permissions.
    #[default]
    Unmapped,
    /// Part of a defined region; the frame arrives on first fault.
    Declared(Permissions),
    Mapped {
        frame: PhysFrame<Size4KiB>,
        perms: Permissions,
    },
}

impl PageTableEntry {
    pub fn frame(&self) -> Option<PhysFrame<Size4KiB>> {
        match self {
            PageTableEntry::Mapped { frame, .. } => Some(*frame),
            _ => None,
        }
    }

    pub fn permissions(&self) -> Permissions {
        match self {
            PageTableEntry::Unmapped => Permissions::empty(),
            PageTableEntry::Declared(perms) | PageTableEntry::Mapped { perms, .. } => *perms,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, PageTableEntry::Mapped { .. })
    }

    /// Packed hardware-style form: frame number in the upper bits, then the
    /// exist flag and the permission bits.
    pub fn bits(&self) -> u32 {
        match self {
            PageTableEntry::Unmapped => 0,
            PageTableEntry::Declared(perms) => perms.bits(),
            PageTableEntry::Mapped { frame, perms } => {
                ((frame_number(*frame) as u32) << LEAF_SHIFT) & PAGE_NUMBER
                    | PAGE_EXIST
                    | perms.bits()
            }
        }
    }
}

/// Supplies zeroed frames to a page table walk.
///
/// Each call is its own critical section on the frame table, so a walk
/// that needs a leaf table and then a page never nests the lock.
pub trait FrameSource {
    /// A kernel frame to hold a leaf table.
    fn table_frame(&self) -> Option<PhysFrame<Size4KiB>>;

    /// A frame backing `page` of address space `owner`.
    fn page_frame(&self, owner: AsId, page: Page<Size4KiB>) -> Option<PhysFrame<Size4KiB>>;
}

/// Root directory index and leaf index of `page`.
pub fn table_indices(page: Page<Size4KiB>) -> (usize, usize) {
    let addr = page.start_address().as_u64();
    (
        ((addr >> ROOT_SHIFT) & TABLE_INDEX_MASK) as usize,
        ((addr >> LEAF_SHIFT) & TABLE_INDEX_MASK) as usize,
    )
}

/// The user page containing `vaddr`.
///
/// Only addresses below `USERSTACK` fit the two-level layout; anything
/// higher would alias a low page once the indices are masked.
pub fn user_page(vaddr: VirtAddr) -> Result<Page<Size4KiB>, VmError> {
    if vaddr.as_u64() >= USERSTACK {
        return Err(VmError::BadAddress(vaddr));
    }
    Ok(Page::containing_address(vaddr))
}

/// Inverse of `table_indices`.
pub fn page_at(root_index: usize, leaf_index: usize) -> Page<Size4KiB> {
    Page::containing_address(VirtAddr::new(
        ((root_index as u64) << ROOT_SHIFT) | ((leaf_index as u64) << LEAF_SHIFT),
    ))
}

pub struct LeafTable {
    frame: PhysFrame<Size4KiB>,
    entries: Box<[PageTableEntry; ENTRIES_PER_TABLE]>,
}

impl LeafTable {
    fn new(frame: PhysFrame<Size4KiB>) -> Self {
        LeafTable {
            frame,
            entries: Box::new([PageTableEntry::Unmapped; ENTRIES_PER_TABLE]),
        }
    }

    /// The kernel frame charged for this table.
    pub fn frame(&self) -> PhysFrame<Size4KiB> {
        self.frame
    }

    /// Entries that are not `Unmapped`, with their leaf index.
    pub fn iter_used(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| **e != PageTableEntry::Unmapped)
    }
}

pub struct PageTable {
    owner: AsId,
    root: PhysFrame<Size4KiB>,
    directory: Box<[Option<LeafTable>]>,
}

impl PageTable {
    /// An empty table whose directory is charged to `root`.
    pub fn new(owner: AsId, root: PhysFrame<Size4KiB>) -> Self {
        let mut directory = Vec::with_capacity(ENTRIES_PER_TABLE);
        directory.resize_with(ENTRIES_PER_TABLE, || None);
        PageTable {
            owner,
            root,
            directory: directory.into_boxed_slice(),
        }
    }

    pub fn owner(&self) -> AsId {
        self.owner
    }

    pub fn root_frame(&self) -> PhysFrame<Size4KiB> {
        self.root
    }

    /// Walk to the leaf entry of `page`.
    ///
    /// A missing leaf table is always created. An entry without a frame is
    /// backed only when `allocate` is set; otherwise it is returned as is so
    /// the caller can tell "no mapping" apart.
    pub fn walk(
        &mut self,
        page: Page<Size4KiB>,
        allocate: bool,
        frames: &impl FrameSource,
    ) -> Result<&mut PageTableEntry, VmError> {
        let owner = self.owner;
        let (root_index, leaf_index) = table_indices(page);

        let slot = &mut self.directory[root_index];
        let leaf = match slot.take() {
            Some(leaf) => slot.insert(leaf),
            None => {
                let frame = frames.table_frame().ok_or(VmError::OutOfMemory)?;
                trace!(
                    "paging: {:?} leaf table {} at {:#x}",
                    owner,
                    root_index,
                    frame.start_address().as_u64()
                );
                slot.insert(LeafTable::new(frame))
            }
        };
        let entry = &mut leaf.entries[leaf_index];

        if allocate && !entry.is_mapped() {
            let perms = match *entry {
                PageTableEntry::Declared(perms) => perms,
                _ => Permissions::READ | Permissions::WRITE,
            };
            let frame = frames.page_frame(owner, page).ok_or(VmError::OutOfMemory)?;
            *entry = PageTableEntry::Mapped { frame, perms };
        }
        Ok(entry)
    }

    /// Back `page` with a frame, adding `perms` to whatever was declared.
    pub fn map(
        &mut self,
        page: Page<Size4KiB>,
        perms: Permissions,
        frames: &impl FrameSource,
    ) -> Result<PhysFrame<Size4KiB>, VmError> {
        let owner = self.owner;
        let entry = self.walk(page, false, frames)?;
        let perms = entry.permissions() | perms;
        let frame = match entry.frame() {
            Some(frame) => frame,
            None => frames.page_frame(owner, page).ok_or(VmError::OutOfMemory)?,
        };
        *entry = PageTableEntry::Mapped { frame, perms };
        Ok(frame)
    }

    /// Record `perms` on `page` without backing it. A page that already has a
    /// frame keeps it; that frame is returned so its cached translation can be
    /// dropped.
    pub fn declare(
        &mut self,
        page: Page<Size4KiB>,
        perms: Permissions,
        frames: &impl FrameSource,
    ) -> Result<Option<PhysFrame<Size4KiB>>, VmError> {
        let entry = self.walk(page, false, frames)?;
        match *entry {
            PageTableEntry::Mapped { frame, .. } => {
                *entry = PageTableEntry::Mapped { frame, perms };
                Ok(Some(frame))
            }
            _ => {
                *entry = PageTableEntry::Declared(perms);
                Ok(None)
            }
        }
    }

    /// Clear the entry of `page`, returning the frame it held.
    pub fn unmap(&mut self, page: Page<Size4KiB>) -> Option<PhysFrame<Size4KiB>> {
        let (root_index, leaf_index) = table_indices(page);
        let leaf = self.directory[root_index].as_mut()?;
        let frame = leaf.entries[leaf_index].frame()?;
        leaf.entries[leaf_index] = PageTableEntry::Unmapped;
        Some(frame)
    }

    /// The entry of `page` without creating anything.
    pub fn entry(&self, page: Page<Size4KiB>) -> PageTableEntry {
        let (root_index, leaf_index) = table_indices(page);
        self.directory[root_index]
            .as_ref()
            .map(|leaf| leaf.entries[leaf_index])
            .unwrap_or_default()
    }

    /// Present leaf tables with their directory index.
    pub fn leaves(&self) -> impl Iterator<Item = (usize, &LeafTable)> {
        self.directory
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|leaf| (i, leaf)))
    }

    /// Every page with a frame assigned.
    pub fn iter_mapped(
        &self,
    ) -> impl Iterator<Item = (Page<Size4KiB>, PhysFrame<Size4KiB>, Permissions)> + '_ {
        self.leaves().flat_map(|(root_index, leaf)| {
            leaf.iter_used().filter_map(move |(leaf_index, entry)| match *entry {
                PageTableEntry::Mapped { frame, perms } => {
                    Some((page_at(root_index, leaf_index), frame, perms))
                }
                _ => None,
            })
        })
    }

    /// Detach every leaf table, leaving the directory empty.
    pub(crate) fn take_leaves(&mut self) -> Vec<(usize, LeafTable)> {
        self.directory
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.take().map(|leaf| (i, leaf)))
            .collect()
    }
}
