//! Address spaces
//!
//! A user address space is its page table plus the heap bounds and the
//! loading flag. Each space is owned by whoever runs in it and reaches the
//! `Vm` only through `&mut` borrows, so no lock guards a single space.

use log::{debug, trace, warn};
use x86_64::{
    structures::paging::{Page, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::{PAGE_OFFSET_MASK, PAGE_SIZE, USERSTACK};
use crate::memory::{
    paging::{page_at, user_page, FrameSource, PageTable, PageTableEntry, Permissions},
    Vm, VmError,
};

/// Identity of an address space, recorded as the owner of its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(u32);

impl AsId {
    pub const fn new(id: u32) -> Self {
        AsId(id)
    }
}

pub struct AddressSpace {
    id: AsId,
    page_table: PageTable,
    heap_start: VirtAddr,
    heap_end: VirtAddr,
    loading: bool,
    destroyed: bool,
}

impl AddressSpace {
    fn new(id: AsId, root: PhysFrame<Size4KiB>) -> Self {
        AddressSpace {
            id,
            page_table: PageTable::new(id, root),
            heap_start: VirtAddr::zero(),
            heap_end: VirtAddr::zero(),
            loading: false,
            destroyed: false,
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    /// `(heap_start, heap_end)`; both sit just past the highest region.
    pub fn heap_bounds(&self) -> (VirtAddr, VirtAddr) {
        (self.heap_start, self.heap_end)
    }

    /// Set between `prepare_load` and `complete_load`; read-only pages stay
    /// writable so the loader can fill them.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn mapped_pages(&self) -> usize {
        self.page_table.iter_mapped().count()
    }

    /// Initial user stack pointer. The stack region needs no declaration;
    /// its pages are created on first touch.
    pub fn define_stack(&self) -> VirtAddr {
        VirtAddr::new(USERSTACK)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if !self.destroyed {
            warn!(
                "address space {:?} dropped without destroy, {} frames leaked",
                self.id,
                self.mapped_pages()
            );
        }
    }
}

impl Vm {
    /// A new, empty address space. Only its root directory is allocated.
    pub fn create_address_space(&self) -> Result<AddressSpace, VmError> {
        let root = self.table_frame().ok_or(VmError::OutOfMemory)?;
        let id = self.next_asid();
        debug!("vm: created {:?}, root at {:#x}", id, root.start_address().as_u64());
        Ok(AddressSpace::new(id, root))
    }

    /// Deep copy of `src`: every backed page gets a fresh frame with the same
    /// contents, every declared page keeps its declaration.
    ///
    /// On failure the partial copy is destroyed before the error is returned.
    pub fn duplicate_address_space(&self, src: &AddressSpace) -> Result<AddressSpace, VmError> {
        let mut dst = self.create_address_space()?;
        match self.copy_mappings(src, &mut dst) {
            Ok(()) => {
                dst.heap_start = src.heap_start;
                dst.heap_end = src.heap_end;
                debug!(
                    "vm: duplicated {:?} into {:?} ({} pages)",
                    src.id,
                    dst.id,
                    dst.mapped_pages()
                );
                Ok(dst)
            }
            Err(e) => {
                warn!("vm: duplicate of {:?} failed: {}", src.id, e);
                self.destroy_address_space(dst);
                Err(e)
            }
        }
    }

    fn copy_mappings(&self, src: &AddressSpace, dst: &mut AddressSpace) -> Result<(), VmError> {
        let owner = dst.id;
        for (root_index, leaf) in src.page_table.leaves() {
            // Replicate the leaf table even when none of its entries are used.
            dst.page_table.walk(page_at(root_index, 0), false, self)?;

            for (leaf_index, entry) in leaf.iter_used() {
                let page = page_at(root_index, leaf_index);
                let slot = dst.page_table.walk(page, false, self)?;
                match *entry {
                    PageTableEntry::Mapped { frame, perms } => {
                        let copy = self.page_frame(owner, page).ok_or(VmError::OutOfMemory)?;
                        *slot = PageTableEntry::Mapped { frame: copy, perms };
                        self.copy_frame(frame, copy);
                    }
                    declared => *slot = declared,
                }
            }
        }
        Ok(())
    }

    /// Release every frame the space holds: data pages, leaf tables and
    /// finally the root directory.
    pub fn destroy_address_space(&self, mut space: AddressSpace) {
        let mut released = 0;
        for (root_index, leaf) in space.page_table.take_leaves() {
            for (leaf_index, entry) in leaf.iter_used() {
                if let PageTableEntry::Mapped { frame, .. } = *entry {
                    self.release_frame(frame);
                    self.tlb()
                        .shootdown_one(page_at(root_index, leaf_index).start_address());
                    released += 1;
                }
            }
            self.release_table_frame(leaf.frame());
        }
        self.release_table_frame(space.page_table.root_frame());
        space.destroyed = true;
        debug!("vm: destroyed {:?}, {} pages released", space.id, released);
    }

    /// Declare `[vaddr, vaddr + size)` with the given permissions, rounded
    /// out to whole pages. Nothing is backed yet.
    ///
    /// The heap bounds move to just past the region when it ends above them.
    pub fn define_region(
        &self,
        space: &mut AddressSpace,
        vaddr: VirtAddr,
        size: u64,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Result<(), VmError> {
        let base = vaddr.as_u64() & !PAGE_OFFSET_MASK;
        let npages = size
            .checked_add(vaddr.as_u64() & PAGE_OFFSET_MASK)
            .ok_or(VmError::BadAddress(vaddr))?
            .div_ceil(PAGE_SIZE);
        let end = npages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| base.checked_add(len))
            .filter(|&end| end <= USERSTACK)
            .ok_or(VmError::BadAddress(vaddr))?;

        let perms = Permissions::from_flags(readable, writable, executable);
        for i in 0..npages {
            let page = Page::containing_address(VirtAddr::new(base + i * PAGE_SIZE));
            if space.page_table.declare(page, perms, self)?.is_some() {
                self.tlb().shootdown_one(page.start_address());
            }
        }

        let end = VirtAddr::new(end);
        if npages > 0 && end > space.heap_end {
            space.heap_start = end;
            space.heap_end = end;
        }
        trace!(
            "vm: {:?} region {:#x}+{:#x} {:?}",
            space.id,
            base,
            npages * PAGE_SIZE,
            perms
        );
        Ok(())
    }

    /// Make `space` current on this core.
    pub fn activate(&self, _space: &AddressSpace) {
        self.tlb().shootdown_all();
    }

    /// Allow writes to every page until `complete_load`.
    pub fn prepare_load(&self, space: &mut AddressSpace) {
        space.loading = true;
    }

    /// End loading. Translations cached as writable for read-only pages are
    /// dropped.
    pub fn complete_load(&self, space: &mut AddressSpace) {
        space.loading = false;
        self.tlb().shootdown_all();
    }

    /// The leaf entry for `vaddr`. With `allocate`, an unbacked page gets a
    /// zeroed frame first. Kernel addresses give `BadAddress`.
    pub fn walk(
        &self,
        space: &mut AddressSpace,
        vaddr: VirtAddr,
        allocate: bool,
    ) -> Result<PageTableEntry, VmError> {
        let page = user_page(vaddr)?;
        space.page_table.walk(page, allocate, self).map(|entry| *entry)
    }

    /// Back the page of `vaddr` with a zeroed frame, adding `perms` to its
    /// declared permissions.
    pub fn map_page(
        &self,
        space: &mut AddressSpace,
        vaddr: VirtAddr,
        perms: Permissions,
    ) -> Result<PhysFrame<Size4KiB>, VmError> {
        let page = user_page(vaddr)?;
        let frame = space.page_table.map(page, perms, self)?;
        self.tlb().shootdown_one(page.start_address());
        Ok(frame)
    }

    /// Unmap the page of `vaddr` and release its frame.
    ///
    /// # Panics
    /// If `vaddr` is not a user address or its page has no frame.
    pub fn free_page(&self, space: &mut AddressSpace, vaddr: VirtAddr) {
        let Ok(page) = user_page(vaddr) else {
            panic!("{:?}: freeing kernel address {:#x}", space.id, vaddr.as_u64());
        };
        let Some(frame) = space.page_table.unmap(page) else {
            panic!("{:?}: freeing unbacked page {:#x}", space.id, vaddr.as_u64());
        };
        self.release_frame(frame);
        self.tlb().shootdown_one(page.start_address());
    }

    /// Physical address behind `vaddr`, if its page is backed.
    pub fn translate(&self, space: &AddressSpace, vaddr: VirtAddr) -> Option<PhysAddr> {
        let page = user_page(vaddr).ok()?;
        let frame = space.page_table.entry(page).frame()?;
        Some(frame.start_address() + (vaddr.as_u64() & PAGE_OFFSET_MASK))
    }
}
