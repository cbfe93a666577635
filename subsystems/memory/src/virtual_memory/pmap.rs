//! # Pmap
//!
//! The hardware address-space handle. Wraps the architecture page table and
//! holds a [`FrameRef`] for every translation it contains, so a frame cannot
//! be freed while any page table still points at it.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use strata_hal::mmu::{Mmu, PageFlags, PageTable};
use strata_hal::{PhysAddr, VirtAddr};

use crate::physical::{FrameAllocator, FrameRef};
use crate::{MemError, MemResult};

/// Hardware address-space handle
pub struct Pmap {
    table: Box<dyn PageTable>,
    mmu: Arc<dyn Mmu>,
    /// Page-table root, released with the pmap
    root: FrameRef,
    /// Frame held by each live translation, keyed by page base
    frames: BTreeMap<u64, FrameRef>,
}

impl Pmap {
    /// Create an empty handle, allocating its root table frame
    pub fn new(mmu: Arc<dyn Mmu>, allocator: &FrameAllocator) -> MemResult<Self> {
        let root = allocator.allocate_zeroed()?;
        let table = mmu.create_page_table(root.address())?;
        Ok(Self { table, mmu, root, frames: BTreeMap::new() })
    }

    /// Physical address of the root table
    pub fn root(&self) -> PhysAddr {
        self.root.address()
    }

    /// Install a translation for `vaddr`, replacing any existing one
    pub fn map(&mut self, vaddr: VirtAddr, frame: FrameRef, flags: PageFlags) -> MemResult<()> {
        if !vaddr.is_page_aligned() {
            return Err(MemError::NotAligned);
        }
        if let Some(old) = self.frames.remove(&vaddr.as_u64()) {
            self.table.unmap(vaddr)?;
            self.mmu.invalidate_tlb(vaddr);
            drop(old);
        }
        // SAFETY: `frame` is stored in `self.frames` for as long as the
        // translation exists and is dropped only after it is removed.
        unsafe { self.table.map(vaddr, frame.address(), flags)? };
        log::trace!("pmap {}: map {} -> {} {:?}", self.root(), vaddr, frame.address(), flags);
        self.frames.insert(vaddr.as_u64(), frame);
        Ok(())
    }

    /// Remove the translation for `vaddr`, returning the frame it held
    pub fn unmap(&mut self, vaddr: VirtAddr) -> Option<FrameRef> {
        let page = vaddr.page_base();
        let frame = self.frames.remove(&page.as_u64())?;
        // An entry in `frames` always has a matching translation
        let _ = self.table.unmap(page);
        self.mmu.invalidate_tlb(page);
        Some(frame)
    }

    /// Remove every translation in `[start, end)`, returning how many went
    pub fn unmap_range(&mut self, start: VirtAddr, end: VirtAddr) -> usize {
        let pages: Vec<u64> = self
            .frames
            .range(start.as_u64()..end.as_u64())
            .map(|(&page, _)| page)
            .collect();
        for &page in &pages {
            self.unmap(VirtAddr::new(page));
        }
        pages.len()
    }

    /// Change the flags of the translation for `vaddr`
    pub fn protect(&mut self, vaddr: VirtAddr, flags: PageFlags) -> MemResult<()> {
        let page = vaddr.page_base();
        if !self.frames.contains_key(&page.as_u64()) {
            return Err(MemError::NotMapped);
        }
        self.table.update_flags(page, flags)?;
        self.mmu.invalidate_tlb(page);
        Ok(())
    }

    /// Set `flags` on every translation in `[start, end)`
    ///
    /// A translation the table refuses to update is removed instead; its
    /// page faults back in with the region's current flags. Returns how
    /// many translations were updated.
    pub fn protect_range(&mut self, start: VirtAddr, end: VirtAddr, flags: PageFlags) -> usize {
        let mut changed = 0;
        let mut refused = Vec::new();
        for &page in self.frames.range(start.as_u64()..end.as_u64()).map(|(page, _)| page) {
            match self.table.update_flags(VirtAddr::new(page), flags) {
                Ok(()) => changed += 1,
                Err(_) => refused.push(page),
            }
        }
        for &page in &refused {
            log::warn!("pmap {}: dropping {:#x}, flags not updated", self.root(), page);
            self.unmap(VirtAddr::new(page));
        }
        if changed > 0 {
            self.mmu.invalidate_tlb_all();
        }
        changed
    }

    /// Flush any stale TLB entry for `vaddr`
    pub fn invalidate(&self, vaddr: VirtAddr) {
        self.mmu.invalidate_tlb(vaddr.page_base());
    }

    /// Look up the translation for a page
    pub fn query(&self, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.table.query(vaddr.page_base())
    }

    /// Frame installed at `vaddr`
    pub fn frame(&self, vaddr: VirtAddr) -> Option<&FrameRef> {
        self.frames.get(&vaddr.page_base().as_u64())
    }

    /// Translate a virtual address to physical
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.query(vaddr).map(|(phys, _)| phys.add(vaddr.page_offset()))
    }

    /// Number of live translations
    pub fn mapped_pages(&self) -> usize {
        self.frames.len()
    }

    /// Make this the active page table
    pub fn switch_to(&self) {
        // SAFETY: every translation in `table` refers to a frame held in
        // `self.frames`, so nothing reachable through it can be freed.
        unsafe { self.mmu.switch_page_table(self.table.as_ref()) };
    }

    /// Whether this handle is the active page table
    pub fn is_active(&self) -> bool {
        self.mmu.active_root() == Some(self.root())
    }

    /// Remove every translation
    pub fn remove_all(&mut self) {
        let frames = core::mem::take(&mut self.frames);
        for &page in frames.keys() {
            let _ = self.table.unmap(VirtAddr::new(page));
        }
        if !frames.is_empty() {
            self.mmu.invalidate_tlb_all();
        }
    }
}

impl Drop for Pmap {
    fn drop(&mut self) {
        self.remove_all();
    }
}

impl fmt::Debug for Pmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmap")
            .field("root", &self.root())
            .field("mapped", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_hal::arch_stubs::{SoftMmu, SoftRam};

    fn setup() -> (FrameAllocator, Arc<SoftMmu>) {
        let ram = Arc::new(SoftRam::new(PhysAddr::new(0), 16));
        let alloc = FrameAllocator::new(PhysAddr::new(0), 16, ram).unwrap();
        (alloc, Arc::new(SoftMmu::new()))
    }

    #[test]
    fn test_root_frame_held() {
        let (alloc, mmu) = setup();
        let pmap = Pmap::new(mmu, &alloc).unwrap();
        assert_eq!(alloc.free_frames(), 15);
        assert_eq!(alloc.ref_count(pmap.root()), 1);
        drop(pmap);
        assert_eq!(alloc.free_frames(), 16);
    }

    #[test]
    fn test_map_holds_reference() {
        let (alloc, mmu) = setup();
        let mut pmap = Pmap::new(mmu, &alloc).unwrap();
        let frame = alloc.allocate().unwrap();
        let addr = frame.address();
        pmap.map(VirtAddr::new(0x1000), frame.clone(), PageFlags::user_data()).unwrap();
        assert_eq!(frame.ref_count(), 2);
        assert_eq!(pmap.translate(VirtAddr::new(0x1010)), Some(addr.add(0x10)));
        drop(frame);
        assert_eq!(alloc.ref_count(addr), 1);
        assert!(pmap.unmap(VirtAddr::new(0x1000)).is_some());
        assert_eq!(alloc.ref_count(addr), 0);
        assert_eq!(pmap.mapped_pages(), 0);
    }

    #[test]
    fn test_remap_releases_old_frame() {
        let (alloc, mmu) = setup();
        let mut pmap = Pmap::new(mmu, &alloc).unwrap();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        let a_addr = a.address();
        pmap.map(VirtAddr::new(0x2000), a, PageFlags::user_data()).unwrap();
        pmap.map(VirtAddr::new(0x2000), b.clone(), PageFlags::user_rodata()).unwrap();
        assert_eq!(alloc.ref_count(a_addr), 0);
        assert_eq!(pmap.query(VirtAddr::new(0x2000)).map(|(p, _)| p), Some(b.address()));
    }

    #[test]
    fn test_protect_range_and_unmap_range() {
        let (alloc, mmu) = setup();
        let mut pmap = Pmap::new(mmu.clone(), &alloc).unwrap();
        for i in 1..=3u64 {
            let f = alloc.allocate().unwrap();
            pmap.map(VirtAddr::new(i * 0x1000), f, PageFlags::user_data()).unwrap();
        }
        let rodata = PageFlags::user_rodata();
        let changed = pmap.protect_range(VirtAddr::new(0x1000), VirtAddr::new(0x3000), rodata);
        assert_eq!(changed, 2);
        assert!(!pmap.query(VirtAddr::new(0x2000)).unwrap().1.is_writable());
        assert!(pmap.query(VirtAddr::new(0x3000)).unwrap().1.is_writable());
        assert_eq!(pmap.unmap_range(VirtAddr::new(0x2000), VirtAddr::new(0x4000)), 2);
        assert_eq!(pmap.mapped_pages(), 1);
        let gone = pmap.protect(VirtAddr::new(0x3000), PageFlags::user_data());
        assert_eq!(gone, Err(MemError::NotMapped));
    }

    #[test]
    fn test_switch_to() {
        let (alloc, mmu) = setup();
        let pmap = Pmap::new(mmu.clone(), &alloc).unwrap();
        assert!(!pmap.is_active());
        pmap.switch_to();
        assert!(pmap.is_active());
        assert_eq!(mmu.switches(), 1);
    }
}
