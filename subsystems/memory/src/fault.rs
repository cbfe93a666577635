//! # Page Fault Handling
//!
//! Resolves a faulting address to a frame and installs it in the pmap.
//!
//! Lookup order for a missing page:
//! 1. the region's anonymous overlay
//! 2. the region's file object
//! 3. a fresh zero-filled frame
//!
//! A write to a present read-only page of a writable region is a
//! copy-on-write break: the page is made writable in place when no other
//! store shares it, and copied to a private frame otherwise.

use strata_hal::mmu::PageFlags;
use strata_hal::VirtAddr;

use crate::physical::{FrameAllocator, FrameRef};
use crate::protection::{AccessKind, RegionFlags};
use crate::virtual_memory::anon::PageRef;
use crate::virtual_memory::{AddressSpace, MappingRegion, Pmap};
use crate::MemResult;

/// Outcome of a page fault that did not fail with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// A mapping is installed; the access can be retried
    Resolved,
    /// No region covers the address or the region forbids the access
    Denied,
}

/// Handle a fault on `vaddr` in `space`
///
/// Errors are resource failures (no frame, file read failed) and leave the
/// space consistent; the faulting access simply stays unresolved.
pub fn handle_page_fault(
    space: &mut AddressSpace,
    vaddr: VirtAddr,
    access: AccessKind,
) -> MemResult<FaultResolution> {
    let page = vaddr.page_base();
    let AddressSpace { regions, pmap, allocator, .. } = space;

    let region = match regions
        .range_mut(..=page.as_u64())
        .next_back()
        .map(|(_, region)| region)
        .filter(|region| region.contains(page))
    {
        Some(region) => region,
        None => {
            log::trace!("fault {} {:?}: no region", vaddr, access);
            return Ok(FaultResolution::Denied);
        }
    };
    if !region.flags().permits(access) {
        log::trace!("fault {} {:?}: region is {}", vaddr, access, region.flags());
        return Ok(FaultResolution::Denied);
    }

    let mut fault = Fault { region, pmap, allocator, page };
    match fault.pmap.query(page) {
        Some((_, current)) if access != AccessKind::Write || current.is_writable() => {
            // Stale TLB entry; the translation is already sufficient
            fault.pmap.invalidate(page);
        }
        Some(_) => fault.write_protected()?,
        None => fault.missing(access)?,
    }
    Ok(FaultResolution::Resolved)
}

/// Borrowed state of one fault resolution
struct Fault<'a> {
    region: &'a mut MappingRegion,
    pmap: &'a mut Pmap,
    allocator: &'a FrameAllocator,
    page: VirtAddr,
}

impl Fault<'_> {
    fn flags(&self) -> PageFlags {
        self.region.flags().page_flags()
    }

    fn is_shared_region(&self) -> bool {
        self.region.flags().contains(RegionFlags::SHARED)
    }

    /// Write to a present page the hardware holds read-only
    fn write_protected(&mut self) -> MemResult<()> {
        let flags = self.flags();
        if self.is_shared_region() {
            return self.pmap.protect(self.page, flags);
        }
        let key = self.region.anon_offset(self.page);
        let lookup = self.region.anon().and_then(|anon| anon.lookup(key));
        match lookup {
            Some(anon) if !anon.shared => {
                log::trace!("cow {}: sole owner, write enabled", self.page);
                self.pmap.protect(self.page, flags)
            }
            Some(anon) => self.promote(anon.page.frame()),
            None => {
                // Mapped straight from the file object
                let source = self.pmap.frame(self.page).cloned();
                match source {
                    Some(frame) => self.promote(&frame),
                    None => self.missing(AccessKind::Write),
                }
            }
        }
    }

    /// Access to a page with no translation
    fn missing(&mut self, access: AccessKind) -> MemResult<()> {
        let write = access == AccessKind::Write;
        let key = self.region.anon_offset(self.page);

        if let Some(anon) = self.region.anon().and_then(|anon| anon.lookup(key)) {
            let private = !self.is_shared_region();
            if anon.shared && private {
                if write {
                    return self.promote(anon.page.frame());
                }
                let flags = self.flags().read_only();
                return self.pmap.map(self.page, anon.page.frame().clone(), flags);
            }
            let flags = self.flags();
            return self.pmap.map(self.page, anon.page.frame().clone(), flags);
        }

        if let Some(object) = self.region.object().cloned() {
            let frame = object.page(self.region.object_offset(self.page), self.allocator)?;
            if !self.region.flags().is_private_writable() {
                let flags = self.flags();
                return self.pmap.map(self.page, frame, flags);
            }
            if write {
                return self.promote(&frame);
            }
            // Private writable file page: read through the cache until written
            let flags = self.flags().read_only();
            return self.pmap.map(self.page, frame, flags);
        }

        let frame = self.allocator.allocate_zeroed()?;
        self.region.anon_or_create().insert(key, PageRef::new(frame.clone()));
        let flags = self.flags();
        log::trace!("fault {}: zero page {}", self.page, frame.address());
        self.pmap.map(self.page, frame, flags)
    }

    /// Copy `source` into a private overlay page and map it writable
    fn promote(&mut self, source: &FrameRef) -> MemResult<()> {
        let frame = self.allocator.allocate_copy(source)?;
        let key = self.region.anon_offset(self.page);
        self.region.anon_or_create().insert(key, PageRef::new(frame.clone()));
        let flags = self.flags();
        log::trace!("cow {}: {} -> {}", self.page, source.address(), frame.address());
        self.pmap.map(self.page, frame, flags)
    }
}
