//! # Address Space Management
//!
//! An address space is a set of disjoint mapping regions, sorted by base,
//! plus the pmap that holds their present pages.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use strata_hal::mmu::Mmu;
use strata_hal::{PhysAddr, VirtAddr, PAGE_SIZE};

use super::pmap::Pmap;
use super::region::{Backing, MappingRegion};
use crate::physical::FrameAllocator;
use crate::protection::RegionFlags;
use crate::{MemError, MemResult, VirtRange};

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Privilege level of an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// A process address space
    User,
    /// The privileged kernel space
    Kernel,
}

/// A virtual address space
pub struct AddressSpace {
    id: AddressSpaceId,
    kind: SpaceKind,
    range: VirtRange,
    pub(crate) regions: BTreeMap<u64, MappingRegion>,
    pub(crate) pmap: Pmap,
    pub(crate) allocator: FrameAllocator,
    mmu: Arc<dyn Mmu>,
}

impl AddressSpace {
    /// Create an empty space covering `range`
    ///
    /// Allocates the page-table root, so this can run out of memory.
    pub fn new(
        kind: SpaceKind,
        range: VirtRange,
        mmu: Arc<dyn Mmu>,
        allocator: FrameAllocator,
    ) -> MemResult<Self> {
        if !range.start.is_page_aligned() || !range.end.is_page_aligned() {
            return Err(MemError::NotAligned);
        }
        if range.is_empty() {
            return Err(MemError::InvalidSize);
        }
        let pmap = Pmap::new(Arc::clone(&mmu), &allocator)?;
        let id = AddressSpaceId::generate();
        log::debug!(
            "space {}: created {:?} {:#x}-{:#x}",
            id.0,
            kind,
            range.start.as_u64(),
            range.end.as_u64()
        );
        Ok(Self {
            id,
            kind,
            range,
            regions: BTreeMap::new(),
            pmap,
            allocator,
            mmu,
        })
    }

    /// Get address space ID
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// User or kernel
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Range regions may be placed in
    pub fn range(&self) -> VirtRange {
        self.range
    }

    /// Hardware handle
    pub fn pmap(&self) -> &Pmap {
        &self.pmap
    }

    /// Frame allocator backing this space
    pub fn allocator(&self) -> &FrameAllocator {
        &self.allocator
    }

    /// Regions in ascending address order
    pub fn regions(&self) -> impl Iterator<Item = &MappingRegion> {
        self.regions.values()
    }

    /// Number of regions
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn check_range(&self, base: VirtAddr, len: u64) -> MemResult<VirtAddr> {
        if !base.is_page_aligned() || len % PAGE_SIZE != 0 {
            return Err(MemError::NotAligned);
        }
        if len == 0 {
            return Err(MemError::InvalidSize);
        }
        let end = base.checked_add(len).ok_or(MemError::OutOfAddressSpace)?;
        if base < self.range.start || end > self.range.end {
            return Err(MemError::OutOfAddressSpace);
        }
        Ok(end)
    }

    /// Whether `[base, end)` intersects any region other than the one at `skip`
    fn overlaps(&self, base: VirtAddr, end: VirtAddr, skip: Option<u64>) -> bool {
        // Regions are disjoint, so only the last region starting before
        // `end` can reach into the range
        self.regions
            .range(..end.as_u64())
            .rev()
            .filter(|(&start, _)| Some(start) != skip)
            .take(1)
            .any(|(_, region)| region.overlaps(base, end))
    }

    /// Lowest gap of at least `len` bytes (first fit)
    pub fn find_gap(&self, len: u64) -> MemResult<VirtAddr> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(MemError::InvalidSize);
        }
        let mut cursor = self.range.start;
        for region in self.regions.values() {
            let Some(end) = cursor.checked_add(len) else {
                return Err(MemError::OutOfAddressSpace);
            };
            if region.base() >= end {
                return Ok(cursor);
            }
            cursor = cursor.max(region.end());
        }
        if self.range.end.as_u64().saturating_sub(cursor.as_u64()) >= len {
            Ok(cursor)
        } else {
            Err(MemError::OutOfAddressSpace)
        }
    }

    /// Insert a region at its own base
    pub fn insert_region(&mut self, region: MappingRegion) -> MemResult<VirtAddr> {
        let base = region.base();
        let end = self.check_range(base, region.len())?;
        if self.overlaps(base, end, None) {
            return Err(MemError::Overlaps);
        }
        log::debug!("space {}: + {}", self.id.0, region);
        self.regions.insert(base.as_u64(), region);
        Ok(base)
    }

    /// Create and insert a region
    ///
    /// Without an explicit `base` the region goes into the first gap that
    /// fits.
    pub fn install(
        &mut self,
        base: Option<VirtAddr>,
        len: u64,
        flags: RegionFlags,
        backing: Backing,
    ) -> MemResult<VirtAddr> {
        let base = match base {
            Some(base) => base,
            None => self.find_gap(len)?,
        };
        if let Backing::File { offset, .. } = &backing {
            if offset % PAGE_SIZE != 0 {
                return Err(MemError::NotAligned);
            }
            if offset.checked_add(len).is_none() {
                return Err(MemError::InvalidSize);
            }
        }
        self.insert_region(MappingRegion::new(base, len, flags, backing))
    }

    /// Region containing `addr`
    pub fn find_region(&self, addr: VirtAddr) -> Option<&MappingRegion> {
        self.regions
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Remove the region starting at `base` and unmap its pages
    pub fn remove_region(&mut self, base: VirtAddr) -> MemResult<MappingRegion> {
        let region = self.regions.remove(&base.as_u64()).ok_or(MemError::NotMapped)?;
        let unmapped = self.pmap.unmap_range(region.base(), region.end());
        log::debug!("space {}: - {} ({} pages)", self.id.0, region, unmapped);
        Ok(region)
    }

    /// Remove every region inside `[start, start + len)`
    ///
    /// A region only partly inside the range is an error and nothing is
    /// removed. Returns the number of regions removed.
    pub fn unmap(&mut self, start: VirtAddr, len: u64) -> MemResult<usize> {
        let end = self.check_range(start, len)?;
        let mut doomed = Vec::new();
        for region in self.regions.values() {
            if !region.overlaps(start, end) {
                continue;
            }
            if region.base() < start || region.end() > end {
                return Err(MemError::InvalidAddress);
            }
            doomed.push(region.base());
        }
        for base in &doomed {
            self.remove_region(*base)?;
        }
        Ok(doomed.len())
    }

    /// Change the flags of the region starting at `base`
    ///
    /// Without READ every present page is unmapped, so the next touch faults
    /// and is refused. Otherwise present pages become read-only and regain
    /// write access through the fault path if the new flags allow it.
    pub fn protect(&mut self, base: VirtAddr, flags: RegionFlags) -> MemResult<()> {
        let region = self.regions.get_mut(&base.as_u64()).ok_or(MemError::NotMapped)?;
        region.set_flags(flags);
        let (start, end) = (region.base(), region.end());
        let pages = if flags.contains(RegionFlags::READ) {
            self.pmap.protect_range(start, end, flags.page_flags().read_only())
        } else {
            self.pmap.unmap_range(start, end)
        };
        log::debug!("space {}: protect {} {} ({} pages)", self.id.0, base, flags, pages);
        Ok(())
    }

    /// Grow or shrink the region starting at `base` to `len` bytes
    pub fn resize(&mut self, base: VirtAddr, len: u64) -> MemResult<()> {
        let end = self.check_range(base, len)?;
        let old_end = self
            .regions
            .get(&base.as_u64())
            .map(MappingRegion::end)
            .ok_or(MemError::NotMapped)?;
        if end > old_end && self.overlaps(old_end, end, Some(base.as_u64())) {
            return Err(MemError::Overlaps);
        }
        if end < old_end {
            self.pmap.unmap_range(end, old_end);
        }
        if let Some(region) = self.regions.get_mut(&base.as_u64()) {
            region.set_len(len);
        }
        Ok(())
    }

    /// Translate a virtual address through the pmap
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.pmap.translate(vaddr)
    }

    /// Make this space's page table active
    pub fn switch_to(&self) {
        self.pmap.switch_to();
    }

    /// Duplicate this space with copy-on-write sharing
    ///
    /// Builds the whole child without touching `self`. The parent's private
    /// writable pages are only downgraded by [`PendingFork::commit`], so a
    /// caller with more fallible work to do can still drop the fork and
    /// leave the parent exactly as it was.
    pub fn fork(&mut self) -> MemResult<PendingFork<'_>> {
        let mut child = AddressSpace::new(
            self.kind,
            self.range,
            Arc::clone(&self.mmu),
            self.allocator.clone(),
        )?;
        let mut copies = Vec::new();
        copies
            .try_reserve_exact(self.regions.len())
            .map_err(|_| MemError::OutOfMemory)?;
        for region in self.regions.values() {
            copies.push(region.fork()?);
        }
        for region in copies {
            child.regions.insert(region.base().as_u64(), region);
        }
        Ok(PendingFork { parent: self, child })
    }

    /// Tear down every region and the hardware handle
    pub fn destroy(self) {
        log::debug!("space {}: destroyed", self.id.0);
        drop(self);
    }

    fn teardown(&mut self) {
        self.pmap.remove_all();
        self.regions.clear();
    }
}

/// A forked child space whose parent has not been downgraded yet
///
/// Dropping it discards the child. The child must not run before
/// [`commit`](Self::commit), since until then the parent can still write to
/// pages the two share.
#[must_use = "dropping a pending fork discards the child"]
pub struct PendingFork<'a> {
    parent: &'a mut AddressSpace,
    child: AddressSpace,
}

impl PendingFork<'_> {
    /// The child as built so far
    pub fn child(&self) -> &AddressSpace {
        &self.child
    }

    /// Make the parent's private writable pages read-only and hand over the
    /// child
    ///
    /// The next write by either side faults and breaks the sharing.
    pub fn commit(self) -> AddressSpace {
        let PendingFork { parent, child } = self;
        let mut downgraded = 0;
        for region in parent.regions.values() {
            if region.flags().is_private_writable() {
                let flags = region.flags().page_flags().read_only();
                downgraded += parent.pmap.protect_range(region.base(), region.end(), flags);
            }
        }
        log::debug!(
            "space {}: forked into {} ({} regions, {} pages downgraded)",
            parent.id.0,
            child.id.0,
            child.regions.len(),
            downgraded
        );
        child
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("regions", &self.regions.len())
            .field("pmap", &self.pmap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{handle_page_fault, FaultResolution};
    use crate::protection::AccessKind;
    use strata_hal::arch_stubs::{SoftMmu, SoftRam};

    fn space(frames: usize) -> (AddressSpace, FrameAllocator) {
        let ram = Arc::new(SoftRam::new(PhysAddr::new(0), frames));
        let alloc = FrameAllocator::new(PhysAddr::new(0), frames, ram).unwrap();
        let range = VirtRange::new(VirtAddr::new(0x1000), VirtAddr::new(0x10_0000));
        let mmu = Arc::new(SoftMmu::new());
        let space = AddressSpace::new(SpaceKind::User, range, mmu, alloc.clone()).unwrap();
        (space, alloc)
    }

    fn anon(space: &mut AddressSpace, base: u64, len: u64) -> MemResult<VirtAddr> {
        space.install(Some(VirtAddr::new(base)), len, RegionFlags::URW, Backing::Anonymous)
    }

    fn assert_disjoint(space: &AddressSpace) {
        let regions: Vec<_> = space.regions().collect();
        for pair in regions.windows(2) {
            assert!(pair[0].end() <= pair[1].base());
        }
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    #[test]
    fn test_explicit_insert_and_overlap() {
        let (mut space, _) = space(8);
        anon(&mut space, 0x2000, 0x2000).unwrap();
        assert_eq!(anon(&mut space, 0x3000, 0x1000), Err(MemError::Overlaps));
        assert_eq!(anon(&mut space, 0x1000, 0x2000), Err(MemError::Overlaps));
        assert_eq!(anon(&mut space, 0x1000, 0x1000), Ok(VirtAddr::new(0x1000)));
        assert_eq!(anon(&mut space, 0x4000, 0x1000), Ok(VirtAddr::new(0x4000)));
        assert_disjoint(&space);
    }

    #[test]
    fn test_insert_validation() {
        let (mut space, _) = space(8);
        assert_eq!(anon(&mut space, 0x1800, 0x1000), Err(MemError::NotAligned));
        assert_eq!(anon(&mut space, 0x1000, 0), Err(MemError::InvalidSize));
        assert_eq!(anon(&mut space, 0x0, 0x1000), Err(MemError::OutOfAddressSpace));
        assert_eq!(anon(&mut space, 0xF_F000, 0x2000), Err(MemError::OutOfAddressSpace));
    }

    #[test]
    fn test_first_fit() {
        let (mut space, _) = space(8);
        anon(&mut space, 0x1000, 0x1000).unwrap();
        anon(&mut space, 0x4000, 0x1000).unwrap();
        let small = space.install(None, 0x1000, RegionFlags::URW, Backing::Anonymous).unwrap();
        assert_eq!(small, VirtAddr::new(0x2000));
        let big = space.install(None, 0x3000, RegionFlags::URW, Backing::Anonymous).unwrap();
        assert_eq!(big, VirtAddr::new(0x5000));
        let tail = space.install(None, 0x1000, RegionFlags::URW, Backing::Anonymous).unwrap();
        assert_eq!(tail, VirtAddr::new(0x3000));
        assert_disjoint(&space);
    }

    #[test]
    fn test_out_of_address_space() {
        let (mut space, _) = space(8);
        anon(&mut space, 0x1000, 0xF_E000).unwrap();
        assert_eq!(
            space.install(None, 0x2000, RegionFlags::URW, Backing::Anonymous),
            Err(MemError::OutOfAddressSpace)
        );
        assert_eq!(space.find_gap(0x1000), Ok(VirtAddr::new(0xF_F000)));
    }

    // =========================================================================
    // Lookup and removal
    // =========================================================================

    #[test]
    fn test_find_region() {
        let (mut space, _) = space(8);
        anon(&mut space, 0x2000, 0x2000).unwrap();
        assert!(space.find_region(VirtAddr::new(0x1fff)).is_none());
        let found = space.find_region(VirtAddr::new(0x3fff)).map(|r| r.base());
        assert_eq!(found, Some(VirtAddr::new(0x2000)));
        assert!(space.find_region(VirtAddr::new(0x4000)).is_none());
    }

    #[test]
    fn test_unmap_whole_regions_only() {
        let (mut space, _) = space(8);
        anon(&mut space, 0x2000, 0x1000).unwrap();
        anon(&mut space, 0x3000, 0x2000).unwrap();
        assert_eq!(space.unmap(VirtAddr::new(0x2000), 0x2000), Err(MemError::InvalidAddress));
        assert_eq!(space.region_count(), 2);
        assert_eq!(space.unmap(VirtAddr::new(0x1000), 0x4000), Ok(2));
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn test_resize() {
        let (mut space, _) = space(8);
        anon(&mut space, 0x2000, 0x1000).unwrap();
        anon(&mut space, 0x5000, 0x1000).unwrap();
        space.resize(VirtAddr::new(0x2000), 0x3000).unwrap();
        assert_eq!(space.resize(VirtAddr::new(0x2000), 0x4000), Err(MemError::Overlaps));
        space.resize(VirtAddr::new(0x2000), 0x1000).unwrap();
        assert_eq!(space.find_region(VirtAddr::new(0x2000)).map(|r| r.len()), Some(0x1000));
        assert_disjoint(&space);
    }

    #[test]
    fn test_destroy_releases_root() {
        let (mut space, alloc) = space(8);
        anon(&mut space, 0x2000, 0x1000).unwrap();
        assert_eq!(alloc.free_frames(), 7);
        space.destroy();
        assert_eq!(alloc.free_frames(), 8);
    }

    #[test]
    fn test_gap_search_length_overflow() {
        let (mut space, _) = space(8);
        anon(&mut space, 0x2000, 0x1000).unwrap();
        let huge = 0xFFFF_FFFF_FFFF_F000;
        assert_eq!(space.find_gap(huge), Err(MemError::OutOfAddressSpace));
        assert_eq!(
            space.install(None, huge, RegionFlags::URW, Backing::Anonymous),
            Err(MemError::OutOfAddressSpace)
        );
        assert_eq!(space.unmap(VirtAddr::new(0x2000), huge), Err(MemError::OutOfAddressSpace));
        assert_eq!(space.region_count(), 1);
    }

    // =========================================================================
    // Protection
    // =========================================================================

    fn touch(space: &mut AddressSpace, addr: u64, access: AccessKind) -> FaultResolution {
        handle_page_fault(space, VirtAddr::new(addr), access).unwrap()
    }

    #[test]
    fn test_protect_read_only_denies_writes() {
        let (mut space, _) = space(8);
        anon(&mut space, 0x2000, 0x2000).unwrap();
        assert_eq!(touch(&mut space, 0x2000, AccessKind::Write), FaultResolution::Resolved);

        space.protect(VirtAddr::new(0x2000), RegionFlags::UR).unwrap();
        let (_, flags) = space.pmap().query(VirtAddr::new(0x2000)).unwrap();
        assert!(!flags.is_writable());
        assert_eq!(touch(&mut space, 0x2000, AccessKind::Write), FaultResolution::Denied);
        assert_eq!(touch(&mut space, 0x3000, AccessKind::Read), FaultResolution::Resolved);
        assert_eq!(space.protect(VirtAddr::new(0x3000), RegionFlags::UR), Err(MemError::NotMapped));
    }

    #[test]
    fn test_protect_restores_write_in_place() {
        let (mut space, alloc) = space(8);
        anon(&mut space, 0x2000, 0x1000).unwrap();
        touch(&mut space, 0x2000, AccessKind::Write);
        let frame = space.translate(VirtAddr::new(0x2000)).unwrap();
        space.protect(VirtAddr::new(0x2000), RegionFlags::UR).unwrap();
        let free = alloc.free_frames();

        space.protect(VirtAddr::new(0x2000), RegionFlags::URW).unwrap();
        assert_eq!(touch(&mut space, 0x2000, AccessKind::Write), FaultResolution::Resolved);
        let (phys, flags) = space.pmap().query(VirtAddr::new(0x2000)).unwrap();
        assert!(flags.is_writable());
        assert_eq!(phys, frame);
        assert_eq!(alloc.free_frames(), free);
    }

    #[test]
    fn test_protect_none_unmaps_and_denies() {
        let (mut space, alloc) = space(8);
        anon(&mut space, 0x2000, 0x1000).unwrap();
        touch(&mut space, 0x2000, AccessKind::Write);
        space.protect(VirtAddr::new(0x2000), RegionFlags::USER).unwrap();

        assert!(space.pmap().query(VirtAddr::new(0x2000)).is_none());
        assert_eq!(touch(&mut space, 0x2000, AccessKind::Read), FaultResolution::Denied);
        // The page lives on in the overlay
        assert_eq!(alloc.free_frames(), 6);

        space.protect(VirtAddr::new(0x2000), RegionFlags::UR).unwrap();
        assert_eq!(touch(&mut space, 0x2000, AccessKind::Read), FaultResolution::Resolved);
        assert_eq!(alloc.free_frames(), 6);
    }

    // =========================================================================
    // Fork
    // =========================================================================

    #[test]
    fn test_fork_fails_cleanly_without_root_frame() {
        let (mut space, alloc) = space(1);
        anon(&mut space, 0x2000, 0x1000).unwrap();
        assert_eq!(space.fork().err(), Some(MemError::OutOfMemory));
        assert_eq!(space.region_count(), 1);
        assert_eq!(alloc.free_frames(), 0);
    }

    #[test]
    fn test_dropped_fork_leaves_parent_writable() {
        let (mut space, alloc) = space(8);
        anon(&mut space, 0x2000, 0x1000).unwrap();
        touch(&mut space, 0x2000, AccessKind::Write);
        let free = alloc.free_frames();

        let pending = space.fork().unwrap();
        assert_eq!(pending.child().region_count(), 1);
        drop(pending);

        let (_, flags) = space.pmap().query(VirtAddr::new(0x2000)).unwrap();
        assert!(flags.is_writable());
        let region = space.find_region(VirtAddr::new(0x2000)).unwrap();
        assert!(!region.anon().unwrap().lookup(0).unwrap().shared);
        assert_eq!(alloc.free_frames(), free);
    }

    #[test]
    fn test_commit_downgrades_private_pages_only() {
        let (mut space, _) = space(8);
        anon(&mut space, 0x2000, 0x1000).unwrap();
        let shared = RegionFlags::URW | RegionFlags::SHARED;
        space.install(Some(VirtAddr::new(0x3000)), 0x1000, shared, Backing::Anonymous).unwrap();
        touch(&mut space, 0x2000, AccessKind::Write);
        touch(&mut space, 0x3000, AccessKind::Write);

        let child = space.fork().unwrap().commit();
        assert_eq!(child.region_count(), 2);
        assert_eq!(child.pmap().mapped_pages(), 0);
        assert!(!space.pmap().query(VirtAddr::new(0x2000)).unwrap().1.is_writable());
        assert!(space.pmap().query(VirtAddr::new(0x3000)).unwrap().1.is_writable());
    }
}
