//! # User Memory Access
//!
//! Copies between kernel buffers and an address space the way the MMU would
//! perform them: each page is looked up in the pmap and faulted in when it
//! is missing or write-protected.

use strata_hal::{VirtAddr, PAGE_SIZE};

use crate::fault::{handle_page_fault, FaultResolution};
use crate::physical::FrameRef;
use crate::protection::AccessKind;
use crate::virtual_memory::AddressSpace;
use crate::{MemError, MemResult};

/// Frame backing `page`, faulting it in for `access` if needed
fn resident(space: &mut AddressSpace, page: VirtAddr, access: AccessKind) -> MemResult<FrameRef> {
    // A present translation says nothing about what the region allows now
    if !space.find_region(page).is_some_and(|r| r.flags().permits(access)) {
        return Err(MemError::PermissionDenied);
    }
    for _ in 0..2 {
        let usable = space
            .pmap()
            .query(page)
            .is_some_and(|(_, flags)| access != AccessKind::Write || flags.is_writable());
        if usable {
            if let Some(frame) = space.pmap().frame(page) {
                return Ok(frame.clone());
            }
        }
        if handle_page_fault(space, page, access)? == FaultResolution::Denied {
            return Err(MemError::PermissionDenied);
        }
    }
    Err(MemError::NotMapped)
}

/// Walk `[vaddr, vaddr + len)` one page-bounded chunk at a time
fn for_each_chunk<F>(
    space: &mut AddressSpace,
    vaddr: VirtAddr,
    len: usize,
    access: AccessKind,
    mut f: F,
) -> MemResult<()>
where
    F: FnMut(&FrameRef, usize, core::ops::Range<usize>) -> MemResult<()>,
{
    vaddr.checked_add(len as u64).ok_or(MemError::InvalidAddress)?;
    let mut done = 0;
    while done < len {
        let addr = vaddr.add(done as u64);
        let offset = addr.page_offset() as usize;
        let chunk = (PAGE_SIZE as usize - offset).min(len - done);
        let frame = resident(space, addr.page_base(), access)?;
        f(&frame, offset, done..done + chunk)?;
        done += chunk;
    }
    Ok(())
}

/// Copy `buf.len()` bytes out of `space` starting at `vaddr`
pub fn copy_from_user(space: &mut AddressSpace, vaddr: VirtAddr, buf: &mut [u8]) -> MemResult<()> {
    let len = buf.len();
    for_each_chunk(space, vaddr, len, AccessKind::Read, |frame, offset, range| {
        frame.read(offset, &mut buf[range])
    })
}

/// Copy `data` into `space` starting at `vaddr`
pub fn copy_to_user(space: &mut AddressSpace, vaddr: VirtAddr, data: &[u8]) -> MemResult<()> {
    for_each_chunk(space, vaddr, data.len(), AccessKind::Write, |frame, offset, range| {
        frame.write(offset, &data[range])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::FrameAllocator;
    use crate::protection::RegionFlags;
    use crate::virtual_memory::{Backing, SpaceKind};
    use crate::VirtRange;
    use alloc::sync::Arc;
    use strata_hal::arch_stubs::{SoftMmu, SoftRam};
    use strata_hal::PhysAddr;

    fn setup() -> AddressSpace {
        let ram = Arc::new(SoftRam::new(PhysAddr::new(0), 16));
        let alloc = FrameAllocator::new(PhysAddr::new(0), 16, ram).unwrap();
        let range = VirtRange::new(VirtAddr::new(0x1000), VirtAddr::new(0x10_0000));
        AddressSpace::new(SpaceKind::User, range, Arc::new(SoftMmu::new()), alloc).unwrap()
    }

    #[test]
    fn test_copy_across_page_boundary() {
        let mut space = setup();
        space
            .install(Some(VirtAddr::new(0x2000)), 0x2000, RegionFlags::URW, Backing::Anonymous)
            .unwrap();
        let data = [1u8, 2, 3, 4, 5, 6];
        copy_to_user(&mut space, VirtAddr::new(0x2ffd), &data).unwrap();
        assert_eq!(space.pmap().mapped_pages(), 2);
        let mut back = [0u8; 6];
        copy_from_user(&mut space, VirtAddr::new(0x2ffd), &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_copy_denied() {
        let mut space = setup();
        space
            .install(Some(VirtAddr::new(0x2000)), 0x1000, RegionFlags::UR, Backing::Anonymous)
            .unwrap();
        let denied = copy_to_user(&mut space, VirtAddr::new(0x2000), &[1]);
        assert_eq!(denied, Err(MemError::PermissionDenied));
        let mut buf = [0u8; 2];
        assert_eq!(
            copy_from_user(&mut space, VirtAddr::new(0x2fff), &mut buf),
            Err(MemError::PermissionDenied)
        );
    }

    #[test]
    fn test_copy_checks_current_region_flags() {
        let mut space = setup();
        let base = VirtAddr::new(0x2000);
        space.install(Some(base), 0x1000, RegionFlags::URW, Backing::Anonymous).unwrap();
        copy_to_user(&mut space, base, &[0x5A; 4]).unwrap();

        space.protect(base, RegionFlags::UR).unwrap();
        assert_eq!(copy_to_user(&mut space, base, &[1]), Err(MemError::PermissionDenied));

        space.protect(base, RegionFlags::USER).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(copy_from_user(&mut space, base, &mut buf), Err(MemError::PermissionDenied));
        assert_eq!(buf, [0; 4]);

        space.protect(base, RegionFlags::URW).unwrap();
        copy_from_user(&mut space, base, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; 4]);
    }
}
