//! # Mapping Regions
//!
//! A region is a page-aligned virtual range with uniform permissions. Its
//! contents come from up to two layers: an optional file object and an
//! optional anonymous overlay. Faults look in the overlay first, then the
//! file, and fall back to a zero page.

use alloc::sync::Arc;
use core::fmt;

use strata_hal::VirtAddr;

use super::anon::AnonStore;
use super::object::FileObject;
use crate::protection::RegionFlags;
use crate::MemResult;

/// Source of a new region's contents
#[derive(Debug, Clone)]
pub enum Backing {
    /// Zero-filled on first touch
    Anonymous,
    /// Pages of a file, starting at byte `offset`
    File {
        /// File page cache
        object: Arc<FileObject>,
        /// Page-aligned offset of the region start in the file
        offset: u64,
    },
}

/// A contiguous virtual range with uniform permissions
pub struct MappingRegion {
    base: VirtAddr,
    len: u64,
    flags: RegionFlags,
    object: Option<Arc<FileObject>>,
    offset: u64,
    anon: Option<Arc<AnonStore>>,
}

impl MappingRegion {
    /// Create a region; `base` and `len` are validated on insertion
    pub fn new(base: VirtAddr, len: u64, flags: RegionFlags, backing: Backing) -> Self {
        let (object, offset, anon) = match backing {
            Backing::Anonymous => (None, 0, Some(AnonStore::new())),
            Backing::File { object, offset } => (Some(object), offset, None),
        };
        Self { base, len, flags, object, offset, anon }
    }

    /// First address
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the region covers no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last address
    pub fn end(&self) -> VirtAddr {
        self.base.add(self.len)
    }

    /// Protection and sharing flags
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// File object, if file backed
    pub fn object(&self) -> Option<&Arc<FileObject>> {
        self.object.as_ref()
    }

    /// File offset of the region start
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Anonymous overlay, if any page has one
    pub fn anon(&self) -> Option<&Arc<AnonStore>> {
        self.anon.as_ref()
    }

    /// Check if address is within this region
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Check whether `[start, end)` intersects this region
    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        start < self.end() && self.base < end
    }

    /// Key of `page` in the anonymous overlay
    pub fn anon_offset(&self, page: VirtAddr) -> u64 {
        page.offset_from(self.base)
    }

    /// Key of `page` in the file object
    pub fn object_offset(&self, page: VirtAddr) -> u64 {
        self.offset + page.offset_from(self.base)
    }

    /// Overlay, creating an empty one on first use
    pub(crate) fn anon_or_create(&mut self) -> &Arc<AnonStore> {
        self.anon.get_or_insert_with(AnonStore::new)
    }

    pub(crate) fn set_flags(&mut self, flags: RegionFlags) {
        self.flags = flags;
    }

    /// Change the length, dropping overlay pages past a shrunk end
    pub(crate) fn set_len(&mut self, len: u64) {
        if len < self.len {
            if let Some(anon) = &self.anon {
                anon.truncate(len);
            }
        }
        self.len = len;
    }

    /// The child's copy of this region for fork
    ///
    /// Shared regions hand the child the same overlay. Private ones give it
    /// a copy of the overlay's page table that shares every page.
    pub(crate) fn fork(&self) -> MemResult<MappingRegion> {
        let anon = match &self.anon {
            Some(anon) if self.flags.contains(RegionFlags::SHARED) => Some(Arc::clone(anon)),
            Some(anon) => Some(anon.share()?),
            None => None,
        };
        Ok(MappingRegion {
            base: self.base,
            len: self.len,
            flags: self.flags,
            object: self.object.clone(),
            offset: self.offset,
            anon,
        })
    }
}

impl fmt::Debug for MappingRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("flags", &self.flags)
            .field("file", &self.object.as_ref().map(|o| o.file_id()))
            .field("anon", &self.anon)
            .finish()
    }
}

impl fmt::Display for MappingRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x} {}", self.base.as_u64(), self.end().as_u64(), self.flags)?;
        if let Some(object) = &self.object {
            write!(f, " file {} +{:#x}", object.file_id(), self.offset)?;
        }
        Ok(())
    }
}
