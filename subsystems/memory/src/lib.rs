//! # Strata Memory Subsystem
//!
//! The memory subsystem provides:
//! - Reference-counted physical frame allocation
//! - The pmap, a counted-ownership wrapper around the hardware page table
//! - File-backed and anonymous (copy-on-write) backing stores
//! - Address spaces built from disjoint mapping regions
//! - Page fault resolution and user-memory copies
//!
//! ## Ownership
//!
//! Frames are never owned by anything but the [`physical::FrameAllocator`].
//! Every other structure holds a [`physical::FrameRef`], whose `Clone` and
//! `Drop` are the only way a frame's reference count ever changes.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod fault;
pub mod physical;
pub mod protection;
pub mod uaccess;
pub mod virtual_memory;

use core::fmt;

use strata_hal::{HalError, VirtAddr};

pub use fault::{handle_page_fault, FaultResolution};
pub use physical::{FrameAllocator, FrameRef};
pub use protection::{AccessKind, RegionFlags};
pub use virtual_memory::{
    AddressSpace, Backing, FileError, FileObject, FileReader, MappingRegion, PendingFork, Pmap,
    SpaceKind,
};

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No free frame or structure memory is left
    OutOfMemory,
    /// Address outside any managed range
    InvalidAddress,
    /// Zero or otherwise unusable size
    InvalidSize,
    /// Address not aligned
    NotAligned,
    /// Region overlaps an existing one
    Overlaps,
    /// No gap large enough is left in the address space
    OutOfAddressSpace,
    /// No region or page at the address
    NotMapped,
    /// Access not allowed by the region flags
    PermissionDenied,
    /// Frame still has holders
    FrameInUse,
    /// The file read collaborator failed
    Io,
    /// The hardware layer rejected the operation
    Hardware(HalError),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::InvalidSize => write!(f, "invalid size"),
            Self::NotAligned => write!(f, "address not page aligned"),
            Self::Overlaps => write!(f, "region overlaps an existing mapping"),
            Self::OutOfAddressSpace => write!(f, "no room left in address space"),
            Self::NotMapped => write!(f, "address not mapped"),
            Self::PermissionDenied => write!(f, "access not permitted"),
            Self::FrameInUse => write!(f, "frame still referenced"),
            Self::Io => write!(f, "backing file read failed"),
            Self::Hardware(e) => write!(f, "hardware: {}", e),
        }
    }
}

impl From<HalError> for MemError {
    fn from(e: HalError) -> Self {
        match e {
            HalError::OutOfMemory => Self::OutOfMemory,
            other => Self::Hardware(other),
        }
    }
}

/// Memory statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Total frames managed
    pub total_frames: usize,
    /// Frames available for allocation
    pub free_frames: usize,
    /// Frames withheld from allocation
    pub reserved_frames: usize,
    /// Successful allocations
    pub allocations: u64,
    /// Frames returned to the free pool
    pub deallocations: u64,
    /// Failed allocations
    pub failures: u64,
}

/// Half-open range `[start, end)` of virtual memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtRange {
    /// First byte
    pub start: VirtAddr,
    /// One past the last byte
    pub end: VirtAddr,
}

impl VirtRange {
    /// Create a new range
    pub const fn new(start: VirtAddr, end: VirtAddr) -> Self {
        Self { start, end }
    }

    /// Length in bytes
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    /// Whether the range is empty
    pub const fn is_empty(&self) -> bool {
        self.end.as_u64() <= self.start.as_u64()
    }

    /// Check if address is within this range
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }
}
