//! # Strata HAL - Hardware Abstraction Layer
//!
//! Capability traits the kernel core consumes from the architecture layer.
//!
//! ## Capabilities
//!
//! - [`mmu::PageTable`] / [`mmu::Mmu`]: the hardware address-space handle
//! - [`cpu::Cpu`]: saved-context switching and idling
//! - [`phys::PhysicalMemory`]: byte access to physical frames
//!
//! [`arch_stubs`] provides software implementations of all three so the
//! kernel core can run hosted.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cpu;
pub mod mmu;
pub mod phys;

// Software implementations (hosted runs and tests)
pub mod arch_stubs;

use core::fmt;

use static_assertions::const_assert;

/// Size of a base page and of a physical frame
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: u32 = 12;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1u64 << PAGE_SHIFT == PAGE_SIZE);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Name of the architecture the kernel was built for
        pub const ARCH_NAME: &str = "x86_64";
    } else if #[cfg(target_arch = "aarch64")] {
        /// Name of the architecture the kernel was built for
        pub const ARCH_NAME: &str = "aarch64";
    } else if #[cfg(target_arch = "riscv64")] {
        /// Name of the architecture the kernel was built for
        pub const ARCH_NAME: &str = "riscv64";
    } else {
        /// Name of the architecture the kernel was built for
        pub const ARCH_NAME: &str = "unknown";
    }
}

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported on this architecture
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Hardware reported an error
    HardwareError,
    /// Address is invalid or not aligned
    InvalidAddress,
    /// Page-table memory could not be obtained
    OutOfMemory,
    /// A translation already exists for the page
    AlreadyMapped,
    /// No translation exists for the page
    NotMapped,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotSupported => "operation not supported",
            Self::InvalidParameter => "invalid parameter",
            Self::HardwareError => "hardware error",
            Self::InvalidAddress => "invalid or misaligned address",
            Self::OutOfMemory => "out of page-table memory",
            Self::AlreadyMapped => "page already mapped",
            Self::NotMapped => "page not mapped",
        };
        f.write_str(msg)
    }
}

/// Physical address type (architecture-independent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Frame number of this address
    #[inline]
    pub const fn frame_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Address of the first byte of frame `pfn`
    #[inline]
    pub const fn from_frame_number(pfn: u64) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Align the address down to the given alignment
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#x}", self.0)
    }
}

/// Virtual address type (architecture-independent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Check page alignment
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }

    /// Align the address up to the given alignment
    ///
    /// Saturates at the highest aligned address instead of wrapping.
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        match self.0.checked_add(align - 1) {
            Some(v) => Self(v & !(align - 1)),
            None => Self(u64::MAX & !(align - 1)),
        }
    }

    /// Align the address down to the given alignment
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Start of the page containing this address
    #[inline]
    pub const fn page_base(self) -> Self {
        self.align_down(PAGE_SIZE)
    }

    /// Byte offset within the containing page
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Add an offset, returning `None` on overflow
    #[inline]
    pub const fn checked_add(self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Distance in bytes from `base` to this address
    #[inline]
    pub const fn offset_from(self, base: VirtAddr) -> u64 {
        self.0 - base.0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#x}", self.0)
    }
}

/// Number of pages needed to cover `bytes`
#[inline]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_alignment() {
        let v = VirtAddr::new(0x1234);
        assert_eq!(v.page_base(), VirtAddr::new(0x1000));
        assert_eq!(v.page_offset(), 0x234);
        assert_eq!(v.align_up(PAGE_SIZE), VirtAddr::new(0x2000));
        assert!(!v.is_page_aligned());
        assert!(VirtAddr::new(0x3000).is_page_aligned());
    }

    #[test]
    fn test_align_up_saturates() {
        let v = VirtAddr::new(u64::MAX - 5);
        assert_eq!(v.align_up(PAGE_SIZE), VirtAddr::new(u64::MAX & !(PAGE_SIZE - 1)));
    }

    #[test]
    fn test_frame_numbers() {
        let p = PhysAddr::new(0x5000);
        assert_eq!(p.frame_number(), 5);
        assert_eq!(PhysAddr::from_frame_number(5), p);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(u64::MAX), u64::MAX / PAGE_SIZE + 1);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_arch_name() {
        assert_eq!(ARCH_NAME, "x86_64");
    }
}
