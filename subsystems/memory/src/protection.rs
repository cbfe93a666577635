//! # Memory Protection
//!
//! Region permission flags and the access kinds a fault reports.

use core::fmt;

use bitflags::bitflags;
use strata_hal::mmu::PageFlags;

bitflags! {
    /// Protection and sharing flags of a mapping region
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// Read access
        const READ = 1 << 0;
        /// Write access
        const WRITE = 1 << 1;
        /// Execute access
        const EXECUTE = 1 << 2;
        /// Accessible from user mode
        const USER = 1 << 3;
        /// Writes are visible to every space mapping the same store
        const SHARED = 1 << 4;
        /// Kernel read + write
        const KRW = Self::READ.bits() | Self::WRITE.bits();
        /// User read-only
        const UR = Self::READ.bits() | Self::USER.bits();
        /// User read + write
        const URW = Self::READ.bits() | Self::WRITE.bits() | Self::USER.bits();
        /// User read + execute
        const URX = Self::READ.bits() | Self::EXECUTE.bits() | Self::USER.bits();
    }
}

impl RegionFlags {
    /// Whether an access of `kind` is allowed
    pub fn permits(self, kind: AccessKind) -> bool {
        match kind {
            AccessKind::Read => self.contains(Self::READ),
            AccessKind::Write => self.contains(Self::WRITE),
            AccessKind::Execute => self.contains(Self::EXECUTE),
        }
    }

    /// Whether writes stay private to one address space
    pub fn is_private_writable(self) -> bool {
        self.contains(Self::WRITE) && !self.contains(Self::SHARED)
    }

    /// Hardware flags for a present page of the region
    ///
    /// Present pages are always readable, so a region without READ must keep
    /// its pages unmapped; [`AddressSpace::protect`] does that.
    ///
    /// [`AddressSpace::protect`]: crate::virtual_memory::AddressSpace::protect
    pub fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::PRESENT;
        if self.contains(Self::WRITE) {
            flags |= PageFlags::WRITABLE;
        }
        if self.contains(Self::USER) {
            flags |= PageFlags::USER;
        } else {
            flags |= PageFlags::GLOBAL;
        }
        if !self.contains(Self::EXECUTE) {
            flags |= PageFlags::NO_EXECUTE;
        }
        flags
    }
}

impl fmt::Display for RegionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag, c| if self.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}{}",
            bit(Self::READ, 'r'),
            bit(Self::WRITE, 'w'),
            bit(Self::EXECUTE, 'x'),
            bit(Self::USER, 'u'),
            bit(Self::SHARED, 's'),
        )
    }
}

/// Kind of memory access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Data read
    Read,
    /// Data write
    Write,
    /// Instruction fetch
    Execute,
}
