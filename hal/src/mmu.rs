//! # MMU Abstraction
//!
//! Traits for the architecture-owned virtual-to-physical translation tables.
//!
//! The kernel core treats a page table as an opaque capability: it can add a
//! translation, remove one, change protection and make the table current.
//! Both traits are object safe so the memory subsystem can hold a
//! `Box<dyn PageTable>` without being generic over the architecture.

use alloc::boxed::Box;

use bitflags::bitflags;

use crate::{HalResult, PhysAddr, VirtAddr};

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// Page is present in memory
        const PRESENT = 1 << 0;
        /// Page is writable
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode
        const USER = 1 << 2;
        /// Page caching is disabled
        const NO_CACHE = 1 << 4;
        /// Page has been accessed
        const ACCESSED = 1 << 5;
        /// Page has been written to
        const DIRTY = 1 << 6;
        /// Page is global (not flushed on context switch)
        const GLOBAL = 1 << 8;
        /// Page is not executable (NX bit)
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Flags for kernel data
    pub const fn kernel_data() -> Self {
        Self::PRESENT.union(Self::WRITABLE).union(Self::NO_EXECUTE).union(Self::GLOBAL)
    }

    /// Flags for user data
    pub const fn user_data() -> Self {
        Self::PRESENT.union(Self::WRITABLE).union(Self::USER).union(Self::NO_EXECUTE)
    }

    /// Flags for user read-only data
    pub const fn user_rodata() -> Self {
        Self::PRESENT.union(Self::USER).union(Self::NO_EXECUTE)
    }

    /// Same flags with write permission removed
    pub const fn read_only(self) -> Self {
        self.difference(Self::WRITABLE)
    }

    /// Whether a write through this entry is allowed
    pub const fn is_writable(self) -> bool {
        self.contains(Self::PRESENT.union(Self::WRITABLE))
    }
}

/// A single hardware translation table
pub trait PageTable: Send + Sync {
    /// Map a virtual page to a physical frame
    ///
    /// # Safety
    /// The caller must keep `phys` alive for as long as the translation exists.
    unsafe fn map(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> HalResult<()>;

    /// Unmap a virtual page, returning the frame it pointed at
    fn unmap(&mut self, virt: VirtAddr) -> HalResult<PhysAddr>;

    /// Replace the flags of an existing translation
    fn update_flags(&mut self, virt: VirtAddr, flags: PageFlags) -> HalResult<()>;

    /// Look up the translation for a page
    fn query(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)>;

    /// Check whether a page is mapped
    fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.query(virt).is_some()
    }

    /// Physical address of the root table
    fn root_physical_address(&self) -> PhysAddr;
}

/// MMU capability
pub trait Mmu: Send + Sync {
    /// Create an empty page table rooted in the frame at `root`
    fn create_page_table(&self, root: PhysAddr) -> HalResult<Box<dyn PageTable>>;

    /// Make `table` the active translation table
    ///
    /// # Safety
    /// Every translation reachable from `table` must be valid for the code
    /// that runs after the switch.
    unsafe fn switch_page_table(&self, table: &dyn PageTable);

    /// Root of the currently active table
    fn active_root(&self) -> Option<PhysAddr>;

    /// Invalidate a TLB entry for a specific address
    fn invalidate_tlb(&self, virt: VirtAddr);

    /// Invalidate all TLB entries
    fn invalidate_tlb_all(&self);
}
