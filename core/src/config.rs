//! # Kernel Configuration

use strata_execution::fork::CHILD_EXIT_QUEUE;
use strata_hal::VirtAddr;

use crate::error::{KernelError, KernelResult};

/// Configuration for the kernel core
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Lowest user virtual address
    pub user_base: VirtAddr,
    /// End of the user virtual range (exclusive)
    pub user_top: VirtAddr,
    /// Lowest kernel virtual address
    pub kernel_base: VirtAddr,
    /// End of the kernel virtual range (exclusive)
    pub kernel_top: VirtAddr,
    /// Kernel stack size, in pages
    pub kernel_stack_pages: usize,
    /// User stack size for new threads, in pages
    pub user_stack_pages: usize,
    /// Descriptor limit per process
    pub max_open_files: usize,
    /// Where a process's program break starts
    pub heap_base: VirtAddr,
    /// Name given to every process's child-exit queue
    pub child_exit_queue: &'static str,
}

impl KernelConfig {
    /// Default first user address, leaving page zero unmapped
    pub const USER_BASE: u64 = 0x1000;
    /// Default end of the user half
    pub const USER_TOP: u64 = 0x0000_8000_0000_0000;
    /// Default start of the kernel half
    pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;
    /// Default end of the kernel half
    pub const KERNEL_TOP: u64 = 0xFFFF_FFFF_FFFF_F000;
    /// Default program-break base
    pub const HEAP_BASE: u64 = 0x0000_1000_0000_0000;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            user_base: VirtAddr::new(Self::USER_BASE),
            user_top: VirtAddr::new(Self::USER_TOP),
            kernel_base: VirtAddr::new(Self::KERNEL_BASE),
            kernel_top: VirtAddr::new(Self::KERNEL_TOP),
            kernel_stack_pages: 2,
            user_stack_pages: 8,
            max_open_files: 64,
            heap_base: VirtAddr::new(Self::HEAP_BASE),
            child_exit_queue: CHILD_EXIT_QUEUE,
        }
    }

    /// Set the user address range
    pub fn with_user_range(mut self, base: VirtAddr, top: VirtAddr) -> Self {
        self.user_base = base;
        self.user_top = top;
        self
    }

    /// Set the kernel address range
    pub fn with_kernel_range(mut self, base: VirtAddr, top: VirtAddr) -> Self {
        self.kernel_base = base;
        self.kernel_top = top;
        self
    }

    /// Set the kernel stack size
    pub fn with_kernel_stack_pages(mut self, pages: usize) -> Self {
        self.kernel_stack_pages = pages;
        self
    }

    /// Set the user stack size
    pub fn with_user_stack_pages(mut self, pages: usize) -> Self {
        self.user_stack_pages = pages;
        self
    }

    /// Set the descriptor limit
    pub fn with_max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }

    /// Set the program-break base
    pub fn with_heap_base(mut self, base: VirtAddr) -> Self {
        self.heap_base = base;
        self
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> KernelResult<()> {
        let aligned = [
            self.user_base,
            self.user_top,
            self.kernel_base,
            self.kernel_top,
            self.heap_base,
        ]
        .iter()
        .all(|a| a.is_page_aligned());
        if !aligned {
            return Err(KernelError::Config("addresses must be page aligned"));
        }
        if self.user_base >= self.user_top || self.kernel_base >= self.kernel_top {
            return Err(KernelError::Config("empty address range"));
        }
        if self.user_top > self.kernel_base && self.kernel_top > self.user_base {
            return Err(KernelError::Config("user and kernel ranges overlap"));
        }
        if self.heap_base < self.user_base || self.heap_base >= self.user_top {
            return Err(KernelError::Config("heap base outside the user range"));
        }
        if self.kernel_stack_pages == 0 || self.user_stack_pages == 0 {
            return Err(KernelError::Config("stacks need at least one page"));
        }
        if self.max_open_files == 0 {
            return Err(KernelError::Config("descriptor limit is zero"));
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_layouts() {
        let overlap = KernelConfig::new()
            .with_kernel_range(VirtAddr::new(0x2000), VirtAddr::new(0x10_0000));
        assert!(overlap.validate().is_err());

        let unaligned = KernelConfig::new().with_heap_base(VirtAddr::new(0x1001));
        assert!(unaligned.validate().is_err());

        let no_stack = KernelConfig::new().with_user_stack_pages(0);
        assert!(no_stack.validate().is_err());
    }
}
