//! # Thread Structure
//!
//! Core thread data structure.

use alloc::vec::Vec;

use strata_hal::cpu::SavedContext;
use strata_hal::{PhysAddr, PAGE_SIZE};
use strata_memory::{FrameAllocator, FrameRef};

use super::{ThreadState, WaitResult};
use crate::scheduler::WaitQueueId;
use crate::{ExecResult, ProcessId, ThreadId};

/// Thread flags
pub mod flags {
    use bitflags::bitflags;

    bitflags! {
        /// Thread flags
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct ThreadFlags: u32 {
            /// Thread is a kernel thread
            const KERNEL = 1 << 0;
            /// Thread is the child side of a fork
            const FORKED = 1 << 1;
        }
    }
}

pub use flags::ThreadFlags;

/// Thread structure
///
/// Owned by the scheduler's arena. Fields that the scheduler's invariants
/// depend on are only writable inside this crate.
pub struct Thread {
    /// Unique identifier
    id: ThreadId,
    /// Owning process
    process: ProcessId,
    /// Current state
    pub(crate) state: ThreadState,
    /// Flags
    flags: ThreadFlags,
    /// Saved CPU context, valid while the thread is off-CPU
    pub(crate) context: SavedContext,
    /// Kernel stack
    kernel_stack: KernelStack,
    /// Wait queue the thread currently belongs to
    pub(crate) wait: Option<WaitQueueId>,
    /// How the last sleep ended, consumed by the sleeper
    pub(crate) wake: Option<WaitResult>,
    /// Present in the run queue
    pub(crate) queued: bool,
    /// Currently executing
    pub(crate) on_cpu: bool,
    /// Exit code
    exit_code: Option<i32>,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        process: ProcessId,
        context: SavedContext,
        kernel_stack: KernelStack,
        flags: ThreadFlags,
    ) -> Self {
        Self {
            id,
            process,
            state: ThreadState::Runnable,
            flags,
            context,
            kernel_stack,
            wait: None,
            wake: None,
            queued: false,
            on_cpu: false,
            exit_code: None,
        }
    }

    /// Get thread ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Get process ID
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Get current state
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Get flags
    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    /// Check if kernel thread
    pub fn is_kernel(&self) -> bool {
        self.flags.contains(ThreadFlags::KERNEL)
    }

    /// Saved context
    pub fn context(&self) -> &SavedContext {
        &self.context
    }

    /// Mutable saved context, for syscall return values and signal setup
    pub fn context_mut(&mut self) -> &mut SavedContext {
        &mut self.context
    }

    /// Kernel stack
    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }

    /// Wait queue the thread sleeps on
    pub fn waiting_on(&self) -> Option<WaitQueueId> {
        self.wait
    }

    /// Whether the thread is executing right now
    pub fn is_on_cpu(&self) -> bool {
        self.on_cpu
    }

    /// Exit code, once the thread has exited
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub(crate) fn set_exit_code(&mut self, code: i32) {
        self.exit_code = Some(code);
    }
}

/// Kernel stack
///
/// Physically contiguous frames, reached through the kernel's direct map.
/// Dropping the stack returns the frames.
pub struct KernelStack {
    frames: Vec<FrameRef>,
}

impl KernelStack {
    /// Default kernel stack size in pages
    pub const DEFAULT_PAGES: usize = 2;

    /// Allocate a kernel stack of `pages` pages
    pub fn allocate(allocator: &FrameAllocator, pages: usize) -> ExecResult<Self> {
        let frames = allocator.allocate_contiguous(pages)?;
        Ok(Self { frames })
    }

    /// Get stack base (lowest address)
    pub fn base(&self) -> PhysAddr {
        self.frames
            .first()
            .map(FrameRef::address)
            .unwrap_or_default()
    }

    /// Get stack top (highest address)
    pub fn top(&self) -> PhysAddr {
        self.base().add(self.size() as u64)
    }

    /// Get stack size in bytes
    pub fn size(&self) -> usize {
        self.frames.len() * PAGE_SIZE as usize
    }
}
