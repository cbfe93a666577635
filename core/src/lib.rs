//! # Strata Kernel Core
//!
//! The memory-management and scheduling core of the kernel, packaged as a
//! single [`Kernel`] object. The trap layer calls into it on page faults,
//! syscalls and timer ticks; the program loader uses it to build address
//! spaces.
//!
//! ## Locking
//!
//! All kernel state sits behind one lock. Every interface takes it on entry.
//! Interfaces that may switch threads hold the lock across the switch, and
//! the thread that resumes releases it when its own interface returns.
//! Lock ownership thus travels with the CPU. A thread dispatched for the first
//! time never returns through an interface, so it must call
//! [`Kernel::release_after_first_dispatch`] before entering user mode.
//!
//! ## Current thread
//!
//! There is no hidden "current thread". The trap layer owns the
//! [`SchedulerContext`] of its CPU and passes it to every interface that acts
//! on the running thread.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod error;
mod kernel;
mod memory;
mod process;

use alloc::sync::Arc;

use strata_hal::cpu::Cpu;
use strata_hal::mmu::Mmu;
use strata_hal::phys::PhysicalMemory;
use strata_hal::PhysAddr;

pub use config::KernelConfig;
pub use error::{ErrorCode, KernelError, KernelResult};
pub use kernel::Kernel;
pub use memory::FaultOutcome;

pub use strata_execution::{
    ExitStatus, ProcessId, SchedulerContext, Signal, SleepKind, ThreadId, ThreadState,
    WaitQueueId, WaitResult,
};
pub use strata_memory::{AccessKind, Backing, RegionFlags};

/// Hardware capabilities the kernel runs on
#[derive(Clone)]
pub struct Platform {
    /// Access to physical memory
    pub memory: Arc<dyn PhysicalMemory>,
    /// Page-table capability
    pub mmu: Arc<dyn Mmu>,
    /// Context-switch capability
    pub cpu: Arc<dyn Cpu>,
    /// First managed physical frame
    pub phys_base: PhysAddr,
    /// Number of managed frames
    pub frames: usize,
}
