//! # Strata Execution Subsystem
//!
//! The execution subsystem manages:
//! - Threads, their state machine and saved contexts
//! - Processes and the process table
//! - The FIFO run queue and arena-indexed wait queues
//! - Open-file tables and pending signals
//! - The fork engine
//!
//! There is no global "current thread". Every operation that needs one takes
//! the [`context::SchedulerContext`] of the executing CPU, and only the
//! scheduler's switch step changes it.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod context;
pub mod fd_table;
pub mod fork;
pub mod process;
pub mod scheduler;
pub mod signal;
pub mod thread;

use core::fmt;

use strata_memory::MemError;

pub use context::{SchedulerContext, SwitchReason};
pub use process::{ExitStatus, Process, ProcessTable};
pub use scheduler::{Scheduler, WaitQueueId};
pub use signal::Signal;
pub use thread::{SleepKind, Thread, ThreadState, WaitResult};

/// Thread identifier: a slot in the thread arena plus the slot's generation
///
/// A stale id from a reaped thread never matches the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    slot: u32,
    generation: u32,
}

impl ThreadId {
    pub(crate) const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub(crate) const fn slot(self) -> usize {
        self.slot as usize
    }

    pub(crate) const fn generation(self) -> u32 {
        self.generation
    }

    /// Get the raw ID value
    pub const fn as_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}.{}", self.slot, self.generation)
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    /// The kernel itself
    pub const KERNEL: Self = Self(0);

    /// The first user process, adopter of orphans
    pub const INIT: Self = Self(1);

    /// Create a process ID from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw ID value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution result type
pub type ExecResult<T> = Result<T, ExecError>;

/// Execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// The CPU is idle
    NoCurrentThread,
    /// Thread not found
    ThreadNotFound,
    /// Process not found
    ProcessNotFound,
    /// The caller has no such child
    NoChild,
    /// Thread or process is in the wrong state for the operation
    InvalidState,
    /// The thread already sleeps on a queue
    AlreadyWaiting,
    /// The wait has not been completed yet
    WouldBlock,
    /// A signal ended the wait
    Interrupted,
    /// Frame or structure allocation failed
    OutOfMemory,
    /// No such open file
    BadFileDescriptor,
    /// The open-file table is full
    TooManyOpenFiles,
    /// Invalid argument
    InvalidArgument,
    /// Memory subsystem failure
    Memory(MemError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCurrentThread => write!(f, "no current thread"),
            Self::ThreadNotFound => write!(f, "thread not found"),
            Self::ProcessNotFound => write!(f, "process not found"),
            Self::NoChild => write!(f, "no child process"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::AlreadyWaiting => write!(f, "thread already waiting"),
            Self::WouldBlock => write!(f, "wait still pending"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::BadFileDescriptor => write!(f, "bad file descriptor"),
            Self::TooManyOpenFiles => write!(f, "too many open files"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Memory(e) => write!(f, "memory: {}", e),
        }
    }
}

impl From<MemError> for ExecError {
    fn from(e: MemError) -> Self {
        match e {
            MemError::OutOfMemory => Self::OutOfMemory,
            other => Self::Memory(other),
        }
    }
}
