//! # Thread Management
//!
//! Thread records, their state machine and the arena that owns them.

pub mod arena;
pub mod states;
pub mod thread;

pub use arena::ThreadArena;
pub use states::{SleepKind, ThreadState, WaitResult};
pub use thread::{KernelStack, Thread, ThreadFlags};
