//! # CPU Abstraction
//!
//! The register-context primitives the scheduler needs: a saved context
//! record and a capability that switches between two of them.

use crate::VirtAddr;

/// Number of general-purpose registers carried in a [`SavedContext`]
pub const SAVED_REGISTERS: usize = 16;

/// Register index holding the syscall return value
const RETURN_REGISTER: usize = 0;

/// Register index of the first syscall argument
const FIRST_ARG_REGISTER: usize = 1;

/// Architecture-opaque saved register state of a thread
///
/// The core only reads and writes the instruction pointer, the stack pointer,
/// the return-value register and the argument registers. Everything else is
/// carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct SavedContext {
    /// Instruction pointer
    pub ip: u64,
    /// Stack pointer
    pub sp: u64,
    /// General-purpose registers
    pub regs: [u64; SAVED_REGISTERS],
    /// Flags register
    pub flags: u64,
    /// Whether the context returns to user mode
    pub user: bool,
}

impl SavedContext {
    /// Context that starts running kernel code at `entry`
    pub const fn new_kernel(entry: VirtAddr, stack: VirtAddr) -> Self {
        Self {
            ip: entry.as_u64(),
            sp: stack.as_u64(),
            regs: [0; SAVED_REGISTERS],
            flags: 0,
            user: false,
        }
    }

    /// Context that starts running user code at `entry`
    pub const fn new_user(entry: VirtAddr, stack: VirtAddr) -> Self {
        Self {
            ip: entry.as_u64(),
            sp: stack.as_u64(),
            regs: [0; SAVED_REGISTERS],
            flags: 0,
            user: true,
        }
    }

    /// Instruction pointer
    pub const fn instruction_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.ip)
    }

    /// Stack pointer
    pub const fn stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.sp)
    }

    /// Value returned to the interrupted code
    pub const fn return_value(&self) -> u64 {
        self.regs[RETURN_REGISTER]
    }

    /// Set the value returned to the interrupted code
    pub fn set_return_value(&mut self, value: u64) {
        self.regs[RETURN_REGISTER] = value;
    }

    /// Syscall argument `index` (zero based)
    pub fn syscall_arg(&self, index: usize) -> u64 {
        self.regs.get(FIRST_ARG_REGISTER + index).copied().unwrap_or(0)
    }

    /// Set syscall argument `index`
    pub fn set_syscall_arg(&mut self, index: usize, value: u64) {
        if let Some(slot) = self.regs.get_mut(FIRST_ARG_REGISTER + index) {
            *slot = value;
        }
    }
}

impl Default for SavedContext {
    fn default() -> Self {
        Self::new_kernel(VirtAddr::new(0), VirtAddr::new(0))
    }
}

/// Context-switch capability of the executing CPU
pub trait Cpu: Send + Sync {
    /// Save the running register state into `into`
    fn save_context(&self, into: &mut SavedContext);

    /// Save the running state into `from` (if any) and resume `to`
    ///
    /// Returns once something switches back to `from`. With `from == None`
    /// the current state is discarded.
    ///
    /// # Safety
    /// `to` must describe a context whose stack and address space are valid.
    unsafe fn resume_context(&self, from: Option<&mut SavedContext>, to: &SavedContext);

    /// Idle until the next interrupt
    fn halt(&self);

    /// Enable interrupts
    ///
    /// # Safety
    /// Enabling interrupts may cause immediate interrupt handling.
    unsafe fn enable_interrupts(&self);

    /// Disable interrupts
    ///
    /// # Safety
    /// Disabling interrupts for too long can cause system issues.
    unsafe fn disable_interrupts(&self);

    /// Check if interrupts are enabled
    fn interrupts_enabled(&self) -> bool;
}
