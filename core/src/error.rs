//! # Kernel Errors
//!
//! The error type of the kernel interfaces and its POSIX errno mapping.

use core::fmt;

use strata_execution::ExecError;
use strata_memory::MemError;

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Memory subsystem failure
    Memory(MemError),
    /// Execution subsystem failure
    Exec(ExecError),
    /// Invalid configuration
    Config(&'static str),
}

/// POSIX error numbers returned to user space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum ErrorCode {
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EFAULT = 14,
    EEXIST = 17,
    EINVAL = 22,
    EMFILE = 24,
}

impl ErrorCode {
    /// Raw errno value
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Value a syscall returns in the result register
    pub const fn as_syscall_return(self) -> i64 {
        -(self as i64)
    }
}

impl KernelError {
    /// The errno reported for this error
    pub fn errno(&self) -> ErrorCode {
        match self {
            KernelError::Memory(e) => mem_errno(e),
            KernelError::Exec(e) => match e {
                ExecError::NoCurrentThread
                | ExecError::ThreadNotFound
                | ExecError::ProcessNotFound => ErrorCode::ESRCH,
                ExecError::NoChild => ErrorCode::ECHILD,
                ExecError::WouldBlock => ErrorCode::EAGAIN,
                ExecError::Interrupted => ErrorCode::EINTR,
                ExecError::OutOfMemory => ErrorCode::ENOMEM,
                ExecError::BadFileDescriptor => ErrorCode::EBADF,
                ExecError::TooManyOpenFiles => ErrorCode::EMFILE,
                ExecError::InvalidState
                | ExecError::AlreadyWaiting
                | ExecError::InvalidArgument => ErrorCode::EINVAL,
                ExecError::Memory(e) => mem_errno(e),
            },
            KernelError::Config(_) => ErrorCode::EINVAL,
        }
    }

    /// Whether this is the recoverable exhaustion class
    pub fn is_out_of_memory(&self) -> bool {
        self.errno() == ErrorCode::ENOMEM
    }
}

fn mem_errno(e: &MemError) -> ErrorCode {
    match e {
        MemError::OutOfMemory | MemError::OutOfAddressSpace => ErrorCode::ENOMEM,
        MemError::InvalidAddress | MemError::PermissionDenied | MemError::Hardware(_) => {
            ErrorCode::EFAULT
        }
        MemError::InvalidSize | MemError::NotAligned | MemError::NotMapped => ErrorCode::EINVAL,
        MemError::Overlaps => ErrorCode::EEXIST,
        MemError::FrameInUse => ErrorCode::EAGAIN,
        MemError::Io => ErrorCode::EIO,
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Memory(e) => write!(f, "{}", e),
            KernelError::Exec(e) => write!(f, "{}", e),
            KernelError::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl From<MemError> for KernelError {
    fn from(e: MemError) -> Self {
        KernelError::Memory(e)
    }
}

impl From<ExecError> for KernelError {
    fn from(e: ExecError) -> Self {
        KernelError::Exec(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(KernelError::from(MemError::OutOfMemory).errno(), ErrorCode::ENOMEM);
        assert_eq!(KernelError::from(ExecError::OutOfMemory).errno(), ErrorCode::ENOMEM);
        assert_eq!(KernelError::from(ExecError::NoChild).errno().as_i32(), 10);
        assert_eq!(KernelError::from(ExecError::Interrupted).errno().as_i32(), 4);
        assert_eq!(
            KernelError::from(ExecError::Memory(MemError::Overlaps)).errno(),
            ErrorCode::EEXIST
        );
        assert_eq!(ErrorCode::EBADF.as_syscall_return(), -9);
    }
}
