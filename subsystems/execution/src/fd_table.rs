//! # Open-File Tables
//!
//! Per-process descriptor tables. Descriptors index into a slot vector; an
//! open file is shared between tables after a fork, so its offset is shared
//! too.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;
use strata_memory::FileReader;

use crate::{ExecError, ExecResult};

bitflags! {
    /// Open-file flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Closed by exec
        const CLOEXEC = 1 << 2;
    }
}

/// An open file description
pub struct OpenFile {
    file: Arc<dyn FileReader>,
    flags: OpenFlags,
    offset: Mutex<u64>,
}

impl OpenFile {
    /// Open `file` at offset zero
    pub fn new(file: Arc<dyn FileReader>, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            file,
            flags,
            offset: Mutex::new(0),
        })
    }

    /// The underlying file
    pub fn file(&self) -> &Arc<dyn FileReader> {
        &self.file
    }

    /// Open flags
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Current offset
    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    /// Read at the current offset and advance it
    pub fn read(&self, buf: &mut [u8]) -> ExecResult<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(ExecError::BadFileDescriptor);
        }
        let mut offset = self.offset.lock();
        let n = self
            .file
            .read(*offset, buf)
            .map_err(|_| ExecError::InvalidArgument)?;
        *offset += n as u64;
        Ok(n)
    }
}

/// A descriptor table
pub struct FileTable {
    slots: Vec<Option<Arc<OpenFile>>>,
    max: usize,
}

impl FileTable {
    /// Create an empty table holding at most `max` descriptors
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            max,
        }
    }

    /// Install `file` in the lowest free descriptor
    pub fn install(&mut self, file: Arc<OpenFile>) -> ExecResult<usize> {
        if let Some(fd) = self.slots.iter().position(Option::is_none) {
            self.slots[fd] = Some(file);
            return Ok(fd);
        }
        if self.slots.len() >= self.max {
            return Err(ExecError::TooManyOpenFiles);
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| ExecError::OutOfMemory)?;
        self.slots.push(Some(file));
        Ok(self.slots.len() - 1)
    }

    /// Look up a descriptor
    pub fn get(&self, fd: usize) -> ExecResult<&Arc<OpenFile>> {
        self.slots
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(ExecError::BadFileDescriptor)
    }

    /// Close a descriptor
    pub fn close(&mut self, fd: usize) -> ExecResult<Arc<OpenFile>> {
        self.slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(ExecError::BadFileDescriptor)
    }

    /// Copy the table for a child; both tables share the open files
    pub fn duplicate(&self) -> ExecResult<FileTable> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(self.slots.len())
            .map_err(|_| ExecError::OutOfMemory)?;
        slots.extend(self.slots.iter().cloned());
        Ok(FileTable {
            slots,
            max: self.max,
        })
    }

    /// Close every descriptor
    pub fn close_all(&mut self) -> usize {
        let open = self.open_count();
        self.slots.clear();
        open
    }

    /// Close descriptors marked close-on-exec
    pub fn close_on_exec(&mut self) -> usize {
        let mut closed = 0;
        for slot in self.slots.iter_mut() {
            if slot
                .as_ref()
                .is_some_and(|f| f.flags().contains(OpenFlags::CLOEXEC))
            {
                *slot = None;
                closed += 1;
            }
        }
        closed
    }

    /// Number of open descriptors
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
