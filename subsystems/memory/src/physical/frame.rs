//! # Frames and Frame References
//!
//! A [`FrameRef`] is a counted reference to one allocated frame. Cloning it
//! increments the frame's reference count, dropping it decrements the count
//! and the frame returns to the free pool when the last reference goes.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{fence, Ordering};

use strata_hal::{PhysAddr, PAGE_SIZE};

use super::FrameTable;
use crate::MemResult;

/// A physical page-sized frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    address: PhysAddr,
}

impl Frame {
    /// Frame starting at `address`
    pub const fn new(address: PhysAddr) -> Self {
        Self { address }
    }

    /// Get the physical address
    pub const fn address(&self) -> PhysAddr {
        self.address
    }

    /// Get the end address
    pub const fn end(&self) -> PhysAddr {
        self.address.add(PAGE_SIZE)
    }

    /// Check if address is within this frame
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.address && addr < self.end()
    }
}

/// Counted reference to an allocated frame
pub struct FrameRef {
    table: Arc<FrameTable>,
    index: usize,
}

impl FrameRef {
    /// Wrap a freshly allocated frame whose count was already set to one
    pub(super) fn adopt(table: Arc<FrameTable>, index: usize) -> Self {
        Self { table, index }
    }

    /// The referenced frame
    pub fn frame(&self) -> Frame {
        Frame::new(self.address())
    }

    /// Physical address of the frame
    pub fn address(&self) -> PhysAddr {
        self.table.address(self.index)
    }

    /// Current number of references to this frame
    pub fn ref_count(&self) -> u32 {
        self.table.refs[self.index].load(Ordering::Acquire)
    }

    /// Whether this is the only reference
    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    /// Read bytes from the frame at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> MemResult<()> {
        self.check(offset, buf.len())?;
        self.table.memory.read(self.address().add(offset as u64), buf)?;
        Ok(())
    }

    /// Write bytes into the frame at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> MemResult<()> {
        self.check(offset, data.len())?;
        self.table.memory.write(self.address().add(offset as u64), data)?;
        Ok(())
    }

    /// Fill the whole frame with zeroes
    pub fn zero(&self) -> MemResult<()> {
        self.table.memory.fill(self.address(), PAGE_SIZE as usize, 0)?;
        Ok(())
    }

    /// Copy the whole contents of `src` into this frame
    pub fn copy_from(&self, src: &FrameRef) -> MemResult<()> {
        self.table
            .memory
            .copy(src.address(), self.address(), PAGE_SIZE as usize)?;
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> MemResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE as usize => Ok(()),
            _ => Err(crate::MemError::InvalidSize),
        }
    }
}

impl Clone for FrameRef {
    fn clone(&self) -> Self {
        let prev = self.table.refs[self.index].fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "cloned a frame reference with no holders");
        Self { table: Arc::clone(&self.table), index: self.index }
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        if self.table.refs[self.index].fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        self.table.release(self.index);
    }
}

impl PartialEq for FrameRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.table, &other.table) && self.index == other.index
    }
}

impl Eq for FrameRef {}

impl fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRef")
            .field("address", &self.address())
            .field("refs", &self.ref_count())
            .finish()
    }
}
