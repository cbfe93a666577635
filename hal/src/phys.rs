//! # Physical Memory Access
//!
//! Byte-level access to physical frames. The kernel reaches frame contents
//! through this capability when it zero-fills, copies or pages in a frame.

use crate::{HalError, HalResult, PhysAddr};

/// Access to the contents of physical memory
pub trait PhysicalMemory: Send + Sync {
    /// Read `buf.len()` bytes starting at `addr`
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> HalResult<()>;

    /// Write `data` starting at `addr`
    fn write(&self, addr: PhysAddr, data: &[u8]) -> HalResult<()>;

    /// Fill `len` bytes starting at `addr` with `value`
    fn fill(&self, addr: PhysAddr, len: usize, value: u8) -> HalResult<()>;

    /// Copy `len` bytes from `src` to `dst`
    ///
    /// The ranges must not overlap.
    fn copy(&self, src: PhysAddr, dst: PhysAddr, len: usize) -> HalResult<()>;
}

/// Physical memory reached through a linear kernel mapping
///
/// Physical address `p` is visible at virtual address `offset + p`.
#[derive(Debug)]
pub struct DirectMap {
    offset: u64,
    limit: u64,
}

impl DirectMap {
    /// Create a direct-map accessor
    ///
    /// # Safety
    /// All physical memory below `limit` must be mapped read/write at
    /// `offset + addr` for the lifetime of the returned value.
    pub const unsafe fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    fn ptr(&self, addr: PhysAddr, len: usize) -> HalResult<*mut u8> {
        let end = addr
            .as_u64()
            .checked_add(len as u64)
            .ok_or(HalError::InvalidAddress)?;
        if end > self.limit {
            return Err(HalError::InvalidAddress);
        }
        Ok((self.offset + addr.as_u64()) as *mut u8)
    }
}

impl PhysicalMemory for DirectMap {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> HalResult<()> {
        let src = self.ptr(addr, buf.len())?;
        // SAFETY: range checked against the mapped limit in `ptr`
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write(&self, addr: PhysAddr, data: &[u8]) -> HalResult<()> {
        let dst = self.ptr(addr, data.len())?;
        // SAFETY: range checked against the mapped limit in `ptr`
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    fn fill(&self, addr: PhysAddr, len: usize, value: u8) -> HalResult<()> {
        let dst = self.ptr(addr, len)?;
        // SAFETY: range checked against the mapped limit in `ptr`
        unsafe { core::ptr::write_bytes(dst, value, len) };
        Ok(())
    }

    fn copy(&self, src: PhysAddr, dst: PhysAddr, len: usize) -> HalResult<()> {
        let s = self.ptr(src, len)?;
        let d = self.ptr(dst, len)?;
        // SAFETY: both ranges checked; callers guarantee they are disjoint frames
        unsafe { core::ptr::copy_nonoverlapping(s, d, len) };
        Ok(())
    }
}
