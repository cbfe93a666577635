//! # Physical Memory Management
//!
//! The frame allocator owns every frame in one contiguous physical range.
//! It hands out [`FrameRef`]s and takes a frame back when its last reference
//! is dropped.

pub mod bitmap;
pub mod frame;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;
use strata_hal::phys::PhysicalMemory;
use strata_hal::{PhysAddr, PAGE_SIZE};

use crate::{MemError, MemResult, MemoryStats};
use bitmap::FrameBitmap;

pub use frame::{Frame, FrameRef};

/// Shared state behind every [`FrameAllocator`] handle and [`FrameRef`]
pub(crate) struct FrameTable {
    base: PhysAddr,
    bitmap: Mutex<FrameBitmap>,
    /// Holders per frame; zero for free and reserved frames
    refs: Box<[AtomicU32]>,
    free: AtomicUsize,
    reserved: AtomicUsize,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    failures: AtomicU64,
    memory: Arc<dyn PhysicalMemory>,
}

impl FrameTable {
    fn address(&self, index: usize) -> PhysAddr {
        self.base.add(index as u64 * PAGE_SIZE)
    }

    fn index(&self, addr: PhysAddr) -> Option<usize> {
        let offset = addr.as_u64().checked_sub(self.base.as_u64())?;
        let index = (offset / PAGE_SIZE) as usize;
        (index < self.refs.len()).then_some(index)
    }

    /// Return a frame whose count just dropped to zero
    fn release(&self, index: usize) {
        self.bitmap.lock().set_free(index);
        self.free.fetch_add(1, Ordering::SeqCst);
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reference-counting frame allocator
///
/// Cheap to clone; all clones manage the same frames.
#[derive(Clone)]
pub struct FrameAllocator {
    table: Arc<FrameTable>,
}

impl FrameAllocator {
    /// Manage `frames` frames starting at `base`, all initially free
    pub fn new(base: PhysAddr, frames: usize, memory: Arc<dyn PhysicalMemory>) -> MemResult<Self> {
        if !base.is_aligned(PAGE_SIZE) {
            return Err(MemError::NotAligned);
        }
        if frames == 0 {
            return Err(MemError::InvalidSize);
        }
        let refs = (0..frames).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();
        let table = FrameTable {
            base,
            bitmap: Mutex::new(FrameBitmap::new(frames)),
            refs: refs.into_boxed_slice(),
            free: AtomicUsize::new(frames),
            reserved: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            memory,
        };
        log::info!("frame allocator: {} frames at {}", frames, base);
        Ok(Self { table: Arc::new(table) })
    }

    /// Allocate one frame with a reference count of one
    ///
    /// Contents are whatever the frame last held.
    pub fn allocate(&self) -> MemResult<FrameRef> {
        let index = {
            let mut bitmap = self.table.bitmap.lock();
            match bitmap.find_free() {
                Some(index) => {
                    bitmap.set_used(index);
                    index
                }
                None => {
                    self.table.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(MemError::OutOfMemory);
                }
            }
        };
        Ok(self.adopt(index))
    }

    /// Allocate one zero-filled frame
    pub fn allocate_zeroed(&self) -> MemResult<FrameRef> {
        let frame = self.allocate()?;
        frame.zero()?;
        Ok(frame)
    }

    /// Allocate a frame holding a copy of `src`
    pub fn allocate_copy(&self, src: &FrameRef) -> MemResult<FrameRef> {
        let frame = self.allocate()?;
        frame.copy_from(src)?;
        Ok(frame)
    }

    /// Allocate `count` physically contiguous frames
    pub fn allocate_contiguous(&self, count: usize) -> MemResult<Vec<FrameRef>> {
        if count == 0 {
            return Err(MemError::InvalidSize);
        }
        let start = {
            let mut bitmap = self.table.bitmap.lock();
            match bitmap.find_contiguous(count) {
                Some(start) => {
                    for index in start..start + count {
                        bitmap.set_used(index);
                    }
                    start
                }
                None => {
                    self.table.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(MemError::OutOfMemory);
                }
            }
        };
        Ok((start..start + count).map(|index| self.adopt(index)).collect())
    }

    fn adopt(&self, index: usize) -> FrameRef {
        let prev = self.table.refs[index].swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "allocated a frame that still had holders");
        self.table.free.fetch_sub(1, Ordering::SeqCst);
        self.table.allocations.fetch_add(1, Ordering::Relaxed);
        FrameRef::adopt(Arc::clone(&self.table), index)
    }

    fn index_range(&self, start: PhysAddr, size: u64) -> MemResult<core::ops::Range<usize>> {
        if !start.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 {
            return Err(MemError::NotAligned);
        }
        if size == 0 {
            return Err(MemError::InvalidSize);
        }
        let first = self.table.index(start).ok_or(MemError::InvalidAddress)?;
        let count = (size / PAGE_SIZE) as usize;
        if first + count > self.table.refs.len() {
            return Err(MemError::InvalidAddress);
        }
        Ok(first..first + count)
    }

    /// Withhold a free range from allocation (firmware, boot modules)
    pub fn reserve_range(&self, start: PhysAddr, size: u64) -> MemResult<()> {
        let range = self.index_range(start, size)?;
        let mut bitmap = self.table.bitmap.lock();
        if range.clone().any(|index| bitmap.is_used(index)) {
            return Err(MemError::FrameInUse);
        }
        for index in range.clone() {
            bitmap.set_used(index);
        }
        self.table.free.fetch_sub(range.len(), Ordering::SeqCst);
        self.table.reserved.fetch_add(range.len(), Ordering::Relaxed);
        log::debug!("frame allocator: reserved {} frames at {}", range.len(), start);
        Ok(())
    }

    /// Return a reserved range to the free pool
    ///
    /// Fails without changing anything if any frame in the range is still
    /// referenced. Frames already free are skipped. Returns the number of
    /// frames released.
    pub fn release_range(&self, start: PhysAddr, size: u64) -> MemResult<usize> {
        let range = self.index_range(start, size)?;
        let mut bitmap = self.table.bitmap.lock();
        if range
            .clone()
            .any(|index| self.table.refs[index].load(Ordering::Acquire) != 0)
        {
            return Err(MemError::FrameInUse);
        }
        let mut released = 0;
        for index in range {
            if bitmap.is_used(index) {
                bitmap.set_free(index);
                released += 1;
            }
        }
        self.table.free.fetch_add(released, Ordering::SeqCst);
        let reserved = self.table.reserved.load(Ordering::Relaxed);
        self.table
            .reserved
            .store(reserved.saturating_sub(released), Ordering::Relaxed);
        Ok(released)
    }

    /// Reference count of the frame at `addr` (zero when free or unknown)
    pub fn ref_count(&self, addr: PhysAddr) -> u32 {
        self.table
            .index(addr)
            .map_or(0, |index| self.table.refs[index].load(Ordering::Acquire))
    }

    /// Frames available for allocation
    pub fn free_frames(&self) -> usize {
        self.table.free.load(Ordering::SeqCst)
    }

    /// Total frames managed
    pub fn total_frames(&self) -> usize {
        self.table.refs.len()
    }

    /// First managed physical address
    pub fn base(&self) -> PhysAddr {
        self.table.base
    }

    /// Physical memory access used for frame contents
    pub fn memory(&self) -> &Arc<dyn PhysicalMemory> {
        &self.table.memory
    }

    /// Check the free counter against the bitmap
    pub fn is_consistent(&self) -> bool {
        let bitmap = self.table.bitmap.lock();
        bitmap.count_free() == self.free_frames()
    }

    /// Get statistics
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_frames: self.total_frames(),
            free_frames: self.free_frames(),
            reserved_frames: self.table.reserved.load(Ordering::Relaxed),
            allocations: self.table.allocations.load(Ordering::Relaxed),
            deallocations: self.table.deallocations.load(Ordering::Relaxed),
            failures: self.table.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("base", &self.table.base)
            .field("total", &self.total_frames())
            .field("free", &self.free_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use strata_hal::arch_stubs::SoftRam;

    fn allocator(frames: usize) -> FrameAllocator {
        let ram = Arc::new(SoftRam::new(PhysAddr::new(0x10_0000), frames));
        FrameAllocator::new(PhysAddr::new(0x10_0000), frames, ram).unwrap()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    #[test]
    fn test_allocate_starts_at_one_reference() {
        let alloc = allocator(4);
        let frame = alloc.allocate().unwrap();
        assert_eq!(frame.ref_count(), 1);
        assert_eq!(alloc.ref_count(frame.address()), 1);
        assert_eq!(alloc.free_frames(), 3);
    }

    #[test]
    fn test_clone_and_drop_balance() {
        let alloc = allocator(4);
        let frame = alloc.allocate().unwrap();
        let addr = frame.address();
        let second = frame.clone();
        assert_eq!(alloc.ref_count(addr), 2);
        drop(frame);
        assert_eq!(alloc.ref_count(addr), 1);
        assert_eq!(alloc.free_frames(), 3);
        drop(second);
        assert_eq!(alloc.ref_count(addr), 0);
        assert_eq!(alloc.free_frames(), 4);
    }

    #[test]
    fn test_exhaustion_then_free_keeps_count() {
        let alloc = allocator(8);
        let mut held = Vec::new();
        loop {
            match alloc.allocate() {
                Ok(frame) => held.push(frame),
                Err(e) => {
                    assert_eq!(e, MemError::OutOfMemory);
                    break;
                }
            }
        }
        assert_eq!(held.len(), 8);
        assert_eq!(alloc.free_frames(), 0);
        assert!(alloc.allocate().is_err());
        held.truncate(3);
        assert_eq!(alloc.free_frames(), 5);
        assert!(alloc.is_consistent());
        assert_eq!(alloc.stats().failures, 2);
        let again = alloc.allocate().unwrap();
        assert_eq!(again.ref_count(), 1);
        assert_eq!(alloc.free_frames(), 4);
    }

    #[test]
    fn test_allocate_zeroed_and_copy() {
        let alloc = allocator(4);
        let a = alloc.allocate().unwrap();
        a.write(0, &[0xFF; 16]).unwrap();
        drop(a);
        let z = alloc.allocate_zeroed().unwrap();
        let mut buf = [1u8; 16];
        z.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        z.write(100, b"strata").unwrap();
        let c = alloc.allocate_copy(&z).unwrap();
        let mut copy = [0u8; 6];
        c.read(100, &mut copy).unwrap();
        assert_eq!(&copy, b"strata");
        assert_ne!(c.address(), z.address());
    }

    #[test]
    fn test_frame_io_bounds() {
        let alloc = allocator(1);
        let f = alloc.allocate().unwrap();
        assert_eq!(f.write(PAGE_SIZE as usize - 1, &[1, 2]), Err(MemError::InvalidSize));
    }

    #[test]
    fn test_contiguous_allocation() {
        let alloc = allocator(8);
        let _hole = alloc.allocate().unwrap();
        let run = alloc.allocate_contiguous(3).unwrap();
        for pair in run.windows(2) {
            assert_eq!(pair[1].address().as_u64() - pair[0].address().as_u64(), PAGE_SIZE);
        }
        assert_eq!(alloc.free_frames(), 4);
        assert_eq!(alloc.allocate_contiguous(5).err(), Some(MemError::OutOfMemory));
    }

    // =========================================================================
    // Reserved ranges
    // =========================================================================

    #[test]
    fn test_reserve_and_release_range() {
        let alloc = allocator(8);
        let start = PhysAddr::new(0x10_0000 + 2 * PAGE_SIZE);
        alloc.reserve_range(start, 3 * PAGE_SIZE).unwrap();
        assert_eq!(alloc.free_frames(), 5);
        assert_eq!(alloc.stats().reserved_frames, 3);
        assert_eq!(alloc.reserve_range(start, PAGE_SIZE), Err(MemError::FrameInUse));
        assert_eq!(alloc.release_range(start, 3 * PAGE_SIZE), Ok(3));
        assert_eq!(alloc.free_frames(), 8);
        assert!(alloc.is_consistent());
    }

    #[test]
    fn test_release_range_refuses_live_frames() {
        let alloc = allocator(4);
        let frame = alloc.allocate().unwrap();
        assert_eq!(alloc.release_range(frame.address(), PAGE_SIZE), Err(MemError::FrameInUse));
        assert_eq!(frame.ref_count(), 1);
    }

    #[test]
    fn test_range_validation() {
        let alloc = allocator(4);
        let misaligned = alloc.reserve_range(PhysAddr::new(0x10_0001), PAGE_SIZE);
        assert_eq!(misaligned, Err(MemError::NotAligned));
        assert_eq!(alloc.reserve_range(PhysAddr::new(0), PAGE_SIZE), Err(MemError::InvalidAddress));
        assert_eq!(
            alloc.reserve_range(PhysAddr::new(0x10_0000), 5 * PAGE_SIZE),
            Err(MemError::InvalidAddress)
        );
    }
}
