//! # Software HAL
//!
//! Host-side implementations of every capability trait. Physical memory is a
//! byte vector, page tables are ordered maps and a context switch only records
//! what would have been resumed. The kernel core runs unchanged on top of
//! them, which is how its behaviour is exercised off-target.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::cpu::{Cpu, SavedContext};
use crate::mmu::{Mmu, PageFlags, PageTable};
use crate::phys::PhysicalMemory;
use crate::{HalError, HalResult, PhysAddr, VirtAddr, PAGE_SIZE};

// =============================================================================
// Physical memory
// =============================================================================

/// RAM backed by a heap buffer
#[derive(Debug)]
pub struct SoftRam {
    base: PhysAddr,
    bytes: Mutex<Vec<u8>>,
}

impl SoftRam {
    /// Create RAM covering `frames` frames starting at `base`
    pub fn new(base: PhysAddr, frames: usize) -> Self {
        Self {
            base,
            bytes: Mutex::new(vec![0; frames * PAGE_SIZE as usize]),
        }
    }

    /// First physical address
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Number of frames covered
    pub fn frames(&self) -> usize {
        self.bytes.lock().len() / PAGE_SIZE as usize
    }

    fn index(&self, addr: PhysAddr, len: usize, total: usize) -> HalResult<usize> {
        let start = addr
            .as_u64()
            .checked_sub(self.base.as_u64())
            .ok_or(HalError::InvalidAddress)? as usize;
        match start.checked_add(len) {
            Some(end) if end <= total => Ok(start),
            _ => Err(HalError::InvalidAddress),
        }
    }
}

impl PhysicalMemory for SoftRam {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> HalResult<()> {
        let bytes = self.bytes.lock();
        let start = self.index(addr, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, addr: PhysAddr, data: &[u8]) -> HalResult<()> {
        let mut bytes = self.bytes.lock();
        let total = bytes.len();
        let start = self.index(addr, data.len(), total)?;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn fill(&self, addr: PhysAddr, len: usize, value: u8) -> HalResult<()> {
        let mut bytes = self.bytes.lock();
        let total = bytes.len();
        let start = self.index(addr, len, total)?;
        bytes[start..start + len].fill(value);
        Ok(())
    }

    fn copy(&self, src: PhysAddr, dst: PhysAddr, len: usize) -> HalResult<()> {
        let mut bytes = self.bytes.lock();
        let total = bytes.len();
        let s = self.index(src, len, total)?;
        let d = self.index(dst, len, total)?;
        bytes.copy_within(s..s + len, d);
        Ok(())
    }
}

// =============================================================================
// Page tables
// =============================================================================

/// Page table kept as an ordered map of page base to translation
#[derive(Debug)]
pub struct SoftPageTable {
    root: PhysAddr,
    entries: BTreeMap<u64, (PhysAddr, PageFlags)>,
}

impl SoftPageTable {
    /// Create an empty table
    pub fn new(root: PhysAddr) -> Self {
        Self { root, entries: BTreeMap::new() }
    }

    /// Number of live translations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no translations
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PageTable for SoftPageTable {
    unsafe fn map(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> HalResult<()> {
        if !virt.is_page_aligned() || !phys.is_aligned(PAGE_SIZE) {
            return Err(HalError::InvalidAddress);
        }
        if self.entries.contains_key(&virt.as_u64()) {
            return Err(HalError::AlreadyMapped);
        }
        self.entries.insert(virt.as_u64(), (phys, flags | PageFlags::PRESENT));
        Ok(())
    }

    fn unmap(&mut self, virt: VirtAddr) -> HalResult<PhysAddr> {
        self.entries
            .remove(&virt.page_base().as_u64())
            .map(|(phys, _)| phys)
            .ok_or(HalError::NotMapped)
    }

    fn update_flags(&mut self, virt: VirtAddr, flags: PageFlags) -> HalResult<()> {
        let entry = self
            .entries
            .get_mut(&virt.page_base().as_u64())
            .ok_or(HalError::NotMapped)?;
        entry.1 = flags | PageFlags::PRESENT;
        Ok(())
    }

    fn query(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.entries.get(&virt.page_base().as_u64()).copied()
    }

    fn root_physical_address(&self) -> PhysAddr {
        self.root
    }
}

/// MMU that hands out [`SoftPageTable`]s and counts TLB maintenance
#[derive(Debug, Default)]
pub struct SoftMmu {
    active: Mutex<Option<PhysAddr>>,
    switches: AtomicU64,
    tlb_flushes: AtomicU64,
}

impl SoftMmu {
    /// Create a new software MMU
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of page-table switches performed
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Number of TLB invalidations requested
    pub fn tlb_flushes(&self) -> u64 {
        self.tlb_flushes.load(Ordering::Relaxed)
    }
}

impl Mmu for SoftMmu {
    fn create_page_table(&self, root: PhysAddr) -> HalResult<Box<dyn PageTable>> {
        if !root.is_aligned(PAGE_SIZE) {
            return Err(HalError::InvalidAddress);
        }
        Ok(Box::new(SoftPageTable::new(root)))
    }

    unsafe fn switch_page_table(&self, table: &dyn PageTable) {
        let root = table.root_physical_address();
        log::trace!("soft mmu: active table {}", root);
        *self.active.lock() = Some(root);
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    fn active_root(&self) -> Option<PhysAddr> {
        *self.active.lock()
    }

    fn invalidate_tlb(&self, _virt: VirtAddr) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn invalidate_tlb_all(&self) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// CPU
// =============================================================================

/// CPU that records context switches instead of performing them
///
/// `resume_context` returns immediately, as if the resumed context had
/// switched straight back.
#[derive(Debug, Default)]
pub struct SoftCpu {
    switches: AtomicU64,
    halts: AtomicU64,
    interrupts: AtomicBool,
    last_resumed: Mutex<Option<SavedContext>>,
}

impl SoftCpu {
    /// Create a new software CPU
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contexts resumed
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Number of times the CPU idled
    pub fn halts(&self) -> u64 {
        self.halts.load(Ordering::Relaxed)
    }

    /// The context most recently resumed
    pub fn last_resumed(&self) -> Option<SavedContext> {
        self.last_resumed.lock().clone()
    }
}

impl Cpu for SoftCpu {
    fn save_context(&self, into: &mut SavedContext) {
        if let Some(current) = self.last_resumed.lock().as_ref() {
            into.clone_from(current);
        }
    }

    unsafe fn resume_context(&self, _from: Option<&mut SavedContext>, to: &SavedContext) {
        *self.last_resumed.lock() = Some(to.clone());
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::Relaxed);
    }

    unsafe fn disable_interrupts(&self) {
        self.interrupts.store(false, Ordering::Relaxed);
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::Relaxed)
    }
}
