//! # Memory Interfaces
//!
//! Page faults, region management, program break, file mappings and user
//! copies, each resolved against the address space of a process.

use alloc::sync::{Arc, Weak};

use strata_execution::fd_table::{OpenFile, OpenFlags};
use strata_execution::process::Heap;
use strata_execution::{ExecError, ProcessId, SchedulerContext, Signal};
use strata_hal::{pages_for, PhysAddr, VirtAddr, PAGE_SIZE};
use strata_memory::{
    handle_page_fault, uaccess, AccessKind, Backing, FaultResolution, FileObject, FileReader,
    MemError, RegionFlags,
};

use crate::error::KernelResult;
use crate::kernel::{Kernel, KernelState};

/// What the trap layer does after a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Retry the faulting instruction
    Resolved,
    /// The fault could not be resolved; `signal` is now pending on the process
    Signal(Signal),
}

/// `len` rounded up to whole pages
fn page_len(len: u64) -> Result<u64, MemError> {
    pages_for(len).checked_mul(PAGE_SIZE).ok_or(MemError::InvalidSize)
}

impl KernelState {
    /// The file object for `file`, shared with any existing mapping of it
    fn file_object(&mut self, file: Arc<dyn FileReader>) -> Arc<FileObject> {
        let id = file.id();
        if let Some(object) = self.objects.get(&id).and_then(Weak::upgrade) {
            return object;
        }
        self.objects.retain(|_, object| object.strong_count() > 0);
        let object = FileObject::new(file);
        self.objects.insert(id, Arc::downgrade(&object));
        object
    }
}

impl Kernel {
    /// Resolve a fault taken by the running thread
    ///
    /// Faults outside any region or that the region forbids queue SIGSEGV.
    /// Running out of memory kills only the faulting process.
    pub fn on_page_fault(
        &self,
        ctx: &SchedulerContext,
        vaddr: VirtAddr,
        access: AccessKind,
    ) -> KernelResult<FaultOutcome> {
        let mut state = self.lock();
        let pid = state.current_process(ctx)?;
        let KernelState {
            procs,
            kernel_space,
            ..
        } = &mut *state;
        let space = match procs.require(pid)?.space_mut() {
            Some(space) => space,
            None => kernel_space,
        };

        let signal = match handle_page_fault(space, vaddr, access) {
            Ok(FaultResolution::Resolved) => return Ok(FaultOutcome::Resolved),
            Ok(FaultResolution::Denied) => {
                log::debug!("Process {}: {:?} fault at {} denied", pid, access, vaddr);
                Signal::Segv
            }
            Err(MemError::OutOfMemory) => {
                log::warn!("Process {}: out of memory at {}, killing", pid, vaddr);
                Signal::Kill
            }
            Err(MemError::Io) => {
                log::warn!("Process {}: page-in failed at {}", pid, vaddr);
                Signal::Bus
            }
            Err(e) => {
                log::debug!("Process {}: fault at {}: {}", pid, vaddr, e);
                Signal::Segv
            }
        };
        state.signal_process(pid, signal)?;
        Ok(FaultOutcome::Signal(signal))
    }

    /// Install a region in a process's address space
    ///
    /// With `base == None` the lowest gap that fits is used.
    pub fn region_install(
        &self,
        pid: ProcessId,
        base: Option<VirtAddr>,
        len: u64,
        flags: RegionFlags,
        backing: Backing,
    ) -> KernelResult<VirtAddr> {
        let mut state = self.lock();
        let space = state.procs.require(pid)?.require_space()?;
        Ok(space.install(base, len, flags | RegionFlags::USER, backing)?)
    }

    /// Remove the region starting at `base`
    pub fn region_remove(&self, pid: ProcessId, base: VirtAddr) -> KernelResult<()> {
        let mut state = self.lock();
        let space = state.procs.require(pid)?.require_space()?;
        space.remove_region(base)?;
        Ok(())
    }

    /// Change a region's permissions
    ///
    /// Dropping READ unmaps the region's pages, so later accesses fault and
    /// are refused until the flags allow them again.
    pub fn region_protect(
        &self,
        pid: ProcessId,
        base: VirtAddr,
        flags: RegionFlags,
    ) -> KernelResult<()> {
        let mut state = self.lock();
        let space = state.procs.require(pid)?.require_space()?;
        Ok(space.protect(base, flags | RegionFlags::USER)?)
    }

    /// Number of regions in a process's address space
    pub fn region_count(&self, pid: ProcessId) -> usize {
        self.lock()
            .procs
            .get(pid)
            .and_then(|p| p.space())
            .map_or(0, |s| s.region_count())
    }

    /// Physical address `vaddr` is mapped to in `pid`
    pub fn translate(&self, pid: ProcessId, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.lock()
            .procs
            .get(pid)
            .and_then(|p| p.space())
            .and_then(|s| s.translate(vaddr))
    }

    /// Move the program break; `None` queries it
    pub fn brk(&self, pid: ProcessId, new_end: Option<VirtAddr>) -> KernelResult<VirtAddr> {
        let mut state = self.lock();
        let process = state.procs.require(pid)?;
        let mut heap = process.heap();
        if heap.start == VirtAddr::default() {
            heap = Heap {
                start: self.config().heap_base,
                end: self.config().heap_base,
            };
            process.set_heap(heap);
        }
        let Some(new_end) = new_end else {
            return Ok(heap.end);
        };
        if new_end < heap.start {
            return Err(ExecError::InvalidArgument.into());
        }

        let old_len = page_len(heap.end.offset_from(heap.start))?;
        let new_len = page_len(new_end.offset_from(heap.start))?;
        let space = process.require_space()?;
        match (old_len, new_len) {
            (old, new) if old == new => {}
            (0, new) => {
                space.install(Some(heap.start), new, RegionFlags::URW, Backing::Anonymous)?;
            }
            (_, 0) => {
                space.remove_region(heap.start)?;
            }
            (_, new) => space.resize(heap.start, new)?,
        }
        heap.end = new_end;
        process.set_heap(heap);
        log::debug!("Process {}: break {} ({:#x} bytes)", pid, new_end, new_len);
        Ok(new_end)
    }

    /// Make a file available to a process under the lowest free descriptor
    pub fn file_install(
        &self,
        pid: ProcessId,
        file: Arc<dyn FileReader>,
        flags: OpenFlags,
    ) -> KernelResult<usize> {
        let mut state = self.lock();
        let fd = state
            .procs
            .require(pid)?
            .files_mut()
            .install(OpenFile::new(file, flags))?;
        Ok(fd)
    }

    /// Close a descriptor
    pub fn file_close(&self, pid: ProcessId, fd: usize) -> KernelResult<()> {
        let mut state = self.lock();
        state.procs.require(pid)?.files_mut().close(fd)?;
        Ok(())
    }

    /// Map `len` bytes of the file open as `fd`, starting at file `offset`
    ///
    /// Every mapping of the same file shares one page cache. Without
    /// [`RegionFlags::SHARED`] writes land in private copies. A shared
    /// writable mapping needs a descriptor opened for writing.
    pub fn mmap_file(
        &self,
        pid: ProcessId,
        fd: usize,
        len: u64,
        offset: u64,
        flags: RegionFlags,
    ) -> KernelResult<VirtAddr> {
        if offset % PAGE_SIZE != 0 {
            return Err(MemError::NotAligned.into());
        }
        let mut state = self.lock();
        let open = state.procs.require(pid)?.files().get(fd)?.clone();
        if !open.flags().contains(OpenFlags::READ) {
            return Err(ExecError::BadFileDescriptor.into());
        }
        let shared_write = flags.contains(RegionFlags::SHARED | RegionFlags::WRITE);
        if shared_write && !open.flags().contains(OpenFlags::WRITE) {
            return Err(ExecError::BadFileDescriptor.into());
        }
        let len = page_len(len)?;
        let object = state.file_object(open.file().clone());
        let space = state.procs.require(pid)?.require_space()?;
        let base = space.install(
            None,
            len,
            flags | RegionFlags::USER,
            Backing::File { object, offset },
        )?;
        log::debug!("Process {}: fd {} mapped at {}", pid, fd, base);
        Ok(base)
    }

    /// Unmap the regions inside `[addr, addr + len)`
    pub fn munmap(&self, pid: ProcessId, addr: VirtAddr, len: u64) -> KernelResult<usize> {
        let mut state = self.lock();
        let space = state.procs.require(pid)?.require_space()?;
        Ok(space.unmap(addr, page_len(len)?)?)
    }

    /// Copy bytes out of a process's memory, faulting pages in as needed
    pub fn copy_from_user(
        &self,
        pid: ProcessId,
        vaddr: VirtAddr,
        buf: &mut [u8],
    ) -> KernelResult<()> {
        let mut state = self.lock();
        let space = state.procs.require(pid)?.require_space()?;
        Ok(uaccess::copy_from_user(space, vaddr, buf)?)
    }

    /// Copy bytes into a process's memory, breaking copy-on-write sharing
    pub fn copy_to_user(&self, pid: ProcessId, vaddr: VirtAddr, data: &[u8]) -> KernelResult<()> {
        let mut state = self.lock();
        let space = state.procs.require(pid)?.require_space()?;
        Ok(uaccess::copy_to_user(space, vaddr, data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_len_rounds_up() {
        assert_eq!(page_len(1), Ok(PAGE_SIZE));
        assert_eq!(page_len(PAGE_SIZE), Ok(PAGE_SIZE));
        assert_eq!(page_len(0), Ok(0));
    }

    #[test]
    fn test_page_len_overflow() {
        let last_page = u64::MAX - PAGE_SIZE + 1;
        assert_eq!(page_len(last_page), Ok(last_page));
        assert_eq!(page_len(last_page + 1), Err(MemError::InvalidSize));
        assert_eq!(page_len(u64::MAX), Err(MemError::InvalidSize));
    }
}
