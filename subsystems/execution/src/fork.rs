//! # Fork
//!
//! Duplicates the calling process. Every step that can fail runs before the
//! child becomes visible, and each one either builds something the child
//! owns or leaves the parent as it was, so an error simply drops the
//! half-built child. The parent's address space is only downgraded for
//! copy-on-write once the child's thread exists.

use alloc::string::String;

use strata_hal::cpu::SavedContext;
use strata_memory::{AddressSpace, FrameAllocator, PendingFork};

use crate::context::SchedulerContext;
use crate::process::{Process, ProcessTable};
use crate::scheduler::Scheduler;
use crate::thread::{KernelStack, ThreadFlags};
use crate::{ExecError, ExecResult, ProcessId, ThreadId};

/// Default name of the queue a parent sleeps on while waiting for children
pub const CHILD_EXIT_QUEUE: &str = "child-exit";

/// Outcome of a successful fork, as seen by the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkResult {
    /// The new process
    pub child: ProcessId,
    /// The new process's only thread
    pub thread: ThreadId,
}

/// Fork the process running on `ctx`
///
/// `frame` is the register state the parent entered the kernel with. The
/// child resumes from a copy of it with a zero return value; the caller
/// reports `child` to the parent.
pub fn fork(
    sched: &mut Scheduler,
    procs: &mut ProcessTable,
    ctx: &SchedulerContext,
    frame: &SavedContext,
    allocator: &FrameAllocator,
    stack_pages: usize,
) -> ExecResult<ForkResult> {
    let parent_tid = ctx.require_current()?;
    let parent_pid = sched
        .thread(parent_tid)
        .ok_or(ExecError::ThreadNotFound)?
        .process();
    let child_pid = procs.allocate_pid()?;

    let parent = procs.require(parent_pid)?;
    if parent.is_zombie() {
        return Err(ExecError::InvalidState);
    }

    let stack = KernelStack::allocate(allocator, stack_pages)?;
    let files = parent.files().duplicate()?;
    let name = String::from(parent.name());
    let heap = parent.heap();
    let queue_name = sched
        .wait_queue_name(parent.child_exit_queue())
        .unwrap_or(CHILD_EXIT_QUEUE);
    let child_exit = sched.create_wait_queue(queue_name)?;

    // The parent's pages keep their write access until the commit below
    let pending = match parent.space_mut().map(AddressSpace::fork).transpose() {
        Ok(pending) => pending,
        Err(e) => {
            let _ = sched.destroy_wait_queue(child_exit);
            log::debug!("fork of {} failed: {}", parent_pid, e);
            return Err(e.into());
        }
    };

    let mut context = frame.clone();
    context.set_return_value(0);
    let thread = match sched.spawn(child_pid, context, stack, ThreadFlags::FORKED) {
        Ok(thread) => thread,
        Err(e) => {
            let _ = sched.destroy_wait_queue(child_exit);
            log::debug!("fork of {} failed: {}", parent_pid, e);
            return Err(e);
        }
    };

    let space = pending.map(PendingFork::commit);
    let mut child = Process::new(child_pid, Some(parent_pid), name, space, files, child_exit);
    child.set_heap(heap);
    child.add_thread(thread);
    procs.insert(child)?;
    procs.require(parent_pid)?.add_child(child_pid);
    sched.ready(thread)?;

    log::debug!("Forked {} -> {} (thread {})", parent_pid, child_pid, thread);
    Ok(ForkResult {
        child: child_pid,
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SwitchReason;
    use crate::fd_table::{FileTable, OpenFile, OpenFlags};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use strata_hal::arch_stubs::{SoftCpu, SoftMmu, SoftRam};
    use strata_hal::{PhysAddr, VirtAddr};
    use strata_memory::virtual_memory::SpaceKind;
    use strata_memory::uaccess::copy_to_user;
    use strata_memory::{Backing, FileError, FileReader, RegionFlags, VirtRange};

    struct Empty;

    impl FileReader for Empty {
        fn id(&self) -> u64 {
            9
        }

        fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, FileError> {
            Ok(0)
        }
    }

    struct Fixture {
        sched: Scheduler,
        procs: ProcessTable,
        ctx: SchedulerContext,
        alloc: FrameAllocator,
        parent: ProcessId,
    }

    fn fixture(frames: usize) -> Fixture {
        let ram = Arc::new(SoftRam::new(PhysAddr::new(0), frames));
        let alloc = FrameAllocator::new(PhysAddr::new(0), frames, ram).unwrap();
        let mmu = Arc::new(SoftMmu::new());
        let mut sched = Scheduler::new(Arc::new(SoftCpu::new()));
        let mut procs = ProcessTable::new();

        let range = VirtRange::new(VirtAddr::new(0x1000), VirtAddr::new(0x10_0000));
        let mut space = AddressSpace::new(SpaceKind::User, range, mmu, alloc.clone()).unwrap();
        space
            .install(Some(VirtAddr::new(0x1000)), 0x1000, RegionFlags::URW, Backing::Anonymous)
            .unwrap();
        let mut files = FileTable::new(8);
        files.install(OpenFile::new(Arc::new(Empty), OpenFlags::READ)).unwrap();

        let pid = procs.allocate_pid().unwrap();
        let q = sched.create_wait_queue(CHILD_EXIT_QUEUE).unwrap();
        let mut parent = Process::new(pid, None, "init", Some(space), files, q);
        let stack = KernelStack::allocate(&alloc, 1).unwrap();
        let start = SavedContext::new_user(VirtAddr::new(0x1000), VirtAddr::new(0x2000));
        let tid = sched.spawn(pid, start, stack, ThreadFlags::empty()).unwrap();
        parent.add_thread(tid);
        procs.insert(parent).unwrap();
        sched.ready(tid).unwrap();
        let mut ctx = sched.start();
        sched.schedule(&mut ctx, SwitchReason::NewThread);
        Fixture {
            sched,
            procs,
            ctx,
            alloc,
            parent: pid,
        }
    }

    #[test]
    fn test_child_shape() {
        let mut f = fixture(32);
        let mut frame = SavedContext::new_user(VirtAddr::new(0x1234), VirtAddr::new(0x2000));
        frame.set_return_value(57);
        let res = fork(&mut f.sched, &mut f.procs, &f.ctx, &frame, &f.alloc, 1).unwrap();

        let child = f.procs.get(res.child).unwrap();
        assert_eq!(child.parent(), Some(f.parent));
        assert_eq!(child.threads(), &[res.thread]);
        assert_eq!(child.files().open_count(), 1);
        assert_eq!(child.space().unwrap().region_count(), 1);
        assert_eq!(f.procs.get(f.parent).unwrap().children(), &[res.child]);

        let thread = f.sched.thread(res.thread).unwrap();
        assert_eq!(thread.context().return_value(), 0);
        assert_eq!(thread.context().ip, 0x1234);
        assert!(thread.flags().contains(ThreadFlags::FORKED));
        assert_eq!(f.sched.run_queue_len(), 1);
    }

    #[test]
    fn test_oom_leaves_parent_untouched() {
        let mut f = fixture(16);
        let frame = SavedContext::default();
        // Leave exactly one frame: enough for the kernel stack, not for the
        // child's page-table root.
        let mut hog = Vec::new();
        while f.alloc.free_frames() > 1 {
            hog.push(f.alloc.allocate().unwrap());
        }
        let before = f.alloc.free_frames();
        let count = f.procs.count();

        let err = fork(&mut f.sched, &mut f.procs, &f.ctx, &frame, &f.alloc, 1).unwrap_err();
        assert_eq!(err, ExecError::OutOfMemory);
        assert_eq!(f.alloc.free_frames(), before);
        assert_eq!(f.procs.count(), count);
        assert!(f.procs.get(f.parent).unwrap().children().is_empty());
        assert_eq!(f.sched.threads().len(), 1);
        assert!(f.alloc.is_consistent());
    }

    #[test]
    fn test_parent_downgraded_only_by_completed_fork() {
        let mut f = fixture(32);
        let pid = f.parent;
        let page = VirtAddr::new(0x1000);
        let space = f.procs.get_mut(pid).unwrap().space_mut().unwrap();
        copy_to_user(space, page, &[7]).unwrap();
        let writable = |procs: &ProcessTable| {
            let space = procs.get(pid).unwrap().space().unwrap();
            space.pmap().query(page).unwrap().1.is_writable()
        };

        let mut hog = Vec::new();
        while f.alloc.free_frames() > 1 {
            hog.push(f.alloc.allocate().unwrap());
        }
        let frame = SavedContext::default();
        assert!(fork(&mut f.sched, &mut f.procs, &f.ctx, &frame, &f.alloc, 1).is_err());
        assert!(writable(&f.procs));

        drop(hog);
        let res = fork(&mut f.sched, &mut f.procs, &f.ctx, &frame, &f.alloc, 1).unwrap();
        assert!(!writable(&f.procs));
        let child = f.procs.get(res.child).unwrap().space().unwrap();
        assert_eq!(child.pmap().mapped_pages(), 0);
    }

    #[test]
    fn test_fork_needs_current_thread() {
        let mut f = fixture(32);
        let idle = SchedulerContext::new();
        let err = fork(&mut f.sched, &mut f.procs, &idle, &SavedContext::default(), &f.alloc, 1);
        assert_eq!(err, Err(ExecError::NoCurrentThread));
    }
}
