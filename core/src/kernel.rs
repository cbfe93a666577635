//! # Kernel Object
//!
//! The kernel-wide lock, the state it protects and the scheduling and
//! thread interfaces.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};
use strata_execution::process::ProcessTable;
use strata_execution::thread::{KernelStack, ThreadFlags};
use strata_execution::{
    ExecError, ProcessId, Scheduler, SchedulerContext, SleepKind, SwitchReason, Thread, ThreadId,
    ThreadState, WaitQueueId, WaitResult,
};
use strata_hal::cpu::SavedContext;
use strata_hal::mmu::Mmu;
use strata_hal::{VirtAddr, PAGE_SIZE};
use strata_memory::MemoryStats;
use strata_memory::{
    AddressSpace, Backing, FileObject, FrameAllocator, RegionFlags, SpaceKind, VirtRange,
};

use crate::config::KernelConfig;
use crate::error::KernelResult;
use crate::Platform;

/// Everything the kernel lock protects
pub(crate) struct KernelState {
    pub(crate) allocator: FrameAllocator,
    pub(crate) mmu: Arc<dyn Mmu>,
    pub(crate) sched: Scheduler,
    pub(crate) procs: ProcessTable,
    pub(crate) kernel_space: AddressSpace,
    /// File objects by file id, shared by every mapping of the same file
    pub(crate) objects: BTreeMap<u64, Weak<FileObject>>,
}

/// The kernel core
pub struct Kernel {
    state: Mutex<KernelState>,
    config: KernelConfig,
}

/// Builds the hook that installs the incoming thread's address space
fn space_switcher<'a>(
    procs: &'a ProcessTable,
    kernel_space: &'a AddressSpace,
) -> impl FnMut(&Thread) + 'a {
    move |next| match procs.get(next.process()).and_then(|p| p.space()) {
        Some(space) => space.switch_to(),
        None => kernel_space.switch_to(),
    }
}

impl KernelState {
    /// Process the CPU is running
    pub(crate) fn current_process(&self, ctx: &SchedulerContext) -> KernelResult<ProcessId> {
        let tid = ctx.require_current()?;
        let thread = self.sched.thread(tid).ok_or(ExecError::ThreadNotFound)?;
        Ok(thread.process())
    }

    pub(crate) fn schedule(&mut self, ctx: &mut SchedulerContext, reason: SwitchReason) {
        let KernelState {
            sched,
            procs,
            kernel_space,
            ..
        } = self;
        sched.schedule_with(ctx, reason, space_switcher(procs, kernel_space));
    }

    /// Sleep on `q`, refusing an interruptible sleep while a signal is pending
    pub(crate) fn block(
        &mut self,
        ctx: &mut SchedulerContext,
        q: WaitQueueId,
        kind: SleepKind,
    ) -> KernelResult<WaitResult> {
        let pid = self.current_process(ctx)?;
        let pending = self
            .procs
            .get(pid)
            .is_some_and(|p| !p.signals().is_empty());
        if kind == SleepKind::Interruptible && pending {
            return Ok(WaitResult::Interrupted);
        }
        let KernelState {
            sched,
            procs,
            kernel_space,
            ..
        } = self;
        Ok(sched.block_on_with(ctx, q, kind, space_switcher(procs, kernel_space))?)
    }

    /// Make the kernel's page table active if `space` is the active one
    pub(crate) fn leave_space(&self, space: &AddressSpace) {
        if space.pmap().is_active() {
            self.kernel_space.switch_to();
        }
    }
}

impl Kernel {
    /// Bring up the kernel core on `platform`
    pub fn new(platform: Platform, config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        let allocator = FrameAllocator::new(platform.phys_base, platform.frames, platform.memory)?;
        let kernel_space = AddressSpace::new(
            SpaceKind::Kernel,
            VirtRange::new(config.kernel_base, config.kernel_top),
            platform.mmu.clone(),
            allocator.clone(),
        )?;
        kernel_space.switch_to();
        log::info!(
            "Kernel core up on {}: {} frames at {}",
            strata_hal::ARCH_NAME,
            platform.frames,
            platform.phys_base
        );
        Ok(Self {
            state: Mutex::new(KernelState {
                allocator,
                mmu: platform.mmu,
                sched: Scheduler::new(platform.cpu),
                procs: ProcessTable::new(),
                kernel_space,
                objects: BTreeMap::new(),
            }),
            config,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock()
    }

    /// Active configuration
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Release the kernel lock on behalf of a freshly dispatched thread
    ///
    /// # Safety
    /// Must only be called by a thread that was resumed for the first time
    /// by a switch performed under the lock, before it returns to user mode.
    pub unsafe fn release_after_first_dispatch(&self) {
        // SAFETY: the switching thread's guard is logically ours now.
        unsafe { self.state.force_unlock() };
    }

    /// Hand out the boot CPU's scheduler context
    pub fn start(&self) -> SchedulerContext {
        self.lock().sched.start()
    }

    /// Create a thread in `pid` that starts at `entry` with `arg` in its
    /// first argument register
    ///
    /// A user stack is carved out of the process's address space.
    pub fn thread_create(
        &self,
        pid: ProcessId,
        entry: VirtAddr,
        arg: u64,
    ) -> KernelResult<ThreadId> {
        let mut state = self.lock();
        let KernelState {
            allocator,
            sched,
            procs,
            ..
        } = &mut *state;
        let process = procs.require(pid)?;
        if process.is_zombie() {
            return Err(ExecError::InvalidState.into());
        }

        let kernel_stack = KernelStack::allocate(allocator, self.config.kernel_stack_pages)?;
        let stack_len = self.config.user_stack_pages as u64 * PAGE_SIZE;
        let space = process.require_space()?;
        let stack_base = space.install(None, stack_len, RegionFlags::URW, Backing::Anonymous)?;

        let mut context = SavedContext::new_user(entry, stack_base.add(stack_len));
        context.set_syscall_arg(0, arg);
        let tid = match sched.spawn(pid, context, kernel_stack, ThreadFlags::empty()) {
            Ok(tid) => tid,
            Err(e) => {
                let _ = space.remove_region(stack_base);
                return Err(e.into());
            }
        };
        process.add_thread(tid);
        sched.ready(tid)?;
        log::debug!("Thread {} created in {} at {}", tid, pid, entry);
        Ok(tid)
    }

    /// Create a wait queue
    pub fn wait_queue_create(&self, name: &'static str) -> KernelResult<WaitQueueId> {
        Ok(self.lock().sched.create_wait_queue(name)?)
    }

    /// Destroy a wait queue; its sleepers wake as interrupted
    pub fn wait_queue_destroy(&self, q: WaitQueueId) -> KernelResult<usize> {
        Ok(self.lock().sched.destroy_wait_queue(q)?)
    }

    /// Put the running thread to sleep on `q`
    ///
    /// On a CPU that switches stacks this returns once the thread is woken.
    /// Otherwise it returns `WouldBlock` and the outcome is collected later
    /// with [`thread_finish_wait`](Self::thread_finish_wait).
    pub fn thread_block(
        &self,
        ctx: &mut SchedulerContext,
        q: WaitQueueId,
        kind: SleepKind,
    ) -> KernelResult<WaitResult> {
        self.lock().block(ctx, q, kind)
    }

    /// Collect how a thread's last sleep ended
    pub fn thread_finish_wait(&self, tid: ThreadId) -> KernelResult<WaitResult> {
        Ok(self.lock().sched.finish_wait(tid)?)
    }

    /// Wake every thread sleeping on `q`
    pub fn thread_wake(&self, q: WaitQueueId) -> KernelResult<usize> {
        let woken = self.lock().sched.wake_all(q)?;
        log::debug!("Woke {} threads", woken);
        Ok(woken)
    }

    /// Give up the CPU
    pub fn schedule(&self, ctx: &mut SchedulerContext) {
        self.lock().schedule(ctx, SwitchReason::Yield);
    }

    /// Timer interrupt: rotate to the next runnable thread
    pub fn timer_tick(&self, ctx: &mut SchedulerContext) {
        let mut state = self.lock();
        let KernelState {
            sched,
            procs,
            kernel_space,
            ..
        } = &mut *state;
        sched.tick_with(ctx, space_switcher(procs, kernel_space));
    }

    /// State of a thread
    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.lock().sched.thread(tid).map(Thread::state)
    }

    /// Saved register state of a thread that is off the CPU
    pub fn thread_context(&self, tid: ThreadId) -> Option<SavedContext> {
        self.lock().sched.thread(tid).map(|t| t.context().clone())
    }

    /// Process the CPU is running
    pub fn current_process(&self, ctx: &SchedulerContext) -> Option<ProcessId> {
        self.lock().current_process(ctx).ok()
    }

    /// Threads of a process
    pub fn threads_of(&self, pid: ProcessId) -> Vec<ThreadId> {
        self.lock()
            .procs
            .get(pid)
            .map(|p| p.threads().to_vec())
            .unwrap_or_default()
    }

    /// Context switches performed so far
    pub fn context_switches(&self) -> u64 {
        self.lock().sched.metrics().context_switches()
    }

    /// Frame allocator statistics
    pub fn memory_stats(&self) -> MemoryStats {
        self.lock().allocator.stats()
    }

    /// Free frames
    pub fn free_frames(&self) -> usize {
        self.lock().allocator.free_frames()
    }

    /// Whether every frame's count matches its holders
    pub fn is_consistent(&self) -> bool {
        self.lock().allocator.is_consistent()
    }

    /// Create an empty user address space
    pub fn address_space_new(&self) -> KernelResult<AddressSpace> {
        let state = self.lock();
        Ok(AddressSpace::new(
            SpaceKind::User,
            VirtRange::new(self.config.user_base, self.config.user_top),
            state.mmu.clone(),
            state.allocator.clone(),
        )?)
    }

    /// Tear down an address space that no process uses any more
    pub fn address_space_destroy(&self, space: AddressSpace) {
        self.lock().leave_space(&space);
        space.destroy();
    }
}
