//! # Scheduler
//!
//! Single-CPU FIFO scheduler. Runnable threads are served in arrival order;
//! sleeping threads wait on queues held in the scheduler's wait-queue arena.
//!
//! Sleeping is two-phase. [`Scheduler::prepare_to_wait`] parks the current
//! thread on a queue, the switch step gives the CPU away, and
//! [`Scheduler::finish_wait`] collects the outcome once the thread is
//! Runnable again. A wake that lands between the first two steps simply
//! leaves the thread Runnable, so it is never lost.

pub mod metrics;
pub mod queue;
pub mod wait;

use alloc::boxed::Box;
use alloc::sync::Arc;

use strata_hal::cpu::{Cpu, SavedContext};

use crate::context::{SchedulerContext, SwitchReason};
use crate::thread::{
    KernelStack, SleepKind, Thread, ThreadArena, ThreadFlags, ThreadState, WaitResult,
};
use crate::{ExecError, ExecResult, ProcessId, ThreadId};

pub use metrics::SchedulerMetrics;
pub use queue::{FifoQueue, RunQueue};
pub use wait::{WaitQueueId, WaitQueues};

/// The scheduler
pub struct Scheduler {
    threads: ThreadArena,
    run_queue: Box<dyn RunQueue>,
    waits: WaitQueues,
    cpu: Arc<dyn Cpu>,
    /// Where the CPU's idle loop resumes when nothing is runnable
    idle: SavedContext,
    metrics: SchedulerMetrics,
}

impl Scheduler {
    /// Create a scheduler driving `cpu`
    pub fn new(cpu: Arc<dyn Cpu>) -> Self {
        Self {
            threads: ThreadArena::new(),
            run_queue: Box::new(FifoQueue::new()),
            waits: WaitQueues::new(),
            cpu,
            idle: SavedContext::default(),
            metrics: SchedulerMetrics::new(),
        }
    }

    /// Hand out the context of the boot CPU
    pub fn start(&self) -> SchedulerContext {
        log::info!("Scheduler started, {} threads", self.threads.len());
        SchedulerContext::new()
    }

    /// The CPU this scheduler drives
    pub fn cpu(&self) -> &Arc<dyn Cpu> {
        &self.cpu
    }

    /// Create a thread in the Runnable state
    ///
    /// The thread is not queued until [`ready`](Self::ready) is called.
    pub fn spawn(
        &mut self,
        process: ProcessId,
        context: SavedContext,
        kernel_stack: KernelStack,
        flags: ThreadFlags,
    ) -> ExecResult<ThreadId> {
        let id = self.threads.next_id().ok_or(ExecError::OutOfMemory)?;
        self.threads
            .insert(Thread::new(id, process, context, kernel_stack, flags));
        log::debug!("Spawned thread {} in process {}", id, process);
        Ok(id)
    }

    /// Look up a thread
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id)
    }

    /// Look up a thread mutably
    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(id)
    }

    /// All live threads
    pub fn threads(&self) -> &ThreadArena {
        &self.threads
    }

    /// Reap a zombie thread, releasing its record and kernel stack
    pub fn remove(&mut self, id: ThreadId) -> ExecResult<Thread> {
        let thread = self.threads.get(id).ok_or(ExecError::ThreadNotFound)?;
        if !thread.state.is_terminated() || thread.on_cpu {
            return Err(ExecError::InvalidState);
        }
        self.threads.remove(id).ok_or(ExecError::ThreadNotFound)
    }

    /// Create a wait queue
    pub fn create_wait_queue(&mut self, name: &'static str) -> ExecResult<WaitQueueId> {
        self.waits.create(name)
    }

    /// Destroy a wait queue; remaining sleepers wake as `Interrupted`
    pub fn destroy_wait_queue(&mut self, q: WaitQueueId) -> ExecResult<usize> {
        let waiters = self.waits.destroy(q)?;
        let mut woken = 0;
        for id in waiters {
            let member = self.threads.get(id).is_some_and(|t| t.wait == Some(q));
            if member && self.wake_thread(id, WaitResult::Interrupted) {
                woken += 1;
            }
        }
        Ok(woken)
    }

    /// Threads sleeping on `q`
    pub fn wait_queue_len(&self, q: WaitQueueId) -> usize {
        self.waits.len(q)
    }

    /// Name `q` was created with
    pub fn wait_queue_name(&self, q: WaitQueueId) -> Option<&'static str> {
        self.waits.name(q)
    }

    /// Whether `q` is a live wait queue
    pub fn has_wait_queue(&self, q: WaitQueueId) -> bool {
        self.waits.contains(q)
    }

    /// Make a thread Runnable and queue it
    ///
    /// Any wait-queue membership is dropped first. A thread that is already
    /// queued or executing is not queued twice.
    pub fn ready(&mut self, id: ThreadId) -> ExecResult<()> {
        let thread = self.threads.get_mut(id).ok_or(ExecError::ThreadNotFound)?;
        if thread.state.is_terminated() {
            return Err(ExecError::InvalidState);
        }
        if let Some(q) = thread.wait.take() {
            self.waits.remove_waiter(q, id);
            thread.wake = Some(WaitResult::Woken);
        }
        thread.state = ThreadState::Runnable;
        if !thread.on_cpu && !thread.queued {
            thread.queued = true;
            self.run_queue.enqueue(id);
        }
        Ok(())
    }

    /// Park the current thread on `q` without giving up the CPU
    pub fn prepare_to_wait(
        &mut self,
        ctx: &SchedulerContext,
        q: WaitQueueId,
        kind: SleepKind,
    ) -> ExecResult<ThreadId> {
        let id = ctx.require_current()?;
        if !self.waits.contains(q) {
            return Err(ExecError::InvalidArgument);
        }
        let thread = self.threads.get_mut(id).ok_or(ExecError::ThreadNotFound)?;
        if thread.wait.is_some() {
            return Err(ExecError::AlreadyWaiting);
        }
        if !thread.state.is_runnable() {
            return Err(ExecError::InvalidState);
        }
        self.waits.push(q, id)?;
        thread.state = kind.state();
        thread.wait = Some(q);
        thread.wake = None;
        self.metrics.record_block();
        log::trace!("Thread {} sleeps on {:?}", id, self.waits.name(q));
        Ok(id)
    }

    /// Collect the outcome of a sleep
    ///
    /// Fails with `WouldBlock` while the thread is still asleep.
    pub fn finish_wait(&mut self, id: ThreadId) -> ExecResult<WaitResult> {
        let thread = self.threads.get_mut(id).ok_or(ExecError::ThreadNotFound)?;
        if thread.state.is_sleeping() {
            return Err(ExecError::WouldBlock);
        }
        if let Some(q) = thread.wait.take() {
            self.waits.remove_waiter(q, id);
        }
        thread.wake.take().ok_or(ExecError::InvalidState)
    }

    /// Sleep on `q` until woken or interrupted
    pub fn block_on(
        &mut self,
        ctx: &mut SchedulerContext,
        q: WaitQueueId,
        kind: SleepKind,
    ) -> ExecResult<WaitResult> {
        self.block_on_with(ctx, q, kind, |_| {})
    }

    /// [`block_on`](Self::block_on), running `before_resume` on the next thread
    pub fn block_on_with<F>(
        &mut self,
        ctx: &mut SchedulerContext,
        q: WaitQueueId,
        kind: SleepKind,
        before_resume: F,
    ) -> ExecResult<WaitResult>
    where
        F: FnMut(&Thread),
    {
        let id = self.prepare_to_wait(ctx, q, kind)?;
        self.schedule_with(ctx, SwitchReason::Blocked, before_resume);
        self.finish_wait(id)
    }

    /// Wake every thread sleeping on `q`, in arrival order
    pub fn wake_all(&mut self, q: WaitQueueId) -> ExecResult<usize> {
        let waiters = self.waits.drain(q)?;
        let mut woken = 0;
        for id in waiters {
            // Entries left behind by a thread that already moved on
            let member = self.threads.get(id).is_some_and(|t| t.wait == Some(q));
            if member && self.wake_thread(id, WaitResult::Woken) {
                woken += 1;
            }
        }
        Ok(woken)
    }

    /// End an interruptible sleep
    ///
    /// Returns whether the thread was interrupted. Threads in any other
    /// state are left alone.
    pub fn interrupt(&mut self, id: ThreadId) -> ExecResult<bool> {
        let thread = self.threads.get_mut(id).ok_or(ExecError::ThreadNotFound)?;
        if thread.state != ThreadState::InterruptibleSleep {
            return Ok(false);
        }
        if let Some(q) = thread.wait {
            self.waits.remove_waiter(q, id);
        }
        Ok(self.wake_thread(id, WaitResult::Interrupted))
    }

    fn wake_thread(&mut self, id: ThreadId, result: WaitResult) -> bool {
        let Some(thread) = self.threads.get_mut(id) else {
            return false;
        };
        if !thread.state.is_sleeping() {
            return false;
        }
        thread.wait = None;
        thread.wake = Some(result);
        thread.state = ThreadState::Runnable;
        if !thread.on_cpu && !thread.queued {
            thread.queued = true;
            self.run_queue.enqueue(id);
        }
        match result {
            WaitResult::Woken => self.metrics.record_wakeup(),
            WaitResult::Interrupted => self.metrics.record_interrupted(),
        }
        true
    }

    /// Turn a thread into a zombie, dropping it from every queue
    ///
    /// The caller still has to [`schedule`](Self::schedule) away from it if
    /// it is the current thread.
    pub fn exit_thread(&mut self, id: ThreadId, code: i32) -> ExecResult<()> {
        let thread = self.threads.get_mut(id).ok_or(ExecError::ThreadNotFound)?;
        if thread.state.is_terminated() {
            return Err(ExecError::InvalidState);
        }
        if let Some(q) = thread.wait.take() {
            self.waits.remove_waiter(q, id);
        }
        if thread.queued {
            thread.queued = false;
            self.run_queue.remove(id);
        }
        thread.wake = None;
        thread.state = ThreadState::Zombie;
        thread.set_exit_code(code);
        log::debug!("Thread {} exited with {}", id, code);
        Ok(())
    }

    fn pick_next(&mut self) -> Option<ThreadId> {
        while let Some(id) = self.run_queue.dequeue() {
            let Some(thread) = self.threads.get_mut(id) else {
                continue;
            };
            thread.queued = false;
            if thread.state.is_runnable() {
                return Some(id);
            }
        }
        None
    }

    /// Give the CPU to the next runnable thread
    pub fn schedule(&mut self, ctx: &mut SchedulerContext, reason: SwitchReason) {
        self.schedule_with(ctx, reason, |_| {});
    }

    /// [`schedule`](Self::schedule), running `before_resume` on the incoming
    /// thread just before its context is loaded
    ///
    /// The outgoing thread goes back to the tail of the run queue if it is
    /// still Runnable. On hardware the call returns when the outgoing thread
    /// is resumed; on a CPU that does not switch stacks it returns at once.
    pub fn schedule_with<F>(
        &mut self,
        ctx: &mut SchedulerContext,
        reason: SwitchReason,
        mut before_resume: F,
    ) where
        F: FnMut(&Thread),
    {
        match reason {
            SwitchReason::Yield => self.metrics.record_yield(),
            SwitchReason::Preemption => self.metrics.record_preemption(),
            _ => {}
        }

        let prev = ctx.current();
        if let Some(thread) = prev.and_then(|id| self.threads.get_mut(id)) {
            thread.on_cpu = false;
            if thread.state.is_runnable() && !thread.queued {
                thread.queued = true;
                self.run_queue.enqueue(thread.id());
            }
        }

        let Some(next) = self.pick_next() else {
            ctx.set_current(None);
            self.metrics.record_idle();
            match prev.and_then(|id| self.threads.get_mut(id)) {
                Some(thread) => {
                    log::trace!("Thread {} -> idle ({:?})", thread.id(), reason);
                    let idle = self.idle.clone();
                    // SAFETY: the idle context was captured from this CPU's
                    // idle loop, whose stack outlives every thread.
                    unsafe { self.cpu.resume_context(Some(&mut thread.context), &idle) };
                }
                None => self.cpu.halt(),
            }
            return;
        };

        let Some(thread) = self.threads.get_mut(next) else {
            return;
        };
        thread.on_cpu = true;
        ctx.set_current(Some(next));
        if prev == Some(next) {
            return;
        }
        self.metrics.record_context_switch();
        before_resume(&*thread);
        let to = thread.context.clone();
        log::trace!("Switch {:?} -> {} ({:?})", prev, next, reason);

        let from = match prev.and_then(|id| self.threads.get_mut(id)) {
            Some(thread) => &mut thread.context,
            None => &mut self.idle,
        };
        // SAFETY: `to` was saved from, or built for, a thread that owns a
        // live kernel stack, and `before_resume` installed its address space.
        unsafe { self.cpu.resume_context(Some(from), &to) };
    }

    /// Voluntarily give up the CPU
    pub fn yield_now(&mut self, ctx: &mut SchedulerContext) {
        self.schedule(ctx, SwitchReason::Yield);
    }

    /// Timer tick: the current thread goes to the back of the queue
    pub fn tick(&mut self, ctx: &mut SchedulerContext) {
        self.tick_with(ctx, |_| {});
    }

    /// [`tick`](Self::tick) with a `before_resume` hook
    pub fn tick_with<F>(&mut self, ctx: &mut SchedulerContext, before_resume: F)
    where
        F: FnMut(&Thread),
    {
        self.metrics.record_tick();
        if self.run_queue.is_empty() {
            return;
        }
        self.schedule_with(ctx, SwitchReason::Preemption, before_resume);
    }

    /// Number of queued runnable threads
    pub fn run_queue_len(&self) -> usize {
        self.run_queue.len()
    }

    /// Scheduler metrics
    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }
}
