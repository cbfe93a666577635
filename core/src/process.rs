//! # Process Interfaces
//!
//! Process creation, fork, exit and reaping, signal delivery and the exec
//! hand-off.

use alloc::string::String;
use alloc::vec::Vec;

use strata_execution::fd_table::FileTable;
use strata_execution::fork::fork;
use strata_execution::process::{Heap, Process, ProcessState};
use strata_execution::signal::DefaultAction;
use strata_execution::{
    ExecError, ExitStatus, ProcessId, SchedulerContext, Signal, SleepKind, SwitchReason,
    WaitResult,
};
use strata_hal::cpu::SavedContext;
use strata_hal::VirtAddr;
use strata_memory::{AddressSpace, SpaceKind, VirtRange};

use crate::error::KernelResult;
use crate::kernel::{Kernel, KernelState};

impl KernelState {
    /// Queue `signal` on `pid` and interrupt its interruptible sleepers
    ///
    /// Signals whose default action is not fatal are discarded, since no
    /// handlers exist to run for them.
    pub(crate) fn signal_process(&mut self, pid: ProcessId, signal: Signal) -> KernelResult<()> {
        let process = self.procs.require(pid)?;
        if process.is_zombie() {
            return Ok(());
        }
        if !signal.default_action().is_fatal() {
            log::trace!("Process {}: {} discarded", pid, signal);
            return Ok(());
        }
        if process.signals_mut().push(signal) {
            log::debug!("Process {}: {} pending", pid, signal);
        }
        for &tid in process.threads() {
            self.sched.interrupt(tid)?;
        }
        Ok(())
    }

    /// End a process: zombie threads, released memory and files, orphans
    /// handed to init, parent notified
    pub(crate) fn terminate(&mut self, pid: ProcessId, status: ExitStatus) -> KernelResult<()> {
        let process = self.procs.require(pid)?;
        if process.is_zombie() {
            return Ok(());
        }
        let code = match status {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signal) => 128 + signal.number() as i32,
        };
        for &tid in process.threads() {
            if let Err(e) = self.sched.exit_thread(tid, code) {
                log::debug!("Thread {} already gone: {}", tid, e);
            }
        }
        process.files_mut().close_all();
        process.signals_mut().clear();
        let space = process.replace_space(None);
        let orphans = process.take_children();
        let parent = process.parent();
        process.set_exited(status);

        if let Some(space) = space {
            self.leave_space(&space);
            space.destroy();
        }

        if !orphans.is_empty() && pid != ProcessId::INIT {
            let mut zombie_orphan = false;
            for &child in &orphans {
                if let Some(c) = self.procs.get_mut(child) {
                    c.set_parent(ProcessId::INIT);
                    zombie_orphan |= c.is_zombie();
                }
            }
            if let Some(init) = self.procs.get_mut(ProcessId::INIT) {
                orphans.iter().for_each(|&c| init.add_child(c));
                let q = init.child_exit_queue();
                if zombie_orphan {
                    self.sched.wake_all(q)?;
                }
            }
        }

        if let Some(parent) = parent {
            self.signal_process(parent, Signal::Chld)?;
            if let Some(q) = self.procs.get(parent).map(Process::child_exit_queue) {
                self.sched.wake_all(q)?;
            }
        }
        log::info!("Process {} exited: {:?}", pid, status);
        Ok(())
    }

    /// Release an exited child and return how it ended
    pub(crate) fn reap(&mut self, parent: ProcessId, child: ProcessId) -> KernelResult<ExitStatus> {
        let process = self.procs.get(child).ok_or(ExecError::ProcessNotFound)?;
        if process.parent() != Some(parent) {
            return Err(ExecError::NoChild.into());
        }
        let status = match (process.state(), process.exit_status()) {
            (ProcessState::Zombie, Some(status)) => status,
            _ => return Err(ExecError::InvalidState.into()),
        };
        for &tid in process.threads() {
            self.sched.remove(tid)?;
        }
        let q = process.child_exit_queue();
        self.sched.destroy_wait_queue(q)?;
        self.procs.remove(child)?;
        if let Some(p) = self.procs.get_mut(parent) {
            p.remove_child(child);
        }
        log::debug!("Process {} reaped by {}", child, parent);
        Ok(status)
    }
}

impl Kernel {
    /// Create a process with an empty user address space
    ///
    /// The first process created gets [`ProcessId::INIT`].
    pub fn process_create(&self, name: &str, parent: Option<ProcessId>) -> KernelResult<ProcessId> {
        let space = self.address_space_new()?;
        let mut state = self.lock();
        if let Some(parent) = parent {
            state.procs.require(parent)?;
        }
        let pid = state.procs.allocate_pid()?;
        let child_exit = state.sched.create_wait_queue(self.config().child_exit_queue)?;
        let files = FileTable::new(self.config().max_open_files);
        let mut process = Process::new(
            pid,
            parent,
            String::from(name),
            Some(space),
            files,
            child_exit,
        );
        process.set_heap(Heap {
            start: self.config().heap_base,
            end: self.config().heap_base,
        });
        state.procs.insert(process)?;
        if let Some(parent) = parent {
            state.procs.require(parent)?.add_child(pid);
        }
        log::info!("Process {} ({}) created", pid, name);
        Ok(pid)
    }

    /// Fork the running process
    ///
    /// `frame` is the register state the parent trapped with. The child
    /// resumes from a copy of it returning 0; the parent gets the child's pid.
    pub fn on_syscall_fork(
        &self,
        ctx: &SchedulerContext,
        frame: &SavedContext,
    ) -> KernelResult<ProcessId> {
        let mut state = self.lock();
        let KernelState {
            allocator,
            sched,
            procs,
            ..
        } = &mut *state;
        match fork(sched, procs, ctx, frame, allocator, self.config().kernel_stack_pages) {
            Ok(result) => {
                log::info!("Forked process {}", result.child);
                Ok(result.child)
            }
            Err(e) => {
                log::warn!("fork failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Exit the running process with `code` and switch away
    pub fn exit(&self, ctx: &mut SchedulerContext, code: i32) -> KernelResult<()> {
        let mut state = self.lock();
        let pid = state.current_process(ctx)?;
        state.terminate(pid, ExitStatus::Exited(code))?;
        state.schedule(ctx, SwitchReason::Exit);
        Ok(())
    }

    /// Wait for a child of the running process to exit and reap it
    ///
    /// `pid == None` waits for any child. Returns the child and its encoded
    /// wait status. Fails with ECHILD when there is nothing to wait for and
    /// with EINTR when a signal arrives first.
    pub fn wait_child(
        &self,
        ctx: &mut SchedulerContext,
        pid: Option<ProcessId>,
    ) -> KernelResult<(ProcessId, i32)> {
        let mut state = self.lock();
        let me = state.current_process(ctx)?;
        loop {
            if let Some(child) = state.procs.zombie_child(me, pid) {
                let status = state.reap(me, child)?;
                return Ok((child, status.wait_status()));
            }
            if !state.procs.has_child(me, pid) {
                return Err(ExecError::NoChild.into());
            }
            let q = state.procs.require(me)?.child_exit_queue();
            match state.block(ctx, q, SleepKind::Interruptible)? {
                WaitResult::Woken => continue,
                WaitResult::Interrupted => return Err(ExecError::Interrupted.into()),
            }
        }
    }

    /// Reap an exited child on behalf of `parent`
    pub fn reap(&self, parent: ProcessId, child: ProcessId) -> KernelResult<ExitStatus> {
        self.lock().reap(parent, child)
    }

    /// Send `signal` to a process
    pub fn send_signal(&self, pid: ProcessId, signal: Signal) -> KernelResult<()> {
        self.lock().signal_process(pid, signal)
    }

    /// Act on the running process's pending signals before it returns to
    /// user mode
    ///
    /// Returns the fatal signal if one ended the process, in which case the
    /// CPU has already switched away from it.
    pub fn deliver_signals(&self, ctx: &mut SchedulerContext) -> KernelResult<Option<Signal>> {
        let mut state = self.lock();
        let pid = state.current_process(ctx)?;
        while let Some(signal) = state.procs.require(pid)?.signals_mut().pop() {
            match signal.default_action() {
                DefaultAction::Terminate | DefaultAction::Abort => {
                    log::warn!("Process {} killed by {}", pid, signal);
                    state.terminate(pid, ExitStatus::Signaled(signal))?;
                    state.schedule(ctx, SwitchReason::Exit);
                    return Ok(Some(signal));
                }
                DefaultAction::Ignore | DefaultAction::Stop | DefaultAction::Continue => {}
            }
        }
        Ok(None)
    }

    /// Replace the running process's image with a loader-built space
    ///
    /// The old space is torn down, close-on-exec descriptors are closed and
    /// the calling thread restarts at `entry` on `stack`.
    pub fn exec_replace(
        &self,
        ctx: &SchedulerContext,
        space: AddressSpace,
        entry: VirtAddr,
        stack: VirtAddr,
    ) -> KernelResult<()> {
        if space.kind() != SpaceKind::User {
            return Err(ExecError::InvalidArgument.into());
        }
        let mut state = self.lock();
        let tid = ctx.require_current()?;
        let pid = state.current_process(ctx)?;
        let process = state.procs.require(pid)?;
        if process.threads().len() != 1 {
            return Err(ExecError::InvalidState.into());
        }
        space.switch_to();
        let old = process.replace_space(Some(space));
        process.files_mut().close_on_exec();
        process.signals_mut().clear();
        process.set_heap(Heap {
            start: self.config().heap_base,
            end: self.config().heap_base,
        });
        if let Some(old) = old {
            old.destroy();
        }
        if let Some(thread) = state.sched.thread_mut(tid) {
            *thread.context_mut() = SavedContext::new_user(entry, stack);
        }
        log::info!("Process {} exec at {}", pid, entry);
        Ok(())
    }

    /// User address range new spaces are created with
    pub fn user_range(&self) -> VirtRange {
        VirtRange::new(self.config().user_base, self.config().user_top)
    }

    /// State of a process
    pub fn process_state(&self, pid: ProcessId) -> Option<ProcessState> {
        self.lock().procs.get(pid).map(Process::state)
    }

    /// Exit status of a zombie process
    pub fn exit_status(&self, pid: ProcessId) -> Option<ExitStatus> {
        self.lock().procs.get(pid).and_then(Process::exit_status)
    }

    /// Parent of a process
    pub fn parent_of(&self, pid: ProcessId) -> Option<ProcessId> {
        self.lock().procs.get(pid).and_then(Process::parent)
    }

    /// Children of a process
    pub fn children_of(&self, pid: ProcessId) -> Vec<ProcessId> {
        self.lock()
            .procs
            .get(pid)
            .map(|p| p.children().to_vec())
            .unwrap_or_default()
    }

    /// Number of signals pending on a process
    pub fn pending_signals(&self, pid: ProcessId) -> usize {
        self.lock().procs.get(pid).map_or(0, |p| p.signals().len())
    }

    /// Open descriptors of a process
    pub fn open_files(&self, pid: ProcessId) -> usize {
        self.lock().procs.get(pid).map_or(0, |p| p.files().open_count())
    }
}
