//! # Process Management
//!
//! Process records and the process table.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use strata_hal::VirtAddr;
use strata_memory::AddressSpace;

use crate::fd_table::FileTable;
use crate::scheduler::WaitQueueId;
use crate::signal::{Signal, SignalQueue};
use crate::{ExecError, ExecResult, ProcessId, ThreadId};

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has at least one live thread
    Alive,
    /// Process has exited and waits for its parent
    Zombie,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Called exit with a code
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
}

impl ExitStatus {
    /// Encoded status as reported to a waiting parent
    pub fn wait_status(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => (code & 0xff) << 8,
            ExitStatus::Signaled(signal) => signal.number() as i32,
        }
    }
}

/// Program break of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heap {
    /// First byte of the heap region
    pub start: VirtAddr,
    /// Current break
    pub end: VirtAddr,
}

/// Process structure
pub struct Process {
    /// Process ID
    id: ProcessId,
    /// Parent process
    parent: Option<ProcessId>,
    /// Process name
    name: String,
    /// Current state
    state: ProcessState,
    /// All threads
    threads: Vec<ThreadId>,
    /// Child processes
    children: Vec<ProcessId>,
    /// User address space, `None` for the kernel and after teardown
    space: Option<AddressSpace>,
    /// Open files
    files: FileTable,
    /// Pending signals
    signals: SignalQueue,
    /// Where the parent sleeps while waiting for a child
    child_exit: WaitQueueId,
    /// How the process ended
    exit: Option<ExitStatus>,
    heap: Heap,
}

impl Process {
    /// Create a new process
    pub fn new(
        id: ProcessId,
        parent: Option<ProcessId>,
        name: impl Into<String>,
        space: Option<AddressSpace>,
        files: FileTable,
        child_exit: WaitQueueId,
    ) -> Self {
        Self {
            id,
            parent,
            name: name.into(),
            state: ProcessState::Alive,
            threads: Vec::new(),
            children: Vec::new(),
            space,
            files,
            signals: SignalQueue::new(),
            child_exit,
            exit: None,
            heap: Heap::default(),
        }
    }

    /// Get process ID
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Get parent process
    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    /// Change the parent, when the old one exits
    pub fn set_parent(&mut self, parent: ProcessId) {
        self.parent = Some(parent);
    }

    /// Get process name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Whether the process has exited
    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }

    /// Record the exit and turn into a zombie
    pub fn set_exited(&mut self, status: ExitStatus) {
        self.exit = Some(status);
        self.state = ProcessState::Zombie;
    }

    /// How the process ended
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Threads of the process
    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }

    /// Add a thread
    pub fn add_thread(&mut self, thread: ThreadId) {
        self.threads.push(thread);
    }

    /// Remove a thread
    pub fn remove_thread(&mut self, thread: ThreadId) {
        self.threads.retain(|&t| t != thread);
    }

    /// Child processes
    pub fn children(&self) -> &[ProcessId] {
        &self.children
    }

    /// Add a child process
    pub fn add_child(&mut self, child: ProcessId) {
        self.children.push(child);
    }

    /// Remove a child process
    pub fn remove_child(&mut self, child: ProcessId) {
        self.children.retain(|&c| c != child);
    }

    /// Take every child, for reparenting
    pub fn take_children(&mut self) -> Vec<ProcessId> {
        core::mem::take(&mut self.children)
    }

    /// Address space
    pub fn space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    /// Address space, mutably
    pub fn space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.space.as_mut()
    }

    /// Address space or `InvalidState` for a process without one
    pub fn require_space(&mut self) -> ExecResult<&mut AddressSpace> {
        self.space.as_mut().ok_or(ExecError::InvalidState)
    }

    /// Replace the address space, returning the old one
    pub fn replace_space(&mut self, space: Option<AddressSpace>) -> Option<AddressSpace> {
        core::mem::replace(&mut self.space, space)
    }

    /// Open files
    pub fn files(&self) -> &FileTable {
        &self.files
    }

    /// Open files, mutably
    pub fn files_mut(&mut self) -> &mut FileTable {
        &mut self.files
    }

    /// Pending signals
    pub fn signals(&self) -> &SignalQueue {
        &self.signals
    }

    /// Pending signals, mutably
    pub fn signals_mut(&mut self) -> &mut SignalQueue {
        &mut self.signals
    }

    /// Queue the parent sleeps on while waiting for a child
    pub fn child_exit_queue(&self) -> WaitQueueId {
        self.child_exit
    }

    /// Program break
    pub fn heap(&self) -> Heap {
        self.heap
    }

    /// Set the program break
    pub fn set_heap(&mut self, heap: Heap) {
        self.heap = heap;
    }
}

/// Process table
pub struct ProcessTable {
    processes: BTreeMap<ProcessId, Process>,
    next: u32,
}

impl ProcessTable {
    /// Create an empty table; the first pid handed out is init's
    pub fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            next: ProcessId::INIT.as_u32(),
        }
    }

    /// Pick an unused pid
    pub fn allocate_pid(&mut self) -> ExecResult<ProcessId> {
        for _ in 0..=u32::MAX {
            let pid = ProcessId::new(self.next);
            self.next = self.next.checked_add(1).unwrap_or(ProcessId::INIT.as_u32());
            if !self.processes.contains_key(&pid) {
                return Ok(pid);
            }
        }
        Err(ExecError::OutOfMemory)
    }

    /// Register a process
    pub fn insert(&mut self, process: Process) -> ExecResult<()> {
        let id = process.id();
        if self.processes.contains_key(&id) {
            return Err(ExecError::InvalidArgument);
        }
        self.processes.insert(id, process);
        Ok(())
    }

    /// Get a process
    pub fn get(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(&id)
    }

    /// Get a process mutably
    pub fn get_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&id)
    }

    /// Get a process or `ProcessNotFound`
    pub fn require(&mut self, id: ProcessId) -> ExecResult<&mut Process> {
        self.processes
            .get_mut(&id)
            .ok_or(ExecError::ProcessNotFound)
    }

    /// Unregister a process
    pub fn remove(&mut self, id: ProcessId) -> ExecResult<Process> {
        self.processes
            .remove(&id)
            .ok_or(ExecError::ProcessNotFound)
    }

    /// Whether `parent` has a child matching `pid` (any child for `None`)
    pub fn has_child(&self, parent: ProcessId, pid: Option<ProcessId>) -> bool {
        self.get(parent).is_some_and(|p| {
            p.children()
                .iter()
                .any(|&c| pid.map_or(true, |want| want == c))
        })
    }

    /// First exited child of `parent` matching `pid`
    pub fn zombie_child(&self, parent: ProcessId, pid: Option<ProcessId>) -> Option<ProcessId> {
        let p = self.get(parent)?;
        p.children()
            .iter()
            .copied()
            .filter(|&c| pid.map_or(true, |want| want == c))
            .find(|&c| self.get(c).is_some_and(Process::is_zombie))
    }

    /// Get process count
    pub fn count(&self) -> usize {
        self.processes.len()
    }

    /// Iterate over every process
    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
