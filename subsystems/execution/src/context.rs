//! # Scheduler Context
//!
//! The per-CPU record of which thread is executing. It is passed explicitly
//! to every operation that acts on "the current thread" and is only changed
//! by the scheduler's switch step.

use crate::{ExecError, ExecResult, ThreadId};

/// Context switch reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// Voluntary yield
    Yield,
    /// Timer preemption
    Preemption,
    /// Thread blocked
    Blocked,
    /// Thread exited
    Exit,
    /// First dispatch after boot
    NewThread,
}

impl SwitchReason {
    /// Whether the outgoing thread gave up the CPU itself
    pub fn is_voluntary(self) -> bool {
        !matches!(self, SwitchReason::Preemption)
    }
}

/// Per-CPU scheduling state
#[derive(Debug, Default)]
pub struct SchedulerContext {
    current: Option<ThreadId>,
    switches: u64,
}

impl SchedulerContext {
    /// Context of an idle CPU
    pub const fn new() -> Self {
        Self {
            current: None,
            switches: 0,
        }
    }

    /// Thread executing on this CPU
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    /// Thread executing on this CPU, or an error if the CPU is idle
    pub fn require_current(&self) -> ExecResult<ThreadId> {
        self.current.ok_or(ExecError::NoCurrentThread)
    }

    /// Switches performed on this CPU
    pub fn switches(&self) -> u64 {
        self.switches
    }

    pub(crate) fn set_current(&mut self, next: Option<ThreadId>) {
        if next.is_some() && next != self.current {
            self.switches += 1;
        }
        self.current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_current_counts_switches() {
        let mut ctx = SchedulerContext::new();
        assert_eq!(ctx.require_current(), Err(ExecError::NoCurrentThread));
        let t = ThreadId::new(0, 0);
        ctx.set_current(Some(t));
        ctx.set_current(Some(t));
        assert_eq!(ctx.switches(), 1);
        ctx.set_current(None);
        assert_eq!(ctx.current(), None);
        assert!(!SwitchReason::Preemption.is_voluntary());
    }
}
