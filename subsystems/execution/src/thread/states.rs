//! # Thread States
//!
//! Thread state machine definition.

/// Thread state
///
/// A thread that is on a CPU is still `Runnable`; "running" is tracked by the
/// scheduler, not by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadState {
    /// Thread can be picked by the scheduler
    #[default]
    Runnable,
    /// Sleeping on a wait queue, a signal ends the sleep
    InterruptibleSleep,
    /// Sleeping on a wait queue, only a wake ends the sleep
    UninterruptibleSleep,
    /// Terminated, waiting to be reaped
    Zombie,
}

impl ThreadState {
    /// Check if thread can be scheduled
    pub fn is_runnable(&self) -> bool {
        matches!(self, ThreadState::Runnable)
    }

    /// Check if thread is asleep on a wait queue
    pub fn is_sleeping(&self) -> bool {
        matches!(
            self,
            ThreadState::InterruptibleSleep | ThreadState::UninterruptibleSleep
        )
    }

    /// Check if thread is terminated
    pub fn is_terminated(&self) -> bool {
        matches!(self, ThreadState::Zombie)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ThreadState) -> bool {
        match (self, next) {
            (ThreadState::Zombie, _) => false,
            (ThreadState::Runnable, _) => true,
            (_, ThreadState::Runnable) | (_, ThreadState::Zombie) => true,
            _ => false,
        }
    }
}

/// How a thread sleeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepKind {
    /// Signals end the sleep
    Interruptible,
    /// Only an explicit wake ends the sleep
    Uninterruptible,
}

impl SleepKind {
    /// The thread state this sleep puts a thread into
    pub fn state(self) -> ThreadState {
        match self {
            SleepKind::Interruptible => ThreadState::InterruptibleSleep,
            SleepKind::Uninterruptible => ThreadState::UninterruptibleSleep,
        }
    }
}

/// Outcome of a sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The queue was woken
    Woken,
    /// A signal or queue teardown ended the sleep
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ThreadState::*;
        assert!(Runnable.can_transition_to(InterruptibleSleep));
        assert!(Runnable.can_transition_to(Zombie));
        assert!(UninterruptibleSleep.can_transition_to(Runnable));
        assert!(InterruptibleSleep.can_transition_to(Zombie));
        assert!(!InterruptibleSleep.can_transition_to(UninterruptibleSleep));
        assert!(!Zombie.can_transition_to(Runnable));
    }

    #[test]
    fn test_sleep_kind_state() {
        assert_eq!(SleepKind::Interruptible.state(), ThreadState::InterruptibleSleep);
        assert!(SleepKind::Uninterruptible.state().is_sleeping());
        assert!(!ThreadState::Runnable.is_sleeping());
    }
}
