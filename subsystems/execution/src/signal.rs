//! # Signals
//!
//! POSIX signal numbers, their default actions and the per-process queue of
//! pending signals. Handlers and masks are not modelled: every signal takes
//! its default action when delivered.

use alloc::collections::VecDeque;
use core::fmt;

/// A POSIX signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Signal {
    Hup = 1,
    Int = 2,
    Quit = 3,
    Ill = 4,
    Trap = 5,
    Abrt = 6,
    Bus = 7,
    Fpe = 8,
    Kill = 9,
    Usr1 = 10,
    Segv = 11,
    Usr2 = 12,
    Pipe = 13,
    Alrm = 14,
    Term = 15,
    Chld = 17,
    Cont = 18,
    Stop = 19,
    Tstp = 20,
    Ttin = 21,
    Ttou = 22,
    Urg = 23,
    Xcpu = 24,
    Xfsz = 25,
    Vtalrm = 26,
    Prof = 27,
    Winch = 28,
    Io = 29,
    Pwr = 30,
    Sys = 31,
}

/// What happens when a signal is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    /// Terminate the process
    Terminate,
    /// Terminate the process, as if it crashed
    Abort,
    /// Discard the signal
    Ignore,
    /// Stop the process
    Stop,
    /// Continue a stopped process
    Continue,
}

impl DefaultAction {
    /// Whether delivery ends the process
    pub fn is_fatal(self) -> bool {
        matches!(self, DefaultAction::Terminate | DefaultAction::Abort)
    }
}

impl Signal {
    const ALL: [Signal; 30] = [
        Signal::Hup,
        Signal::Int,
        Signal::Quit,
        Signal::Ill,
        Signal::Trap,
        Signal::Abrt,
        Signal::Bus,
        Signal::Fpe,
        Signal::Kill,
        Signal::Usr1,
        Signal::Segv,
        Signal::Usr2,
        Signal::Pipe,
        Signal::Alrm,
        Signal::Term,
        Signal::Chld,
        Signal::Cont,
        Signal::Stop,
        Signal::Tstp,
        Signal::Ttin,
        Signal::Ttou,
        Signal::Urg,
        Signal::Xcpu,
        Signal::Xfsz,
        Signal::Vtalrm,
        Signal::Prof,
        Signal::Winch,
        Signal::Io,
        Signal::Pwr,
        Signal::Sys,
    ];

    /// Signal with the given number
    pub fn from_number(number: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.number() == number)
    }

    /// Signal number
    pub const fn number(self) -> u32 {
        self as u32
    }

    /// Action taken on delivery
    pub fn default_action(self) -> DefaultAction {
        use Signal::*;
        match self {
            Abrt | Bus | Fpe | Ill | Quit | Segv | Sys | Trap => DefaultAction::Abort,
            Chld | Urg => DefaultAction::Ignore,
            Stop | Tstp | Ttin | Ttou => DefaultAction::Stop,
            Cont => DefaultAction::Continue,
            _ => DefaultAction::Terminate,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{:?}", self)
    }
}

/// Pending signals of a process, oldest first
///
/// A signal that is already pending is not queued again.
#[derive(Debug, Default)]
pub struct SignalQueue {
    pending: VecDeque<Signal>,
}

impl SignalQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `signal`, returning whether it was newly added
    pub fn push(&mut self, signal: Signal) -> bool {
        if self.contains(signal) {
            return false;
        }
        self.pending.push_back(signal);
        true
    }

    /// Take the oldest pending signal
    pub fn pop(&mut self) -> Option<Signal> {
        self.pending.pop_front()
    }

    /// Whether `signal` is pending
    pub fn contains(&self, signal: Signal) -> bool {
        self.pending.contains(&signal)
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of pending signals
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Discard everything pending
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers() {
        assert_eq!(Signal::Kill.number(), 9);
        assert_eq!(Signal::from_number(11), Some(Signal::Segv));
        assert_eq!(Signal::from_number(16), None);
        assert_eq!(Signal::from_number(0), None);
        assert!(Signal::ALL.iter().all(|&s| Signal::from_number(s.number()) == Some(s)));
    }

    #[test]
    fn test_default_actions() {
        assert_eq!(Signal::Segv.default_action(), DefaultAction::Abort);
        assert_eq!(Signal::Chld.default_action(), DefaultAction::Ignore);
        assert_eq!(Signal::Tstp.default_action(), DefaultAction::Stop);
        assert!(Signal::Term.default_action().is_fatal());
        assert!(!Signal::Cont.default_action().is_fatal());
    }

    #[test]
    fn test_queue_drops_duplicates() {
        let mut q = SignalQueue::new();
        assert!(q.push(Signal::Usr1));
        assert!(q.push(Signal::Term));
        assert!(!q.push(Signal::Usr1));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(Signal::Usr1));
        q.clear();
        assert!(q.is_empty());
    }
}
