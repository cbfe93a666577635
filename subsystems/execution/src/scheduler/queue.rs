//! # Scheduler Run Queue
//!
//! The scheduler's FIFO of runnable threads.

use alloc::collections::VecDeque;

use crate::ThreadId;

/// Run queue interface
pub trait RunQueue: Send {
    /// Add a thread at the tail
    fn enqueue(&mut self, id: ThreadId);

    /// Take the thread at the head
    fn dequeue(&mut self) -> Option<ThreadId>;

    /// Peek at the head without removing it
    fn peek(&self) -> Option<ThreadId>;

    /// Whether the queue is empty
    fn is_empty(&self) -> bool;

    /// Number of queued threads
    fn len(&self) -> usize;

    /// Remove a specific thread
    fn remove(&mut self, id: ThreadId) -> bool;
}

/// Simple FIFO run queue
pub struct FifoQueue {
    queue: VecDeque<ThreadId>,
}

impl FifoQueue {
    /// Create a new FIFO queue
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue for FifoQueue {
    fn enqueue(&mut self, id: ThreadId) {
        self.queue.push_back(id);
    }

    fn dequeue(&mut self) -> Option<ThreadId> {
        self.queue.pop_front()
    }

    fn peek(&self) -> Option<ThreadId> {
        self.queue.front().copied()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn remove(&mut self, id: ThreadId) -> bool {
        if let Some(pos) = self.queue.iter().position(|&x| x == id) {
            self.queue.remove(pos);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = FifoQueue::new();
        let (a, b, c) = (ThreadId::new(0, 0), ThreadId::new(1, 0), ThreadId::new(2, 0));
        q.enqueue(a);
        q.enqueue(b);
        q.enqueue(c);
        assert!(q.remove(b));
        assert!(!q.remove(b));
        assert_eq!(q.peek(), Some(a));
        assert_eq!(q.dequeue(), Some(a));
        assert_eq!(q.dequeue(), Some(c));
        assert!(q.is_empty());
    }
}
