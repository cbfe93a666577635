//! # Wait Queues
//!
//! Wait queues live in an arena owned by the scheduler. Threads record the
//! [`WaitQueueId`] they sleep on and queues record thread ids, so neither
//! side holds a pointer to the other. Destroying a queue bumps its slot's
//! generation, which makes every outstanding id for it stale.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::{ExecError, ExecResult, ThreadId};

/// Handle to a wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitQueueId {
    slot: u32,
    generation: u32,
}

/// A FIFO of sleeping threads
struct WaitQueue {
    name: &'static str,
    waiters: VecDeque<ThreadId>,
}

struct Slot {
    generation: u32,
    queue: Option<WaitQueue>,
}

/// Arena of wait queues
#[derive(Default)]
pub struct WaitQueues {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl WaitQueues {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue
    pub fn create(&mut self, name: &'static str) -> ExecResult<WaitQueueId> {
        let queue = WaitQueue {
            name,
            waiters: VecDeque::new(),
        };
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.queue = Some(queue);
            return Ok(WaitQueueId {
                slot,
                generation: entry.generation,
            });
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| ExecError::OutOfMemory)?;
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            queue: Some(queue),
        });
        Ok(WaitQueueId { slot, generation: 0 })
    }

    fn queue(&self, id: WaitQueueId) -> Option<&WaitQueue> {
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.queue.as_ref())
    }

    fn queue_mut(&mut self, id: WaitQueueId) -> Option<&mut WaitQueue> {
        self.slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.queue.as_mut())
    }

    /// Whether `id` names a live queue
    pub fn contains(&self, id: WaitQueueId) -> bool {
        self.queue(id).is_some()
    }

    /// Queue name, for logs
    pub fn name(&self, id: WaitQueueId) -> Option<&'static str> {
        self.queue(id).map(|q| q.name)
    }

    /// Number of threads sleeping on `id`
    pub fn len(&self, id: WaitQueueId) -> usize {
        self.queue(id).map_or(0, |q| q.waiters.len())
    }

    /// Append a sleeper
    pub(crate) fn push(&mut self, id: WaitQueueId, thread: ThreadId) -> ExecResult<()> {
        let queue = self.queue_mut(id).ok_or(ExecError::InvalidArgument)?;
        queue
            .waiters
            .try_reserve(1)
            .map_err(|_| ExecError::OutOfMemory)?;
        queue.waiters.push_back(thread);
        Ok(())
    }

    /// Drop `thread` from `id`, if it is there
    pub(crate) fn remove_waiter(&mut self, id: WaitQueueId, thread: ThreadId) -> bool {
        let Some(queue) = self.queue_mut(id) else {
            return false;
        };
        match queue.waiters.iter().position(|&t| t == thread) {
            Some(pos) => {
                queue.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Take every sleeper, in arrival order
    pub(crate) fn drain(&mut self, id: WaitQueueId) -> ExecResult<VecDeque<ThreadId>> {
        let queue = self.queue_mut(id).ok_or(ExecError::InvalidArgument)?;
        Ok(core::mem::take(&mut queue.waiters))
    }

    /// Destroy a queue, returning the threads still on it
    pub(crate) fn destroy(&mut self, id: WaitQueueId) -> ExecResult<VecDeque<ThreadId>> {
        let slot = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .ok_or(ExecError::InvalidArgument)?;
        let queue = slot.queue.take().ok_or(ExecError::InvalidArgument)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot);
        Ok(queue.waiters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_drain_order() {
        let mut queues = WaitQueues::new();
        let q = queues.create("test").unwrap();
        let (a, b) = (ThreadId::new(0, 0), ThreadId::new(1, 0));
        queues.push(q, a).unwrap();
        queues.push(q, b).unwrap();
        assert_eq!(queues.len(q), 2);
        let drained: Vec<_> = queues.drain(q).unwrap().into_iter().collect();
        assert_eq!(drained, [a, b]);
        assert_eq!(queues.len(q), 0);
    }

    #[test]
    fn test_destroyed_id_is_stale() {
        let mut queues = WaitQueues::new();
        let q = queues.create("old").unwrap();
        queues.push(q, ThreadId::new(3, 0)).unwrap();
        assert_eq!(queues.destroy(q).unwrap().len(), 1);
        let r = queues.create("new").unwrap();
        assert_ne!(q, r);
        assert!(!queues.contains(q));
        assert!(queues.push(q, ThreadId::new(0, 0)).is_err());
        assert!(!queues.remove_waiter(q, ThreadId::new(3, 0)));
        assert_eq!(queues.name(r), Some("new"));
    }
}
