//! # Thread Arena
//!
//! Generational slot storage for thread records. Queues refer to threads by
//! [`ThreadId`], never by pointer, so a reaped slot can be reused without
//! dangling references: the generation check turns stale ids into misses.

use alloc::vec::Vec;

use super::Thread;
use crate::ThreadId;

struct Slot {
    generation: u32,
    thread: Option<Thread>,
}

/// Arena of thread records
#[derive(Default)]
pub struct ThreadArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ThreadArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id for a thread about to be inserted
    ///
    /// Allocation failure is reported as `None`.
    pub(crate) fn next_id(&mut self) -> Option<ThreadId> {
        if let Some(&slot) = self.free.last() {
            return Some(ThreadId::new(slot, self.slots[slot as usize].generation));
        }
        self.slots.try_reserve(1).ok()?;
        Some(ThreadId::new(self.slots.len() as u32, 0))
    }

    /// Store a thread created with the id from [`next_id`](Self::next_id)
    pub(crate) fn insert(&mut self, thread: Thread) {
        let id = thread.id();
        if self.free.last() == Some(&(id.slot() as u32)) {
            self.free.pop();
            self.slots[id.slot()].thread = Some(thread);
        } else {
            self.slots.push(Slot {
                generation: id.generation(),
                thread: Some(thread),
            });
        }
        self.live += 1;
    }

    /// Look up a thread
    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.slots
            .get(id.slot())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.thread.as_ref())
    }

    /// Look up a thread mutably
    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.slots
            .get_mut(id.slot())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.thread.as_mut())
    }

    /// Remove a thread, retiring its id
    pub fn remove(&mut self, id: ThreadId) -> Option<Thread> {
        let slot = self
            .slots
            .get_mut(id.slot())
            .filter(|s| s.generation == id.generation())?;
        let thread = slot.thread.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot() as u32);
        self.live -= 1;
        Some(thread)
    }

    /// Number of live threads
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the arena holds no threads
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live threads
    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.slots.iter().filter_map(|s| s.thread.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{KernelStack, ThreadFlags};
    use crate::ProcessId;
    use alloc::sync::Arc;
    use strata_hal::arch_stubs::SoftRam;
    use strata_hal::cpu::SavedContext;
    use strata_hal::PhysAddr;
    use strata_memory::FrameAllocator;

    fn thread(arena: &mut ThreadArena, alloc: &FrameAllocator) -> ThreadId {
        let id = arena.next_id().unwrap();
        let stack = KernelStack::allocate(alloc, 1).unwrap();
        let flags = ThreadFlags::empty();
        arena.insert(Thread::new(id, ProcessId::INIT, SavedContext::default(), stack, flags));
        id
    }

    #[test]
    fn test_stale_id_misses() {
        let ram = Arc::new(SoftRam::new(PhysAddr::new(0), 4));
        let alloc = FrameAllocator::new(PhysAddr::new(0), 4, ram).unwrap();
        let mut arena = ThreadArena::new();
        let a = thread(&mut arena, &alloc);
        assert!(arena.remove(a).is_some());
        let b = thread(&mut arena, &alloc);
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 1);
    }
}
