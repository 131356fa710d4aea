//! Task identifiers and the per-core ready queue.

use core::fmt;

use crate::config::READY_QUEUE_CAPACITY;

/// Process id of the kernel itself; idle tasks are its threads.
pub const KERNEL_PROCESS: u32 = 0;

/// A `(process, thread)` pair naming one schedulable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub process: u32,
    pub thread: u32,
}

impl TaskId {
    /// No task; what a core runs before its first task is assigned.
    pub const NONE: TaskId = TaskId::new(u32::MAX, u32::MAX);

    pub const fn new(process: u32, thread: u32) -> Self {
        Self { process, thread }
    }

    /// The idle task of core `core_id`.
    pub const fn idle(core_id: usize) -> Self {
        Self::new(KERNEL_PROCESS, core_id as u32)
    }

    pub const fn pack(self) -> u64 {
        (self.process as u64) << 32 | self.thread as u64
    }

    pub const fn unpack(packed: u64) -> Self {
        Self::new((packed >> 32) as u32, packed as u32)
    }

    pub const fn is_none(self) -> bool {
        self.pack() == Self::NONE.pack()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("<none>")
        } else {
            write!(f, "{}:{}", self.process, self.thread)
        }
    }
}

/// Fixed-capacity FIFO ring. A push into a full ring evicts the oldest entry.
pub struct RingQueue<T, const N: usize> {
    items: [T; N],
    read: usize,
    write: usize,
    len: usize,
}

impl<T: Copy + Default, const N: usize> RingQueue<T, N> {
    pub fn new() -> Self {
        Self {
            items: [T::default(); N],
            read: 0,
            write: 0,
            len: 0,
        }
    }

    /// Appends `item`, returning the entry evicted to make room, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.len == N {
            let oldest = self.items[self.read];
            self.read = (self.read + 1) % N;
            self.len -= 1;
            Some(oldest)
        } else {
            None
        };

        self.items[self.write] = item;
        self.write = (self.write + 1) % N;
        self.len += 1;

        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        let item = self.items[self.read];
        self.read = (self.read + 1) % N;
        self.len -= 1;

        Some(item)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: Copy + Default, const N: usize> Default for RingQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

pub type ReadyQueue = RingQueue<TaskId, READY_QUEUE_CAPACITY>;

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{boxed::Box, vec::Vec};

    use super::*;

    #[test]
    fn task_id_packs_losslessly() {
        for (process, thread) in [(0, 0), (1, 2), (u32::MAX, 0), (0, u32::MAX), (0xDEAD, 0xBEEF)] {
            let id = TaskId::new(process, thread);

            assert_eq!(TaskId::unpack(id.pack()), id);
        }

        assert_eq!(TaskId::new(1, 2).pack(), 0x0000_0001_0000_0002);
    }

    #[test]
    fn none_is_distinct_from_idle_tasks() {
        assert!(TaskId::NONE.is_none());
        assert!(!TaskId::idle(0).is_none());
        assert_eq!(TaskId::default(), TaskId::NONE);
        assert_ne!(TaskId::idle(1), TaskId::idle(2));
    }

    #[test]
    fn queue_is_fifo() {
        let mut queue = RingQueue::<u32, 4>::new();

        assert_eq!(queue.pop(), None);

        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));

        queue.push(3);
        queue.push(4);
        queue.push(5);

        assert_eq!(queue.len(), 4);
        assert_eq!(core::iter::from_fn(|| queue.pop()).collect::<Vec<_>>(), [2, 3, 4, 5]);
    }

    #[test]
    fn full_ready_queue_keeps_the_newest_entries() {
        let mut queue = Box::new(ReadyQueue::new());
        let mut evicted = Vec::new();

        for thread in 0..=READY_QUEUE_CAPACITY as u32 {
            evicted.extend(queue.push(TaskId::new(1, thread)));
        }

        assert_eq!(evicted, [TaskId::new(1, 0)]);
        assert_eq!(queue.len(), READY_QUEUE_CAPACITY);

        let remaining: Vec<_> = core::iter::from_fn(|| queue.pop()).collect();
        let expected: Vec<_> = (1..=READY_QUEUE_CAPACITY as u32)
            .map(|thread| TaskId::new(1, thread))
            .collect();

        assert_eq!(remaining, expected);
        assert!(queue.is_empty());
    }
}
