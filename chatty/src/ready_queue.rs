// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! FIFO of descriptors awaiting service, single producer (the listener),
//! multiple consumers (the worker pool). One condition variable suffices
//! because workers are interchangeable -- any waiter may take the next
//! descriptor.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Condvar, Mutex};

/// Pushed once per worker at shutdown; a worker that pops this exits its
/// loop instead of dispatching a request.
pub const POISON: RawFd = -1;

pub struct ReadyQueue {
    queue: Mutex<VecDeque<RawFd>>,
    not_empty: Condvar,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `fd` then wakes one waiting worker.
    pub fn push(&self, fd: RawFd) {
        let mut guard = self.queue.lock().unwrap();
        guard.push_back(fd);
        self.not_empty.notify_one();
    }

    /// Blocks until a descriptor (or the poison value) is available.
    pub fn pop(&self) -> RawFd {
        let mut guard = self.queue.lock().unwrap();
        loop {
            if let Some(fd) = guard.pop_front() {
                return fd;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_blocks_until_pushed() {
        let queue = Arc::new(ReadyQueue::new());
        let q2 = Arc::clone(&queue);
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(std::time::Duration::from_millis(20));
        queue.push(42);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn preserves_fifo_order() {
        let queue = ReadyQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.pop(), 2);
        assert_eq!(queue.pop(), 3);
    }

    #[test]
    fn poison_value_is_delivered_like_any_fd() {
        let queue = ReadyQueue::new();
        queue.push(POISON);
        assert_eq!(queue.pop(), POISON);
    }
}
