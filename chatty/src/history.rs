// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bounded per-user FIFO of posted messages, evicting the oldest entry
//! once full. There is no separate list-level mutex: `History` is only
//! reachable through `UserRecord`'s own methods, which always run under
//! the owning shard guard -- the shard lock *is* the history's lock.

use std::collections::VecDeque;

use chatty_wire::Message;

pub struct HistoryEntry {
    pub message: Message,
    pub delivered: bool,
}

pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a message, evicting the oldest entry once at capacity --
    /// evict-head, since history has no comparator to order by.
    pub fn push(&mut self, message: Message, delivered: bool) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { message, delivered });
    }

    /// Returns every entry in FIFO order for GETPREVMSGS, marking each
    /// delivered (false -> true at most once; already-true entries stay
    /// true). The bool in each pair is whether the entry was *already*
    /// delivered before this call, so the caller can transfer stats only
    /// for entries that just transitioned.
    pub fn replay_and_mark_delivered(&mut self) -> Vec<(Message, bool)> {
        self.entries
            .iter_mut()
            .map(|e| {
                let was_delivered = e.delivered;
                e.delivered = true;
                (e.message.clone(), was_delivered)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatty_wire::OpCode;

    fn msg(payload: &str) -> Message {
        Message::new(OpCode::TxtMessage, "bob").with_payload(payload.as_bytes().to_vec())
    }

    #[test]
    fn evicts_oldest_once_over_capacity() {
        let mut h = History::new(2);
        h.push(msg("one"), false);
        h.push(msg("two"), false);
        h.push(msg("three"), false);
        assert_eq!(h.len(), 2);
        let replayed = h.replay_and_mark_delivered();
        assert_eq!(replayed[0].0.payload, b"two");
        assert_eq!(replayed[1].0.payload, b"three");
    }

    #[test]
    fn delivered_flag_transitions_at_most_once() {
        let mut h = History::new(4);
        h.push(msg("hi"), false);
        let first = h.replay_and_mark_delivered();
        assert!(!first[0].1);
        let second = h.replay_and_mark_delivered();
        assert!(second[0].1);
    }

    #[test]
    fn exactly_at_capacity_keeps_every_entry() {
        let mut h = History::new(3);
        for payload in ["a", "b", "c"] {
            h.push(msg(payload), false);
        }
        assert_eq!(h.len(), 3);
    }
}
