// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Descriptor -> nickname lookup, letting a worker resolve the caller's
//! identity without parsing credentials out of every frame. Stores the
//! nickname rather than a borrowed record reference: the actual record
//! always lives behind its own registry shard lock, so a worker resolves
//! `fd -> nickname -> ShardedTable::with_shard(nickname)` rather than
//! holding a raw reference across registry operations.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Mutex;

pub struct OnlineIndex {
    by_fd: Mutex<HashMap<RawFd, String>>,
}

impl OnlineIndex {
    pub fn new() -> Self {
        Self {
            by_fd: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, fd: RawFd, nickname: String) {
        self.by_fd.lock().unwrap().insert(fd, nickname);
    }

    pub fn remove(&self, fd: RawFd) -> Option<String> {
        self.by_fd.lock().unwrap().remove(&fd)
    }

    pub fn lookup(&self, fd: RawFd) -> Option<String> {
        self.by_fd.lock().unwrap().get(&fd).cloned()
    }

    /// A bounded snapshot of every currently-online nickname, used by
    /// USRLIST and by REGISTER/CONNECT's online-user-list reply.
    pub fn online_nicknames(&self) -> Vec<String> {
        self.by_fd.lock().unwrap().values().cloned().collect()
    }
}

impl Default for OnlineIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove_round_trip() {
        let idx = OnlineIndex::new();
        idx.insert(7, "alice".into());
        assert_eq!(idx.lookup(7), Some("alice".to_string()));
        assert_eq!(idx.remove(7), Some("alice".to_string()));
        assert_eq!(idx.lookup(7), None);
    }
}
