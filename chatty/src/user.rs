// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The user record and its registry.

use std::collections::BTreeSet;
use std::os::fd::RawFd;

use chatty_wire::{FdStream, Message};

use crate::history::History;
use crate::registry::ShardedTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Online,
    Offline,
    Inactive,
}

pub struct UserRecord {
    pub nickname: String,
    pub status: UserStatus,
    /// Meaningful only when `status == Online`.
    pub fd: Option<RawFd>,
    pub history: History,
    /// Groups this user currently belongs to, by name.
    pub groups: BTreeSet<String>,
}

impl UserRecord {
    pub fn new(nickname: String, max_hist: usize) -> Self {
        Self {
            nickname,
            status: UserStatus::Offline,
            fd: None,
            history: History::new(max_hist),
            groups: BTreeSet::new(),
        }
    }

    /// Writes `msg` directly to this user's descriptor. Every reply and
    /// push send that can be routed through a known user record goes
    /// through this method, so that the shard lock held while calling it
    /// serialises concurrent writers to the same descriptor.
    pub fn send(&self, msg: &Message) -> std::io::Result<()> {
        let fd = self
            .fd
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "user is not online"))?;
        let mut stream = FdStream(fd);
        chatty_wire::write_message(&mut stream, msg).map_err(|e| match e {
            chatty_wire::Error::Io(io) => io,
            chatty_wire::Error::Protocol(p) => std::io::Error::other(p.to_string()),
        })
    }
}

pub type UserRegistry = ShardedTable<UserRecord>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_user_is_offline_with_empty_history() {
        let u = UserRecord::new("alice".into(), 10);
        assert_eq!(u.status, UserStatus::Offline);
        assert!(u.fd.is_none());
        assert!(u.history.is_empty());
        assert!(u.groups.is_empty());
    }
}
