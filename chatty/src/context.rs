// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! `ServerContext` bundles every piece of shared server state into a
//! single struct built once at startup and handed by reference to every
//! actor, in place of file-scope globals.

use crate::config::Config;
use crate::error::ServerError;
use crate::file_store::FileStore;
use crate::group::GroupRegistry;
use crate::online_index::OnlineIndex;
use crate::ready_queue::ReadyQueue;
use crate::self_pipe::SelfPipe;
use crate::stats::Stats;
use crate::user::UserRegistry;

/// Shard count for both the user and group registries. Picked generously
/// for a teaching-scale server -- plenty of parallelism, never so many
/// that `keys_snapshot`'s per-shard locking dominates.
pub const REGISTRY_SHARDS: usize = 16;

pub struct ServerContext {
    pub config: Config,
    pub users: UserRegistry,
    pub groups: GroupRegistry,
    pub online: OnlineIndex,
    pub stats: Stats,
    pub files: FileStore,
    pub self_pipe: SelfPipe,
    pub ready_queue: ReadyQueue,
}

impl ServerContext {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let files = FileStore::new(config.dir_name.clone());
        let self_pipe = SelfPipe::new()?;
        Ok(Self {
            users: UserRegistry::new(REGISTRY_SHARDS),
            groups: GroupRegistry::new(REGISTRY_SHARDS),
            online: OnlineIndex::new(),
            stats: Stats::new(),
            files,
            self_pipe,
            ready_queue: ReadyQueue::new(),
            config,
        })
    }

    /// Nicknames are globally unique across users *and* groups.
    pub fn name_taken(&self, name: &str) -> bool {
        self.users.contains(name) || self.groups.contains(name)
    }
}
