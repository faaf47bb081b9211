// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! chatty: a multi-user chat server. Clients authenticate by nickname,
//! exchange text and file messages with other users and user groups, and
//! replay a bounded per-user history.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod file_store;
pub mod group;
pub mod history;
pub mod listener;
pub mod online_index;
pub mod ready_queue;
pub mod registry;
pub mod self_pipe;
pub mod signals;
pub mod stats;
pub mod user;
pub mod worker;

pub use context::ServerContext;
pub use error::ServerError;
