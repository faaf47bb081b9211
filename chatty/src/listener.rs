// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The single-threaded listener: owns the accept socket and every
//! currently-connected client descriptor, multiplexing readiness with a
//! `select` wait over that set plus the self-pipe read end. Descriptor
//! ownership (open/close) is centralised here and in the teardown path --
//! a worker never closes a descriptor itself, only signals the listener
//! to do so (see `chatty_wire::FdStream`'s doc comment).

use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use nix::sys::select::{select, FdSet};
use nix::sys::socket::{accept, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};

use chatty_wire::FdStream;

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::self_pipe::ControlOp;

/// Listen backlog: fixed, not configurable.
const LISTEN_BACKLOG: usize = 64;

pub fn run(ctx: Arc<ServerContext>) -> Result<(), ServerError> {
    let mut listener = ChattyListener::bind(&ctx)?;
    listener.main_loop()
}

struct ChattyListener {
    ctx: Arc<ServerContext>,
    accept_owned: OwnedFd,
    accept_fd: RawFd,
    self_pipe_fd: RawFd,
    /// Every currently-connected client descriptor, whether armed for
    /// `select` right now or out for service with a worker. Owns the
    /// descriptor: dropping the `OwnedFd` closes it.
    owned: HashMap<RawFd, OwnedFd>,
    /// The subset of `owned` currently included in the `select` wait set
    /// (`accept_fd` and the self-pipe are always present and tracked
    /// separately).
    armed: HashSet<RawFd>,
}

impl ChattyListener {
    fn bind(ctx: &Arc<ServerContext>) -> Result<Self, ServerError> {
        let path = &ctx.config.socket_path;
        // ENOENT is expected and ignored; a real failure to remove a
        // stale socket surfaces as a bind() error instead.
        let _ = std::fs::remove_file(path);
        let accept_owned = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)?;
        let addr = UnixAddr::new(path).map_err(|e| ServerError::BadArg(format!("bad UnixPath {path:?}: {e}")))?;
        bind(accept_owned.as_raw_fd(), &addr)?;
        listen(&accept_owned, Backlog::new(LISTEN_BACKLOG as i32).expect("64 is a valid backlog"))?;
        let accept_fd = accept_owned.as_raw_fd();
        info!("listening on {}", path.display());
        Ok(Self {
            self_pipe_fd: ctx.self_pipe.read_fd(),
            ctx: Arc::clone(ctx),
            accept_owned,
            accept_fd,
            owned: HashMap::new(),
            armed: HashSet::new(),
        })
    }

    fn main_loop(&mut self) -> Result<(), ServerError> {
        loop {
            let mut readfds = FdSet::new();
            // SAFETY: every fd borrowed here is owned by `self`
            // (`accept_owned`, the self-pipe's read end, or an entry in
            // `owned`) and stays open for this entire loop iteration, which
            // is the only scope these borrows need to outlive.
            let accept_borrow = unsafe { BorrowedFd::borrow_raw(self.accept_fd) };
            let pipe_borrow = unsafe { BorrowedFd::borrow_raw(self.self_pipe_fd) };
            readfds.insert(accept_borrow);
            readfds.insert(pipe_borrow);
            for fd in &self.armed {
                readfds.insert(unsafe { BorrowedFd::borrow_raw(*fd) });
            }

            match select(None, Some(&mut readfds), None, None, None) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    error!("select failed: {e}");
                    let _ = nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR2);
                    return Err(ServerError::Io(e.into()));
                }
            }

            if readfds.contains(pipe_borrow) {
                match self.handle_self_pipe()? {
                    LoopAction::Continue => {}
                    LoopAction::Terminate => return Ok(()),
                }
            }
            if readfds.contains(accept_borrow) {
                self.handle_accept();
            }
            // Ready client descriptors: drop them from the wait set (at
            // most one worker ever has a given fd in flight) and hand
            // them to the pool.
            let ready: Vec<RawFd> = self
                .armed
                .iter()
                .copied()
                .filter(|fd| readfds.contains(unsafe { BorrowedFd::borrow_raw(*fd) }))
                .collect();
            for fd in ready {
                self.armed.remove(&fd);
                trace!("fd {fd} ready, handing to worker pool");
                self.ctx.ready_queue.push(fd);
            }
        }
    }

    fn handle_accept(&mut self) {
        let new_fd = match accept(self.accept_fd) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::EINTR) | Err(nix::errno::Errno::EAGAIN) => return,
            Err(e) => {
                warn!("accept failed: {e}");
                return;
            }
        };
        if self.owned.len() >= self.ctx.config.max_connections {
            debug!("rejecting fd {new_fd}: at MaxConnections cap, no ack sent");
            let _ = nix::unistd::close(unsafe { OwnedFd::from_raw_fd(new_fd) });
            return;
        }
        let mut stream = FdStream(new_fd);
        match chatty_wire::write_accept_ack(&mut stream) {
            Ok(()) => {
                self.owned.insert(new_fd, unsafe { OwnedFd::from_raw_fd(new_fd) });
                self.armed.insert(new_fd);
                debug!("accepted fd {new_fd}, {} connections", self.owned.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("fd {new_fd} gone before accept ack landed");
                let _ = nix::unistd::close(unsafe { OwnedFd::from_raw_fd(new_fd) });
            }
            Err(e) => {
                warn!("failed to write accept ack to fd {new_fd}: {e}");
                let _ = nix::unistd::close(unsafe { OwnedFd::from_raw_fd(new_fd) });
            }
        }
    }

    fn handle_self_pipe(&mut self) -> Result<LoopAction, ServerError> {
        let record = self.ctx.self_pipe.recv()?;
        match record.op {
            ControlOp::ReadyAgain => {
                self.armed.insert(record.fd);
            }
            ControlOp::Close => {
                if !self.armed.contains(&record.fd) {
                    if self.owned.remove(&record.fd).is_some() {
                        debug!("closed fd {} ({} connections left)", record.fd, self.owned.len());
                    }
                }
            }
            ControlOp::Terminate => {
                info!("terminating: closing {} client descriptors", self.owned.len());
                self.owned.clear();
                return Ok(LoopAction::Terminate);
            }
        }
        Ok(LoopAction::Continue)
    }
}

enum LoopAction {
    Continue,
    Terminate,
}
