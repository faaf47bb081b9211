// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The worker pool: a fixed number of interchangeable threads, each
//! popping one ready descriptor at a time, reading exactly one request off
//! it, dispatching through [`crate::dispatch`], replying, and handing the
//! descriptor back to the listener over the self-pipe.

use std::os::fd::RawFd;
use std::sync::Arc;

use log::{debug, warn};

use chatty_wire::{read_file_block, read_message, write_count, write_message, FdStream, OpCode};

use crate::context::ServerContext;
use crate::dispatch::{self, RawRequest, Reply};
use crate::ready_queue::POISON;
use crate::self_pipe::ControlOp;
use crate::user::UserStatus;

/// A single worker's loop. Exits when it pops the poison value (teardown
/// pushes exactly one poison per worker).
pub fn run(ctx: Arc<ServerContext>) {
    loop {
        let fd = ctx.ready_queue.pop();
        if fd == POISON {
            debug!("worker exiting");
            return;
        }
        service(&ctx, fd);
    }
}

/// Services exactly one request on `fd`: resolve the caller's online
/// identity, read one frame (plus POSTFILE's trailing file block),
/// dispatch, write the reply, and tell the listener whether to re-arm
/// the descriptor or drop it.
fn service(ctx: &ServerContext, fd: RawFd) {
    let online_nick = ctx.online.lookup(fd);
    let mut stream = FdStream(fd);

    let request = match read_request(&mut stream) {
        Ok(Some(req)) => req,
        Ok(None) => {
            peer_gone(ctx, fd, &online_nick);
            return;
        }
        Err(e) => {
            warn!("fd {fd} malformed request: {e}");
            peer_gone(ctx, fd, &online_nick);
            return;
        }
    };

    let (identity, reply) = dispatch::handle(ctx, fd, online_nick, request);

    if let Err(e) = write_reply_serialized(ctx, fd, &identity, &reply) {
        warn!("fd {fd} reply write failed: {e}");
        // Dispatch may have just registered or connected this fd, so its
        // identity can differ from the one resolved before the request.
        let current = ctx.online.lookup(fd);
        peer_gone(ctx, fd, &current);
        return;
    }

    let _ = ctx.self_pipe.send(fd, ControlOp::ReadyAgain);
}

/// Writes the reply through the user's own shard lock when the caller's
/// identity is known, the same lock [`dispatch::handle`]'s delivery path
/// takes before pushing a `TXT_MESSAGE`/`FILE_MESSAGE` to this descriptor.
/// Without this, a worker writing this reply and another worker pushing a
/// message from a different sender could interleave bytes on the same
/// descriptor. Falls back to a bare descriptor write when there is no
/// online identity yet (pre-REGISTER/CONNECT) or the record is gone
/// (UNREGISTER's reply, sent after the record has already been removed).
fn write_reply_serialized(ctx: &ServerContext, fd: RawFd, identity: &Option<String>, reply: &Reply) -> std::io::Result<()> {
    if let Some(name) = identity {
        let locked = ctx.users.with_shard(name, |g| {
            g.find(name).and_then(|u| u.fd).map(|locked_fd| {
                let mut stream = FdStream(locked_fd);
                write_reply(&mut stream, reply)
            })
        });
        if let Some(result) = locked {
            return result;
        }
    }
    let mut stream = FdStream(fd);
    write_reply(&mut stream, reply)
}

fn read_request(stream: &mut FdStream) -> Result<Option<RawRequest>, chatty_wire::Error> {
    let Some(message) = read_message(stream)? else {
        return Ok(None);
    };
    let file_body = if message.op == OpCode::PostFile {
        match read_file_block(stream)? {
            Some(body) => body,
            None => return Ok(None),
        }
    } else {
        Vec::new()
    };
    Ok(Some(RawRequest { message, file_body }))
}

fn write_reply(stream: &mut FdStream, reply: &Reply) -> std::io::Result<()> {
    match reply {
        Reply::Single(msg) => write_message(stream, msg).map_err(wire_to_io),
        Reply::Stream(messages) => {
            write_count(stream, messages.len() as u32)?;
            for msg in messages {
                write_message(stream, msg).map_err(wire_to_io)?;
            }
            Ok(())
        }
    }
}

fn wire_to_io(e: chatty_wire::Error) -> std::io::Error {
    match e {
        chatty_wire::Error::Io(e) => e,
        chatty_wire::Error::Protocol(e) => std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    }
}

/// The connection is gone -- clean close, malformed frame, or a failed
/// reply write: mark its user offline if it had registered an identity,
/// drop it from the online index, and tell the listener to close the
/// descriptor instead of re-arming it.
fn peer_gone(ctx: &ServerContext, fd: RawFd, online_nick: &Option<String>) {
    if let Some(name) = online_nick {
        ctx.users.with_shard(name, |mut g| {
            if let Some(u) = g.get_mut(name) {
                u.status = UserStatus::Offline;
                u.fd = None;
            }
        });
        ctx.stats.update(|c| c.nonline = c.nonline.saturating_sub(1));
    }
    ctx.online.remove(fd);
    let _ = ctx.self_pipe.send(fd, ControlOp::Close);
}
