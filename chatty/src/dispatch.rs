// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The operation vocabulary: one function per op-code, each taking the
//! already-decoded request and the caller's resolved online identity (or
//! `None` before REGISTER/CONNECT) and producing a reply plus any
//! registry/history/stats side effects.
//!
//! Every op here acquires at most one registry shard lock at a time.
//! Cross-entity work (fan-out, cascades) is a sequence of independent
//! `with_shard` calls, each released before the next is taken -- never two
//! shard guards of the same registry held simultaneously.

use std::os::fd::RawFd;

use chatty_wire::{Message, OpCode};

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::file_store::basename;
use crate::group::{GroupRecord, GroupStatus};
use crate::user::{UserRecord, UserStatus};

/// A fully-read request: the header+data frame, plus the file body that
/// trails a POSTFILE request (empty for every other op).
pub struct RawRequest {
    pub message: Message,
    pub file_body: Vec<u8>,
}

/// What the worker should write back to the requester. `Stream` is
/// GETPREVMSGS's count-frame-then-N-messages shape; every other op
/// replies with exactly one frame.
pub enum Reply {
    Single(Message),
    Stream(Vec<Message>),
}

/// Which stats counters a delivery attempt updates -- POSTTXT/POSTTXTALL
/// use the text pair, POSTFILE uses the file pair.
#[derive(Clone, Copy)]
enum DeliveryKind {
    Text,
    File,
}

impl DeliveryKind {
    fn on_delivered(self, ctx: &ServerContext) {
        ctx.stats.update(|c| match self {
            DeliveryKind::Text => c.ndelivered += 1,
            DeliveryKind::File => c.nfiledelivered += 1,
        });
    }

    fn on_not_delivered(self, ctx: &ServerContext) {
        ctx.stats.update(|c| match self {
            DeliveryKind::Text => c.nnotdelivered += 1,
            DeliveryKind::File => c.nfilenotdelivered += 1,
        });
    }
}

/// Top-level entry point: runs the op, maps any `ServerError` to its reply
/// op-code and bumps `nerrors`, and returns the identity that should be
/// used to route the reply (through the user record when known).
pub fn handle(ctx: &ServerContext, fd: RawFd, online_nick: Option<String>, req: RawRequest) -> (Option<String>, Reply) {
    match try_handle(ctx, fd, &online_nick, &req) {
        Ok((identity, reply)) => (identity, reply),
        Err(e) => {
            ctx.stats.update(|c| c.nerrors += 1);
            let reply = Message::new(e.reply_op_code(), String::new());
            (online_nick, Reply::Single(reply))
        }
    }
}

fn try_handle(
    ctx: &ServerContext,
    fd: RawFd,
    online_nick: &Option<String>,
    req: &RawRequest,
) -> Result<(Option<String>, Reply), ServerError> {
    let msg = &req.message;
    match msg.op {
        OpCode::Register => register(ctx, fd, online_nick, msg),
        OpCode::Connect => connect(ctx, fd, online_nick, msg),
        OpCode::PostTxt => post_txt(ctx, online_nick, msg),
        OpCode::PostTxtAll => post_txt_all(ctx, online_nick, msg),
        OpCode::PostFile => post_file(ctx, online_nick, msg, &req.file_body),
        OpCode::GetFile => get_file(ctx, online_nick, msg),
        OpCode::GetPrevMsgs => get_prev_msgs(ctx, online_nick),
        OpCode::UsrList => usr_list(ctx, online_nick),
        OpCode::Unregister => unregister(ctx, fd, online_nick, msg),
        OpCode::CreateGroup => create_group(ctx, online_nick, msg),
        OpCode::AddGroup => add_group(ctx, online_nick, msg),
        OpCode::DelGroup => del_group(ctx, online_nick, msg),
        OpCode::CancGroup => canc_group(ctx, online_nick, msg),
        // Replies and push ops never arrive as requests.
        OpCode::Ok
        | OpCode::NickAlready
        | OpCode::NickUnknown
        | OpCode::MsgTooLong
        | OpCode::NoSuchFile
        | OpCode::Fail
        | OpCode::NoCreator
        | OpCode::TxtMessage
        | OpCode::FileMessage => Err(ServerError::BadArg(format!("{:?} is not a valid request op", msg.op))),
    }
}

fn require_online<'a>(online_nick: &'a Option<String>) -> Result<&'a str, ServerError> {
    online_nick.as_deref().ok_or(ServerError::NotFound)
}

/// Packs nicknames into fixed `MAX_NAME_LENGTH + 1`-wide NUL-padded fields,
/// one per name, concatenated -- the same `get_listname` layout the
/// original uses for every name list it hands back to a client (the extra
/// byte over `MAX_NAME_LENGTH` guarantees a name at the length limit still
/// carries its own terminating NUL instead of running into the next
/// field). REGISTER/CONNECT's online-user list and USRLIST's snapshot
/// share this one encoding.
fn pack_name_list(names: &[String]) -> Vec<u8> {
    let field_width = chatty_wire::MAX_NAME_LENGTH + 1;
    let mut buf = Vec::with_capacity(names.len() * field_width);
    for name in names {
        let mut field = vec![0u8; field_width];
        let bytes = name.as_bytes();
        let n = bytes.len().min(chatty_wire::MAX_NAME_LENGTH);
        field[..n].copy_from_slice(&bytes[..n]);
        buf.extend_from_slice(&field);
    }
    buf
}

fn online_user_list(ctx: &ServerContext) -> Vec<u8> {
    let mut names = ctx.online.online_nicknames();
    names.sort();
    pack_name_list(&names)
}

fn ok(payload: Vec<u8>) -> Reply {
    Reply::Single(Message::new(OpCode::Ok, String::new()).with_payload(payload))
}

fn register(
    ctx: &ServerContext,
    fd: RawFd,
    online_nick: &Option<String>,
    msg: &Message,
) -> Result<(Option<String>, Reply), ServerError> {
    if online_nick.is_some() {
        return Err(ServerError::Denied);
    }
    let name = msg.sender.clone();
    if ctx.name_taken(&name) {
        return Err(ServerError::AlreadyExists);
    }
    ctx.users.with_shard(&name, |mut g| {
        let mut rec = UserRecord::new(name.clone(), ctx.config.max_hist_msgs);
        rec.status = UserStatus::Online;
        rec.fd = Some(fd);
        g.insert(name.clone(), rec).map_err(|_| ServerError::AlreadyExists)
    })?;
    ctx.online.insert(fd, name.clone());
    ctx.stats.update(|c| {
        c.nusers += 1;
        c.nonline += 1;
    });
    Ok((Some(name), ok(online_user_list(ctx))))
}

fn connect(
    ctx: &ServerContext,
    fd: RawFd,
    online_nick: &Option<String>,
    msg: &Message,
) -> Result<(Option<String>, Reply), ServerError> {
    if online_nick.is_some() {
        return Err(ServerError::Denied);
    }
    let name = msg.sender.clone();
    ctx.users.with_shard(&name, |mut g| match g.get_mut(&name) {
        None => Err(ServerError::NotFound),
        Some(u) if u.status == UserStatus::Online => Err(ServerError::Denied),
        Some(u) => {
            u.status = UserStatus::Online;
            u.fd = Some(fd);
            Ok(())
        }
    })?;
    ctx.online.insert(fd, name.clone());
    ctx.stats.update(|c| c.nonline += 1);
    Ok((Some(name), ok(online_user_list(ctx))))
}

/// Delivers `msg` to `nickname`'s record: pushed live if online, appended
/// undelivered to history otherwise. A push that hits a dead descriptor
/// (EPIPE, peer gone) is a peer error, not a system one: the receiver is
/// marked offline and CLOSE is raised for its descriptor, same as if its
/// own worker had seen the EOF.
fn deliver_single(ctx: &ServerContext, nickname: &str, msg: &Message, kind: DeliveryKind) {
    ctx.users.with_shard(nickname, |mut g| {
        let Some(user) = g.get_mut(nickname) else {
            return;
        };
        if user.status == UserStatus::Online {
            match user.send(msg) {
                Ok(()) => {
                    user.history.push(msg.clone(), true);
                    kind.on_delivered(ctx);
                }
                Err(_) => {
                    let dead_fd = user.fd.take();
                    user.status = UserStatus::Offline;
                    user.history.push(msg.clone(), false);
                    kind.on_not_delivered(ctx);
                    if let Some(dead_fd) = dead_fd {
                        ctx.online.remove(dead_fd);
                        let _ = ctx.self_pipe.send(dead_fd, crate::self_pipe::ControlOp::Close);
                    }
                }
            }
        } else {
            user.history.push(msg.clone(), false);
            kind.on_not_delivered(ctx);
        }
    });
}

/// Resolves `receiver` per POSTTXT/POSTFILE's shared precondition
/// (sender==receiver short-circuits without a registry lookup) and fans
/// the message out to it -- a single user, or every member of a group the
/// sender belongs to.
fn resolve_receiver_and_deliver(
    ctx: &ServerContext,
    sender: &str,
    receiver: &str,
    msg: &Message,
    kind: DeliveryKind,
) -> Result<(), ServerError> {
    if receiver == sender || ctx.users.contains(receiver) {
        deliver_single(ctx, receiver, msg, kind);
        return Ok(());
    }
    if ctx.groups.contains(receiver) {
        let members = ctx.groups.with_shard(receiver, |g| {
            g.find(receiver)
                .filter(|grp| grp.status == GroupStatus::Active && grp.members.contains(sender))
                .map(|grp| grp.members.iter().cloned().collect::<Vec<_>>())
        });
        return match members {
            Some(members) => {
                for member in members {
                    deliver_single(ctx, &member, msg, kind);
                }
                Ok(())
            }
            None => Err(ServerError::NotFound),
        };
    }
    Err(ServerError::NotFound)
}

fn post_txt(ctx: &ServerContext, online_nick: &Option<String>, msg: &Message) -> Result<(Option<String>, Reply), ServerError> {
    let sender = require_online(online_nick)?;
    if msg.payload.len() > ctx.config.max_msg_size {
        return Err(ServerError::TooLong);
    }
    let out = Message::new(OpCode::TxtMessage, sender).with_payload(msg.payload.clone());
    resolve_receiver_and_deliver(ctx, sender, &msg.receiver, &out, DeliveryKind::Text)?;
    Ok((online_nick.clone(), ok(Vec::new())))
}

fn post_txt_all(ctx: &ServerContext, online_nick: &Option<String>, msg: &Message) -> Result<(Option<String>, Reply), ServerError> {
    let sender = require_online(online_nick)?;
    if msg.payload.len() > ctx.config.max_msg_size {
        return Err(ServerError::TooLong);
    }
    let out = Message::new(OpCode::TxtMessage, sender).with_payload(msg.payload.clone());
    // Every registered user, sender included -- the sender is itself a
    // registered user and counts toward the delivered/not-delivered tally
    // like any other recipient.
    for name in ctx.users.keys_snapshot() {
        deliver_single(ctx, &name, &out, DeliveryKind::Text);
    }
    Ok((online_nick.clone(), ok(Vec::new())))
}

fn post_file(
    ctx: &ServerContext,
    online_nick: &Option<String>,
    msg: &Message,
    file_body: &[u8],
) -> Result<(Option<String>, Reply), ServerError> {
    let sender = require_online(online_nick)?;
    if file_body.len() > ctx.config.max_file_size {
        return Err(ServerError::TooLong);
    }
    let path = std::str::from_utf8(&msg.payload).map_err(|_| ServerError::BadArg("non-UTF8 file path".into()))?;
    let name = basename(path)?;
    ctx.files.save(&name, file_body)?;
    let out = Message::new(OpCode::FileMessage, sender).with_payload(name.into_bytes());
    resolve_receiver_and_deliver(ctx, sender, &msg.receiver, &out, DeliveryKind::File)?;
    Ok((online_nick.clone(), ok(Vec::new())))
}

fn get_file(ctx: &ServerContext, online_nick: &Option<String>, msg: &Message) -> Result<(Option<String>, Reply), ServerError> {
    require_online(online_nick)?;
    let name = std::str::from_utf8(&msg.payload).map_err(|_| ServerError::BadArg("non-UTF8 file name".into()))?;
    // The mapping's borrow ends with this statement -- copied out before
    // the reply is built, so it is released well before the descriptor
    // goes back to the listener.
    let bytes = ctx.files.load(name)?.to_vec();
    Ok((online_nick.clone(), ok(bytes)))
}

fn get_prev_msgs(ctx: &ServerContext, online_nick: &Option<String>) -> Result<(Option<String>, Reply), ServerError> {
    let sender = require_online(online_nick)?;
    let entries = ctx
        .users
        .with_shard(sender, |mut g| g.get_mut(sender).map(|u| u.history.replay_and_mark_delivered()).unwrap_or_default());
    // A transfer, not a pure increment: each entry that just transitioned
    // false->true moves its count from nnotdelivered to ndelivered so the
    // sum stays conserved.
    let newly_delivered = entries.iter().filter(|(_, was_delivered)| !was_delivered).count() as u64;
    if newly_delivered > 0 {
        ctx.stats.update(|c| {
            c.ndelivered += newly_delivered;
            c.nnotdelivered = c.nnotdelivered.saturating_sub(newly_delivered);
        });
    }
    let messages = entries.into_iter().map(|(m, _)| m).collect();
    Ok((online_nick.clone(), Reply::Stream(messages)))
}

fn usr_list(ctx: &ServerContext, online_nick: &Option<String>) -> Result<(Option<String>, Reply), ServerError> {
    require_online(online_nick)?;
    let mut names = ctx.online.online_nicknames();
    names.sort();
    Ok((online_nick.clone(), ok(pack_name_list(&names))))
}

/// Tears a group down: validates `caller` is its creator, transitions it
/// ACTIVE -> DELETION -> removed (a DELETION group is never re-observed
/// ACTIVE because the registry drops it in the same critical section),
/// and strips the membership reference from every member still holding
/// one. Shared by CANCGROUP, DELGROUP-by-creator, and UNREGISTER's
/// cascade over groups the departing user created.
fn cancel_group(ctx: &ServerContext, name: &str, caller: &str) -> Result<(), ServerError> {
    let removed = ctx.groups.with_shard(name, |mut g| match g.find(name) {
        None => Err(ServerError::NotFound),
        Some(grp) if grp.creator != caller => Err(ServerError::NoCreator),
        Some(_) => {
            if let Some(grp) = g.get_mut(name) {
                grp.status = GroupStatus::Deletion;
            }
            Ok(g.remove(name).expect("just observed present"))
        }
    })?;
    for member in removed.members.iter() {
        ctx.users.with_shard(member, |mut g| {
            if let Some(u) = g.get_mut(member) {
                u.groups.remove(name);
            }
        });
    }
    ctx.stats.update(|c| c.ngroups = c.ngroups.saturating_sub(1));
    Ok(())
}

fn unregister(
    ctx: &ServerContext,
    fd: RawFd,
    online_nick: &Option<String>,
    msg: &Message,
) -> Result<(Option<String>, Reply), ServerError> {
    let sender = require_online(online_nick)?;
    if !msg.receiver.is_empty() && msg.receiver != sender {
        return Err(ServerError::Denied);
    }
    // Mark INACTIVE before the record leaves the registry -- its lifetime
    // ends once both hold (status == INACTIVE *and* removed), so the two
    // happen back to back under the same shard guard rather than the
    // record jumping straight from ONLINE to gone.
    let group_names = ctx.users.with_shard(sender, |mut g| {
        if let Some(u) = g.get_mut(sender) {
            u.status = UserStatus::Inactive;
            u.fd = None;
        }
        g.remove(sender).map(|u| u.groups.into_iter().collect::<Vec<_>>()).unwrap_or_default()
    });
    ctx.online.remove(fd);
    ctx.stats.update(|c| c.nonline = c.nonline.saturating_sub(1));
    // Pop the departing user's group list: groups they created cascade a
    // full cancel_group (tearing the group down for every other member
    // too); groups they merely joined just drop this one membership.
    for name in group_names {
        let creator = ctx.groups.with_shard(&name, |g| g.find(&name).map(|grp| grp.creator.clone()));
        match creator {
            Some(creator) if creator == sender => {
                let _ = cancel_group(ctx, &name, sender);
            }
            Some(_) => {
                ctx.groups.with_shard(&name, |mut g| {
                    if let Some(grp) = g.get_mut(&name) {
                        grp.members.remove(sender);
                    }
                });
            }
            None => {}
        }
    }
    Ok((None, ok(Vec::new())))
}

fn create_group(ctx: &ServerContext, online_nick: &Option<String>, msg: &Message) -> Result<(Option<String>, Reply), ServerError> {
    let sender = require_online(online_nick)?;
    let name = msg.receiver.clone();
    // Two-step collision check: the user registry first (a distinct error
    // path), then the group registry.
    if ctx.users.contains(&name) {
        return Err(ServerError::AlreadyExists);
    }
    ctx.groups.with_shard(&name, |mut g| {
        g.insert(name.clone(), GroupRecord::new(name.clone(), sender.to_string()))
            .map_err(|_| ServerError::AlreadyExists)
    })?;
    ctx.users.with_shard(sender, |mut g| {
        if let Some(u) = g.get_mut(sender) {
            u.groups.insert(name.clone());
        }
    });
    ctx.stats.update(|c| c.ngroups += 1);
    Ok((online_nick.clone(), ok(Vec::new())))
}

fn add_group(ctx: &ServerContext, online_nick: &Option<String>, msg: &Message) -> Result<(Option<String>, Reply), ServerError> {
    let sender = require_online(online_nick)?;
    let name = msg.receiver.clone();
    ctx.groups.with_shard(&name, |mut g| match g.get_mut(&name) {
        None => Err(ServerError::NotFound),
        Some(grp) if grp.status != GroupStatus::Active => Err(ServerError::NotFound),
        Some(grp) if grp.members.contains(sender) => Err(ServerError::Denied),
        Some(grp) => {
            grp.members.insert(sender.to_string());
            Ok(())
        }
    })?;
    ctx.users.with_shard(sender, |mut g| {
        if let Some(u) = g.get_mut(sender) {
            u.groups.insert(name.clone());
        }
    });
    Ok((online_nick.clone(), ok(Vec::new())))
}

fn del_group(ctx: &ServerContext, online_nick: &Option<String>, msg: &Message) -> Result<(Option<String>, Reply), ServerError> {
    let sender = require_online(online_nick)?;
    let name = msg.receiver.clone();
    let is_creator = ctx.groups.with_shard(&name, |mut g| match g.get_mut(&name) {
        None => Err(ServerError::NotFound),
        Some(grp) if !grp.members.contains(sender) => Err(ServerError::NotFound),
        Some(grp) => {
            let is_creator = grp.creator == sender;
            if !is_creator {
                grp.members.remove(sender);
            }
            Ok(is_creator)
        }
    })?;
    if is_creator {
        // A creatorless group is never left around; cascade the same as
        // an explicit CANCGROUP.
        cancel_group(ctx, &name, sender)?;
    } else {
        ctx.users.with_shard(sender, |mut g| {
            if let Some(u) = g.get_mut(sender) {
                u.groups.remove(&name);
            }
        });
    }
    Ok((online_nick.clone(), ok(Vec::new())))
}

fn canc_group(ctx: &ServerContext, online_nick: &Option<String>, msg: &Message) -> Result<(Option<String>, Reply), ServerError> {
    let sender = require_online(online_nick)?;
    let name = msg.receiver.clone();
    cancel_group(ctx, &name, sender)?;
    Ok((online_nick.clone(), ok(Vec::new())))
}
