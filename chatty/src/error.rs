// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A tagged error kind covering every way a request can fail, in place of
//! an errno-style return code.

use std::fmt;

use chatty_wire::OpCode;

#[derive(Debug)]
pub enum ServerError {
    /// The descriptor the caller was about to act on is already gone.
    Closed,
    /// A request was malformed in a way none of the other variants name.
    BadArg(String),
    /// No user or group by that name is registered.
    NotFound,
    /// A user or group name collides with an existing user or group.
    AlreadyExists,
    /// A payload or file body exceeded its configured limit.
    TooLong,
    /// The operation is not permitted in the caller's current state (e.g.
    /// CONNECT while already online, ADDGROUP to a group already joined).
    Denied,
    /// GETFILE named a file that isn't in the store.
    NoSuchFile,
    /// CANCGROUP (or an unregister/delgroup cascade) invoked by a non-creator.
    NoCreator,
    Io(std::io::Error),
}

impl ServerError {
    /// Pure function from error kind to reply op-code. Every dispatch
    /// function's error path collapses to this one match.
    pub fn reply_op_code(&self) -> OpCode {
        match self {
            ServerError::AlreadyExists => OpCode::NickAlready,
            ServerError::NotFound => OpCode::NickUnknown,
            ServerError::TooLong => OpCode::MsgTooLong,
            ServerError::NoSuchFile => OpCode::NoSuchFile,
            ServerError::NoCreator => OpCode::NoCreator,
            ServerError::Closed | ServerError::BadArg(_) | ServerError::Denied | ServerError::Io(_) => {
                OpCode::Fail
            }
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Closed => write!(f, "descriptor already closed"),
            ServerError::BadArg(msg) => write!(f, "bad argument: {msg}"),
            ServerError::NotFound => write!(f, "no such user or group"),
            ServerError::AlreadyExists => write!(f, "name already in use"),
            ServerError::TooLong => write!(f, "payload exceeds the configured limit"),
            ServerError::Denied => write!(f, "operation not permitted in the caller's current state"),
            ServerError::NoSuchFile => write!(f, "no such file"),
            ServerError::NoCreator => write!(f, "sender is not the group's creator"),
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<chatty_wire::Error> for ServerError {
    fn from(e: chatty_wire::Error) -> Self {
        match e {
            chatty_wire::Error::Io(io) => ServerError::Io(io),
            chatty_wire::Error::Protocol(p) => ServerError::BadArg(p.to_string()),
        }
    }
}

impl From<nix::errno::Errno> for ServerError {
    fn from(e: nix::errno::Errno) -> Self {
        ServerError::Io(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_the_documented_op_codes() {
        assert_eq!(ServerError::AlreadyExists.reply_op_code(), OpCode::NickAlready);
        assert_eq!(ServerError::NotFound.reply_op_code(), OpCode::NickUnknown);
        assert_eq!(ServerError::TooLong.reply_op_code(), OpCode::MsgTooLong);
        assert_eq!(ServerError::NoSuchFile.reply_op_code(), OpCode::NoSuchFile);
        assert_eq!(ServerError::NoCreator.reply_op_code(), OpCode::NoCreator);
        assert_eq!(ServerError::Denied.reply_op_code(), OpCode::Fail);
    }
}
