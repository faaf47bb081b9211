// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A typed control channel the listener multiplexes alongside client
//! descriptors. Workers post `(fd, op)` records here instead of calling
//! back into the listener directly, so the listener's `select`-equivalent
//! wait has exactly one extra descriptor to watch no matter how many
//! workers exist.
//!
//! Wraps a real pipe -- not a `std::sync::mpsc` channel -- because the
//! listener's wait loop needs a raw descriptor to hand to `select`.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use chatty_wire::FdStream;

/// Control ops exchanged between workers and the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOp {
    /// The worker finished the descriptor's request; re-arm it in `set`.
    ReadyAgain = 0,
    /// The descriptor's peer is gone; drop it from `conn_count`.
    Close = 1,
    /// Shut down: close everything and exit the listener loop.
    Terminate = 2,
}

impl ControlOp {
    fn from_byte(b: u8) -> std::io::Result<Self> {
        match b {
            0 => Ok(ControlOp::ReadyAgain),
            1 => Ok(ControlOp::Close),
            2 => Ok(ControlOp::Terminate),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown self-pipe control op {other}"),
            )),
        }
    }
}

/// One (descriptor, op) record. `fd` is meaningless for `Terminate` and is
/// sent as `-1`.
#[derive(Debug, Clone, Copy)]
pub struct ControlRecord {
    pub fd: RawFd,
    pub op: ControlOp,
}

pub struct SelfPipe {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    /// Covers the *pair* of writes (fd then op-byte) and the *pair* of
    /// reads, so the listener can never observe half of a record.
    lock: Mutex<()>,
}

impl SelfPipe {
    pub fn new() -> std::io::Result<Self> {
        let (read_fd, write_fd) = nix::unistd::pipe()?;
        Ok(Self {
            read_fd,
            write_fd,
            lock: Mutex::new(()),
        })
    }

    /// The descriptor the listener adds to `set` alongside `accept_fd`.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Posts one control record. Called by workers and by the signal
    /// thread's teardown routine.
    pub fn send(&self, fd: RawFd, op: ControlOp) -> std::io::Result<()> {
        use std::io::Write;
        let _guard = self.lock.lock().unwrap();
        let mut w = FdStream(self.write_fd.as_raw_fd());
        w.write_all(&fd.to_ne_bytes())?;
        w.write_all(&[op as u8])?;
        Ok(())
    }

    /// Reads exactly one control record. Only the listener ever calls this,
    /// so the lock merely documents the pairing invariant rather than
    /// arbitrating between concurrent readers.
    pub fn recv(&self) -> std::io::Result<ControlRecord> {
        use std::io::Read;
        let _guard = self.lock.lock().unwrap();
        let mut r = FdStream(self.read_fd.as_raw_fd());
        let mut fd_buf = [0u8; std::mem::size_of::<RawFd>()];
        r.read_exact(&mut fd_buf)?;
        let mut op_buf = [0u8; 1];
        r.read_exact(&mut op_buf)?;
        Ok(ControlRecord {
            fd: RawFd::from_ne_bytes(fd_buf),
            op: ControlOp::from_byte(op_buf[0])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_control_record() {
        let pipe = SelfPipe::new().unwrap();
        pipe.send(7, ControlOp::ReadyAgain).unwrap();
        let rec = pipe.recv().unwrap();
        assert_eq!(rec.fd, 7);
        assert_eq!(rec.op, ControlOp::ReadyAgain);
    }

    #[test]
    fn preserves_fifo_order_across_sends() {
        let pipe = SelfPipe::new().unwrap();
        pipe.send(1, ControlOp::Close).unwrap();
        pipe.send(2, ControlOp::ReadyAgain).unwrap();
        assert_eq!(pipe.recv().unwrap().fd, 1);
        assert_eq!(pipe.recv().unwrap().fd, 2);
    }
}
