//! Wire protocol and frame codec for chatty.
//!
//! A connection carries a stream of fixed-layout frames: a header (op-code,
//! sender nickname) followed by a data block (receiver nickname, payload).
//! POSTFILE carries a second, bare length-prefixed data block with the file
//! bytes. See the frame codec module notes for the exact byte layout.

use std::io::{Read, Write};

/// Maximum nickname length, not counting the trailing NUL.
pub const MAX_NAME_LENGTH: usize = 32;

/// Errors that can arise while decoding or encoding a frame.
#[derive(Debug)]
pub enum Error {
    Protocol(ProtocolError),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    /// The op-code byte did not match any known `OpCode`.
    UnknownOpCode(u8),
    /// A nickname or filename exceeded `MAX_NAME_LENGTH`.
    NameTooLong,
    /// A length field claimed an implausibly large payload.
    LengthOverflow,
    /// A string field was not validly NUL-terminated UTF-8.
    BadString,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::UnknownOpCode(b) => return write!(f, "unknown op-code {b}"),
                Self::NameTooLong => "name exceeds MAX_NAME_LENGTH",
                Self::LengthOverflow => "length field too large",
                Self::BadString => "malformed NUL-terminated string",
            }
        )
    }
}

/// The operation vocabulary: request ops, reply ops, and push ops, all
/// sharing one wire-level namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // requests
    Register = 0,
    Connect = 1,
    PostTxt = 2,
    PostTxtAll = 3,
    PostFile = 4,
    GetFile = 5,
    GetPrevMsgs = 6,
    UsrList = 7,
    Unregister = 8,
    CreateGroup = 9,
    AddGroup = 10,
    DelGroup = 11,
    CancGroup = 12,
    // replies
    Ok = 13,
    NickAlready = 14,
    NickUnknown = 15,
    MsgTooLong = 16,
    NoSuchFile = 17,
    Fail = 18,
    NoCreator = 19,
    // push ops
    TxtMessage = 20,
    FileMessage = 21,
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, ProtocolError> {
        use OpCode::*;
        Ok(match b {
            0 => Register,
            1 => Connect,
            2 => PostTxt,
            3 => PostTxtAll,
            4 => PostFile,
            5 => GetFile,
            6 => GetPrevMsgs,
            7 => UsrList,
            8 => Unregister,
            9 => CreateGroup,
            10 => AddGroup,
            11 => DelGroup,
            12 => CancGroup,
            13 => Ok,
            14 => NickAlready,
            15 => NickUnknown,
            16 => MsgTooLong,
            17 => NoSuchFile,
            18 => Fail,
            19 => NoCreator,
            20 => TxtMessage,
            21 => FileMessage,
            other => return Err(ProtocolError::UnknownOpCode(other)),
        })
    }
}

impl OpCode {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            OpCode::NickAlready
                | OpCode::NickUnknown
                | OpCode::MsgTooLong
                | OpCode::NoSuchFile
                | OpCode::Fail
                | OpCode::NoCreator
        )
    }
}

/// A single decoded frame: header (op, sender) plus data (receiver, payload).
#[derive(Debug, Clone)]
pub struct Message {
    pub op: OpCode,
    pub sender: String,
    pub receiver: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(op: OpCode, sender: impl Into<String>) -> Self {
        Self {
            op,
            sender: sender.into(),
            receiver: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = receiver.into();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

/// `read_exact`, but tolerant of `ErrorKind::Interrupted` and distinguishing a
/// clean close (peer hung up before handing over any part of this record)
/// from a hard I/O error.
///
/// Returns `Ok(true)` once `buf` is completely filled, `Ok(false)` if the
/// peer closed the connection (whether or not a partial record had already
/// been read into `buf` -- a partial record is indistinguishable from a
/// clean close at this layer).
fn readn<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// `write_all`, but tolerant of `ErrorKind::Interrupted`.
fn writen<W: Write>(w: &mut W, buf: &[u8]) -> std::io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match w.write(&buf[sent..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write returned 0",
                ))
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    if !readn(r, &mut buf)? {
        return Ok(None);
    }
    Ok(Some(u32::from_ne_bytes(buf)))
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> std::io::Result<()> {
    writen(w, &v.to_ne_bytes())
}

fn read_string<R: Read>(r: &mut R, max_len: usize) -> Result<Option<String>, Error> {
    let Some(len) = read_u32(r)? else {
        return Ok(None);
    };
    let len = len as usize;
    if len == 0 || len > max_len + 1 {
        return Err(ProtocolError::NameTooLong.into());
    }
    let mut bytes = vec![0u8; len];
    if !readn(r, &mut bytes)? {
        return Ok(None);
    }
    if bytes.pop() != Some(0) {
        return Err(ProtocolError::BadString.into());
    }
    String::from_utf8(bytes).map(Some).map_err(|_| ProtocolError::BadString.into())
}

fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    let len = (s.len() + 1) as u32;
    write_u32(w, len)?;
    writen(w, s.as_bytes())?;
    writen(w, &[0u8])
}

/// Reads one header+data frame. Returns `Ok(None)` on a clean disconnect
/// (the caller should treat this as a peer error, not a system error).
pub fn read_message<R: Read>(r: &mut R) -> Result<Option<Message>, Error> {
    let Some(op_byte) = read_u32(r)? else {
        return Ok(None);
    };
    let op = OpCode::try_from(op_byte as u8)?;

    let Some(sender) = read_string(r, MAX_NAME_LENGTH)? else {
        return Ok(None);
    };

    let Some(receiver) = read_string(r, MAX_NAME_LENGTH)? else {
        return Ok(None);
    };

    let Some(len) = read_u32(r)? else {
        return Ok(None);
    };
    let len = len as usize;
    if len > 64 * 1024 * 1024 {
        return Err(ProtocolError::LengthOverflow.into());
    }
    let mut payload = vec![0u8; len];
    if len > 0 && !readn(r, &mut payload)? {
        return Ok(None);
    }

    Ok(Some(Message {
        op,
        sender,
        receiver,
        payload,
    }))
}

/// Writes one header+data frame.
pub fn write_message<W: Write>(w: &mut W, msg: &Message) -> Result<(), Error> {
    write_u32(w, msg.op as u32)?;
    write_string(w, &msg.sender)?;
    write_string(w, &msg.receiver)?;
    write_u32(w, msg.payload.len() as u32)?;
    if !msg.payload.is_empty() {
        writen(w, &msg.payload)?;
    }
    Ok(())
}

/// Reads the second data block that trails a POSTFILE request (file bytes).
pub fn read_file_block<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, Error> {
    let Some(len) = read_u32(r)? else {
        return Ok(None);
    };
    let len = len as usize;
    let mut buf = vec![0u8; len];
    if len > 0 && !readn(r, &mut buf)? {
        return Ok(None);
    }
    Ok(Some(buf))
}

/// Writes the second data block trailing a POSTFILE request.
pub fn write_file_block<W: Write>(w: &mut W, bytes: &[u8]) -> Result<(), Error> {
    write_u32(w, bytes.len() as u32)?;
    if !bytes.is_empty() {
        writen(w, bytes)?;
    }
    Ok(())
}

/// The server->client handshake sent immediately after `accept`: a single
/// integer `1`.
pub fn write_accept_ack<W: Write>(w: &mut W) -> std::io::Result<()> {
    write_u32(w, 1)
}

pub fn read_accept_ack<R: Read>(r: &mut R) -> std::io::Result<Option<u32>> {
    read_u32(r)
}

/// GETPREVMSGS replies with a count frame before the history stream.
pub fn write_count<W: Write>(w: &mut W, count: u32) -> std::io::Result<()> {
    write_u32(w, count)
}

pub fn read_count<R: Read>(r: &mut R) -> std::io::Result<Option<u32>> {
    read_u32(r)
}

/// A non-owning `Read + Write` view of a raw descriptor.
///
/// Descriptor lifecycle (open/close) in chatty is centralised in the
/// listener and the teardown path, never in the worker that merely reads or
/// writes a request -- so this wrapper never closes the descriptor on drop,
/// unlike `std::os::unix::net::UnixStream`, which would close it as soon as a
/// per-request temporary went out of scope.
pub struct FdStream(pub std::os::fd::RawFd);

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::read(unsafe { std::os::fd::BorrowedFd::borrow_raw(self.0) }, buf)?)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::write(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(self.0) },
            buf,
        )?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Test-only fixtures shared by this crate and the server crate's tests.
pub mod test_support {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::OwnedFd;

    /// A connected, in-memory `Read + Write` endpoint backed by
    /// `socketpair(2)`, used to drive the codec and single-connection worker
    /// logic without a real `UnixListener`.
    pub struct Endpoint {
        fd: OwnedFd,
    }

    pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        Ok((Endpoint { fd: a }, Endpoint { fd: b }))
    }

    impl std::io::Read for Endpoint {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::read(&self.fd, buf)?)
        }
    }

    impl std::io::Write for Endpoint {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::write(&self.fd, buf)?)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::pipe;

    #[test]
    fn round_trips_a_posttxt_message() {
        let (mut a, mut b) = pipe().unwrap();
        let msg = Message::new(OpCode::PostTxt, "alice")
            .with_receiver("bob")
            .with_payload(b"hello".to_vec());
        write_message(&mut a, &msg).unwrap();
        let got = read_message(&mut b).unwrap().unwrap();
        assert_eq!(got.sender, "alice");
        assert_eq!(got.receiver, "bob");
        assert_eq!(got.payload, b"hello");
        assert_eq!(got.op, OpCode::PostTxt);
    }

    #[test]
    fn empty_payload_round_trips() {
        let (mut a, mut b) = pipe().unwrap();
        let msg = Message::new(OpCode::UsrList, "alice");
        write_message(&mut a, &msg).unwrap();
        let got = read_message(&mut b).unwrap().unwrap();
        assert!(got.payload.is_empty());
    }

    #[test]
    fn clean_disconnect_reads_as_none() {
        let (a, mut b) = pipe().unwrap();
        drop(a);
        assert!(read_message(&mut b).unwrap().is_none());
    }

    #[test]
    fn unknown_opcode_is_a_protocol_error() {
        let (mut a, mut b) = pipe().unwrap();
        write_u32(&mut a, 255).unwrap();
        match read_message(&mut b) {
            Err(Error::Protocol(ProtocolError::UnknownOpCode(255))) => {}
            other => panic!("expected UnknownOpCode, got {other:?}"),
        }
    }

    #[test]
    fn file_block_round_trips() {
        let (mut a, mut b) = pipe().unwrap();
        write_file_block(&mut a, b"file bytes").unwrap();
        let got = read_file_block(&mut b).unwrap().unwrap();
        assert_eq!(got, b"file bytes");
    }
}
