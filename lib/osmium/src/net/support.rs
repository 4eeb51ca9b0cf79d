//! Error plumbing for the IPC layer. Non-blocking operations surface
//! `Wait` when they cannot progress yet; everything else is fatal for the
//! session that hit it.

use std::io;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    /// Not an error: retry once more bytes or buffer space are available.
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Frame kind byte outside the protocol.
    BadFrameKind(u8),
    /// Declared frame length inconsistent with its body.
    BadFrameLength,
    /// Frame body failed to decode (bad status byte, non-UTF-8 path).
    BadPayload,
    /// Frame larger than the session read buffer can ever hold.
    FrameTooLarge,
    BufferOverrun,
    ShmFailure,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    /// True for anything except success and `Wait`.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}
