//! Operation and status codes shared by the IPC protocol, the worker pool
//! and the remote authorization client.

use std::convert::TryFrom;
use std::fmt;

/// Internal operation codes. `READ`/`WRITE`/`DELETE`/`AUTH` cross the
/// authz wire; the rest only travel between the session and the workers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum IoOpCode {
    Read = 1,
    Write = 2,
    Delete = 3,
    Auth = 4,
    Commit = 5,
    Close = 6,
    Append = 7,
    CheckWrite = 8,
    Abort = 9,
    Exit = 10,
    Nop = 255,
}

impl TryFrom<u8> for IoOpCode {
    type Error = u8;

    fn try_from(raw: u8) -> Result<IoOpCode, u8> {
        Ok(match raw {
            1 => IoOpCode::Read,
            2 => IoOpCode::Write,
            3 => IoOpCode::Delete,
            4 => IoOpCode::Auth,
            5 => IoOpCode::Commit,
            6 => IoOpCode::Close,
            7 => IoOpCode::Append,
            8 => IoOpCode::CheckWrite,
            9 => IoOpCode::Abort,
            10 => IoOpCode::Exit,
            255 => IoOpCode::Nop,
            other => return Err(other),
        })
    }
}

/// Status taxonomy flowing on the IPC wire and inside authz replies.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum IoStatus {
    Success = 0,
    ErrUser = 1,
    ErrPass = 2,
    ErrPath = 3,
    ErrDeny = 4,
    ErrQuota = 5,
    ErrObjLarge = 6,
    ErrObjSmall = 7,
    ErrContent = 8,
    ErrParams = 9,
    ErrProt = 10,
    ErrLock = 11,
    PartialRead = 12,
    PartialWrite = 13,
    Close = 14,
    ErrInternal = 255,
}

impl IoStatus {
    /// Terminal statuses end an operation; `PartialRead`/`PartialWrite`
    /// announce that more traffic follows under the same context.
    pub fn is_terminal(self) -> bool {
        !matches!(self, IoStatus::PartialRead | IoStatus::PartialWrite)
    }

    pub fn is_error(self) -> bool {
        !matches!(
            self,
            IoStatus::Success
                | IoStatus::Close
                | IoStatus::PartialRead
                | IoStatus::PartialWrite
        )
    }
}

impl TryFrom<u8> for IoStatus {
    type Error = u8;

    fn try_from(raw: u8) -> Result<IoStatus, u8> {
        Ok(match raw {
            0 => IoStatus::Success,
            1 => IoStatus::ErrUser,
            2 => IoStatus::ErrPass,
            3 => IoStatus::ErrPath,
            4 => IoStatus::ErrDeny,
            5 => IoStatus::ErrQuota,
            6 => IoStatus::ErrObjLarge,
            7 => IoStatus::ErrObjSmall,
            8 => IoStatus::ErrContent,
            9 => IoStatus::ErrParams,
            10 => IoStatus::ErrProt,
            11 => IoStatus::ErrLock,
            12 => IoStatus::PartialRead,
            13 => IoStatus::PartialWrite,
            14 => IoStatus::Close,
            255 => IoStatus::ErrInternal,
            other => return Err(other),
        })
    }
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_u8_roundtrip() {
        for raw in 0..=255u8 {
            if let Ok(status) = IoStatus::try_from(raw) {
                assert_eq!(status as u8, raw);
            }
        }

        assert_eq!(IoStatus::try_from(200), Err(200));
    }

    #[test]
    fn test_opcode_u8_roundtrip() {
        for raw in 0..=255u8 {
            if let Ok(op) = IoOpCode::try_from(raw) {
                assert_eq!(op as u8, raw);
            }
        }

        assert_eq!(IoOpCode::try_from(42), Err(42));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(IoStatus::Success.is_terminal());
        assert!(IoStatus::ErrInternal.is_terminal());
        assert!(!IoStatus::PartialRead.is_terminal());
        assert!(!IoStatus::PartialWrite.is_terminal());
    }
}
