//! IPC frame grammar. Every frame starts with a 9-byte little-endian
//! header (kind u8, txn-id u32, total length u32 including the header);
//! bodies vary by kind.
//!
//! Property bits on READ/WRITE requests: NEW starts a fresh operation,
//! ABORT cancels the path, MERGE marks a READ request that redirects the
//! application to a surviving write operation (the merge-id follows as a
//! trailing u32) and RELEASE tells it the original operation is gone.

use crate::net::buffer::Buffer;
use crate::net::support::{ErrorKind, NetError, NetResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ferrite::codes::IoStatus;
use ferrite::task::UserAuth;
use std::convert::TryFrom;
use std::io::{Cursor, Read, Write};

pub const HEADER_SIZE: usize = 9;
pub const NAME_SIZE: usize = 32;

pub const PROP_NEW: u32 = 0x1;
pub const PROP_ABORT: u32 = 0x2;
pub const PROP_MERGE: u32 = 0x4;
pub const PROP_RELEASE: u32 = 0x8;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FrameKind {
    Status = 0,
    Auth = 1,
    Read = 2,
    Write = 3,
    ConnectReply = 4,
    Close = 5,
    Delete = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(raw: u8) -> Result<FrameKind, u8> {
        Ok(match raw {
            0 => FrameKind::Status,
            1 => FrameKind::Auth,
            2 => FrameKind::Read,
            3 => FrameKind::Write,
            4 => FrameKind::ConnectReply,
            5 => FrameKind::Close,
            6 => FrameKind::Delete,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Status {
        tran_id: u32,
        status: IoStatus,
    },
    Auth {
        tran_id: u32,
        user: String,
        passwd: [u8; UserAuth::PASSWD_SIZE],
    },
    /// Application → broker: request the next chunk of a read; broker →
    /// application: ask for the next write chunk (optionally redirected
    /// under `merge_id`).
    Read {
        tran_id: u32,
        path: String,
        properties: u32,
        merge_id: Option<u32>,
    },
    /// Application → broker: a filled write chunk; broker → application:
    /// a read reply announcing `data_len` bytes at `data_addr`.
    Write {
        tran_id: u32,
        path: String,
        properties: u32,
        data_addr: u64,
        data_len: u64,
    },
    ConnectReply {
        tran_id: u32,
        write_addr: u64,
        write_size: u32,
        read_addr: u64,
        read_size: u32,
        write_name: [u8; NAME_SIZE],
        read_name: [u8; NAME_SIZE],
    },
    Close {
        tran_id: u32,
    },
    Delete {
        tran_id: u32,
        path: String,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Status { .. } => FrameKind::Status,
            Frame::Auth { .. } => FrameKind::Auth,
            Frame::Read { .. } => FrameKind::Read,
            Frame::Write { .. } => FrameKind::Write,
            Frame::ConnectReply { .. } => FrameKind::ConnectReply,
            Frame::Close { .. } => FrameKind::Close,
            Frame::Delete { .. } => FrameKind::Delete,
        }
    }

    pub fn tran_id(&self) -> u32 {
        match self {
            Frame::Status { tran_id, .. }
            | Frame::Auth { tran_id, .. }
            | Frame::Read { tran_id, .. }
            | Frame::Write { tran_id, .. }
            | Frame::ConnectReply { tran_id, .. }
            | Frame::Close { tran_id }
            | Frame::Delete { tran_id, .. } => *tran_id,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::Status { .. } => 1,
            Frame::Auth { user, .. } => 2 + user.len() + UserAuth::PASSWD_SIZE,
            Frame::Read { path, merge_id, .. } => {
                2 + path.len() + 4 + if merge_id.is_some() { 4 } else { 0 }
            }
            Frame::Write { path, .. } => 2 + path.len() + 4 + 8 + 8,
            Frame::ConnectReply { .. } => 8 + 4 + 8 + 4 + NAME_SIZE + NAME_SIZE,
            Frame::Close { .. } => 0,
            Frame::Delete { path, .. } => 2 + path.len(),
        }
    }

    /// Serialized length including the header.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    /// Append the frame to `out`. `Wait` when the buffer lacks space.
    pub fn encode(&self, out: &mut Buffer) -> NetResult<()> {
        let total = self.encoded_len();

        if out.free_capacity() < total {
            return Err(NetError::Wait);
        }

        let mut bytes = Vec::with_capacity(total);
        self.encode_bytes(&mut bytes, total)
            .map_err(|_| NetError::Fatal(ErrorKind::BufferOverrun))?;

        debug_assert_eq!(bytes.len(), total);
        out.extend(&bytes).map_err(Into::into)
    }

    // Writes into a Vec cannot fail; the io::Result plumbing only exists
    // so byteorder's writers compose with `?`.
    fn encode_bytes(&self, bytes: &mut Vec<u8>, total: usize) -> std::io::Result<()> {
        bytes.write_u8(self.kind() as u8)?;
        bytes.write_u32::<LittleEndian>(self.tran_id())?;
        bytes.write_u32::<LittleEndian>(total as u32)?;

        match self {
            Frame::Status { status, .. } => {
                bytes.write_u8(*status as u8)?;
            }
            Frame::Auth { user, passwd, .. } => {
                bytes.write_u16::<LittleEndian>(user.len() as u16)?;
                bytes.write_all(user.as_bytes())?;
                bytes.write_all(passwd)?;
            }
            Frame::Read {
                path,
                properties,
                merge_id,
                ..
            } => {
                bytes.write_u16::<LittleEndian>(path.len() as u16)?;
                bytes.write_all(path.as_bytes())?;
                bytes.write_u32::<LittleEndian>(*properties)?;
                if let Some(merge_id) = merge_id {
                    bytes.write_u32::<LittleEndian>(*merge_id)?;
                }
            }
            Frame::Write {
                path,
                properties,
                data_addr,
                data_len,
                ..
            } => {
                bytes.write_u16::<LittleEndian>(path.len() as u16)?;
                bytes.write_all(path.as_bytes())?;
                bytes.write_u32::<LittleEndian>(*properties)?;
                bytes.write_u64::<LittleEndian>(*data_addr)?;
                bytes.write_u64::<LittleEndian>(*data_len)?;
            }
            Frame::ConnectReply {
                write_addr,
                write_size,
                read_addr,
                read_size,
                write_name,
                read_name,
                ..
            } => {
                bytes.write_u64::<LittleEndian>(*write_addr)?;
                bytes.write_u32::<LittleEndian>(*write_size)?;
                bytes.write_u64::<LittleEndian>(*read_addr)?;
                bytes.write_u32::<LittleEndian>(*read_size)?;
                bytes.write_all(write_name)?;
                bytes.write_all(read_name)?;
            }
            Frame::Close { .. } => {}
            Frame::Delete { path, .. } => {
                bytes.write_u16::<LittleEndian>(path.len() as u16)?;
                bytes.write_all(path.as_bytes())?;
            }
        }

        Ok(())
    }

    /// Decode one frame off the head of `buf`. `Ok(None)` means the frame
    /// is still incomplete; on success the consumed byte count is returned
    /// alongside the frame.
    ///
    /// Length sanity runs before kind validation so that a malformed
    /// frame only errors once its declared extent has fully arrived — the
    /// caller can then skip exactly that many bytes and keep the stream.
    /// `max_frame` bounds the declared length (a frame larger than the
    /// session buffer could never complete).
    pub fn decode(buf: &[u8], max_frame: usize) -> NetResult<Option<(Frame, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = Cursor::new(buf);
        let raw_kind = rd_u8(&mut header)?;
        let tran_id = rd_u32(&mut header)?;
        let total = rd_u32(&mut header)? as usize;

        if total < HEADER_SIZE {
            return Err(NetError::Fatal(ErrorKind::BadFrameLength));
        }

        if total > max_frame {
            return Err(NetError::Fatal(ErrorKind::FrameTooLarge));
        }

        if buf.len() < total {
            return Ok(None);
        }

        let kind = FrameKind::try_from(raw_kind)
            .map_err(|raw| NetError::Fatal(ErrorKind::BadFrameKind(raw)))?;

        let mut body = Cursor::new(&buf[HEADER_SIZE..total]);
        let frame = match kind {
            FrameKind::Status => {
                let raw = rd_u8(&mut body)?;
                let status =
                    IoStatus::try_from(raw).map_err(|_| NetError::Fatal(ErrorKind::BadPayload))?;
                Frame::Status { tran_id, status }
            }
            FrameKind::Auth => {
                let user = read_string(&mut body)?;
                let mut passwd = [0u8; UserAuth::PASSWD_SIZE];
                body.read_exact(&mut passwd)
                    .map_err(|_| NetError::Fatal(ErrorKind::BadFrameLength))?;
                Frame::Auth {
                    tran_id,
                    user,
                    passwd,
                }
            }
            FrameKind::Read => {
                let path = read_string(&mut body)?;
                let properties = rd_u32(&mut body)?;
                let merge_id = if properties & PROP_MERGE != 0 {
                    Some(rd_u32(&mut body)?)
                } else {
                    None
                };
                Frame::Read {
                    tran_id,
                    path,
                    properties,
                    merge_id,
                }
            }
            FrameKind::Write => {
                let path = read_string(&mut body)?;
                let properties = rd_u32(&mut body)?;
                let data_addr = rd_u64(&mut body)?;
                let data_len = rd_u64(&mut body)?;
                Frame::Write {
                    tran_id,
                    path,
                    properties,
                    data_addr,
                    data_len,
                }
            }
            FrameKind::ConnectReply => {
                let write_addr = rd_u64(&mut body)?;
                let write_size = rd_u32(&mut body)?;
                let read_addr = rd_u64(&mut body)?;
                let read_size = rd_u32(&mut body)?;
                let mut write_name = [0u8; NAME_SIZE];
                let mut read_name = [0u8; NAME_SIZE];
                body.read_exact(&mut write_name)
                    .map_err(|_| NetError::Fatal(ErrorKind::BadFrameLength))?;
                body.read_exact(&mut read_name)
                    .map_err(|_| NetError::Fatal(ErrorKind::BadFrameLength))?;
                Frame::ConnectReply {
                    tran_id,
                    write_addr,
                    write_size,
                    read_addr,
                    read_size,
                    write_name,
                    read_name,
                }
            }
            FrameKind::Close => Frame::Close { tran_id },
            FrameKind::Delete => {
                let path = read_string(&mut body)?;
                Frame::Delete { tran_id, path }
            }
        };

        // The declared length must match what the body actually used.
        if body.position() as usize != total - HEADER_SIZE {
            return Err(NetError::Fatal(ErrorKind::BadFrameLength));
        }

        Ok(Some((frame, total)))
    }
}

// Cursor reads failing mid-body mean a short frame, not an IO problem.
fn short(_: std::io::Error) -> NetError {
    NetError::Fatal(ErrorKind::BadFrameLength)
}

fn rd_u8(body: &mut Cursor<&[u8]>) -> NetResult<u8> {
    body.read_u8().map_err(short)
}

fn rd_u32(body: &mut Cursor<&[u8]>) -> NetResult<u32> {
    body.read_u32::<LittleEndian>().map_err(short)
}

fn rd_u64(body: &mut Cursor<&[u8]>) -> NetResult<u64> {
    body.read_u64::<LittleEndian>().map_err(short)
}

fn read_string(body: &mut Cursor<&[u8]>) -> NetResult<String> {
    let len = body.read_u16::<LittleEndian>().map_err(short)? as usize;

    let start = body.position() as usize;
    let raw = body.get_ref();
    if start + len > raw.len() {
        return Err(NetError::Fatal(ErrorKind::BadFrameLength));
    }

    let value = std::str::from_utf8(&raw[start..start + len])
        .map_err(|_| NetError::Fatal(ErrorKind::BadPayload))?
        .to_string();
    body.set_position((start + len) as u64);

    Ok(value)
}
