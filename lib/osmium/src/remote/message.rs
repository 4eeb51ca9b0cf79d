//! HTTP-like framing for the authz wire. Requests carry the correlation
//! id and credentials in dedicated headers; bodies, when present, are
//! JSON. Replies are matched back to requests purely via `X-Tran-Id`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ferrite::codes::{IoOpCode, IoStatus};
use ferrite::task::UserAuth;
use parking_lot::Mutex;
use std::io::{self, BufRead, Read, Write};

pub const HDR_TRAN_ID: &str = "X-Tran-Id";
pub const HDR_AUTH_USER: &str = "X-Auth-User";
pub const HDR_AUTH_KEY: &str = "X-Auth-Key";

/// An authz request awaiting a transaction id.
#[derive(Debug, Clone)]
pub struct Request {
    pub tran_id: u32,
    pub op: IoOpCode,
    pub user: UserAuth,
    pub path: String,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(op: IoOpCode, user: UserAuth, path: impl Into<String>, body: Vec<u8>) -> Request {
        Request {
            tran_id: 0,
            op,
            user,
            path: path.into(),
            body,
        }
    }

    fn verb(&self) -> &'static str {
        match self.op {
            IoOpCode::Auth | IoOpCode::Read => "GET",
            IoOpCode::Write | IoOpCode::CheckWrite | IoOpCode::Append => "PUT",
            IoOpCode::Commit => "POST",
            IoOpCode::Delete => "DELETE",
            _ => "GET",
        }
    }

    fn target(&self) -> &str {
        match self.op {
            IoOpCode::Auth => "/auth",
            _ => &self.path,
        }
    }

    /// Serialize onto the wire. The key travels base64-encoded; the body
    /// length is always declared, even at zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());

        // Writes into a Vec are infallible.
        let _ = write!(
            out,
            "{} {} HTTP/1.1\r\n{}: {}\r\n{}: {}\r\n{}: {}\r\nContent-Length: {}\r\n\r\n",
            self.verb(),
            self.target(),
            HDR_TRAN_ID,
            self.tran_id,
            HDR_AUTH_USER,
            self.user.username,
            HDR_AUTH_KEY,
            BASE64.encode(self.user.passwd),
            self.body.len(),
        );
        out.extend_from_slice(&self.body);

        out
    }
}

/// A reply read off the wire. `status` reflects the transport-level HTTP
/// status only; operation handlers refine it from the JSON body.
#[derive(Debug, Clone)]
pub struct Response {
    pub tran_id: u32,
    pub status: IoStatus,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum WireError {
    Closed,
    Malformed(&'static str),
    Io(io::Error),
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> WireError {
        WireError::Io(err)
    }
}

impl Response {
    /// Read one complete response. Blocks until the reply (status line,
    /// headers, declared body) has fully arrived.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Response, WireError> {
        let status_line = read_line(reader)?;

        let mut parts = status_line.split_whitespace();
        let _version = parts.next().ok_or(WireError::Malformed("status line"))?;
        let code: u16 = parts
            .next()
            .and_then(|raw| raw.parse().ok())
            .ok_or(WireError::Malformed("status code"))?;

        let mut tran_id: Option<u32> = None;
        let mut content_length: usize = 0;

        loop {
            let line = read_line(reader)?;
            if line.is_empty() {
                break;
            }

            let (name, value) = match line.split_once(':') {
                Some(pair) => pair,
                None => return Err(WireError::Malformed("header")),
            };
            let value = value.trim();

            if name.eq_ignore_ascii_case(HDR_TRAN_ID) {
                tran_id = value.parse().ok();
            } else if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value
                    .parse()
                    .map_err(|_| WireError::Malformed("content length"))?;
            }
        }

        let mut data = vec![0u8; content_length];
        reader.read_exact(&mut data).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                WireError::Closed
            } else {
                WireError::Io(err)
            }
        })?;

        Ok(Response {
            tran_id: tran_id.ok_or(WireError::Malformed("missing tran id"))?,
            status: if code == 200 {
                IoStatus::Success
            } else {
                IoStatus::ErrInternal
            },
            data,
        })
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, WireError> {
    let mut line = String::new();
    let count = reader.read_line(&mut line)?;

    if count == 0 {
        return Err(WireError::Closed);
    }

    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }

    Ok(line)
}

/// Reply routed from the security module to a waiting worker. The raw
/// JSON body travels untouched; the worker's protocol handlers decode it.
#[derive(Debug, Clone)]
pub struct IoResponse {
    pub op: IoOpCode,
    pub status: IoStatus,
    pub data: Vec<u8>,
}

impl IoResponse {
    pub fn error(op: IoOpCode, status: IoStatus) -> IoResponse {
        IoResponse {
            op,
            status,
            data: Vec::new(),
        }
    }
}

/// Mutex-protected pool the receiver thread deposits replies into; the
/// security thread polls it between queue sweeps.
pub struct ReceivePool {
    pool: Mutex<Vec<Response>>,
}

impl ReceivePool {
    pub fn new() -> ReceivePool {
        ReceivePool {
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, response: Response) {
        self.pool.lock().push(response);
    }

    pub fn poll(&self) -> Vec<Response> {
        std::mem::take(&mut *self.pool.lock())
    }
}

impl Default for ReceivePool {
    fn default() -> ReceivePool {
        ReceivePool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn test_user() -> UserAuth {
        UserAuth::new("alice", [b'x'; 32])
    }

    #[test]
    fn test_request_encoding() {
        let mut request = Request::new(IoOpCode::Read, test_user(), "/bucket/obj", Vec::new());
        request.tran_id = 42;

        let wire = String::from_utf8(request.encode()).unwrap();

        assert!(wire.starts_with("GET /bucket/obj HTTP/1.1\r\n"));
        assert!(wire.contains("X-Tran-Id: 42\r\n"));
        assert!(wire.contains("X-Auth-User: alice\r\n"));
        assert!(wire.contains("Content-Length: 0\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_verb_map() {
        let auth = Request::new(IoOpCode::Auth, test_user(), "ignored", Vec::new());
        assert!(String::from_utf8(auth.encode())
            .unwrap()
            .starts_with("GET /auth "));

        let check = Request::new(IoOpCode::CheckWrite, test_user(), "/b", Vec::new());
        assert!(String::from_utf8(check.encode()).unwrap().starts_with("PUT /b "));

        let commit = Request::new(IoOpCode::Commit, test_user(), "/b", Vec::new());
        assert!(String::from_utf8(commit.encode())
            .unwrap()
            .starts_with("POST /b "));

        let delete = Request::new(IoOpCode::Delete, test_user(), "/b", Vec::new());
        assert!(String::from_utf8(delete.encode())
            .unwrap()
            .starts_with("DELETE /b "));
    }

    #[test]
    fn test_response_roundtrip() {
        let body = br#"{"Result":{"Account":"alice"}}"#;
        let wire = format!(
            "HTTP/1.1 200 OK\r\nX-Tran-Id: 7\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut full = wire.into_bytes();
        full.extend_from_slice(body);

        let mut reader = BufReader::new(&full[..]);
        let response = Response::read_from(&mut reader).unwrap();

        assert_eq!(response.tran_id, 7);
        assert_eq!(response.status, IoStatus::Success);
        assert_eq!(response.data, body);
    }

    #[test]
    fn test_response_missing_tran_id() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);

        assert!(matches!(
            Response::read_from(&mut reader),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_response_closed_stream() {
        let mut reader = BufReader::new(&b""[..]);

        assert!(matches!(
            Response::read_from(&mut reader),
            Err(WireError::Closed)
        ));
    }

    #[test]
    fn test_receive_pool_drains() {
        let pool = ReceivePool::new();
        pool.insert(Response {
            tran_id: 1,
            status: IoStatus::Success,
            data: Vec::new(),
        });
        pool.insert(Response {
            tran_id: 2,
            status: IoStatus::Success,
            data: Vec::new(),
        });

        let drained = pool.poll();
        assert_eq!(drained.len(), 2);
        assert!(pool.poll().is_empty());
    }
}
