//! Harness shared by the end-to-end tests: a scripted authorization
//! server speaking the HTTP-like authz wire, and a minimal IPC client
//! that frames requests over the broker's Unix socket.

use osmium::net::buffer::Buffer;
use osmium::net::frame::{Frame, HEADER_SIZE};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A parsed authz request as seen by the scripted server.
#[derive(Debug, Clone)]
pub struct ParsedReq {
    pub verb: String,
    pub path: String,
    pub tran_id: u32,
    pub user: String,
    pub body: Vec<u8>,
}

/// `Some(body)` answers with HTTP 200 and the body; `None` drops the
/// connection on the spot; `Ignore` swallows the request silently.
pub enum Script {
    Reply(String),
    Drop,
    Ignore,
}

type Handler = Arc<dyn Fn(&ParsedReq) -> Script + Send + Sync>;

pub struct AuthzServer {
    pub addr: String,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AuthzServer {
    /// Bind on an ephemeral port and serve connections sequentially,
    /// re-accepting after a scripted drop (reconnect scenarios).
    pub fn start(handler: Handler) -> AuthzServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        listener.set_nonblocking(true).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        serve_connection(stream, &handler, &stop_flag);
                    }
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        AuthzServer {
            addr,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for AuthzServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_connection(stream: TcpStream, handler: &Handler, stop: &Arc<AtomicBool>) {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    while !stop.load(Ordering::Acquire) {
        let request = match read_request(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(_) => return,
        };

        match handler(&request) {
            Script::Reply(body) => {
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nX-Tran-Id: {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n{}",
                    request.tran_id,
                    body.len(),
                    body
                );
                if writer.write_all(reply.as_bytes()).is_err() {
                    return;
                }
            }
            Script::Drop => return,
            Script::Ignore => {}
        }
    }
}

/// `Ok(None)` on a read timeout so the loop can watch the stop flag.
fn read_request(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<ParsedReq>> {
    let mut line = String::new();

    match reader.read_line(&mut line) {
        Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
        Ok(_) => {}
        Err(err)
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.kind() == std::io::ErrorKind::TimedOut =>
        {
            return Ok(None)
        }
        Err(err) => return Err(err),
    }

    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut tran_id = 0u32;
    let mut user = String::new();
    let mut content_length = 0usize;

    loop {
        let mut header = String::new();
        reader.read_line(&mut header)?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }

        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("X-Tran-Id") {
                tran_id = value.parse().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("X-Auth-User") {
                user = value.to_string();
            } else if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    Ok(Some(ParsedReq {
        verb,
        path,
        tran_id,
        user,
        body,
    }))
}

// ---- IPC client side ----------------------------------------------------

pub fn send_frame(stream: &mut UnixStream, frame: &Frame) {
    let mut buffer = Buffer::new(65536);
    frame.encode(&mut buffer).unwrap();
    stream.write_all(buffer.read_slice()).unwrap();
}

/// Read exactly one frame, blocking up to the stream's read timeout.
pub fn read_frame(stream: &mut UnixStream) -> Frame {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).unwrap();

    let total = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let mut raw = header.to_vec();
    raw.resize(total, 0);
    stream.read_exact(&mut raw[HEADER_SIZE..]).unwrap();

    let (frame, used) = Frame::decode(&raw, total).unwrap().unwrap();
    assert_eq!(used, total);
    frame
}

pub fn json_manifest_read(size: u64, fragments: &[(&str, &str, u64)]) -> String {
    let objs: Vec<String> = fragments
        .iter()
        .map(|(pool, oid, size)| {
            format!(r#"{{"pool":"{}","oid":"{}","size":{}}}"#, pool, oid, size)
        })
        .collect();
    format!(
        r#"{{"Result":{{"Object_Size":{},"Rados_Objs":[{}]}}}}"#,
        size,
        objs.join(",")
    )
}

pub fn json_manifest_write(fragments: &[(&str, &str, u64)]) -> String {
    let objs: Vec<String> = fragments
        .iter()
        .map(|(pool, oid, size)| {
            format!(
                r#"{{"pool":"{}","oid":"{}","size":{},"offset":0,"new_object":1}}"#,
                pool, oid, size
            )
        })
        .collect();
    format!(
        r#"{{"Result":{{"Rados_Objs":[{}],"Data_Manifest":{{}}}}}}"#,
        objs.join(",")
    )
}

pub fn json_status(code: u8) -> String {
    format!(r#"{{"Result":{{"Error_Type":{}}}}}"#, code)
}

pub fn json_account(account: &str) -> String {
    format!(r#"{{"Result":{{"Account":"{}"}}}}"#, account)
}
