//! End-to-end scenarios over a real Unix socket, real shared memory and a
//! scripted authorization server.

mod common;

use common::*;
use ferrite::codes::IoStatus;
use ferrite::config::BrokerConfig;
use ferrite::logging::discard_logger;
use osmium::cluster::pool::WorkerPool;
use osmium::cluster::store::MemStore;
use osmium::net::endpoint::Endpoint;
use osmium::net::frame::{Frame, PROP_ABORT, PROP_MERGE, PROP_NEW};
use osmium::net::shm::ShmRegion;
use osmium::remote::security::{SecurityConfig, SecurityModule};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Broker {
    socket: String,
    shutdown: Arc<AtomicBool>,
    endpoint_thread: Option<thread::JoinHandle<()>>,
    pool: Arc<WorkerPool>,
    security: Arc<SecurityModule>,
    _authz: AuthzServer,
    _dir: tempfile::TempDir,
}

impl Broker {
    fn start(store: Arc<MemStore>, handler: Arc<dyn Fn(&ParsedReq) -> Script + Send + Sync>) -> Broker {
        let authz = AuthzServer::start(handler);

        let dir = tempfile::tempdir().unwrap();
        let socket = dir
            .path()
            .join("broker.sock")
            .to_string_lossy()
            .into_owned();

        let config = BrokerConfig::from_toml_str(&format!(
            r#"
ipc_socket = "{}"
ipc_buffersize = 65536
ipc_minallocbuf = 256
ipc_newallocsize = 4096
ipc_readsmsize = 65536
ipc_writesmsize = 65536
auth_server_ip = "127.0.0.1"
auth_server_port = {}
"#,
            socket,
            authz.addr.rsplit(':').next().unwrap()
        ))
        .unwrap();

        let security = SecurityModule::start(
            SecurityConfig {
                server_addr: authz.addr.clone(),
                timeout_ms: 0,
                window_cap: 0,
            },
            discard_logger(),
        )
        .unwrap();

        let pool = Arc::new(WorkerPool::new(
            0,
            2,
            security.clone(),
            store,
            discard_logger(),
        ));
        assert!(pool.initialize());

        let mut endpoint = Endpoint::bind(
            &config,
            pool.clone(),
            security.clone(),
            discard_logger(),
        )
        .unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let endpoint_thread = thread::spawn(move || {
            endpoint.run(&flag).unwrap();
        });

        // Give the endpoint a moment to come up.
        thread::sleep(Duration::from_millis(50));

        Broker {
            socket,
            shutdown,
            endpoint_thread: Some(endpoint_thread),
            pool,
            security,
            _authz: authz,
            _dir: dir,
        }
    }

    fn connect(&self) -> UnixStream {
        let stream = UnixStream::connect(&self.socket).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.endpoint_thread.take() {
            let _ = handle.join();
        }
        self.pool.stop();
        self.security.stop();
    }
}

fn authenticate(stream: &mut UnixStream, tran_id: u32, user: &str) -> Frame {
    send_frame(
        stream,
        &Frame::Auth {
            tran_id,
            user: user.to_string(),
            passwd: [b'x'; 32],
        },
    );
    read_frame(stream)
}

/// Script used by most tests: alice authenticates, objects live in pool
/// "p", writes commit cleanly.
fn default_handler() -> Arc<dyn Fn(&ParsedReq) -> Script + Send + Sync> {
    Arc::new(|req: &ParsedReq| match (req.verb.as_str(), req.path.as_str()) {
        ("GET", "/auth") => {
            if req.user == "alice" {
                Script::Reply(json_account("alice"))
            } else {
                Script::Reply(json_status(IoStatus::ErrPass as u8))
            }
        }
        ("GET", "/a") => Script::Reply(json_manifest_read(10, &[("p", "o", 10)])),
        ("GET", "/b") => {
            Script::Reply(json_manifest_read(12, &[("p", "b1", 8), ("p", "b2", 4)]))
        }
        ("PUT", "/b") => {
            Script::Reply(json_manifest_write(&[("p", "b1", 8), ("p", "b2", 4)]))
        }
        ("PUT", "/m") => Script::Reply(json_manifest_write(&[("p", "m1", 8)])),
        ("POST", _) => Script::Reply(json_status(0)),
        ("DELETE", _) => Script::Reply(json_status(0)),
        _ => Script::Reply(json_status(IoStatus::ErrPath as u8)),
    })
}

#[test]
fn test_auth_success_returns_connect_reply() {
    let store = Arc::new(MemStore::default());
    let broker = Broker::start(store, default_handler());

    let mut stream = broker.connect();
    let reply = authenticate(&mut stream, 1, "alice");

    match reply {
        Frame::ConnectReply {
            tran_id,
            read_size,
            write_size,
            read_name,
            write_name,
            ..
        } => {
            assert_eq!(tran_id, 1);
            assert_eq!(read_size, 65536);
            assert_eq!(write_size, 65536);
            assert_eq!(read_name[0], b'/');
            assert_eq!(write_name[0], b'/');
        }
        other => panic!("expected CONNECT_REPLY, got {:?}", other),
    }
}

#[test]
fn test_auth_bad_password_returns_status() {
    let store = Arc::new(MemStore::default());
    let broker = Broker::start(store, default_handler());

    let mut stream = broker.connect();
    let reply = authenticate(&mut stream, 2, "eve");

    match reply {
        Frame::Status { tran_id, status } => {
            assert_eq!(tran_id, 2);
            assert_eq!(status, IoStatus::ErrPass);
        }
        other => panic!("expected STATUS, got {:?}", other),
    }
}

#[test]
fn test_double_auth_is_protocol_error() {
    let store = Arc::new(MemStore::default());
    let broker = Broker::start(store, default_handler());

    let mut stream = broker.connect();
    authenticate(&mut stream, 1, "alice");

    let reply = authenticate(&mut stream, 2, "alice");
    match reply {
        Frame::Status { tran_id, status } => {
            assert_eq!(tran_id, 2);
            assert_eq!(status, IoStatus::ErrProt);
        }
        other => panic!("expected STATUS, got {:?}", other),
    }
}

#[test]
fn test_simple_read_one_fragment() {
    let store = Arc::new(MemStore::default());
    store.put_object("p", "o", b"0123456789".to_vec());
    let broker = Broker::start(store, default_handler());

    let mut stream = broker.connect();
    let (read_base, read_name) = match authenticate(&mut stream, 1, "alice") {
        Frame::ConnectReply {
            read_addr,
            read_name,
            ..
        } => (read_addr, read_name),
        other => panic!("expected CONNECT_REPLY, got {:?}", other),
    };

    let name = String::from_utf8(read_name.to_vec()).unwrap();
    let region = ShmRegion::open(name.trim_end_matches('\0')).unwrap();

    // New READ for the whole object.
    send_frame(
        &mut stream,
        &Frame::Read {
            tran_id: 3,
            path: "/a".to_string(),
            properties: PROP_NEW,
            merge_id: None,
        },
    );

    let (addr, len) = match read_frame(&mut stream) {
        Frame::Write {
            tran_id,
            data_addr,
            data_len,
            ..
        } => {
            assert_eq!(tran_id, 3);
            (data_addr, data_len)
        }
        other => panic!("expected read reply, got {:?}", other),
    };

    assert_eq!(len, 10);
    assert!(addr >= read_base);

    let offset = (addr - read_base) as usize;
    assert_eq!(region.read_at(offset, 10).unwrap(), b"0123456789");

    // Acknowledge: the end-of-object marker follows.
    send_frame(
        &mut stream,
        &Frame::Read {
            tran_id: 3,
            path: "/a".to_string(),
            properties: 0,
            merge_id: None,
        },
    );

    match read_frame(&mut stream) {
        Frame::Write {
            tran_id,
            data_addr,
            data_len,
            ..
        } => {
            assert_eq!(tran_id, 3);
            assert_eq!(data_addr, 0);
            assert_eq!(data_len, 0);
        }
        other => panic!("expected end-of-object reply, got {:?}", other),
    }

    // Final acknowledgement erases the path; a fresh READ works again.
    send_frame(
        &mut stream,
        &Frame::Read {
            tran_id: 3,
            path: "/a".to_string(),
            properties: 0,
            merge_id: None,
        },
    );

    send_frame(
        &mut stream,
        &Frame::Read {
            tran_id: 30,
            path: "/a".to_string(),
            properties: PROP_NEW,
            merge_id: None,
        },
    );

    match read_frame(&mut stream) {
        Frame::Write {
            tran_id, data_len, ..
        } => {
            assert_eq!(tran_id, 30);
            assert_eq!(data_len, 10);
        }
        other => panic!("expected fresh read reply, got {:?}", other),
    }
}

#[test]
fn test_abort_mid_read() {
    let store = Arc::new(MemStore::default());
    store.put_object("p", "o", b"0123456789".to_vec());
    let broker = Broker::start(store, default_handler());

    let mut stream = broker.connect();
    authenticate(&mut stream, 1, "alice");

    send_frame(
        &mut stream,
        &Frame::Read {
            tran_id: 5,
            path: "/a".to_string(),
            properties: PROP_NEW,
            merge_id: None,
        },
    );

    match read_frame(&mut stream) {
        Frame::Write { tran_id, .. } => assert_eq!(tran_id, 5),
        other => panic!("expected read reply, got {:?}", other),
    }

    // Abort instead of acknowledging.
    send_frame(
        &mut stream,
        &Frame::Read {
            tran_id: 5,
            path: "/a".to_string(),
            properties: PROP_ABORT,
            merge_id: None,
        },
    );

    match read_frame(&mut stream) {
        Frame::Status { tran_id, status } => {
            assert_eq!(tran_id, 5);
            assert_eq!(status, IoStatus::Success);
        }
        other => panic!("expected STATUS, got {:?}", other),
    }

    // The path state is gone: a new READ starts from scratch.
    send_frame(
        &mut stream,
        &Frame::Read {
            tran_id: 6,
            path: "/a".to_string(),
            properties: PROP_NEW,
            merge_id: None,
        },
    );

    match read_frame(&mut stream) {
        Frame::Write {
            tran_id, data_len, ..
        } => {
            assert_eq!(tran_id, 6);
            assert_eq!(data_len, 10);
        }
        other => panic!("expected read reply, got {:?}", other),
    }
}

#[test]
fn test_write_two_fragments_then_read_back() {
    let store = Arc::new(MemStore::default());
    let broker = Broker::start(store.clone(), default_handler());

    let mut stream = broker.connect();
    let (write_base, write_name, read_base, read_name) = match authenticate(&mut stream, 1, "alice")
    {
        Frame::ConnectReply {
            write_addr,
            write_name,
            read_addr,
            read_name,
            ..
        } => (write_addr, write_name, read_addr, read_name),
        other => panic!("expected CONNECT_REPLY, got {:?}", other),
    };

    let name = String::from_utf8(write_name.to_vec()).unwrap();
    let region = ShmRegion::open(name.trim_end_matches('\0')).unwrap();

    // Announce a 12-byte write.
    send_frame(
        &mut stream,
        &Frame::Write {
            tran_id: 4,
            path: "/b".to_string(),
            properties: PROP_NEW,
            data_addr: 0,
            data_len: 12,
        },
    );

    match read_frame(&mut stream) {
        Frame::Read { tran_id, .. } => assert_eq!(tran_id, 4),
        other => panic!("expected chunk request, got {:?}", other),
    }

    // First chunk: 8 bytes.
    region.write_at(0, b"01234567").unwrap();
    send_frame(
        &mut stream,
        &Frame::Write {
            tran_id: 4,
            path: "/b".to_string(),
            properties: 0,
            data_addr: write_base,
            data_len: 8,
        },
    );

    match read_frame(&mut stream) {
        Frame::Read { tran_id, .. } => assert_eq!(tran_id, 4),
        other => panic!("expected chunk request, got {:?}", other),
    }

    // Final chunk: 4 bytes; the commit acknowledgement ends the write.
    region.write_at(8, b"89ab").unwrap();
    send_frame(
        &mut stream,
        &Frame::Write {
            tran_id: 4,
            path: "/b".to_string(),
            properties: 0,
            data_addr: write_base + 8,
            data_len: 4,
        },
    );

    match read_frame(&mut stream) {
        Frame::Status { tran_id, status } => {
            assert_eq!(tran_id, 4);
            assert_eq!(status, IoStatus::Success);
        }
        other => panic!("expected STATUS, got {:?}", other),
    }

    assert_eq!(store.object("p", "b1").unwrap(), b"01234567");
    assert_eq!(store.object("p", "b2").unwrap(), b"89ab");

    // Read the object back through the broker (write/read round trip).
    let read_region_name = String::from_utf8(read_name.to_vec()).unwrap();
    let read_region = ShmRegion::open(read_region_name.trim_end_matches('\0')).unwrap();

    send_frame(
        &mut stream,
        &Frame::Read {
            tran_id: 8,
            path: "/b".to_string(),
            properties: PROP_NEW,
            merge_id: None,
        },
    );

    let (addr, len) = match read_frame(&mut stream) {
        Frame::Write {
            tran_id,
            data_addr,
            data_len,
            ..
        } => {
            assert_eq!(tran_id, 8);
            (data_addr, data_len)
        }
        other => panic!("expected read reply, got {:?}", other),
    };

    assert_eq!(len, 12);
    let offset = (addr - read_base) as usize;
    assert_eq!(read_region.read_at(offset, 12).unwrap(), b"0123456789ab");
}

#[test]
fn test_write_merge_redirects_second_writer() {
    let store = Arc::new(MemStore::default());
    let broker = Broker::start(store, default_handler());

    let mut stream = broker.connect();
    let (write_base, write_name) = match authenticate(&mut stream, 1, "alice") {
        Frame::ConnectReply {
            write_addr,
            write_name,
            ..
        } => (write_addr, write_name),
        other => panic!("expected CONNECT_REPLY, got {:?}", other),
    };

    let name = String::from_utf8(write_name.to_vec()).unwrap();
    let region = ShmRegion::open(name.trim_end_matches('\0')).unwrap();

    // First write takes the path.
    send_frame(
        &mut stream,
        &Frame::Write {
            tran_id: 10,
            path: "/m".to_string(),
            properties: PROP_NEW,
            data_addr: 0,
            data_len: 8,
        },
    );

    match read_frame(&mut stream) {
        Frame::Read { tran_id, .. } => assert_eq!(tran_id, 10),
        other => panic!("expected chunk request, got {:?}", other),
    }

    // Second write to the same path merges under the first.
    send_frame(
        &mut stream,
        &Frame::Write {
            tran_id: 11,
            path: "/m".to_string(),
            properties: PROP_NEW,
            data_addr: 0,
            data_len: 8,
        },
    );

    match read_frame(&mut stream) {
        Frame::Read {
            tran_id,
            properties,
            merge_id,
            ..
        } => {
            assert_eq!(tran_id, 11);
            assert!(properties & PROP_MERGE != 0);
            assert_eq!(merge_id, Some(10));
        }
        other => panic!("expected merge redirect, got {:?}", other),
    }

    // The surviving operation keeps going under its own id.
    region.write_at(0, b"datadata").unwrap();
    send_frame(
        &mut stream,
        &Frame::Write {
            tran_id: 10,
            path: "/m".to_string(),
            properties: 0,
            data_addr: write_base,
            data_len: 8,
        },
    );

    match read_frame(&mut stream) {
        Frame::Status { tran_id, status } => {
            assert_eq!(tran_id, 10);
            assert_eq!(status, IoStatus::Success);
        }
        other => panic!("expected STATUS, got {:?}", other),
    }
}

#[test]
fn test_delete_returns_status() {
    let store = Arc::new(MemStore::default());
    let broker = Broker::start(store, default_handler());

    let mut stream = broker.connect();
    authenticate(&mut stream, 1, "alice");

    send_frame(
        &mut stream,
        &Frame::Delete {
            tran_id: 12,
            path: "/a".to_string(),
        },
    );

    match read_frame(&mut stream) {
        Frame::Status { tran_id, status } => {
            assert_eq!(tran_id, 12);
            assert_eq!(status, IoStatus::Success);
        }
        other => panic!("expected STATUS, got {:?}", other),
    }
}

#[test]
fn test_close_is_idempotent() {
    let store = Arc::new(MemStore::default());
    let broker = Broker::start(store, default_handler());

    let mut stream = broker.connect();
    authenticate(&mut stream, 1, "alice");

    for tran_id in [20u32, 21] {
        send_frame(&mut stream, &Frame::Close { tran_id });

        match read_frame(&mut stream) {
            Frame::Status {
                tran_id: reply_id,
                status,
            } => {
                assert_eq!(reply_id, tran_id);
                assert_eq!(status, IoStatus::Close);
            }
            other => panic!("expected STATUS, got {:?}", other),
        }
    }
}

#[test]
fn test_unauthenticated_read_is_protocol_error() {
    let store = Arc::new(MemStore::default());
    let broker = Broker::start(store, default_handler());

    let mut stream = broker.connect();

    send_frame(
        &mut stream,
        &Frame::Read {
            tran_id: 7,
            path: "/a".to_string(),
            properties: PROP_NEW,
            merge_id: None,
        },
    );

    match read_frame(&mut stream) {
        Frame::Status { tran_id, status } => {
            assert_eq!(tran_id, 7);
            assert_eq!(status, IoStatus::ErrProt);
        }
        other => panic!("expected STATUS, got {:?}", other),
    }
}
