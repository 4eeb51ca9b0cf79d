//! The single persistent connection to the authorization server. Sends
//! happen on the security driver thread; a dedicated receiver thread
//! parses complete replies into the receive pool and raises a
//! disconnected flag on any socket failure, parking until the driver
//! re-establishes the connection.

use crate::remote::message::{Request, ReceivePool, Response, WireError};
use ferrite::logging::{self, Logger};
use parking_lot::{Condvar, Mutex};
use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::{io, net};

struct ChannelShared {
    stream: Mutex<Option<TcpStream>>,
    pool: ReceivePool,
    /// Transaction ids whose send failed on the socket; drained by the
    /// security driver and translated into internal errors.
    sock_errs: Mutex<Vec<u32>>,
    disconnected: AtomicBool,
    stopping: AtomicBool,
    /// Parks the receiver between disconnection and reconnect.
    gate: Mutex<()>,
    gate_cv: Condvar,
}

pub struct ServerChannel {
    addr: String,
    shared: Arc<ChannelShared>,
    receiver: Option<thread::JoinHandle<()>>,
    log: Logger,
}

impl ServerChannel {
    pub fn connect(addr: &str, log: Logger) -> io::Result<ServerChannel> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        let shared = Arc::new(ChannelShared {
            stream: Mutex::new(Some(stream)),
            pool: ReceivePool::new(),
            sock_errs: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            gate: Mutex::new(()),
            gate_cv: Condvar::new(),
        });

        let receiver_shared = shared.clone();
        let receiver_log = log.new(logging::o!("thread" => "authz-receiver"));
        let receiver = thread::Builder::new()
            .name("authz-receiver".to_string())
            .spawn(move || receiver_loop(receiver_shared, receiver_log))?;

        Ok(ServerChannel {
            addr: addr.to_string(),
            shared,
            receiver: Some(receiver),
            log,
        })
    }

    /// Write one request. A failure records the transaction id on the
    /// socket-error list and flags the connection for reconnection.
    pub fn send(&self, request: &Request) -> bool {
        let wire = request.encode();
        let mut guard = self.shared.stream.lock();

        let result = match guard.as_mut() {
            Some(stream) => stream.write_all(&wire),
            None => Err(io::ErrorKind::NotConnected.into()),
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                logging::warn!(self.log, "authz send failed";
                               "tran_id" => request.tran_id,
                               "error" => %err);
                self.shared.sock_errs.lock().push(request.tran_id);
                self.shared.disconnected.store(true, Ordering::Release);
                false
            }
        }
    }

    pub fn poll_responses(&self) -> Vec<Response> {
        self.shared.pool.poll()
    }

    pub fn take_socket_errors(&self) -> Vec<u32> {
        std::mem::take(&mut *self.shared.sock_errs.lock())
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    /// Re-establish the connection and wake the receiver. The old stream
    /// is discarded; in-flight ids were already failed by the caller.
    pub fn reconnect(&self) -> io::Result<()> {
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_nodelay(true)?;

        {
            let mut guard = self.shared.stream.lock();
            if let Some(old) = guard.take() {
                let _ = old.shutdown(Shutdown::Both);
            }
            *guard = Some(stream);
        }

        self.shared.disconnected.store(false, Ordering::Release);
        self.shared.gate_cv.notify_all();

        logging::info!(self.log, "authz channel reconnected"; "addr" => %self.addr);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);

        if let Some(stream) = self.shared.stream.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.shared.gate_cv.notify_all();

        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receiver_loop(shared: Arc<ChannelShared>, log: Logger) {
    while !shared.stopping.load(Ordering::Acquire) {
        // Park while the driver works on reconnection.
        if shared.disconnected.load(Ordering::Acquire) {
            let mut gate = shared.gate.lock();
            if shared.disconnected.load(Ordering::Acquire)
                && !shared.stopping.load(Ordering::Acquire)
            {
                shared
                    .gate_cv
                    .wait_for(&mut gate, std::time::Duration::from_millis(100));
            }
            continue;
        }

        let stream = match shared.stream.lock().as_ref().map(net::TcpStream::try_clone) {
            Some(Ok(stream)) => stream,
            _ => {
                shared.disconnected.store(true, Ordering::Release);
                continue;
            }
        };

        let mut reader = BufReader::new(stream);

        loop {
            if shared.stopping.load(Ordering::Acquire) {
                return;
            }

            match Response::read_from(&mut reader) {
                Ok(response) => {
                    logging::trace!(log, "authz reply received";
                                    "tran_id" => response.tran_id);
                    shared.pool.insert(response);
                }
                Err(WireError::Closed) | Err(WireError::Io(_)) => {
                    shared.disconnected.store(true, Ordering::Release);
                    break;
                }
                Err(WireError::Malformed(what)) => {
                    // A desynchronized stream cannot be resumed; drop the
                    // connection and let the driver rebuild it.
                    logging::warn!(log, "authz reply malformed"; "field" => what);
                    shared.disconnected.store(true, Ordering::Release);
                    break;
                }
            }
        }
    }
}
