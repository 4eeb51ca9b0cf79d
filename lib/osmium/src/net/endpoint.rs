//! Accept loop and readiness pump for the IPC front-end. Sessions live in
//! a slab with a free list; each tick moves bytes, dispatches frames,
//! polls completion futures and flushes replies.

use crate::cluster::pool::WorkerPool;
use crate::net::session::{Session, SessionConfig};
use crate::net::support::ErrorUtils;
use crate::remote::security::SecurityModule;
use ferrite::config::BrokerConfig;
use ferrite::logging::{self, Logger};
use mio::net::UnixListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LISTENER: Token = Token(usize::MAX - 1);
const EVENT_CAPACITY: usize = 1024;

const IDLE_TICK: Duration = Duration::from_millis(50);
const BUSY_TICK: Duration = Duration::from_millis(1);

pub struct Endpoint {
    listener: UnixListener,
    socket_path: String,
    poll: Poll,
    events: Events,
    sessions: Vec<Option<Session>>,
    free: Vec<usize>,
    pool: Arc<WorkerPool>,
    security: Arc<SecurityModule>,
    session_config: SessionConfig,
    next_conn: u64,
    log: Logger,
}

impl Endpoint {
    pub fn bind(
        config: &BrokerConfig,
        pool: Arc<WorkerPool>,
        security: Arc<SecurityModule>,
        log: Logger,
    ) -> io::Result<Endpoint> {
        let socket_path = config.ipc_socket.clone();

        // A stale socket file from a previous run blocks the bind.
        if Path::new(&socket_path).exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let mut listener = UnixListener::bind(&socket_path)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        logging::info!(log, "ipc endpoint listening"; "socket" => %socket_path);

        Ok(Endpoint {
            listener,
            socket_path,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            sessions: Vec::new(),
            free: Vec::new(),
            pool,
            security,
            session_config: SessionConfig {
                buffer_size: config.ipc_buffersize as usize,
                min_alloc: config.ipc_minallocbuf as u64,
                slice_size: config.ipc_newallocsize,
                read_sm_size: config.ipc_readsmsize,
                write_sm_size: config.ipc_writesmsize,
            },
            next_conn: 1,
            log,
        })
    }

    /// Drive the endpoint until `shutdown` flips. Sessions die with their
    /// sockets; their outstanding futures are dropped unresolved.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        while !shutdown.load(Ordering::Acquire) {
            let timeout = if self.any_busy() { BUSY_TICK } else { IDLE_TICK };

            if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
                // A signal landing mid-poll is not a failure; the loop
                // condition picks up the shutdown flag.
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            let mut ready: Vec<(Token, bool, bool)> = Vec::new();
            for event in self.events.iter() {
                ready.push((event.token(), event.is_readable(), event.is_writable()));
            }

            for (token, readable, writable) in ready {
                if token == LISTENER {
                    self.accept_ready();
                } else {
                    self.session_ready(token.0, readable, writable);
                }
            }

            self.pump_sessions();
        }

        self.close_all();
        Ok(())
    }

    fn any_busy(&self) -> bool {
        self.sessions
            .iter()
            .flatten()
            .any(|session| session.is_busy() || session.has_egress())
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.open_session(stream) {
                        logging::warn!(self.log, "session setup failed"; "error" => %err);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn open_session(&mut self, mut stream: mio::net::UnixStream) -> io::Result<()> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.sessions.push(None);
                self.sessions.len() - 1
            }
        };

        self.poll.registry().register(
            &mut stream,
            Token(index),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let conn_key = self.next_conn;
        self.next_conn += 1;

        let session = Session::new(
            conn_key,
            stream,
            self.pool.clone(),
            self.security.clone(),
            self.session_config.clone(),
            self.log.new(logging::o!("conn" => conn_key)),
        );

        logging::debug!(self.log, "session opened"; "conn" => conn_key);
        self.sessions[index] = Some(session);
        Ok(())
    }

    fn session_ready(&mut self, index: usize, readable: bool, writable: bool) {
        let verdict = {
            let session = match self.sessions.get_mut(index).and_then(Option::as_mut) {
                Some(session) => session,
                None => return,
            };

            let mut why = None;

            if readable {
                if session.receive().has_failed() {
                    why = Some("socket read failed");
                } else {
                    session.dispatch();
                }
            }

            if why.is_none() && writable && session.has_egress() && session.flush().has_failed() {
                why = Some("socket write failed");
            }

            if why.is_none() && session.is_dead() {
                why = Some("protocol failure");
            }

            why
        };

        if let Some(why) = verdict {
            self.close_session(index, why);
        }
    }

    /// Poll completion futures and flush replies on every live session.
    fn pump_sessions(&mut self) {
        for index in 0..self.sessions.len() {
            let (failed, dead) = match self.sessions[index].as_mut() {
                Some(session) => {
                    session.poll_completions();
                    let failed = session.has_egress() && session.flush().has_failed();
                    (failed, session.is_dead())
                }
                None => continue,
            };

            if failed {
                self.close_session(index, "socket write failed");
            } else if dead {
                self.close_session(index, "protocol failure");
            }
        }
    }

    fn close_session(&mut self, index: usize, why: &str) {
        if let Some(mut session) = self.sessions[index].take() {
            let _ = self.poll.registry().deregister(session.stream_mut());
            logging::debug!(self.log, "session closed"; "reason" => why);
            self.free.push(index);
        }
    }

    fn close_all(&mut self) {
        for index in 0..self.sessions.len() {
            if self.sessions[index].is_some() {
                self.close_session(index, "shutdown");
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        logging::info!(self.log, "ipc endpoint stopped");
    }
}
