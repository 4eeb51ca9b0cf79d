//! The authorization client. Typed requests from sessions and workers are
//! queued to a single driver thread which owns the transaction window,
//! writes requests onto the server channel, matches replies back through
//! the correlation id, enforces the optional per-request timeout, and
//! turns socket failures into internal errors before reconnecting.

use crate::remote::channel::ServerChannel;
use crate::remote::message::{IoResponse, Request, Response};
use ferrite::codes::{IoOpCode, IoStatus};
use ferrite::future::{promise, Future, Promise};
use ferrite::logging::{self, Logger};
use ferrite::queue::ConcurrentQueue;
use ferrite::task::{Task, UserAuth};
use hashbrown::{HashMap, HashSet};
use serde_derive::Deserialize;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// The half-open range `[back_id, next_id)` of transactions open against
/// the server, in wrapping u32 arithmetic. Completions arriving out of
/// order are parked in `completed` until `back_id` catches up past them.
pub struct TranWindow {
    next_id: u32,
    back_id: u32,
    completed: HashSet<u32>,
    /// 0 leaves the window unbounded.
    cap: u32,
}

impl TranWindow {
    pub fn new(cap: u32) -> TranWindow {
        TranWindow {
            next_id: 0,
            back_id: 0,
            completed: HashSet::new(),
            cap,
        }
    }

    pub fn open_count(&self) -> u32 {
        self.next_id.wrapping_sub(self.back_id)
    }

    pub fn at_cap(&self) -> bool {
        // Even unbounded windows cannot wrap onto still-open ids.
        if self.open_count() == u32::MAX {
            return true;
        }
        self.cap != 0 && self.open_count() >= self.cap
    }

    pub fn peek(&self) -> u32 {
        self.next_id
    }

    pub fn assign(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// True when `id` lies in `[back_id, next_id)` and has not completed.
    pub fn is_open(&self, id: u32) -> bool {
        id.wrapping_sub(self.back_id) < self.open_count() && !self.completed.contains(&id)
    }

    /// Retire a transaction. The oldest id advances `back_id` across any
    /// contiguous run of already-completed successors.
    pub fn complete(&mut self, id: u32) {
        if !self.is_open(id) {
            return;
        }

        if id == self.back_id {
            self.back_id = self.back_id.wrapping_add(1);
            while self.back_id != self.next_id && self.completed.remove(&self.back_id) {
                self.back_id = self.back_id.wrapping_add(1);
            }
        } else {
            self.completed.insert(id);
        }
    }
}

enum ReplySlot {
    /// AUTH: the security module parses the account itself.
    Auth(Promise<Task>),
    /// Worker-bound: the raw body passes through to protocol handlers.
    Worker(Promise<IoResponse>),
}

struct TaskWrapper {
    msg: Request,
    slot: ReplySlot,
}

struct OpenTran {
    wrapper: TaskWrapper,
    deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub server_addr: String,
    /// Per-request ceiling; zero disables timeouts.
    pub timeout_ms: u64,
    /// Maximum open window; zero leaves it unbounded.
    pub window_cap: u32,
}

pub struct SecurityModule {
    tasks: ConcurrentQueue<TaskWrapper>,
    done: Arc<AtomicBool>,
    driver: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
}

impl SecurityModule {
    const QUEUE_DEPTH: usize = 1024;

    pub fn start(config: SecurityConfig, log: Logger) -> io::Result<Arc<SecurityModule>> {
        let channel = ServerChannel::connect(
            &config.server_addr,
            log.new(logging::o!("component" => "authz-channel")),
        )?;

        let tasks = ConcurrentQueue::new(Self::QUEUE_DEPTH);
        let done = Arc::new(AtomicBool::new(false));

        let mut driver = Driver {
            tasks: tasks.clone(),
            channel,
            window: TranWindow::new(config.window_cap),
            open: HashMap::new(),
            pend: VecDeque::new(),
            timeout: if config.timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(config.timeout_ms))
            },
            done: done.clone(),
            log: log.new(logging::o!("thread" => "authz-driver")),
        };

        let handle = thread::Builder::new()
            .name("authz-driver".to_string())
            .spawn(move || driver.run())?;

        Ok(Arc::new(SecurityModule {
            tasks,
            done,
            driver: parking_lot::Mutex::new(Some(handle)),
        }))
    }

    /// Authenticate a session. The reply task carries the account name on
    /// success or the remote error status.
    pub fn client_connect(&self, user: &UserAuth) -> Future<Task> {
        let (promise, future) = promise();

        let wrapper = TaskWrapper {
            msg: Request::new(IoOpCode::Auth, user.clone(), "", Vec::new()),
            slot: ReplySlot::Auth(promise),
        };

        self.submit(wrapper);
        future
    }

    /// Ask for permission (and the manifest) for an operation on `path`.
    pub fn check_perm(
        &self,
        path: &str,
        user: &UserAuth,
        op: IoOpCode,
        data_size: u64,
    ) -> Future<IoResponse> {
        let (promise, future) = promise();

        let body = if op == IoOpCode::Write || op == IoOpCode::CheckWrite {
            format!("{{\"Size\":{}}}", data_size).into_bytes()
        } else {
            Vec::new()
        };

        let wire_op = if op == IoOpCode::CheckWrite {
            IoOpCode::Write
        } else {
            op
        };

        let wrapper = TaskWrapper {
            msg: Request::new(wire_op, user.clone(), path, body),
            slot: ReplySlot::Worker(promise),
        };

        self.submit(wrapper);
        future
    }

    /// Report an operation result (commit of a finished write).
    pub fn send_io_result(
        &self,
        path: &str,
        user: &UserAuth,
        op: IoOpCode,
        body: Vec<u8>,
    ) -> Future<IoResponse> {
        let (promise, future) = promise();

        let wrapper = TaskWrapper {
            msg: Request::new(op, user.clone(), path, body),
            slot: ReplySlot::Worker(promise),
        };

        self.submit(wrapper);
        future
    }

    fn submit(&self, wrapper: TaskWrapper) {
        if self.done.load(Ordering::Acquire) || !self.tasks.push(wrapper) {
            // The driver is gone; the dropped promise surfaces as a
            // detached future at the caller.
        }
    }

    pub fn stop(&self) {
        self.done.store(true, Ordering::Release);

        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.join();
        }
    }
}

struct Driver {
    tasks: ConcurrentQueue<TaskWrapper>,
    channel: ServerChannel,
    window: TranWindow,
    open: HashMap<u32, OpenTran>,
    pend: VecDeque<TaskWrapper>,
    timeout: Option<Duration>,
    done: Arc<AtomicBool>,
    log: Logger,
}

impl Driver {
    fn run(&mut self) {
        let mut incoming: Vec<TaskWrapper> = Vec::new();

        while !self.done.load(Ordering::Acquire) {
            incoming.clear();
            self.tasks.try_drain(&mut incoming);

            if incoming.is_empty() && self.open.is_empty() && self.pend.is_empty() {
                // Fully idle: block briefly on the queue.
                if let Some(wrapper) = self.tasks.pop_timeout(Duration::from_millis(50)) {
                    incoming.push(wrapper);
                }
            }

            // Pending submissions go first to keep FIFO fairness.
            let mut backlog: Vec<TaskWrapper> = self.pend.drain(..).collect();
            backlog.extend(incoming.drain(..));
            for wrapper in backlog {
                self.dispatch(wrapper);
            }

            self.handle_socket_errors();
            self.handle_disconnect();
            self.poll_replies();
            self.expire_timeouts();

            if !self.open.is_empty() {
                // Replies land via the receiver thread; poll gently.
                thread::sleep(Duration::from_micros(200));
            }
        }

        self.shutdown();
    }

    fn dispatch(&mut self, mut wrapper: TaskWrapper) {
        if self.window.at_cap() {
            self.pend.push_back(wrapper);
            return;
        }

        wrapper.msg.tran_id = self.window.peek();

        if self.channel.send(&wrapper.msg) {
            let id = self.window.assign();
            let deadline = self.timeout.map(|t| Instant::now() + t);
            self.open.insert(id, OpenTran { wrapper, deadline });
        } else {
            // The send already recorded the id on the socket-error list;
            // fail the caller without consuming a window slot.
            fail(wrapper, IoStatus::ErrInternal);
        }
    }

    fn handle_socket_errors(&mut self) {
        for id in self.channel.take_socket_errors() {
            if let Some(open) = self.open.remove(&id) {
                fail(open.wrapper, IoStatus::ErrInternal);
                self.window.complete(id);
            }
        }
    }

    /// A broken connection fails every in-flight transaction, then the
    /// socket is rebuilt; later submissions proceed normally.
    fn handle_disconnect(&mut self) {
        if !self.channel.is_disconnected() {
            return;
        }

        let open = std::mem::take(&mut self.open);
        let count = open.len();
        for (id, tran) in open {
            fail(tran.wrapper, IoStatus::ErrInternal);
            self.window.complete(id);
        }

        if count > 0 {
            logging::warn!(self.log, "authz connection lost";
                           "failed_transactions" => count);
        }

        if let Err(err) = self.channel.reconnect() {
            logging::warn!(self.log, "authz reconnect failed"; "error" => %err);
            thread::sleep(Duration::from_millis(50));
        }
    }

    fn poll_replies(&mut self) {
        for response in self.channel.poll_responses() {
            let id = response.tran_id;

            match self.open.remove(&id) {
                Some(open) => {
                    resolve(open.wrapper, response);
                    self.window.complete(id);
                }
                None => {
                    // Late reply for a timed-out or failed id.
                    logging::debug!(self.log, "unmatched authz reply"; "tran_id" => id);
                }
            }
        }
    }

    fn expire_timeouts(&mut self) {
        if self.timeout.is_none() {
            return;
        }

        let now = Instant::now();
        let expired: Vec<u32> = self
            .open
            .iter()
            .filter(|(_, tran)| tran.deadline.map_or(false, |d| d <= now))
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            if let Some(open) = self.open.remove(&id) {
                logging::warn!(self.log, "authz transaction timed out"; "tran_id" => id);
                fail(open.wrapper, IoStatus::ErrInternal);
                self.window.complete(id);
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, tran) in std::mem::take(&mut self.open) {
            fail(tran.wrapper, IoStatus::ErrInternal);
        }
        for wrapper in std::mem::take(&mut self.pend) {
            fail(wrapper, IoStatus::ErrInternal);
        }

        let mut rest = Vec::new();
        self.tasks.try_drain(&mut rest);
        for wrapper in rest {
            fail(wrapper, IoStatus::ErrInternal);
        }

        self.channel.stop();
    }
}

fn fail(wrapper: TaskWrapper, status: IoStatus) {
    match wrapper.slot {
        ReplySlot::Auth(promise) => {
            let task = Task::request(wrapper.msg.user, "", IoOpCode::Auth, 0, 0, 0, 0);
            promise.set(task.reply(status));
        }
        ReplySlot::Worker(promise) => {
            promise.set(IoResponse::error(wrapper.msg.op, status));
        }
    }
}

fn resolve(wrapper: TaskWrapper, response: Response) {
    match wrapper.slot {
        ReplySlot::Auth(promise) => {
            promise.set(parse_auth_reply(wrapper.msg.user, &response));
        }
        ReplySlot::Worker(promise) => {
            promise.set(IoResponse {
                op: wrapper.msg.op,
                status: response.status,
                data: response.data,
            });
        }
    }
}

#[derive(Deserialize)]
struct AuthEnvelope {
    #[serde(rename = "Result")]
    result: AuthResult,
}

#[derive(Deserialize)]
struct AuthResult {
    #[serde(rename = "Account")]
    account: Option<String>,
    #[serde(rename = "Error_Type")]
    error_type: Option<u8>,
}

/// AUTH replies resolve here: `Result.Account` on success, otherwise
/// `Result.Error_Type` mapped onto the status taxonomy.
fn parse_auth_reply(mut user: UserAuth, response: &Response) -> Task {
    if response.status != IoStatus::Success {
        let task = Task::request(user, "", IoOpCode::Auth, 0, 0, 0, 0);
        return task.reply(response.status);
    }

    let parsed: Result<AuthEnvelope, _> = serde_json::from_slice(&response.data);

    let status = match parsed {
        Ok(envelope) => match (envelope.result.account, envelope.result.error_type) {
            (Some(account), _) => {
                user.username = account;
                IoStatus::Success
            }
            (None, Some(code)) => IoStatus::try_from(code).unwrap_or(IoStatus::ErrInternal),
            (None, None) => IoStatus::ErrInternal,
        },
        Err(_) => IoStatus::ErrInternal,
    };

    Task::request(user, "", IoOpCode::Auth, 0, 0, 0, 0).reply(status)
}
