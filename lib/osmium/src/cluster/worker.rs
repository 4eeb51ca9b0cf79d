//! A single-threaded worker serving tasks from its bounded queue. The
//! loop correlates three streams: upstream task submissions, authz
//! replies, and backend completions. At most one operation per
//! `(connection, path)` is active at a time; concurrent arrivals queue in
//! a per-path FIFO.

use crate::cluster::backend::{BackendClient, Completion};
use crate::cluster::protocol::{parse_status, ReadHandler, WriteHandler};
use crate::net::shm;
use crate::remote::message::IoResponse;
use crate::remote::security::SecurityModule;
use ferrite::codes::{IoOpCode, IoStatus};
use ferrite::future::{Future, Poll, Promise};
use ferrite::logging::{self, Logger};
use ferrite::queue::ConcurrentQueue;
use ferrite::task::Task;
use ferrite::ConnKey;
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// An upstream request paired with the promise its completion resolves.
pub type UpperRequest = (Promise<Task>, Task);

type PathKey = (ConnKey, String);

fn key_of(task: &Task) -> PathKey {
    (task.conn_key, task.path.clone())
}

/// Arena of issued backend operations. Completions carry the slot index
/// back; an aborted operation just flips its slots invalid and the late
/// completions are dropped on arrival.
struct SlotPool<T> {
    store: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> SlotPool<T> {
    fn new() -> SlotPool<T> {
        SlotPool {
            store: Vec::new(),
            free: Vec::new(),
        }
    }

    fn push(&mut self, value: T) -> usize {
        if let Some(index) = self.free.pop() {
            self.store[index] = Some(value);
            index
        } else {
            self.store.push(Some(value));
            self.store.len() - 1
        }
    }

    fn reclaim(&mut self, index: usize) -> Option<T> {
        let value = self.store.get_mut(index)?.take();
        if value.is_some() {
            self.free.push(index);
        }
        value
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.store.get_mut(index)?.as_mut()
    }
}

/// One issued backend operation.
struct IssuedCtx {
    key: PathKey,
    /// Offset of this operation's bytes inside the current slice/chunk.
    dest_off: u64,
    valid: bool,
}

enum OpHandler {
    None,
    Read(ReadHandler),
    Write(WriteHandler),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum OpState {
    /// Permission/manifest request in flight at the authz server.
    AwaitingManifest,
    Active,
    /// Final write chunk done, commit in flight.
    Committing,
}

/// Per-path operation state while the path is owned by this worker.
struct OpContext {
    op: IoOpCode,
    /// Transaction id of the operation that owns the path; the merge
    /// target for funneled writes.
    txn: u32,
    state: OpState,
    handler: OpHandler,
    /// Upstream request currently being serviced, if any.
    promise: Option<Promise<Task>>,
    task: Option<Task>,
    /// Bytes planned for the slice/chunk in flight.
    planned: u64,
    outstanding: u32,
    failed: bool,
    issued: HashSet<usize>,
}

impl OpContext {
    fn awaiting(op: IoOpCode, txn: u32, promise: Promise<Task>, task: Task) -> OpContext {
        OpContext {
            op,
            txn,
            state: OpState::AwaitingManifest,
            handler: OpHandler::None,
            promise: Some(promise),
            task: Some(task),
            planned: 0,
            outstanding: 0,
            failed: false,
            issued: HashSet::new(),
        }
    }
}

struct RemoteCtx {
    key: PathKey,
    fut: Future<IoResponse>,
}

pub struct Worker {
    id: u32,
    tasks: ConcurrentQueue<UpperRequest>,
    security: Arc<SecurityModule>,
    backend: BackendClient,
    active_ops: HashMap<PathKey, OpContext>,
    pend_tasks: HashMap<PathKey, VecDeque<UpperRequest>>,
    remote: Vec<RemoteCtx>,
    issued: SlotPool<IssuedCtx>,
    done: Arc<AtomicBool>,
    log: Logger,
}

impl Worker {
    const IDLE_POP: Duration = Duration::from_millis(100);
    const BACKOFF: Duration = Duration::from_micros(100);

    pub fn new(
        id: u32,
        tasks: ConcurrentQueue<UpperRequest>,
        security: Arc<SecurityModule>,
        backend: BackendClient,
        done: Arc<AtomicBool>,
        log: Logger,
    ) -> Worker {
        Worker {
            id,
            tasks,
            security,
            backend,
            active_ops: HashMap::new(),
            pend_tasks: HashMap::new(),
            remote: Vec::new(),
            issued: SlotPool::new(),
            done,
            log,
        }
    }

    /// Establish the backend connection; runs on the worker's own thread.
    pub fn initialize(&mut self) -> bool {
        match self.backend.connect() {
            Ok(()) => true,
            Err(err) => {
                logging::error!(self.log, "backend connect failed"; "error" => ?err);
                false
            }
        }
    }

    pub fn run(&mut self) {
        let mut incoming: Vec<UpperRequest> = Vec::new();
        let mut completions: Vec<Completion> = Vec::new();

        while !self.done.load(Ordering::Acquire) {
            incoming.clear();
            self.tasks.try_drain(&mut incoming);
            let drained = incoming.len();
            for (promise, task) in incoming.drain(..) {
                self.accept(promise, task);
            }

            completions.clear();
            let backend_n = self.backend.poll_completions(&mut completions);
            for completion in completions.drain(..) {
                self.on_backend_completion(completion);
            }

            let remote_n = self.poll_remote();

            if self.active_ops.is_empty() && self.remote.is_empty() {
                // Fully idle: block on the task queue.
                if let Some((promise, task)) = self.tasks.pop_timeout(Self::IDLE_POP) {
                    self.accept(promise, task);
                }
            } else if drained == 0 && backend_n == 0 && remote_n == 0 {
                thread::sleep(Self::BACKOFF);
            }
        }

        self.shutdown();
    }

    fn accept(&mut self, promise: Promise<Task>, task: Task) {
        match task.op {
            IoOpCode::Read => self.process_read(promise, task),
            IoOpCode::Write | IoOpCode::Append => self.process_write(promise, task),
            IoOpCode::CheckWrite => self.process_check_write(promise, task),
            IoOpCode::Delete => self.process_delete(promise, task),
            IoOpCode::Abort => self.process_abort(promise, task),
            IoOpCode::Close => self.process_close(promise, task),
            _ => {
                logging::warn!(self.log, "unsupported task opcode"; "op" => ?task.op);
                self.resolve(promise, task, IoStatus::ErrInternal);
            }
        }
    }

    fn resolve(&self, promise: Promise<Task>, mut task: Task, status: IoStatus) {
        task.worker_id = self.id;
        task.status = status;
        promise.set(task);
    }

    fn pend(&mut self, key: PathKey, request: UpperRequest) {
        self.pend_tasks.entry(key).or_default().push_back(request);
    }

    // ---- task intake ----------------------------------------------------

    fn process_read(&mut self, promise: Promise<Task>, task: Task) {
        let key = key_of(&task);

        match self.active_ops.get(&key) {
            None => self.dispatch_remote(key, IoOpCode::Read, promise, task),
            Some(ctx)
                if ctx.op == IoOpCode::Read
                    && ctx.state == OpState::Active
                    && ctx.promise.is_none() =>
            {
                self.begin_read_slice(&key, promise, task)
            }
            Some(_) => self.pend(key, (promise, task)),
        }
    }

    fn process_check_write(&mut self, promise: Promise<Task>, task: Task) {
        let key = key_of(&task);

        match self.active_ops.get(&key) {
            None => self.dispatch_remote(key, IoOpCode::CheckWrite, promise, task),
            Some(ctx) if ctx.op == IoOpCode::Write && ctx.state == OpState::Active => {
                // Merge: the new write funnels its chunks under the
                // surviving operation's transaction id.
                let merge_id = ctx.txn;
                let mut task = task;
                task.merge_id = merge_id;
                logging::debug!(self.log, "merged write";
                                "path" => %task.path, "merge_id" => merge_id);
                self.resolve(promise, task, IoStatus::PartialWrite);
            }
            Some(_) => self.pend(key, (promise, task)),
        }
    }

    fn process_write(&mut self, promise: Promise<Task>, task: Task) {
        let key = key_of(&task);

        match self.active_ops.get(&key) {
            Some(ctx)
                if ctx.op == IoOpCode::Write
                    && ctx.state == OpState::Active
                    && ctx.promise.is_none() =>
            {
                self.begin_write_chunk(&key, promise, task)
            }
            Some(_) => self.pend(key, (promise, task)),
            // A chunk without a preceding successful check is a protocol
            // violation.
            None => self.resolve(promise, task, IoStatus::ErrProt),
        }
    }

    fn process_delete(&mut self, promise: Promise<Task>, task: Task) {
        let key = key_of(&task);

        match self.active_ops.get(&key) {
            None => self.dispatch_remote(key, IoOpCode::Delete, promise, task),
            Some(_) => self.pend(key, (promise, task)),
        }
    }

    fn process_abort(&mut self, promise: Promise<Task>, task: Task) {
        let key = key_of(&task);

        if let Some(ctx) = self.active_ops.remove(&key) {
            self.invalidate(&ctx);
            logging::debug!(self.log, "aborted active operation";
                            "path" => %task.path, "txn" => ctx.txn);
        }

        // Queued requests for the path die with the operation; their
        // futures surface as detached at the session.
        self.pend_tasks.remove(&key);

        self.resolve(promise, task, IoStatus::Success);
    }

    fn process_close(&mut self, promise: Promise<Task>, task: Task) {
        let conn = task.conn_key;

        let keys: Vec<PathKey> = self
            .active_ops
            .keys()
            .filter(|key| key.0 == conn)
            .cloned()
            .collect();

        for key in keys {
            if let Some(ctx) = self.active_ops.remove(&key) {
                self.invalidate(&ctx);
            }
        }

        self.pend_tasks.retain(|key, _| key.0 != conn);
        self.remote.retain(|ctx| ctx.key.0 != conn);

        self.resolve(promise, task, IoStatus::Close);
    }

    fn invalidate(&mut self, ctx: &OpContext) {
        for &handle in &ctx.issued {
            if let Some(issued) = self.issued.get_mut(handle) {
                issued.valid = false;
            }
        }
    }

    /// Create the serialization placeholder for the path and ask the
    /// authz server for permission (and a manifest).
    fn dispatch_remote(&mut self, key: PathKey, op: IoOpCode, promise: Promise<Task>, task: Task) {
        let fut = match op {
            IoOpCode::CheckWrite => {
                self.security
                    .check_perm(&task.path, &task.user, IoOpCode::CheckWrite, task.obj_size)
            }
            _ => self.security.check_perm(&task.path, &task.user, op, 0),
        };

        let txn = task.tran_id;
        self.active_ops
            .insert(key.clone(), OpContext::awaiting(op, txn, promise, task));
        self.remote.push(RemoteCtx { key, fut });
    }

    // ---- authz replies --------------------------------------------------

    fn poll_remote(&mut self) -> usize {
        let mut resolved = 0;
        let mut index = 0;

        while index < self.remote.len() {
            match self.remote[index].fut.poll() {
                Poll::Pending => index += 1,
                Poll::Detached => {
                    let ctx = self.remote.swap_remove(index);
                    self.fail_op(&ctx.key, IoStatus::ErrInternal);
                    resolved += 1;
                }
                Poll::Ready(response) => {
                    let ctx = self.remote.swap_remove(index);
                    self.on_remote_reply(ctx.key, response);
                    resolved += 1;
                }
            }
        }

        resolved
    }

    fn on_remote_reply(&mut self, key: PathKey, response: IoResponse) {
        match response.op {
            IoOpCode::Read => self.on_read_manifest(key, response),
            IoOpCode::Write => self.on_write_manifest(key, response),
            IoOpCode::Delete => self.on_status_reply(key, response),
            IoOpCode::Commit => self.on_commit_reply(key, response),
            _ => {
                logging::warn!(self.log, "unexpected authz reply"; "op" => ?response.op);
            }
        }
    }

    fn on_read_manifest(&mut self, key: PathKey, response: IoResponse) {
        let ctx = match self.active_ops.get_mut(&key) {
            Some(ctx) => ctx,
            // The operation was aborted while the request was in flight.
            None => return,
        };

        let handler = ReadHandler::from_response(&response);
        let promise = ctx.promise.take();
        let task = ctx.task.take();

        if handler.status() != IoStatus::Success {
            let status = handler.status();
            if let (Some(promise), Some(task)) = (promise, task) {
                self.resolve(promise, task, status);
            }
            self.close_op(&key);
            return;
        }

        ctx.handler = OpHandler::Read(handler);
        ctx.state = OpState::Active;

        if let (Some(promise), Some(task)) = (promise, task) {
            self.begin_read_slice(&key, promise, task);
        }
    }

    fn on_write_manifest(&mut self, key: PathKey, response: IoResponse) {
        let ctx = match self.active_ops.get_mut(&key) {
            Some(ctx) => ctx,
            None => return,
        };

        let handler = WriteHandler::from_response(&response);
        let promise = ctx.promise.take();
        let task = ctx.task.take();

        if handler.status() != IoStatus::Success {
            let status = handler.status();
            if let (Some(promise), Some(task)) = (promise, task) {
                self.resolve(promise, task, status);
            }
            self.close_op(&key);
            return;
        }

        let total = handler.total_size();
        ctx.handler = OpHandler::Write(handler);
        ctx.state = OpState::Active;
        ctx.op = IoOpCode::Write;

        if let (Some(promise), Some(mut task)) = (promise, task) {
            task.obj_size = total;
            task.data_size = 0;
            self.resolve(promise, task, IoStatus::Success);
        }
    }

    fn on_status_reply(&mut self, key: PathKey, response: IoResponse) {
        if self.active_ops.get(&key).is_none() {
            return;
        }

        let status = parse_status(&response);
        if let Some(ctx) = self.active_ops.get_mut(&key) {
            let promise = ctx.promise.take();
            let task = ctx.task.take();
            if let (Some(promise), Some(task)) = (promise, task) {
                self.resolve(promise, task, status);
            }
        }
        self.close_op(&key);
    }

    fn on_commit_reply(&mut self, key: PathKey, response: IoResponse) {
        if self.active_ops.get(&key).is_none() {
            return;
        }

        let status = parse_status(&response);
        if let Some(ctx) = self.active_ops.get_mut(&key) {
            let promise = ctx.promise.take();
            let task = ctx.task.take();
            if let (Some(promise), Some(mut task)) = (promise, task) {
                // Terminal write completion: no more chunks expected.
                task.data_size = 0;
                task.obj_size = 0;
                self.resolve(promise, task, status);
            }
        }
        self.close_op(&key);
    }

    // ---- backend I/O ----------------------------------------------------

    fn begin_read_slice(&mut self, key: &PathKey, promise: Promise<Task>, mut task: Task) {
        let worker_id = self.id;

        let ctx = match self.active_ops.get_mut(key) {
            Some(ctx) => ctx,
            None => {
                task.worker_id = worker_id;
                task.status = IoStatus::ErrInternal;
                promise.set(task);
                return;
            }
        };

        let handler = match &mut ctx.handler {
            OpHandler::Read(handler) => handler,
            _ => {
                task.worker_id = worker_id;
                task.status = IoStatus::ErrInternal;
                promise.set(task);
                return;
            }
        };

        if handler.done_reading() || task.data_size == 0 {
            // The object is drained: terminal empty reply, then the path
            // closes once the session acknowledges it.
            task.worker_id = worker_id;
            task.data_size = 0;
            task.obj_size = 0;
            task.status = IoStatus::Success;
            promise.set(task);
            self.close_op(key);
            return;
        }

        let want = (task.data_size as u64).min(handler.remaining());
        ctx.planned = want;
        ctx.outstanding = 0;
        ctx.failed = false;

        ctx.promise = Some(promise);
        ctx.task = Some(task);

        let mut offset = 0u64;
        while offset < want {
            let handle = self.issued.push(IssuedCtx {
                key: key.clone(),
                dest_off: offset,
                valid: true,
            });

            let accepted = handler.read_data(want - offset, &mut self.backend, handle);
            if accepted == 0 {
                self.issued.reclaim(handle);
                ctx.failed = true;
                break;
            }

            ctx.issued.insert(handle);
            ctx.outstanding += 1;
            offset += accepted;
        }

        if ctx.outstanding == 0 {
            // Nothing was issued at all.
            let promise = ctx.promise.take();
            let task = ctx.task.take();
            if let (Some(promise), Some(task)) = (promise, task) {
                self.resolve(promise, task, IoStatus::ErrInternal);
            }
            self.close_op(key);
        }
    }

    fn begin_write_chunk(&mut self, key: &PathKey, promise: Promise<Task>, task: Task) {
        let worker_id = self.id;

        let ctx = match self.active_ops.get_mut(key) {
            Some(ctx) => ctx,
            None => {
                let mut task = task;
                task.worker_id = worker_id;
                task.status = IoStatus::ErrInternal;
                promise.set(task);
                return;
            }
        };

        let handler = match &mut ctx.handler {
            OpHandler::Write(handler) => handler,
            _ => {
                let mut task = task;
                task.worker_id = worker_id;
                task.status = IoStatus::ErrInternal;
                promise.set(task);
                return;
            }
        };

        let len = (task.data_size as u64).min(handler.remaining());
        if len == 0 {
            let mut task = task;
            task.worker_id = worker_id;
            task.status = IoStatus::ErrParams;
            promise.set(task);
            return;
        }

        // The application filled [data_addr, data_addr + data_size) in the
        // write region before sending the frame.
        let chunk = unsafe { shm::copy_from_raw(task.data_addr, len as usize) };

        ctx.planned = len;
        ctx.outstanding = 0;
        ctx.failed = false;
        ctx.promise = Some(promise);
        ctx.task = Some(task);

        let mut offset = 0usize;
        while (offset as u64) < len {
            let handle = self.issued.push(IssuedCtx {
                key: key.clone(),
                dest_off: offset as u64,
                valid: true,
            });

            let accepted = handler.write_data(&chunk[offset..], &mut self.backend, handle);
            if accepted == 0 {
                self.issued.reclaim(handle);
                ctx.failed = true;
                break;
            }

            ctx.issued.insert(handle);
            ctx.outstanding += 1;
            offset += accepted as usize;
        }

        if ctx.outstanding == 0 {
            let promise = ctx.promise.take();
            let task = ctx.task.take();
            if let (Some(promise), Some(task)) = (promise, task) {
                self.resolve(promise, task, IoStatus::ErrInternal);
            }
            self.close_op(key);
        }
    }

    fn on_backend_completion(&mut self, completion: Completion) {
        let issued = match self.issued.reclaim(completion.user_ctx) {
            Some(issued) => issued,
            None => return,
        };

        if !issued.valid {
            // Late completion of an aborted operation.
            return;
        }

        let ctx = match self.active_ops.get_mut(&issued.key) {
            Some(ctx) => ctx,
            None => return,
        };

        ctx.issued.remove(&completion.user_ctx);
        ctx.outstanding = ctx.outstanding.saturating_sub(1);

        if completion.status != IoStatus::Success {
            ctx.failed = true;
        }

        match ctx.op {
            IoOpCode::Read => {
                if completion.status == IoStatus::Success && !completion.data.is_empty() {
                    if let Some(task) = &ctx.task {
                        // The slice was allocated for exactly this task;
                        // dest_off stays inside ctx.planned.
                        unsafe {
                            shm::copy_to_raw(task.data_addr + issued.dest_off, &completion.data);
                        }
                    }
                }

                if ctx.outstanding == 0 {
                    self.finish_read_slice(&issued.key);
                }
            }
            IoOpCode::Write => {
                if ctx.outstanding == 0 {
                    self.finish_write_chunk(&issued.key);
                }
            }
            _ => {}
        }
    }

    fn finish_read_slice(&mut self, key: &PathKey) {
        let worker_id = self.id;

        let ctx = match self.active_ops.get_mut(key) {
            Some(ctx) => ctx,
            None => return,
        };

        let promise = ctx.promise.take();
        let task = ctx.task.take();
        let failed = ctx.failed;
        let planned = ctx.planned;

        let remaining = match &ctx.handler {
            OpHandler::Read(handler) => handler.remaining(),
            _ => 0,
        };

        match (promise, task) {
            (Some(promise), Some(mut task)) => {
                if failed {
                    task.worker_id = worker_id;
                    task.data_size = 0;
                    task.status = IoStatus::ErrInternal;
                    promise.set(task);
                    self.close_op(key);
                } else {
                    task.worker_id = worker_id;
                    task.data_size = planned as u32;
                    task.obj_size = remaining;
                    task.status = if remaining == 0 {
                        IoStatus::Success
                    } else {
                        IoStatus::PartialRead
                    };
                    promise.set(task);
                    // The context stays active for the next slice or the
                    // final empty reply.
                }
            }
            _ => {
                self.close_op(key);
            }
        }
    }

    fn finish_write_chunk(&mut self, key: &PathKey) {
        let worker_id = self.id;

        let (failed, planned, done, commit_body, path, user) = {
            let ctx = match self.active_ops.get_mut(key) {
                Some(ctx) => ctx,
                None => return,
            };

            let handler = match &mut ctx.handler {
                OpHandler::Write(handler) => handler,
                _ => return,
            };

            let done = handler.done_writing();
            let body = if done && !ctx.failed {
                handler.take_commit_body()
            } else {
                None
            };

            let (path, user) = match &ctx.task {
                Some(task) => (task.path.clone(), task.user.clone()),
                None => return,
            };

            (ctx.failed, ctx.planned, done, body, path, user)
        };

        if failed {
            if let Some(ctx) = self.active_ops.get_mut(key) {
                let promise = ctx.promise.take();
                let task = ctx.task.take();
                if let (Some(promise), Some(mut task)) = (promise, task) {
                    task.data_size = 0;
                    self.resolve(promise, task, IoStatus::ErrInternal);
                }
            }
            // An internal error on an in-flight write releases the path
            // immediately.
            self.close_op(key);
            return;
        }

        if done {
            // Final chunk stored: post the commit and resolve the
            // upstream request only when the server acknowledges it.
            let fut = self.security.send_io_result(
                &path,
                &user,
                IoOpCode::Commit,
                commit_body.unwrap_or_default(),
            );

            if let Some(ctx) = self.active_ops.get_mut(key) {
                ctx.state = OpState::Committing;
            }
            self.remote.push(RemoteCtx {
                key: key.clone(),
                fut,
            });
            return;
        }

        if let Some(ctx) = self.active_ops.get_mut(key) {
            let promise = ctx.promise.take();
            let task = ctx.task.take();
            let remaining = match &ctx.handler {
                OpHandler::Write(handler) => handler.remaining(),
                _ => 0,
            };

            if let (Some(promise), Some(mut task)) = (promise, task) {
                task.worker_id = worker_id;
                task.data_size = planned as u32;
                task.obj_size = remaining;
                task.status = IoStatus::Success;
                promise.set(task);
            }
        }
    }

    // ---- lifecycle ------------------------------------------------------

    /// Fail whatever is active on `key` and release the path.
    fn fail_op(&mut self, key: &PathKey, status: IoStatus) {
        if let Some(ctx) = self.active_ops.get_mut(key) {
            let promise = ctx.promise.take();
            let task = ctx.task.take();
            if let (Some(promise), Some(task)) = (promise, task) {
                self.resolve(promise, task, status);
            }
        }
        self.close_op(key);
    }

    /// Remove the active operation and hand the path to the next queued
    /// request, if any.
    fn close_op(&mut self, key: &PathKey) {
        if let Some(ctx) = self.active_ops.remove(key) {
            self.invalidate(&ctx);
        }

        let next = match self.pend_tasks.get_mut(key) {
            Some(queue) => {
                let next = queue.pop_front();
                if queue.is_empty() {
                    self.pend_tasks.remove(key);
                }
                next
            }
            None => None,
        };

        if let Some((promise, task)) = next {
            self.accept(promise, task);
        }
    }

    fn shutdown(&mut self) {
        // Outstanding promises drop here; their futures read as detached.
        self.active_ops.clear();
        self.pend_tasks.clear();
        self.remote.clear();

        let mut rest = Vec::new();
        self.tasks.try_drain(&mut rest);
        drop(rest);

        self.backend.stop();
        logging::debug!(self.log, "worker stopped"; "worker_id" => self.id);
    }
}
