//! Per-connection session: frames the byte stream, owns the two
//! shared-memory regions and the read-region allocator, submits tasks to
//! the worker pool and correlates completions back into outbound frames.
//!
//! The session runs entirely on the endpoint's thread; concurrency enters
//! only through the task futures it polls.

use crate::cluster::pool::WorkerPool;
use crate::net::alloc::BestFitAllocator;
use crate::net::buffer::Buffer;
use crate::net::frame::{
    Frame, HEADER_SIZE, PROP_ABORT, PROP_MERGE, PROP_NEW, PROP_RELEASE,
};
use crate::net::shm::{self, ShmRegion};
use crate::net::support::{ErrorKind, NetError, NetResult};
use crate::remote::security::SecurityModule;
use byteorder::{ByteOrder, LittleEndian};
use ferrite::codes::{IoOpCode, IoStatus};
use ferrite::future::{Future, Poll};
use ferrite::logging::{self, Logger};
use ferrite::task::{Task, UserAuth};
use ferrite::ConnKey;
use hashbrown::HashMap;
use mio::net::UnixStream;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Read sentinel before the first completion reports the real remainder.
const REMAINING_UNKNOWN: u64 = u64::MAX - 1;

/// Per-session knobs derived from the broker configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Socket buffer capacity per direction.
    pub buffer_size: usize,
    /// Read-region allocator granularity.
    pub min_alloc: u64,
    /// Slice size requested per READ chunk.
    pub slice_size: u32,
    pub read_sm_size: u32,
    pub write_sm_size: u32,
}

struct ReadContext {
    worker_id: u32,
    remaining: u64,
    /// `(addr, len)` of the reply awaiting acknowledgement; `(0, 0)` is
    /// the end-of-object marker.
    last_response: Option<(u64, u64)>,
    /// Region offset and size of the slice backing `last_response` or the
    /// chunk in flight.
    slice: Option<(u64, u64)>,
    /// Follow-up READ frames for this path, started once the current
    /// operation finishes.
    queued: VecDeque<(u32, u32)>,
}

impl ReadContext {
    fn fresh() -> ReadContext {
        ReadContext {
            worker_id: 0,
            remaining: REMAINING_UNKNOWN,
            last_response: None,
            slice: None,
            queued: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct WriteContext {
    worker_id: u32,
    inflight: Vec<u32>,
}

enum PendingKind {
    Auth,
    NewRead { path: String },
    ContinueRead { path: String },
    AbortRead { path: String },
    CheckWrite { path: String },
    WriteChunk { path: String },
    AbortWrite { path: String },
    Delete,
}

struct PendingOp {
    tran_id: u32,
    kind: PendingKind,
    fut: Future<Task>,
}

/// A READ waiting for a free slice in the read region.
struct AllocWait {
    path: String,
    target: u64,
    continuing: bool,
}

pub struct Session {
    conn_key: ConnKey,
    stream: UnixStream,
    read_buffer: Buffer,
    write_buffer: Buffer,

    auth_attempted: bool,
    user: Option<UserAuth>,
    read_shm: Option<ShmRegion>,
    write_shm: Option<ShmRegion>,
    allocator: Option<BestFitAllocator>,

    read_ctxs: HashMap<String, ReadContext>,
    write_ctxs: HashMap<String, WriteContext>,
    /// READs waiting for allocator space, retried as slices free up.
    pending_alloc: BTreeMap<u32, AllocWait>,
    pending: Vec<PendingOp>,
    close_pending: Option<(u32, Vec<Future<Task>>, IoStatus)>,

    pool: Arc<WorkerPool>,
    security: Arc<SecurityModule>,
    config: SessionConfig,
    rng: rand::rngs::SmallRng,
    dead: bool,
    log: Logger,
}

impl Session {
    pub fn new(
        conn_key: ConnKey,
        stream: UnixStream,
        pool: Arc<WorkerPool>,
        security: Arc<SecurityModule>,
        config: SessionConfig,
        log: Logger,
    ) -> Session {
        use rand::SeedableRng;

        Session {
            conn_key,
            stream,
            read_buffer: Buffer::new(config.buffer_size),
            write_buffer: Buffer::new(config.buffer_size.max(4 * HEADER_SIZE)),
            auth_attempted: false,
            user: None,
            read_shm: None,
            write_shm: None,
            allocator: None,
            read_ctxs: HashMap::new(),
            write_ctxs: HashMap::new(),
            pending_alloc: BTreeMap::new(),
            pending: Vec::new(),
            close_pending: None,
            pool,
            security,
            config,
            rng: rand::rngs::SmallRng::from_entropy(),
            dead: false,
            log,
        }
    }

    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// True while task or close futures are outstanding; the endpoint
    /// tightens its poll interval accordingly.
    pub fn is_busy(&self) -> bool {
        !self.pending.is_empty() || self.close_pending.is_some()
    }

    /// Pull everything available off the socket. A zero-byte read on a
    /// readable socket means the peer is gone.
    pub fn receive(&mut self) -> NetResult<usize> {
        let count = self.read_buffer.ingress(&mut self.stream)?;
        Ok(count)
    }

    /// Parse and handle every complete frame in the accumulator.
    pub fn dispatch(&mut self) {
        loop {
            let decoded = Frame::decode(self.read_buffer.read_slice(), self.config.buffer_size);

            match decoded {
                Ok(None) => break,
                Ok(Some((frame, used))) => {
                    self.read_buffer.consume(used);
                    self.handle_frame(frame);
                }
                Err(NetError::Wait) => break,
                Err(NetError::Fatal(ErrorKind::FrameTooLarge)) => {
                    // Can never complete; the stream is unrecoverable.
                    logging::warn!(self.log, "oversized frame, dropping session");
                    self.dead = true;
                    break;
                }
                Err(NetError::Fatal(kind)) => {
                    // The full extent has arrived; skip the bad frame. A
                    // nonsense length below the header size still costs a
                    // whole header.
                    let raw = self.read_buffer.read_slice();
                    let tran_id = LittleEndian::read_u32(&raw[1..5]);
                    let total = LittleEndian::read_u32(&raw[5..9]) as usize;
                    let skip = total.max(HEADER_SIZE).min(raw.len());
                    logging::warn!(self.log, "dropping malformed frame";
                                   "error" => ?kind, "bytes" => skip);
                    self.read_buffer.consume(skip);

                    // An unknown frame kind gets a protocol error on its
                    // own transaction; undecodable bodies are dropped
                    // without a reply.
                    if let ErrorKind::BadFrameKind(_) = kind {
                        self.send_status(tran_id, IoStatus::ErrProt);
                    }
                }
            }

            if self.dead {
                break;
            }
        }
    }

    /// Flush buffered replies to the socket.
    pub fn flush(&mut self) -> NetResult<usize> {
        self.write_buffer.egress(&mut self.stream).map_err(Into::into)
    }

    // ---- frame intake ---------------------------------------------------

    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Auth {
                tran_id,
                user,
                passwd,
            } => self.handle_auth(tran_id, user, passwd),
            Frame::Read {
                tran_id,
                path,
                properties,
                ..
            } => self.handle_read(tran_id, path, properties),
            Frame::Write {
                tran_id,
                path,
                properties,
                data_addr,
                data_len,
            } => self.handle_write(tran_id, path, properties, data_addr, data_len),
            Frame::Delete { tran_id, path } => self.handle_delete(tran_id, path),
            Frame::Close { tran_id } => self.handle_close(tran_id),
            Frame::Status { tran_id, .. } | Frame::ConnectReply { tran_id, .. } => {
                // The application has no business sending these.
                self.send_status(tran_id, IoStatus::ErrProt);
            }
        }
    }

    fn handle_auth(&mut self, tran_id: u32, user: String, passwd: [u8; 32]) {
        if self.auth_attempted {
            self.send_status(tran_id, IoStatus::ErrProt);
            return;
        }
        self.auth_attempted = true;

        let auth = UserAuth::new(user, passwd);
        let fut = self.security.client_connect(&auth);

        logging::debug!(self.log, "authenticating"; "user" => %auth.username);
        self.pending.push(PendingOp {
            tran_id,
            kind: PendingKind::Auth,
            fut,
        });
    }

    fn handle_read(&mut self, tran_id: u32, path: String, properties: u32) {
        if self.user.is_none() {
            self.send_status(tran_id, IoStatus::ErrProt);
            return;
        }

        if properties & PROP_ABORT != 0 {
            let worker_id = self
                .read_ctxs
                .get(&path)
                .map(|ctx| ctx.worker_id)
                .unwrap_or(0);
            let mut task = self.task(path.clone(), IoOpCode::Abort, 0, 0, tran_id);
            task.worker_id = worker_id;

            let fut = self.pool.send_task(task);
            self.pending.push(PendingOp {
                tran_id,
                kind: PendingKind::AbortRead { path },
                fut,
            });
            return;
        }

        if properties & PROP_NEW != 0 {
            if let Some(ctx) = self.read_ctxs.get_mut(&path) {
                // The path is busy; the request waits its turn.
                ctx.queued.push_back((tran_id, properties));
                return;
            }

            self.read_ctxs.insert(path.clone(), ReadContext::fresh());
            self.start_read(tran_id, path, false);
            return;
        }

        // Acknowledgement of the last reply on this path.
        let last = match self.read_ctxs.get_mut(&path) {
            Some(ctx) => ctx.last_response.take(),
            None => {
                self.send_status(tran_id, IoStatus::ErrProt);
                return;
            }
        };

        match last {
            None => self.send_status(tran_id, IoStatus::ErrProt),
            Some((0, 0)) => self.finish_read_path(&path),
            Some((addr, _len)) => {
                self.release_read_slice(&path, addr);
                self.retry_pending_alloc();
                self.start_read(tran_id, path, true);
            }
        }
    }

    fn handle_write(
        &mut self,
        tran_id: u32,
        path: String,
        properties: u32,
        data_addr: u64,
        data_len: u64,
    ) {
        if self.user.is_none() {
            self.send_status(tran_id, IoStatus::ErrProt);
            return;
        }

        if properties & PROP_ABORT != 0 {
            let worker_id = self
                .write_ctxs
                .get(&path)
                .map(|ctx| ctx.worker_id)
                .unwrap_or(0);
            let mut task = self.task(path.clone(), IoOpCode::Abort, 0, 0, tran_id);
            task.worker_id = worker_id;

            let fut = self.pool.send_task(task);
            self.pending.push(PendingOp {
                tran_id,
                kind: PendingKind::AbortWrite { path },
                fut,
            });
            return;
        }

        if properties & PROP_NEW != 0 {
            // data_len announces the total object size to be written.
            let worker_id = self
                .write_ctxs
                .get(&path)
                .map(|ctx| ctx.worker_id)
                .unwrap_or(0);

            let mut task = self.task(path.clone(), IoOpCode::CheckWrite, 0, 0, tran_id);
            task.obj_size = data_len;
            task.worker_id = worker_id;

            let ctx = self.write_ctxs.entry(path.clone()).or_default();
            ctx.inflight.push(tran_id);

            let fut = self.pool.send_task(task);
            self.pending.push(PendingOp {
                tran_id,
                kind: PendingKind::CheckWrite { path },
                fut,
            });
            return;
        }

        // A filled chunk. The context must exist and the extent must lie
        // inside the write region the application was handed.
        let worker_id = match self.write_ctxs.get(&path) {
            Some(ctx) => ctx.worker_id,
            None => {
                self.send_status(tran_id, IoStatus::ErrProt);
                return;
            }
        };

        let inside = self
            .write_shm
            .as_ref()
            .map(|region| region.contains(data_addr, data_len))
            .unwrap_or(false);

        if !inside || data_len == 0 || data_len > u32::MAX as u64 {
            self.send_status(tran_id, IoStatus::ErrParams);
            return;
        }

        let mut task = self.task(
            path.clone(),
            IoOpCode::Write,
            data_addr,
            data_len as u32,
            tran_id,
        );
        task.worker_id = worker_id;

        let fut = self.pool.send_task(task);
        self.pending.push(PendingOp {
            tran_id,
            kind: PendingKind::WriteChunk { path },
            fut,
        });
    }

    fn handle_delete(&mut self, tran_id: u32, path: String) {
        if self.user.is_none() {
            self.send_status(tran_id, IoStatus::ErrProt);
            return;
        }

        let task = self.task(path, IoOpCode::Delete, 0, 0, tran_id);
        let fut = self.pool.send_task(task);
        self.pending.push(PendingOp {
            tran_id,
            kind: PendingKind::Delete,
            fut,
        });
    }

    fn handle_close(&mut self, tran_id: u32) {
        if self.user.is_none() {
            self.send_status(tran_id, IoStatus::ErrProt);
            return;
        }

        let task = self.task(String::new(), IoOpCode::Close, 0, 0, tran_id);
        let futs = self.pool.broadcast_task(task);
        self.close_pending = Some((tran_id, futs, IoStatus::Close));
    }

    // ---- read plumbing --------------------------------------------------

    /// Submit the next read chunk for `path`, allocating a slice first.
    /// With no allocator space the request parks in the pending-alloc map.
    fn start_read(&mut self, tran_id: u32, path: String, continuing: bool) {
        let remaining = self
            .read_ctxs
            .get(&path)
            .map(|ctx| ctx.remaining)
            .unwrap_or(0);

        let target = if continuing {
            (self.config.slice_size as u64).min(remaining)
        } else {
            self.config.slice_size as u64
        };

        if target == 0 {
            // Everything consumed: fetch the end-of-object completion.
            self.submit_read(tran_id, path, None, continuing);
            return;
        }

        let offset = match self.allocator.as_mut() {
            Some(allocator) => allocator.allocate(target),
            None => None,
        };

        match offset {
            Some(offset) => {
                self.submit_read(tran_id, path, Some((offset, target)), continuing);
            }
            None => {
                logging::debug!(self.log, "read parked for allocator space";
                                "path" => %path, "tran_id" => tran_id);
                self.pending_alloc.insert(
                    tran_id,
                    AllocWait {
                        path,
                        target,
                        continuing,
                    },
                );
            }
        }
    }

    fn submit_read(
        &mut self,
        tran_id: u32,
        path: String,
        slice: Option<(u64, u64)>,
        continuing: bool,
    ) {
        let base = self.read_shm.as_ref().map(|r| r.addr()).unwrap_or(0);

        let (addr, size) = match slice {
            Some((offset, size)) => (base + offset, size as u32),
            None => (0, 0),
        };

        let worker_id = self
            .read_ctxs
            .get(&path)
            .map(|ctx| ctx.worker_id)
            .unwrap_or(0);

        if let Some(ctx) = self.read_ctxs.get_mut(&path) {
            ctx.slice = slice;
        }

        let mut task = self.task(path.clone(), IoOpCode::Read, addr, size, tran_id);
        task.worker_id = worker_id;

        let fut = self.pool.send_task(task);
        let kind = if continuing {
            PendingKind::ContinueRead { path }
        } else {
            PendingKind::NewRead { path }
        };
        self.pending.push(PendingOp {
            tran_id,
            kind,
            fut,
        });
    }

    fn release_read_slice(&mut self, path: &str, addr: u64) {
        let base = self.read_shm.as_ref().map(|r| r.addr()).unwrap_or(0);

        if let Some(ctx) = self.read_ctxs.get_mut(path) {
            if let Some((offset, _)) = ctx.slice.take() {
                debug_assert_eq!(base + offset, addr);
                if let Some(allocator) = self.allocator.as_mut() {
                    let _ = allocator.deallocate(offset);
                }
            }
        }
    }

    /// Retry parked reads oldest-txn-first whenever a slice frees up.
    fn retry_pending_alloc(&mut self) {
        let waiting: Vec<u32> = self.pending_alloc.keys().copied().collect();

        for tran_id in waiting {
            let ready = {
                let wait = match self.pending_alloc.get(&tran_id) {
                    Some(wait) => wait,
                    None => continue,
                };

                if !self.read_ctxs.contains_key(&wait.path) {
                    // The path died while parked.
                    self.pending_alloc.remove(&tran_id);
                    continue;
                }

                match self.allocator.as_mut() {
                    Some(allocator) => allocator.allocate(wait.target).map(|off| (off, wait.target)),
                    None => None,
                }
            };

            if let Some(slice) = ready {
                let wait = match self.pending_alloc.remove(&tran_id) {
                    Some(wait) => wait,
                    None => continue,
                };
                self.submit_read(tran_id, wait.path, Some(slice), wait.continuing);
            }
        }
    }

    /// The application acknowledged the end-of-object marker: the path is
    /// finished; hand the turn to the next queued READ, if any.
    fn finish_read_path(&mut self, path: &str) {
        let mut queued = VecDeque::new();

        if let Some(mut ctx) = self.read_ctxs.remove(path) {
            if let Some((offset, _)) = ctx.slice.take() {
                if let Some(allocator) = self.allocator.as_mut() {
                    let _ = allocator.deallocate(offset);
                }
            }
            queued = ctx.queued;
        }

        self.retry_pending_alloc();

        if let Some((tran_id, _properties)) = queued.pop_front() {
            let mut ctx = ReadContext::fresh();
            ctx.queued = queued;
            self.read_ctxs.insert(path.to_string(), ctx);
            self.start_read(tran_id, path.to_string(), false);
        }
    }

    // ---- completion handling --------------------------------------------

    /// Poll every outstanding future once; returns true when any resolved.
    pub fn poll_completions(&mut self) -> bool {
        let mut progressed = false;
        let mut index = 0;

        while index < self.pending.len() {
            match self.pending[index].fut.poll() {
                Poll::Pending => {
                    index += 1;
                    continue;
                }
                Poll::Detached => {
                    let op = self.pending.swap_remove(index);
                    self.on_detached(op);
                    progressed = true;
                }
                Poll::Ready(task) => {
                    let op = self.pending.swap_remove(index);
                    self.on_completion(op, task);
                    progressed = true;
                }
            }

            if self.dead {
                return progressed;
            }
        }

        progressed |= self.poll_close();
        progressed
    }

    fn poll_close(&mut self) -> bool {
        let (tran_id, mut futs, mut status) = match self.close_pending.take() {
            Some(state) => state,
            None => return false,
        };

        let mut index = 0;
        while index < futs.len() {
            match futs[index].poll() {
                Poll::Pending => {
                    index += 1;
                }
                Poll::Detached => {
                    futs.swap_remove(index);
                }
                Poll::Ready(task) => {
                    // The first non-CLOSE status wins.
                    if task.status != IoStatus::Close && status == IoStatus::Close {
                        status = task.status;
                    }
                    futs.swap_remove(index);
                }
            }
        }

        if futs.is_empty() {
            self.send_status(tran_id, status);
            true
        } else {
            self.close_pending = Some((tran_id, futs, status));
            false
        }
    }

    fn on_detached(&mut self, op: PendingOp) {
        // The worker (or the authz driver) went away without resolving.
        match op.kind {
            PendingKind::NewRead { path } | PendingKind::ContinueRead { path } => {
                self.drop_read_path(&path);
            }
            PendingKind::CheckWrite { path } | PendingKind::WriteChunk { path } => {
                self.write_ctxs.remove(&path);
            }
            _ => {}
        }
        logging::debug!(self.log, "operation detached"; "tran_id" => op.tran_id);
    }

    fn on_completion(&mut self, op: PendingOp, task: Task) {
        match op.kind {
            PendingKind::Auth => self.on_auth_complete(op.tran_id, task),
            PendingKind::NewRead { path } | PendingKind::ContinueRead { path } => {
                self.on_read_complete(op.tran_id, path, task)
            }
            PendingKind::AbortRead { path } => {
                self.send_status(op.tran_id, task.status);
                self.drop_read_path(&path);
            }
            PendingKind::CheckWrite { path } => self.on_check_write_complete(op.tran_id, path, task),
            PendingKind::WriteChunk { path } => self.on_write_complete(op.tran_id, path, task),
            PendingKind::AbortWrite { path } => {
                self.send_status(op.tran_id, task.status);
                self.write_ctxs.remove(&path);
            }
            PendingKind::Delete => self.send_status(op.tran_id, task.status),
        }
    }

    fn on_auth_complete(&mut self, tran_id: u32, task: Task) {
        if task.status != IoStatus::Success {
            logging::debug!(self.log, "authentication rejected";
                            "status" => %task.status);
            self.send_status(tran_id, task.status);
            return;
        }

        let read_size = self.config.read_sm_size;
        let write_size = self.config.write_sm_size;

        let read_region = match self.create_region(read_size) {
            Some(region) => region,
            None => {
                self.send_status(tran_id, IoStatus::ErrInternal);
                return;
            }
        };
        let write_region = match self.create_region(write_size) {
            Some(region) => region,
            None => {
                self.send_status(tran_id, IoStatus::ErrInternal);
                return;
            }
        };

        let reply = Frame::ConnectReply {
            tran_id,
            write_addr: write_region.addr(),
            write_size,
            read_addr: read_region.addr(),
            read_size,
            write_name: shm::name_bytes(write_region.name()),
            read_name: shm::name_bytes(read_region.name()),
        };

        self.allocator = Some(BestFitAllocator::new(
            read_size as u64,
            self.config.min_alloc,
        ));
        self.read_shm = Some(read_region);
        self.write_shm = Some(write_region);
        self.user = Some(task.user);

        logging::info!(self.log, "session authenticated"; "conn" => self.conn_key);
        self.send_frame(reply);
    }

    fn create_region(&mut self, size: u32) -> Option<ShmRegion> {
        // A name collision is possible; retry a few times before failing.
        for _ in 0..4 {
            let name = shm::region_name(&mut self.rng);
            match ShmRegion::create(&name, size as usize) {
                Ok(region) => return Some(region),
                Err(err) => {
                    logging::warn!(self.log, "shm create failed"; "error" => %err);
                }
            }
        }
        None
    }

    fn on_read_complete(&mut self, tran_id: u32, path: String, task: Task) {
        if self.read_ctxs.get(&path).is_none() {
            // Aborted while the task was in flight.
            return;
        }

        if task.status.is_error() {
            self.send_status(tran_id, task.status);
            // A failed operation frees the path; queued READs restart it.
            self.finish_read_path(&path);
            return;
        }

        let reply = Frame::Write {
            tran_id,
            path: path.clone(),
            properties: 0,
            data_addr: if task.data_size > 0 { task.data_addr } else { 0 },
            data_len: task.data_size as u64,
        };

        if let Some(ctx) = self.read_ctxs.get_mut(&path) {
            ctx.worker_id = task.worker_id;
            ctx.remaining = task.obj_size;
            ctx.last_response = Some(if task.data_size > 0 {
                (task.data_addr, task.data_size as u64)
            } else {
                (0, 0)
            });

            if task.data_size == 0 {
                // The end-of-object marker carries no slice.
                if let Some((offset, _)) = ctx.slice.take() {
                    if let Some(allocator) = self.allocator.as_mut() {
                        let _ = allocator.deallocate(offset);
                    }
                }
            }
        }

        self.send_frame(reply);
    }

    fn on_check_write_complete(&mut self, tran_id: u32, path: String, task: Task) {
        match task.status {
            IoStatus::Success => {
                if let Some(ctx) = self.write_ctxs.get_mut(&path) {
                    ctx.worker_id = task.worker_id;
                }

                // Ask the application for the first chunk.
                self.send_frame(Frame::Read {
                    tran_id,
                    path,
                    properties: 0,
                    merge_id: None,
                });
            }
            IoStatus::PartialWrite => {
                // Merged under a surviving operation: redirect the
                // application and release this transaction.
                if let Some(ctx) = self.write_ctxs.get_mut(&path) {
                    ctx.worker_id = task.worker_id;
                    ctx.inflight.retain(|&txn| txn != tran_id);
                }

                self.send_frame(Frame::Read {
                    tran_id,
                    path,
                    properties: PROP_MERGE | PROP_RELEASE,
                    merge_id: Some(task.merge_id),
                });
            }
            status => {
                self.send_status(tran_id, status);
                self.release_write_txn(&path, tran_id);
            }
        }
    }

    fn on_write_complete(&mut self, tran_id: u32, path: String, task: Task) {
        if task.status == IoStatus::Success {
            if task.data_size == 0 && task.obj_size == 0 {
                // Commit acknowledged: the write is durable.
                self.send_status(tran_id, IoStatus::Success);
                self.write_ctxs.remove(&path);
            } else {
                // More object left: ask for the next chunk.
                self.send_frame(Frame::Read {
                    tran_id,
                    path,
                    properties: 0,
                    merge_id: None,
                });
            }
            return;
        }

        // Any failure on an in-flight write releases the context at once.
        self.send_status(tran_id, task.status);
        self.write_ctxs.remove(&path);
    }

    fn release_write_txn(&mut self, path: &str, tran_id: u32) {
        let empty = match self.write_ctxs.get_mut(path) {
            Some(ctx) => {
                ctx.inflight.retain(|&txn| txn != tran_id);
                ctx.inflight.is_empty()
            }
            None => false,
        };

        if empty {
            self.write_ctxs.remove(path);
        }
    }

    /// Release everything held on behalf of a read path.
    fn drop_read_path(&mut self, path: &str) {
        if let Some(mut ctx) = self.read_ctxs.remove(path) {
            if let Some((offset, _)) = ctx.slice.take() {
                if let Some(allocator) = self.allocator.as_mut() {
                    let _ = allocator.deallocate(offset);
                }
            }
        }

        let stale: Vec<u32> = self
            .pending_alloc
            .iter()
            .filter(|(_, wait)| wait.path == path)
            .map(|(&txn, _)| txn)
            .collect();
        for txn in stale {
            self.pending_alloc.remove(&txn);
        }
    }

    // ---- frame emission -------------------------------------------------

    fn task(
        &self,
        path: String,
        op: IoOpCode,
        data_addr: u64,
        data_size: u32,
        tran_id: u32,
    ) -> Task {
        let user = self
            .user
            .clone()
            .unwrap_or_else(|| UserAuth::new("", [0u8; 32]));
        Task::request(user, path, op, data_addr, data_size, tran_id, self.conn_key)
    }

    fn send_status(&mut self, tran_id: u32, status: IoStatus) {
        self.send_frame(Frame::Status { tran_id, status });
    }

    fn send_frame(&mut self, frame: Frame) {
        match frame.encode(&mut self.write_buffer) {
            Ok(()) => {}
            Err(NetError::Wait) => {
                // The peer stopped draining its socket while replies keep
                // accumulating; there is no way to make progress.
                logging::warn!(self.log, "write buffer exhausted, dropping session");
                self.dead = true;
            }
            Err(err) => {
                logging::warn!(self.log, "frame encode failed"; "error" => ?err);
                self.dead = true;
            }
        }
    }
}
