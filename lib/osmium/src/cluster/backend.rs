//! Asynchronous facade over the object store. Submissions clamp to the
//! backend's maximum operation size and complete through a poll queue;
//! the caller tags each operation with an arena handle it gets back in
//! the completion.

use crate::cluster::store::{ObjectStore, StoreError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use ferrite::codes::{IoOpCode, IoStatus};
use ferrite::logging::{self, Logger};
use hashbrown::HashSet;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A finished backend operation. `data` is only populated for reads;
/// write completions drop their buffers on the way through the queue.
#[derive(Debug)]
pub struct Completion {
    pub op: IoOpCode,
    pub status: IoStatus,
    pub data: Vec<u8>,
    /// Arena handle supplied at submission.
    pub user_ctx: usize,
}

pub struct BackendClient {
    store: Arc<dyn ObjectStore>,
    open_pools: HashSet<String>,
    active_ios: Arc<AtomicU32>,
    done: Arc<AtomicBool>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    log: Logger,
}

impl BackendClient {
    pub fn new(store: Arc<dyn ObjectStore>, log: Logger) -> BackendClient {
        let (completions_tx, completions_rx) = unbounded();

        BackendClient {
            store,
            open_pools: HashSet::new(),
            active_ios: Arc::new(AtomicU32::new(0)),
            done: Arc::new(AtomicBool::new(false)),
            completions_tx,
            completions_rx,
            log,
        }
    }

    /// Establish the cluster connection; called on the owning worker's
    /// thread before any submission.
    pub fn connect(&mut self) -> Result<(), StoreError> {
        self.store.connect()
    }

    /// Submit an asynchronous read. Returns the number of bytes that will
    /// be transferred, 0 on refusal.
    pub fn read_object(
        &mut self,
        pool: &str,
        oid: &str,
        read_bytes: u64,
        offset: u64,
        user_ctx: usize,
    ) -> u64 {
        if self.done.load(Ordering::Acquire) || read_bytes == 0 {
            return 0;
        }

        if !self.ensure_pool(pool) {
            return 0;
        }

        let len = match clamp_op(read_bytes, self.store.max_op_size()) {
            Some(len) => len,
            None => return 0,
        };

        // Accepted from here on: a completion is guaranteed, carrying
        // either the data or an error status.
        self.active_ios.fetch_add(1, Ordering::AcqRel);

        let (status, data) = match self.store.read(pool, oid, offset, len) {
            Ok(data) => (IoStatus::Success, data),
            Err(err) => {
                logging::warn!(self.log, "backend read failed";
                               "pool" => pool, "oid" => oid, "error" => ?err);
                (IoStatus::ErrInternal, Vec::new())
            }
        };

        self.complete(Completion {
            op: IoOpCode::Read,
            status,
            data,
            user_ctx,
        });

        len as u64
    }

    /// Submit an asynchronous write or append. On a too-large refusal the
    /// attempt is halved down to exhaustion before giving up. Returns the
    /// number of bytes that will be written, 0 on refusal.
    pub fn write_object(
        &mut self,
        pool: &str,
        oid: &str,
        data: &[u8],
        offset: u64,
        append: bool,
        user_ctx: usize,
    ) -> u64 {
        if self.done.load(Ordering::Acquire) || data.is_empty() {
            return 0;
        }

        if !self.ensure_pool(pool) {
            return 0;
        }

        let mut attempt = match clamp_op(data.len() as u64, self.store.max_op_size()) {
            Some(len) => len as usize,
            None => return 0,
        };

        // Accepted from here on: a completion is guaranteed.
        self.active_ios.fetch_add(1, Ordering::AcqRel);

        let (status, accepted) = loop {
            match self.store.write(pool, oid, offset, &data[..attempt], append) {
                Ok(()) => break (IoStatus::Success, attempt as u64),
                Err(StoreError::TooLarge) if attempt > 1 => {
                    attempt /= 2;
                }
                Err(err) => {
                    logging::warn!(self.log, "backend write failed";
                                   "pool" => pool, "oid" => oid, "error" => ?err);
                    break (IoStatus::ErrInternal, attempt as u64);
                }
            }
        };

        self.complete(Completion {
            op: if append { IoOpCode::Append } else { IoOpCode::Write },
            status,
            data: Vec::new(),
            user_ctx,
        });

        accepted
    }

    /// Drain finished operations into `out`; returns how many arrived.
    pub fn poll_completions(&mut self, out: &mut Vec<Completion>) -> usize {
        let before = out.len();
        while let Ok(completion) = self.completions_rx.try_recv() {
            out.push(completion);
        }
        out.len() - before
    }

    pub fn active_ios(&self) -> u32 {
        self.active_ios.load(Ordering::Acquire)
    }

    /// Stop accepting work, wait for in-flight operations, drop leftovers.
    pub fn stop(&mut self) {
        self.done.store(true, Ordering::Release);

        while self.active_ios.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        while self.completions_rx.try_recv().is_ok() {}
    }

    fn ensure_pool(&mut self, pool: &str) -> bool {
        if self.open_pools.contains(pool) {
            return true;
        }

        match self.store.open_pool(pool) {
            Ok(()) => {
                self.open_pools.insert(pool.to_string());
                true
            }
            Err(err) => {
                logging::warn!(self.log, "cannot open backend pool";
                               "pool" => pool, "error" => ?err);
                false
            }
        }
    }

    fn complete(&self, completion: Completion) {
        // The queue is unbounded and the receiver lives in this struct, so
        // the send only fails during teardown.
        let _ = self.completions_tx.send(completion);
        self.active_ios.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Clamp a requested size to the backend maximum with a checked
/// u64 → u32 downcast.
fn clamp_op(requested: u64, max_op: u32) -> Option<u32> {
    let capped = requested.min(max_op as u64);
    u32::try_from(capped).ok().filter(|&len| len > 0)
}
