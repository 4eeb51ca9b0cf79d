//! Fixed-size pool of workers, one OS thread each. Tasks route by
//! explicit worker id or land on a uniformly random worker; broadcast
//! reaches every worker (used for CLOSE).

use crate::cluster::backend::BackendClient;
use crate::cluster::store::ObjectStore;
use crate::cluster::worker::{UpperRequest, Worker};
use crate::remote::security::SecurityModule;
use ferrite::future::{promise, Future};
use ferrite::logging::{self, Logger};
use ferrite::queue::ConcurrentQueue;
use ferrite::task::Task;
use parking_lot::{Condvar, Mutex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const MAX_WORKERS: u32 = 48;
const MAX_AUTO_WORKERS: u32 = 10;
const LEAVE_FREE: u32 = 3;
const DEFAULT_POOL_SIZE: u32 = 4;
const TASK_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Eq, PartialEq)]
pub enum PoolError {
    /// Explicit routing to a worker id outside `1..=size`.
    InvalidWorker(u32),
}

/// One-shot init barrier: the worker thread reports whether its backend
/// connection came up; `initialize` blocks on it.
struct InitGate {
    state: Mutex<Option<bool>>,
    cv: Condvar,
}

impl InitGate {
    fn new() -> InitGate {
        InitGate {
            state: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn set(&self, ok: bool) {
        let mut state = self.state.lock();
        *state = Some(ok);
        self.cv.notify_all();
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while state.is_none() {
            self.cv.wait(&mut state);
        }
        state.unwrap_or(false)
    }
}

struct WorkerHandle {
    queue: ConcurrentQueue<UpperRequest>,
    init: Arc<InitGate>,
    done: Arc<AtomicBool>,
}

pub struct WorkerPool {
    pool_id: u32,
    handles: Vec<WorkerHandle>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    rng: Mutex<SmallRng>,
    active: AtomicBool,
    log: Logger,
}

impl WorkerPool {
    /// Spawn `size` workers (0 derives the size from the core count).
    /// Each worker owns a backend client over `store` and connects on its
    /// own thread; call `initialize` to wait for them.
    pub fn new(
        pool_id: u32,
        size: u32,
        security: Arc<SecurityModule>,
        store: Arc<dyn ObjectStore>,
        log: Logger,
    ) -> WorkerPool {
        let size = effective_size(size);

        let mut handles = Vec::with_capacity(size as usize);
        let mut threads = Vec::with_capacity(size as usize);

        for index in 0..size {
            let worker_id = index + 1;
            let queue: ConcurrentQueue<UpperRequest> = ConcurrentQueue::new(TASK_QUEUE_DEPTH);
            let init = Arc::new(InitGate::new());
            let done = Arc::new(AtomicBool::new(false));

            let worker_log = log.new(logging::o!("worker_id" => worker_id));
            let backend = BackendClient::new(
                store.clone(),
                worker_log.new(logging::o!("component" => "backend")),
            );
            let mut worker = Worker::new(
                worker_id,
                queue.clone(),
                security.clone(),
                backend,
                done.clone(),
                worker_log,
            );

            let gate = init.clone();
            let handle = thread::Builder::new()
                .name(format!("store-worker-{}", worker_id))
                .spawn(move || {
                    let ok = worker.initialize();
                    gate.set(ok);
                    if ok {
                        worker.run();
                    }
                })
                .expect("worker thread spawn failed");

            handles.push(WorkerHandle { queue, init, done });
            threads.push(handle);
        }

        WorkerPool {
            pool_id,
            handles,
            threads: Mutex::new(threads),
            rng: Mutex::new(SmallRng::from_entropy()),
            active: AtomicBool::new(true),
            log,
        }
    }

    /// Wait for every worker's backend connection. A single failure fails
    /// the pool; the caller is expected to stop it.
    pub fn initialize(&self) -> bool {
        self.handles.iter().all(|handle| handle.init.wait())
    }

    pub fn size(&self) -> u32 {
        self.handles.len() as u32
    }

    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Route a task. A zero or out-of-range worker id picks a uniformly
    /// random worker and rewrites the id; the reply echoes it so callers
    /// can pin follow-ups.
    pub fn send_task(&self, mut task: Task) -> Future<Task> {
        let size = self.size();

        let index = if task.worker_id == 0 || task.worker_id > size {
            let index = self.rng.lock().gen_range(0..size);
            task.worker_id = index + 1;
            index as usize
        } else {
            (task.worker_id - 1) as usize
        };

        self.enqueue(index, task)
    }

    /// Route explicitly; an invalid id is a logic error at the caller.
    pub fn send_task_to(&self, mut task: Task, worker_id: u32) -> Result<Future<Task>, PoolError> {
        if worker_id == 0 || worker_id > self.size() {
            return Err(PoolError::InvalidWorker(worker_id));
        }

        task.worker_id = worker_id;
        Ok(self.enqueue((worker_id - 1) as usize, task))
    }

    /// Issue the task to every worker; the ids are rewritten per worker.
    pub fn broadcast_task(&self, task: Task) -> Vec<Future<Task>> {
        (0..self.handles.len())
            .map(|index| {
                let mut task = task.clone();
                task.worker_id = index as u32 + 1;
                self.enqueue(index, task)
            })
            .collect()
    }

    fn enqueue(&self, index: usize, task: Task) -> Future<Task> {
        let (prom, fut) = promise();
        // A full queue applies backpressure to the submitting session
        // thread; a vanished worker leaves the future detached.
        self.handles[index].queue.push((prom, task));
        fut
    }

    /// Stop every worker and join the threads. Idempotent.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        for handle in &self.handles {
            handle.done.store(true, Ordering::Release);
        }

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        logging::info!(self.log, "worker pool stopped"; "pool_id" => self.pool_id);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn effective_size(requested: u32) -> u32 {
    if requested == 0 {
        let cores = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(0);

        if cores == 0 {
            DEFAULT_POOL_SIZE
        } else if cores > MAX_AUTO_WORKERS {
            MAX_AUTO_WORKERS
        } else {
            cores.saturating_sub(LEAVE_FREE).max(1)
        }
    } else {
        requested.min(MAX_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_size_explicit_capped() {
        assert_eq!(effective_size(3), 3);
        assert_eq!(effective_size(100), MAX_WORKERS);
    }

    #[test]
    fn test_effective_size_auto_bounds() {
        let auto = effective_size(0);
        assert!(auto >= 1);
        assert!(auto <= MAX_AUTO_WORKERS);
    }
}
