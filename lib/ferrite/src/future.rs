//! One-shot promise/future pairs connecting sessions, workers and the
//! authorization client. The contract is that a future resolves exactly
//! once; a producer dropped without resolving surfaces as `Detached` so the
//! consumer can discard the operation silently.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let (tx, rx) = bounded(1);
    (Promise { tx: Some(tx) }, Future { rx })
}

/// Producer half. Consumed by `set`; dropping it unresolved detaches the
/// future.
pub struct Promise<T> {
    tx: Option<Sender<T>>,
}

impl<T> Promise<T> {
    /// Resolve the future. A vanished consumer is not an error: sessions
    /// tear down with operations still in flight and their results are
    /// simply discarded.
    pub fn set(mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(value);
        }
    }
}

/// Consumer half.
pub struct Future<T> {
    rx: Receiver<T>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
    /// The producer went away without resolving.
    Detached,
}

impl<T> Future<T> {
    pub fn poll(&self) -> Poll<T> {
        match self.rx.try_recv() {
            Ok(value) => Poll::Ready(value),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => Poll::Detached,
        }
    }

    /// Blocking wait, used by tests and by shutdown paths.
    pub fn wait_timeout(&self, timeout: Duration) -> Poll<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Poll::Ready(value),
            Err(RecvTimeoutError::Timeout) => Poll::Pending,
            Err(RecvTimeoutError::Disconnected) => Poll::Detached,
        }
    }
}
