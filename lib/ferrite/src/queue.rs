//! Bounded MPSC queue used for worker task queues and completion plumbing.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// A cloneable bounded FIFO queue. Producers block when the queue is full;
/// the consumer can block, poll with a timeout, or drain opportunistically.
///
/// By convention there is a single consumer per queue even though clones
/// could technically compete; the owning component keeps the only clone it
/// pops from.
pub struct ConcurrentQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for ConcurrentQueue<T> {
    fn clone(&self) -> ConcurrentQueue<T> {
        ConcurrentQueue {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> ConcurrentQueue<T> {
    pub fn new(capacity: usize) -> ConcurrentQueue<T> {
        let (tx, rx) = bounded(capacity);
        ConcurrentQueue { tx, rx }
    }

    /// Blocking push. Returns false when every consumer is gone.
    pub fn push(&self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }

    /// Non-blocking push. The value comes back if the queue is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        match self.tx.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(value)) | Err(TrySendError::Disconnected(value)) => Err(value),
        }
    }

    /// Blocking pop with a deadline, for loops that also watch a stop flag.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Move every immediately available item into `out`; returns the count.
    pub fn try_drain(&self, out: &mut Vec<T>) -> usize {
        let before = out.len();
        while let Ok(value) = self.rx.try_recv() {
            out.push(value);
        }
        out.len() - before
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = ConcurrentQueue::new(8);

        for i in 0..5 {
            assert!(queue.push(i));
        }

        let mut drained = Vec::new();
        assert_eq!(queue.try_drain(&mut drained), 5);
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_try_push_full() {
        let queue = ConcurrentQueue::new(1);

        assert!(queue.try_push(1).is_ok());
        assert_eq!(queue.try_push(2), Err(2));
    }

    #[test]
    fn test_pop_timeout_empty() {
        let queue: ConcurrentQueue<u32> = ConcurrentQueue::new(1);

        assert_eq!(queue.pop_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn test_cross_thread_handoff() {
        let queue = ConcurrentQueue::new(4);
        let producer = queue.clone();

        let handle = thread::spawn(move || {
            for i in 0..100u32 {
                producer.push(i);
            }
        });

        let mut seen = 0;
        while seen < 100 {
            if let Some(value) = queue.pop_timeout(Duration::from_secs(1)) {
                assert_eq!(value, seen);
                seen += 1;
            }
        }

        handle.join().unwrap();
    }
}
