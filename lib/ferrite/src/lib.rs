//! Shared infrastructure for the storage broker: wire status codes, the
//! task structures passed between the IPC front-end and the worker pool,
//! bounded queues, one-shot futures, configuration and logging.

pub mod codes;
pub mod config;
pub mod future;
pub mod logging;
pub mod queue;
pub mod task;

pub use crate::codes::{IoOpCode, IoStatus};
pub use crate::task::{Task, UserAuth};

/// Key identifying a connected application process within the broker.
pub type ConnKey = u64;
