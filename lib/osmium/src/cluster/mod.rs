//! Backend side of the broker: the object-store seam, the asynchronous
//! backend client, the JSON protocol handlers holding manifests, the
//! per-thread workers and the routing pool.

pub mod backend;
pub mod pool;
pub mod protocol;
pub mod store;
pub mod worker;
