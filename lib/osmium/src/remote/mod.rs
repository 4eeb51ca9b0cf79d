//! Client side of the remote authorization server: request/response
//! framing, the persistent server channel with its receiver thread, and
//! the security module that multiplexes typed requests over one
//! connection with transaction-id correlation.

pub mod channel;
pub mod message;
pub mod security;
