//! The broker engine: IPC front-end (`net`), remote authorization client
//! (`remote`) and the backend worker pool (`cluster`).
//!
//! Composition is leaves-up: `cluster` drives the object store and consumes
//! authz replies, `remote` multiplexes the single authz connection, and
//! `net` fronts application processes over a local stream socket, routing
//! work into the pool and correlating completions back to outbound frames.

pub mod cluster;
pub mod net;
pub mod remote;
