//! Supervised shell execution behind a JSON-RPC WebSocket service.
//!
//! The crate is a small execution core: a process supervisor that runs
//! commands as process groups, a session layer that enforces one execution
//! per session with timeout, heartbeat and cancellation, an output
//! classifier for provider error idioms, and the wire protocol that exposes
//! all of it. The client half treats the server as disposable and stands up
//! a fresh one per unit of work.

pub mod classify;
pub mod client;
pub mod config;
pub mod executor;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod server;
