//! Retry and connection control for remote writes.
//!
//! - `classifier`: keyword-based error classes
//! - `profile`: per-client retry policy (mobile / desktop)
//! - `connection`: cached connectivity probe, connection restart, reconnection wait
//! - `controller`: `sync_project_with_retry`

pub mod classifier;
pub mod connection;
pub mod controller;
pub mod profile;

pub use classifier::{classify, is_network_error, ErrorClass};
pub use connection::ConnectionController;
pub use controller::{RetryOutcome, RetryStatus, SyncController};
pub use profile::NetworkProfile;
