//! Durable job storage.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{LibSqlBackend, QueuePolicy};
pub use traits::{CancelOutcome, HeartbeatAck, JobFilter, JobStore};
