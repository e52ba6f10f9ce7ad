//! classfetch — durable download job queue and worker service.
//!
//! Jobs are enqueued through the HTTP API (or the [`orchestrator`]
//! directly), persisted by the libSQL-backed [`store`], and executed by
//! the [`worker`] engine, which claims work atomically, heartbeats
//! while transferring, retries transient failures with backoff, and
//! honors cooperative cancellation. Crashed workers are recovered by a
//! stale-heartbeat reclaim sweep.

pub mod api;
pub mod config;
pub mod downloader;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod retry;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
