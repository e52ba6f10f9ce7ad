//! Job data model and state machine.

pub mod model;

pub use model::{DownloadJob, ErrorKind, JobProgress, JobStatus};
