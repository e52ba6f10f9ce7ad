//! HTTP API.

pub mod routes;

pub use routes::{AppState, router};
