//! Worker subsystem: the engine that executes jobs and the supervisor
//! that manages its lifecycle.

pub mod engine;
pub mod supervisor;

pub use engine::Engine;
pub use supervisor::Supervisor;
