//! busq Core Library
//!
//! This crate provides the domain models, error types, configuration and clock
//! abstraction shared by the storage layer (`busq-db`) and the dispatch engine
//! (`busq-worker`).

pub mod clock;
pub mod config;
pub mod error;
pub mod handler_error;
pub mod models;

// Re-export commonly used types
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{PersistentQueueMode, QueueConfig, SaturationPolicy};
pub use error::{QueueError, QueueResult};
pub use handler_error::{HandlerError, HandlerResultExt};
