//! Data models for the persistent queues
//!
//! This module contains the persisted row shape, its lifecycle state, the
//! event envelope stored in a row and the table descriptors used by storage.

mod entry;
mod event;
mod table;

// Re-export all models for convenient imports
pub use entry::*;
pub use event::*;
pub use table::*;
