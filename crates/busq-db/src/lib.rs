//! busq Database Layer
//!
//! This crate provides the storage contract used by the queue coordinator
//! together with its PostgreSQL implementation and an in-memory implementation
//! with identical claim semantics.
//!
// Module declarations
pub mod db;

// Re-exports: Queue storage
pub use db::queue::{InMemoryQueueStorage, PgQueueStorage, QueueStorage};

// Re-exports: Transaction utilities
pub use db::transaction::TransactionGuard;

/// Embedded schema migrations (`migrations/` at the workspace root).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
