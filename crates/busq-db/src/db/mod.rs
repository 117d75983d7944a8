//! Database access for the persistent queues
//!
//! `queue` holds the storage contract and its backends, `transaction` the
//! helpers used for multi-statement operations such as moving a row to history.
//
// Queue storage (contract, PostgreSQL, in-memory)
pub mod queue;
//
// Transaction utilities
pub mod transaction;
