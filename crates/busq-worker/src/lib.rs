//! busq Worker – persistent bus and notification queues on top of a table.
//!
//! This crate provides the queue coordinator (inflight cache over a storage
//! polling fallback), the dispatch pool, the callback contract that maps
//! handler outcomes to row transitions, the reaper, and the two public facades:
//! [`PersistentBus`] and [`NotificationQueueService`].

mod bus;
mod callback;
pub mod coordinator;
mod dispatch;
mod lifecycle;
mod notification;
mod reaper;
pub mod telemetry;

pub use bus::{PersistentBus, PostMetadata};
pub use callback::{
    CallbackError, DispatchOutcome, EntryDispatcher, EventHandler, EventMetadata, EventRegistry,
};
pub use coordinator::{DbBackedQueue, QueueMode, QueueStats};
pub use dispatch::DispatchPool;
pub use notification::{NotificationMetadata, NotificationQueue, NotificationQueueService};
pub use reaper::reap_left_behind_entries;

// Re-exported so that applications only depend on this crate.
pub use busq_core::models::{
    EventEnvelope, NewQueueEntry, ProcessingState, QueueEntry, QueueEvent, QueueFlavor, QueueTable,
    SearchKeys,
};
pub use busq_core::{
    Clock, HandlerError, HandlerResultExt, MockClock, PersistentQueueMode, QueueConfig, QueueError,
    QueueResult, SaturationPolicy, SystemClock,
};
pub use busq_db::{InMemoryQueueStorage, PgQueueStorage, QueueStorage};
