//! Storage contract of the persistent queues
//!
//! The coordinator, dispatch pool and reaper only talk to storage through
//! [`QueueStorage`]. Every mutation is atomic at the storage layer; the claim is
//! a compare-and-set on `processing_state` + `processing_owner`, which is the
//! only thing that guarantees a row is dispatched by a single worker at a time.

mod memory;
mod postgres;

pub use memory::InMemoryQueueStorage;
pub use postgres::PgQueueStorage;

use busq_core::models::{NewQueueEntry, ProcessingState, QueueEntry, QueueTable, SearchKeys};
use busq_core::QueueResult;
use chrono::{DateTime, Utc};

#[async_trait::async_trait]
pub trait QueueStorage: Send + Sync {
    /// Persist a new `AVAILABLE` row and return its record id.
    async fn insert_entry(&self, entry: NewQueueEntry, table: &QueueTable) -> QueueResult<i64>;

    /// Ready rows in dispatch order. `owner` restricts the query to rows
    /// created by that owner (sticky polling).
    async fn get_ready_entries(
        &self,
        now: DateTime<Utc>,
        owner: Option<&str>,
        limit: usize,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>>;

    /// Rows of the main table with the given ids, in any state.
    async fn get_entries_from_ids(
        &self,
        record_ids: &[i64],
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>>;

    /// Conditional claim. Returns the number of rows affected: 1 when this
    /// owner won the row, 0 when it lost the race.
    async fn claim_entry(
        &self,
        record_id: i64,
        now: DateTime<Utc>,
        owner: &str,
        next_available_date: DateTime<Utc>,
        table: &QueueTable,
    ) -> QueueResult<u64>;

    /// Release a claimed row back to `AVAILABLE` with a new error count.
    async fn update_on_error(
        &self,
        record_id: i64,
        now: DateTime<Utc>,
        error_count: i32,
        table: &QueueTable,
    ) -> QueueResult<()>;

    async fn remove_entry(&self, record_id: i64, table: &QueueTable) -> QueueResult<()>;

    async fn remove_entries(&self, record_ids: &[i64], table: &QueueTable) -> QueueResult<()>;

    /// Delete the row from the main table and append it to the history table
    /// with `final_state`, in one transaction. `entry` supplies the error
    /// count recorded in history. Returns false when the row was no longer in
    /// the main table.
    async fn move_entry_to_history(
        &self,
        entry: &QueueEntry,
        final_state: ProcessingState,
        table: &QueueTable,
    ) -> QueueResult<bool>;

    async fn get_nb_ready_entries(
        &self,
        now: DateTime<Utc>,
        owner: Option<&str>,
        table: &QueueTable,
    ) -> QueueResult<i64>;

    /// Main-table rows (`AVAILABLE` or `IN_PROCESSING`) matching the search
    /// keys, optionally restricted to one notification queue.
    async fn get_entries_for_search_keys(
        &self,
        keys: SearchKeys,
        queue_name: Option<&str>,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>>;

    async fn get_history_for_search_keys(
        &self,
        keys: SearchKeys,
        queue_name: Option<&str>,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>>;

    /// `IN_PROCESSING` rows whose claim expired before `cutoff`.
    async fn get_in_processing_entries_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>>;

    /// Reset a left-behind row to `AVAILABLE`, only if it is still held by
    /// `owner` with the same claim expiry. The row is handed over to
    /// `new_owner` as its creating owner so that sticky pollers on the
    /// reaping node can see it. Returns rows affected.
    async fn reap_entry(
        &self,
        record_id: i64,
        owner: &str,
        next_available_date: DateTime<Utc>,
        new_owner: &str,
        table: &QueueTable,
    ) -> QueueResult<u64>;

    /// Number of history rows, optionally in one terminal state.
    async fn history_count(
        &self,
        state: Option<ProcessingState>,
        table: &QueueTable,
    ) -> QueueResult<i64>;
}
