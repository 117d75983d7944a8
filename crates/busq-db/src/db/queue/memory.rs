//! In-memory queue storage
//!
//! Same contract and claim semantics as the PostgreSQL backend, without a
//! database. Used by the engine's tests and for embedding a queue in a
//! process that does not need durability.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use busq_core::models::{NewQueueEntry, ProcessingState, QueueEntry, QueueTable, SearchKeys};
use busq_core::{QueueError, QueueResult};
use chrono::{DateTime, Utc};

use super::QueueStorage;

#[derive(Default)]
struct TableState {
    entries: BTreeMap<i64, QueueEntry>,
    history: BTreeMap<i64, QueueEntry>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, TableState>,
    next_record_id: i64,
    /// Rows inserted but not yet visible to readers (uncommitted producer).
    hidden: HashSet<i64>,
    failing: bool,
    ready_queries: usize,
}

impl State {
    fn check(&self) -> QueueResult<()> {
        if self.failing {
            return Err(QueueError::Storage("storage unavailable".to_string()));
        }
        Ok(())
    }

    fn table(&mut self, table: &QueueTable) -> &mut TableState {
        self.tables.entry(table.table_name.clone()).or_default()
    }

    fn visible<'a>(
        &'a self,
        table: &QueueTable,
    ) -> Box<dyn Iterator<Item = &'a QueueEntry> + 'a> {
        let hidden = &self.hidden;
        match self.tables.get(&table.table_name) {
            Some(state) => Box::new(
                state
                    .entries
                    .values()
                    .filter(move |e| !hidden.contains(&e.record_id)),
            ),
            None => Box::new(std::iter::empty()),
        }
    }

    fn ready(&self, now: DateTime<Utc>, owner: Option<&str>, table: &QueueTable) -> Vec<QueueEntry> {
        let mut ready: Vec<QueueEntry> = self
            .visible(table)
            .filter(|e| e.is_ready(now))
            .filter(|e| owner.is_none_or(|o| e.creating_owner == o))
            .cloned()
            .collect();
        if table.is_notification() {
            ready.sort_by_key(|e| (e.effective_date, e.record_id));
        }
        ready
    }
}

fn matches_queue(entry: &QueueEntry, queue_name: Option<&str>, table: &QueueTable) -> bool {
    !table.is_notification() || queue_name.is_none_or(|q| entry.queue_name.as_deref() == Some(q))
}

/// [`QueueStorage`] backed by process memory.
#[derive(Clone, Default)]
pub struct InMemoryQueueStorage {
    state: Arc<Mutex<State>>,
}

impl InMemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent call fail with a transient storage error until
    /// switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Hide a row from readers, as if the producer's transaction had not
    /// committed yet.
    pub fn hide_entry(&self, record_id: i64) {
        self.lock().hidden.insert(record_id);
    }

    pub fn reveal_entry(&self, record_id: i64) {
        self.lock().hidden.remove(&record_id);
    }

    /// Number of ready queries served so far.
    pub fn ready_query_count(&self) -> usize {
        self.lock().ready_queries
    }

    /// Snapshot of one main-table row.
    pub fn entry(&self, record_id: i64, table: &QueueTable) -> Option<QueueEntry> {
        self.lock()
            .tables
            .get(&table.table_name)
            .and_then(|t| t.entries.get(&record_id).cloned())
    }

    /// Snapshot of one history row.
    pub fn history_entry(&self, record_id: i64, table: &QueueTable) -> Option<QueueEntry> {
        self.lock()
            .tables
            .get(&table.table_name)
            .and_then(|t| t.history.get(&record_id).cloned())
    }

    pub fn main_table_len(&self, table: &QueueTable) -> usize {
        self.lock()
            .tables
            .get(&table.table_name)
            .map(|t| t.entries.len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl QueueStorage for InMemoryQueueStorage {
    async fn insert_entry(&self, entry: NewQueueEntry, table: &QueueTable) -> QueueResult<i64> {
        let mut state = self.lock();
        state.check()?;
        state.next_record_id += 1;
        let record_id = state.next_record_id;
        state
            .table(table)
            .entries
            .insert(record_id, entry.into_entry(record_id));
        Ok(record_id)
    }

    async fn get_ready_entries(
        &self,
        now: DateTime<Utc>,
        owner: Option<&str>,
        limit: usize,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        let mut state = self.lock();
        state.check()?;
        state.ready_queries += 1;
        let mut ready = state.ready(now, owner, table);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn get_entries_from_ids(
        &self,
        record_ids: &[i64],
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        let state = self.lock();
        state.check()?;
        let wanted: HashSet<i64> = record_ids.iter().copied().collect();
        Ok(state
            .visible(table)
            .filter(|e| wanted.contains(&e.record_id))
            .cloned()
            .collect())
    }

    async fn claim_entry(
        &self,
        record_id: i64,
        now: DateTime<Utc>,
        owner: &str,
        next_available_date: DateTime<Utc>,
        table: &QueueTable,
    ) -> QueueResult<u64> {
        let mut state = self.lock();
        state.check()?;
        if state.hidden.contains(&record_id) {
            return Ok(0);
        }
        let Some(entry) = state.table(table).entries.get_mut(&record_id) else {
            return Ok(0);
        };
        if !entry.is_ready(now) || entry.processing_owner.is_some() {
            return Ok(0);
        }
        entry.processing_state = ProcessingState::InProcessing;
        entry.processing_owner = Some(owner.to_string());
        entry.next_available_date = Some(next_available_date);
        Ok(1)
    }

    async fn update_on_error(
        &self,
        record_id: i64,
        _now: DateTime<Utc>,
        error_count: i32,
        table: &QueueTable,
    ) -> QueueResult<()> {
        let mut state = self.lock();
        state.check()?;
        if let Some(entry) = state.table(table).entries.get_mut(&record_id) {
            if entry.error_count <= error_count {
                entry.processing_state = ProcessingState::Available;
                entry.processing_owner = None;
                entry.next_available_date = None;
                entry.error_count = error_count;
            }
        }
        Ok(())
    }

    async fn remove_entry(&self, record_id: i64, table: &QueueTable) -> QueueResult<()> {
        self.remove_entries(&[record_id], table).await
    }

    async fn remove_entries(&self, record_ids: &[i64], table: &QueueTable) -> QueueResult<()> {
        let mut state = self.lock();
        state.check()?;
        let entries = &mut state.table(table).entries;
        for record_id in record_ids {
            entries.remove(record_id);
        }
        Ok(())
    }

    async fn move_entry_to_history(
        &self,
        entry: &QueueEntry,
        final_state: ProcessingState,
        table: &QueueTable,
    ) -> QueueResult<bool> {
        let mut state = self.lock();
        state.check()?;
        let table_state = state.table(table);
        let Some(mut removed) = table_state.entries.remove(&entry.record_id) else {
            return Ok(false);
        };
        removed.processing_state = final_state;
        removed.error_count = removed.error_count.max(entry.error_count);
        table_state.history.insert(removed.record_id, removed);
        Ok(true)
    }

    async fn get_nb_ready_entries(
        &self,
        now: DateTime<Utc>,
        owner: Option<&str>,
        table: &QueueTable,
    ) -> QueueResult<i64> {
        let state = self.lock();
        state.check()?;
        Ok(state.ready(now, owner, table).len() as i64)
    }

    async fn get_entries_for_search_keys(
        &self,
        keys: SearchKeys,
        queue_name: Option<&str>,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        let state = self.lock();
        state.check()?;
        Ok(state
            .visible(table)
            .filter(|e| keys.matches(e) && matches_queue(e, queue_name, table))
            .cloned()
            .collect())
    }

    async fn get_history_for_search_keys(
        &self,
        keys: SearchKeys,
        queue_name: Option<&str>,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        let state = self.lock();
        state.check()?;
        Ok(state
            .tables
            .get(&table.table_name)
            .map(|t| {
                t.history
                    .values()
                    .filter(|e| keys.matches(e) && matches_queue(e, queue_name, table))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_in_processing_entries_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        let state = self.lock();
        state.check()?;
        Ok(state
            .visible(table)
            .filter(|e| {
                e.processing_state == ProcessingState::InProcessing
                    && e.next_available_date.is_some_and(|d| d < cutoff)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reap_entry(
        &self,
        record_id: i64,
        owner: &str,
        next_available_date: DateTime<Utc>,
        new_owner: &str,
        table: &QueueTable,
    ) -> QueueResult<u64> {
        let mut state = self.lock();
        state.check()?;
        let Some(entry) = state.table(table).entries.get_mut(&record_id) else {
            return Ok(0);
        };
        if !entry.is_claimed_by(owner) || entry.next_available_date != Some(next_available_date) {
            return Ok(0);
        }
        entry.processing_state = ProcessingState::Available;
        entry.processing_owner = None;
        entry.next_available_date = None;
        entry.creating_owner = new_owner.to_string();
        Ok(1)
    }

    async fn history_count(
        &self,
        state_filter: Option<ProcessingState>,
        table: &QueueTable,
    ) -> QueueResult<i64> {
        let state = self.lock();
        state.check()?;
        Ok(state
            .tables
            .get(&table.table_name)
            .map(|t| {
                t.history
                    .values()
                    .filter(|e| state_filter.is_none_or(|s| e.processing_state == s))
                    .count() as i64
            })
            .unwrap_or(0))
    }
}
