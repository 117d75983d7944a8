//! Queue coordinator
//!
//! [`DbBackedQueue`] decides, on each poll, whether ready rows come from the
//! inflight FIFO or from the storage ready query, claims them, and applies the
//! row transitions requested by the dispatch layer.
//!
//! The FIFO is a best-effort hint filled by local producers. Its
//! [`QueueMode`] flips are heuristics; correctness rests on the conditional
//! claim in storage, so a wrong guess costs one extra ready query at worst.

mod inflight;
mod source;
mod state;

pub use inflight::InflightQueue;
pub use source::{InflightSource, ReadySource, SourceBatch, StorageSource};
pub use state::QueueMode;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use busq_core::models::{NewQueueEntry, ProcessingState, QueueEntry, QueueTable};
use busq_core::{Clock, PersistentQueueMode, QueueConfig, QueueError, QueueResult};
use busq_db::QueueStorage;
use tokio::sync::Notify;

/// Snapshot of the coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Rows written through this coordinator (including tracked external inserts).
    pub total_written: u64,
    /// Written rows whose id made it into the FIFO.
    pub total_inflight_written: u64,
    /// Rows claimed for dispatch.
    pub total_processed: u64,
    /// Claimed rows that were served from the FIFO.
    pub total_inflight_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_reaped: u64,
}

#[derive(Default)]
struct Counters {
    total_written: AtomicU64,
    total_inflight_written: AtomicU64,
    total_processed: AtomicU64,
    total_inflight_processed: AtomicU64,
    total_failed: AtomicU64,
    total_retried: AtomicU64,
    total_reaped: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.total_written,
            &self.total_inflight_written,
            &self.total_processed,
            &self.total_inflight_processed,
            &self.total_failed,
            &self.total_retried,
            &self.total_reaped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            total_written: self.total_written.load(Ordering::Relaxed),
            total_inflight_written: self.total_inflight_written.load(Ordering::Relaxed),
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_inflight_processed: self.total_inflight_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            total_reaped: self.total_reaped.load(Ordering::Relaxed),
        }
    }
}

pub struct DbBackedQueue {
    config: QueueConfig,
    table: QueueTable,
    storage: Arc<dyn QueueStorage>,
    clock: Arc<dyn Clock>,
    mode: Mutex<QueueMode>,
    inflight: Arc<InflightQueue>,
    inflight_source: InflightSource,
    storage_source: StorageSource,
    counters: Counters,
    open: AtomicBool,
    new_entries: Notify,
}

impl DbBackedQueue {
    pub fn new(
        config: QueueConfig,
        storage: Arc<dyn QueueStorage>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        config.validate()?;

        let table = config.table();
        let inflight = Arc::new(InflightQueue::new(config.queue_capacity));
        let sticky_owner = match config.persistent_queue_mode {
            PersistentQueueMode::StickyPolling => Some(config.owner.clone()),
            PersistentQueueMode::Polling => None,
        };

        let inflight_source = InflightSource::new(
            storage.clone(),
            inflight.clone(),
            table.clone(),
            config.inflight_lookup_initial_backoff,
            config.inflight_lookup_max_attempts,
        );
        let storage_source =
            StorageSource::new(storage.clone(), clock.clone(), table.clone(), sticky_owner);

        Ok(Self {
            config,
            table,
            storage,
            clock,
            mode: Mutex::new(QueueMode::Neither),
            inflight,
            inflight_source,
            storage_source,
            counters: Counters::default(),
            open: AtomicBool::new(false),
            new_entries: Notify::new(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn table(&self) -> &QueueTable {
        &self.table
    }

    pub fn storage(&self) -> &Arc<dyn QueueStorage> {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn mode(&self) -> QueueMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn sticky_owner(&self) -> Option<&str> {
        match self.config.persistent_queue_mode {
            PersistentQueueMode::StickyPolling => Some(self.config.owner.as_str()),
            PersistentQueueMode::Polling => None,
        }
    }

    /// Apply a mode transition under the mode lock. Logs only real changes.
    fn transition(&self, reason: &'static str, f: impl FnOnce(QueueMode) -> QueueMode) -> QueueMode {
        let mut mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *mode;
        let next = f(previous);
        if next != previous {
            *mode = next;
            tracing::info!(
                table = %self.table.table_name,
                from = %previous,
                to = %next,
                reason,
                "Inflight queue mode changed"
            );
        }
        next
    }

    /// Prefetch ready rows to pick the starting mode, then open the queue.
    /// Clears the FIFO and counters.
    pub async fn initialize(&self) -> QueueResult<()> {
        self.inflight.clear();
        self.counters.reset();

        let mode = if self.config.inflight_queue_enabled() {
            let ready = self
                .storage
                .get_ready_entries(
                    self.clock.now(),
                    self.sticky_owner(),
                    self.config.prefetch_entries,
                    &self.table,
                )
                .await?;
            QueueMode::after_prefetch(ready.len(), self.config.prefetch_entries)
        } else {
            QueueMode::Neither
        };

        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
        self.open.store(true, Ordering::Release);

        tracing::info!(
            table = %self.table.table_name,
            mode = %mode,
            inflight_enabled = self.config.inflight_queue_enabled(),
            owner = %self.config.owner,
            "Queue initialized"
        );
        Ok(())
    }

    /// Stop serving claims. Rows are left as they are in storage.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::info!(table = %self.table.table_name, "Queue closed");
        }
        self.new_entries.notify_waiters();
    }

    /// Persist a new row, then hint the FIFO. Storage errors are returned:
    /// nothing was written.
    pub async fn insert_entry(&self, entry: NewQueueEntry) -> QueueResult<i64> {
        let record_id = self.storage.insert_entry(entry, &self.table).await?;
        self.track_committed(record_id);
        Ok(record_id)
    }

    /// Account for a row committed outside this coordinator (caller-owned
    /// transaction) so the fast path can pick it up.
    pub fn track_committed(&self, record_id: i64) {
        self.counters.total_written.fetch_add(1, Ordering::Relaxed);
        if self.offer_to_inflight(record_id) {
            self.counters
                .total_inflight_written
                .fetch_add(1, Ordering::Relaxed);
        }
        self.new_entries.notify_one();
    }

    fn offer_to_inflight(&self, record_id: i64) -> bool {
        if !self.config.inflight_queue_enabled() || !self.mode().is_open_for_write() {
            return false;
        }
        if self.inflight.offer(record_id) {
            return true;
        }

        let before = self.mode();
        let after = self.transition("inflight queue overflow", |m| m.with_write(false));
        if before.is_open_for_write() && !after.is_open_for_write() {
            tracing::warn!(
                table = %self.table.table_name,
                record_id,
                capacity = self.inflight.capacity(),
                "Inflight queue full, falling back to storage polling for new entries"
            );
        }
        false
    }

    /// Rows reset by the reaper are ready again; hand them to the FIFO.
    pub fn on_entries_reaped(&self, record_ids: &[i64]) {
        self.counters
            .total_reaped
            .fetch_add(record_ids.len() as u64, Ordering::Relaxed);
        for record_id in record_ids {
            self.offer_to_inflight(*record_id);
        }
        if !record_ids.is_empty() {
            self.new_entries.notify_one();
        }
    }

    /// Wait until a local producer signals new rows.
    pub async fn wait_for_new_entries(&self) {
        self.new_entries.notified().await;
    }

    /// One poll: pick the source for the current mode, move the mode, claim.
    /// Returns the rows this owner now holds.
    pub async fn get_ready_entries(&self) -> QueueResult<Vec<QueueEntry>> {
        if !self.is_open() {
            return Ok(Vec::new());
        }

        let max_claimed = self.config.max_entries_claimed;

        if !self.config.inflight_queue_enabled() {
            let batch = self.storage_source.next(max_claimed).await?;
            return Ok(self.claim_all(batch.entries, false).await);
        }

        if self.mode().is_open_for_read() {
            let batch = self.inflight_source.next(max_claimed).await?;
            if batch.drained == 0 {
                self.transition("inflight queue drained", |m| {
                    if m.is_open_for_write() {
                        m
                    } else {
                        m.with_read(false)
                    }
                });
            }
            if batch.missing > 0 {
                self.transition("inflight ids unresolved", |m| m.with_read(false));
            }
            return Ok(self.claim_all(batch.entries, true).await);
        }

        let prefetch = self.config.prefetch_entries;
        let batch = self.storage_source.next(prefetch).await?;
        if batch.drained < prefetch {
            self.transition("storage backlog below prefetch", |m| m.with_write(true));
        }

        let mut candidates = batch.entries;
        candidates.truncate(max_claimed);
        let (candidates, tracked) = self.inflight.retain_untracked(candidates);
        if tracked > 0 {
            self.transition("inflight queue caught up with storage", |m| {
                m.with_read(true)
            });
        }

        Ok(self.claim_all(candidates, false).await)
    }

    async fn claim_all(&self, candidates: Vec<QueueEntry>, from_inflight: bool) -> Vec<QueueEntry> {
        let mut claimed = Vec::with_capacity(candidates.len());
        for entry in candidates {
            match self.claim(entry).await {
                Ok(Some(entry)) => claimed.push(entry),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    tracing::error!(
                        error = %e,
                        table = %self.table.table_name,
                        "Storage error while claiming entry, will retry on next poll"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        table = %self.table.table_name,
                        "Failed to claim entry"
                    );
                }
            }
        }

        let n = claimed.len() as u64;
        self.counters.total_processed.fetch_add(n, Ordering::Relaxed);
        if from_inflight {
            self.counters
                .total_inflight_processed
                .fetch_add(n, Ordering::Relaxed);
        }
        claimed
    }

    /// Conditional claim. `None` means another owner won the row.
    pub async fn claim(&self, entry: QueueEntry) -> QueueResult<Option<QueueEntry>> {
        let now = self.clock.now();
        let next_available_date = now + self.config.claimed_time_chrono();
        let rows = self
            .storage
            .claim_entry(
                entry.record_id,
                now,
                &self.config.owner,
                next_available_date,
                &self.table,
            )
            .await?;

        if rows == 1 {
            Ok(Some(entry.claimed(&self.config.owner, next_available_date)))
        } else {
            tracing::debug!(
                record_id = entry.record_id,
                table = %self.table.table_name,
                "Entry claimed by another owner"
            );
            Ok(None)
        }
    }

    /// Retire a row into history. Returns false if it was no longer in the
    /// main table.
    pub async fn move_entry_to_history(
        &self,
        entry: &QueueEntry,
        final_state: ProcessingState,
    ) -> QueueResult<bool> {
        if !final_state.is_terminal() {
            return Err(QueueError::Internal(format!(
                "cannot retire entry {} as {}",
                entry.record_id, final_state
            )));
        }
        let moved = self
            .storage
            .move_entry_to_history(entry, final_state, &self.table)
            .await?;
        if moved && final_state == ProcessingState::Failed {
            self.counters.total_failed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(moved)
    }

    /// Release a row after a retryable failure. The row is ready again, so
    /// it goes back to the FIFO when the fast path is open for write.
    pub async fn update_on_error(&self, entry: &QueueEntry, error_count: i32) -> QueueResult<()> {
        self.storage
            .update_on_error(entry.record_id, self.clock.now(), error_count, &self.table)
            .await?;
        self.counters.total_retried.fetch_add(1, Ordering::Relaxed);
        self.offer_to_inflight(entry.record_id);
        self.new_entries.notify_one();
        Ok(())
    }

    pub async fn nb_ready_entries(&self) -> QueueResult<i64> {
        self.storage
            .get_nb_ready_entries(self.clock.now(), self.sticky_owner(), &self.table)
            .await
    }
}
