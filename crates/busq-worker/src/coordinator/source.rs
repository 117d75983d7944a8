//! Ready-entry sources
//!
//! The coordinator serves a poll either from the inflight FIFO or from the
//! storage ready query. Both sit behind [`ReadySource`]; the coordinator only
//! decides which one to ask and how to move its mode afterwards.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use busq_core::models::{ProcessingState, QueueEntry, QueueTable};
use busq_core::{Clock, QueueResult};
use busq_db::QueueStorage;

use super::inflight::InflightQueue;

/// Result of one `next` call.
#[derive(Debug, Default)]
pub struct SourceBatch {
    /// Ids popped from the FIFO, or rows returned by the ready query.
    pub drained: usize,
    /// FIFO ids that could not be resolved to a row after every attempt.
    pub missing: usize,
    pub entries: Vec<QueueEntry>,
}

#[async_trait::async_trait]
pub trait ReadySource: Send + Sync {
    async fn next(&self, limit: usize) -> QueueResult<SourceBatch>;
}

/// Delay before lookup attempt `attempt` (0-based): doubles from `initial`.
pub(crate) fn lookup_backoff(initial: Duration, attempt: u32) -> Duration {
    initial.saturating_mul(2_u32.saturating_pow(attempt))
}

/// Serves record ids pushed into the FIFO by local producers.
pub struct InflightSource {
    storage: Arc<dyn QueueStorage>,
    inflight: Arc<InflightQueue>,
    table: QueueTable,
    initial_backoff: Duration,
    max_attempts: u32,
}

impl InflightSource {
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        inflight: Arc<InflightQueue>,
        table: QueueTable,
        initial_backoff: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            storage,
            inflight,
            table,
            initial_backoff,
            max_attempts,
        }
    }

    /// Resolve ids to rows. A producer may push an id before its transaction
    /// is visible to this connection, so unresolved ids are retried with
    /// exponential backoff.
    async fn resolve(&self, ids: Vec<i64>) -> QueueResult<(Vec<QueueEntry>, usize)> {
        let mut pending: HashSet<i64> = ids.iter().copied().collect();
        let mut resolved = Vec::with_capacity(ids.len());
        let mut attempt = 0;

        loop {
            let lookup: Vec<i64> = ids.iter().copied().filter(|id| pending.contains(id)).collect();
            let found = self.storage.get_entries_from_ids(&lookup, &self.table).await?;
            for entry in found {
                pending.remove(&entry.record_id);
                resolved.push(entry);
            }

            attempt += 1;
            if pending.is_empty() || attempt >= self.max_attempts {
                break;
            }

            let delay = lookup_backoff(self.initial_backoff, attempt - 1);
            tracing::debug!(
                missing = pending.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                table = %self.table.table_name,
                "Inflight ids not visible yet, retrying lookup"
            );
            tokio::time::sleep(delay).await;
        }

        if !pending.is_empty() {
            tracing::warn!(
                missing = ?pending,
                attempts = attempt,
                table = %self.table.table_name,
                "Inflight ids could not be resolved, leaving them to storage polling"
            );
        }

        resolved.sort_by_key(|e| e.record_id);
        Ok((resolved, pending.len()))
    }
}

#[async_trait::async_trait]
impl ReadySource for InflightSource {
    async fn next(&self, limit: usize) -> QueueResult<SourceBatch> {
        let ids = self.inflight.drain(limit);
        if ids.is_empty() {
            return Ok(SourceBatch::default());
        }
        let drained = ids.len();

        let (resolved, missing) = self.resolve(ids).await?;
        let entries = resolved
            .into_iter()
            .filter(|e| e.processing_state == ProcessingState::Available)
            .collect();

        Ok(SourceBatch {
            drained,
            missing,
            entries,
        })
    }
}

/// Serves the storage ready query.
pub struct StorageSource {
    storage: Arc<dyn QueueStorage>,
    clock: Arc<dyn Clock>,
    table: QueueTable,
    /// Set in sticky polling mode.
    owner: Option<String>,
}

impl StorageSource {
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        clock: Arc<dyn Clock>,
        table: QueueTable,
        owner: Option<String>,
    ) -> Self {
        Self {
            storage,
            clock,
            table,
            owner,
        }
    }
}

#[async_trait::async_trait]
impl ReadySource for StorageSource {
    async fn next(&self, limit: usize) -> QueueResult<SourceBatch> {
        let entries = self
            .storage
            .get_ready_entries(self.clock.now(), self.owner.as_deref(), limit, &self.table)
            .await?;
        Ok(SourceBatch {
            drained: entries.len(),
            missing: 0,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busq_core::models::{EventEnvelope, NewQueueEntry, QueueFlavor};
    use busq_core::SystemClock;
    use busq_db::InMemoryQueueStorage;
    use chrono::Utc;

    fn bus() -> QueueTable {
        QueueTable::new("bus_events", "bus_events_history", QueueFlavor::Bus)
    }

    fn new_entry(owner: &str) -> NewQueueEntry {
        NewQueueEntry::new(
            EventEnvelope {
                class_name: "test.event.v1".to_string(),
                payload: "{}".to_string(),
            },
            owner,
            Utc::now(),
        )
    }

    #[test]
    fn test_lookup_backoff_doubles() {
        let initial = Duration::from_millis(10);
        assert_eq!(lookup_backoff(initial, 0), Duration::from_millis(10));
        assert_eq!(lookup_backoff(initial, 1), Duration::from_millis(20));
        assert_eq!(lookup_backoff(initial, 3), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_inflight_source_filters_non_available_rows() {
        let storage = Arc::new(InMemoryQueueStorage::new());
        let inflight = Arc::new(InflightQueue::new(10));
        let a = storage.insert_entry(new_entry("n"), &bus()).await.unwrap();
        let b = storage.insert_entry(new_entry("n"), &bus()).await.unwrap();
        storage
            .claim_entry(b, Utc::now(), "other", Utc::now(), &bus())
            .await
            .unwrap();
        inflight.offer(a);
        inflight.offer(b);

        let source = InflightSource::new(
            storage.clone(),
            inflight.clone(),
            bus(),
            Duration::from_millis(1),
            3,
        );
        let batch = source.next(10).await.unwrap();
        assert_eq!(batch.drained, 2);
        assert_eq!(batch.missing, 0);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].record_id, a);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_inflight_source_waits_for_late_visibility() {
        let storage = Arc::new(InMemoryQueueStorage::new());
        let inflight = Arc::new(InflightQueue::new(10));
        let id = storage.insert_entry(new_entry("n"), &bus()).await.unwrap();
        storage.hide_entry(id);
        inflight.offer(id);

        let reveal = storage.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            reveal.reveal_entry(id);
        });

        let source = InflightSource::new(
            storage.clone(),
            inflight,
            bus(),
            Duration::from_millis(10),
            10,
        );
        let batch = source.next(10).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.missing, 0);
    }

    #[tokio::test]
    async fn test_inflight_source_gives_up_after_max_attempts() {
        let storage = Arc::new(InMemoryQueueStorage::new());
        let inflight = Arc::new(InflightQueue::new(10));
        inflight.offer(999);

        let source = InflightSource::new(storage, inflight, bus(), Duration::from_millis(1), 3);
        let batch = source.next(10).await.unwrap();
        assert_eq!(batch.drained, 1);
        assert_eq!(batch.missing, 1);
        assert!(batch.entries.is_empty());
    }

    #[tokio::test]
    async fn test_storage_source_sticky_owner() {
        let storage = Arc::new(InMemoryQueueStorage::new());
        storage.insert_entry(new_entry("node-a"), &bus()).await.unwrap();
        storage.insert_entry(new_entry("node-b"), &bus()).await.unwrap();

        let sticky = StorageSource::new(
            storage.clone(),
            Arc::new(SystemClock),
            bus(),
            Some("node-a".to_string()),
        );
        let batch = sticky.next(10).await.unwrap();
        assert_eq!(batch.drained, 1);
        assert_eq!(batch.entries[0].creating_owner, "node-a");

        let any = StorageSource::new(storage, Arc::new(SystemClock), bus(), None);
        assert_eq!(any.next(10).await.unwrap().drained, 2);
    }
}
