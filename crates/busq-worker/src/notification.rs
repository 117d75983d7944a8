//! Notification queues: typed events dispatched at a future effective date.
//!
//! All notification queues of a service share one table and one coordinator.
//! Each row carries the composite queue name (`service:queue`) that selects
//! its handler.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use busq_core::models::{
    EventEnvelope, NewQueueEntry, ProcessingState, QueueEntry, QueueEvent, QueueFlavor, SearchKeys,
};
use busq_core::{Clock, QueueConfig, QueueError, QueueResult};
use busq_db::QueueStorage;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::callback::{
    CallbackError, DynHandler, EntryDispatcher, EventHandler, EventMetadata, EventRegistry,
    TypedHandler,
};
use crate::coordinator::{DbBackedQueue, QueueStats};
use crate::lifecycle::QueueLifecycle;

/// Producer-side metadata of a recorded notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationMetadata {
    pub user_token: Option<Uuid>,
    pub future_user_token: Option<Uuid>,
    pub search_key1: i64,
    pub search_key2: i64,
}

impl NotificationMetadata {
    pub fn new(search_key1: i64, search_key2: i64) -> Self {
        Self {
            search_key1,
            search_key2,
            ..Self::default()
        }
    }
}

pub(crate) fn composite_name(service_name: &str, queue_name: &str) -> String {
    format!("{}:{}", service_name, queue_name)
}

#[derive(Default)]
struct Handlers {
    registry: EventRegistry,
    by_queue: HashMap<String, Arc<dyn DynHandler>>,
}

#[derive(Default)]
struct NotificationDispatcher {
    handlers: RwLock<Handlers>,
}

#[async_trait::async_trait]
impl EntryDispatcher for NotificationDispatcher {
    async fn dispatch(&self, entry: &QueueEntry) -> Result<(), CallbackError> {
        let queue_name = entry.queue_name.clone().unwrap_or_default();
        let (event, handler) = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            let handler = handlers
                .by_queue
                .get(&queue_name)
                .cloned()
                .ok_or_else(|| CallbackError::NoHandler {
                    queue_name: queue_name.clone(),
                })?;
            (handlers.registry.decode(&entry.envelope())?, handler)
        };

        handler
            .handle_dyn(event, &EventMetadata::from_entry(entry))
            .await
    }
}

pub struct NotificationQueueService {
    queue: Arc<DbBackedQueue>,
    dispatcher: Arc<NotificationDispatcher>,
    lifecycle: QueueLifecycle,
}

impl NotificationQueueService {
    pub fn new(
        config: QueueConfig,
        storage: Arc<dyn QueueStorage>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        if config.flavor != QueueFlavor::Notification {
            return Err(QueueError::InvalidConfig(
                "notification queue service requires a notification table configuration"
                    .to_string(),
            ));
        }
        // Rows are not ready when written; the inflight cache never applies.
        let config = QueueConfig {
            use_inflight_queue: false,
            ..config
        };
        let queue = Arc::new(DbBackedQueue::new(config, storage, clock)?);
        let dispatcher = Arc::new(NotificationDispatcher::default());
        let lifecycle = QueueLifecycle::new(queue.clone(), dispatcher.clone());
        Ok(Self {
            queue,
            dispatcher,
            lifecycle,
        })
    }

    pub async fn start(&self) -> QueueResult<()> {
        if !self.lifecycle.start().await? {
            tracing::debug!("Notification queue service already started");
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }

    pub async fn is_started(&self) -> bool {
        self.lifecycle.is_started().await
    }

    /// Register a queue and its handler. Fails if the name is taken.
    pub fn create_notification_queue<E, H>(
        &self,
        service_name: &str,
        queue_name: &str,
        handler: H,
    ) -> QueueResult<NotificationQueue<E>>
    where
        E: QueueEvent,
        H: EventHandler<E>,
    {
        let composite = composite_name(service_name, queue_name);
        let mut handlers = self
            .dispatcher
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.by_queue.contains_key(&composite) {
            return Err(QueueError::InvalidConfig(format!(
                "notification queue '{}' already exists",
                composite
            )));
        }
        handlers.registry.register::<E>();
        handlers
            .by_queue
            .insert(composite.clone(), Arc::new(TypedHandler::new(handler)));

        tracing::info!(
            queue = %composite,
            event_type = E::EVENT_TYPE,
            "Notification queue created"
        );

        Ok(NotificationQueue {
            service_name: service_name.to_string(),
            queue_name: queue_name.to_string(),
            composite_name: composite,
            queue: self.queue.clone(),
            _marker: PhantomData,
        })
    }

    /// Unregister a queue. Its pending rows stay in storage and are retried
    /// until a handler is registered again.
    pub fn delete_notification_queue(&self, service_name: &str, queue_name: &str) -> QueueResult<()> {
        let composite = composite_name(service_name, queue_name);
        let removed = self
            .dispatcher
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .by_queue
            .remove(&composite);
        match removed {
            Some(_) => {
                tracing::info!(queue = %composite, "Notification queue deleted");
                Ok(())
            }
            None => Err(QueueError::NotFound(format!(
                "notification queue '{}'",
                composite
            ))),
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .dispatcher
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_queue
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub async fn nb_ready_entries(&self) -> QueueResult<i64> {
        self.queue.nb_ready_entries().await
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn queue(&self) -> &Arc<DbBackedQueue> {
        &self.queue
    }
}

/// Producer handle on one notification queue.
pub struct NotificationQueue<E: QueueEvent> {
    service_name: String,
    queue_name: String,
    composite_name: String,
    queue: Arc<DbBackedQueue>,
    _marker: PhantomData<fn(E)>,
}

impl<E: QueueEvent> Clone for NotificationQueue<E> {
    fn clone(&self) -> Self {
        Self {
            service_name: self.service_name.clone(),
            queue_name: self.queue_name.clone(),
            composite_name: self.composite_name.clone(),
            queue: self.queue.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: QueueEvent> NotificationQueue<E> {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn composite_name(&self) -> &str {
        &self.composite_name
    }

    /// Build the row without writing it, for producers that insert inside
    /// their own transaction.
    pub fn prepare_notification(
        &self,
        effective_date: DateTime<Utc>,
        event: &E,
        metadata: NotificationMetadata,
    ) -> QueueResult<NewQueueEntry> {
        Ok(NewQueueEntry::new(
            EventEnvelope::encode(event)?,
            &self.queue.config().owner,
            self.queue.clock().now(),
        )
        .with_user_token(metadata.user_token)
        .with_search_keys(metadata.search_key1, metadata.search_key2)
        .with_notification(&self.composite_name, effective_date, metadata.future_user_token))
    }

    /// Persist `event` for dispatch at `effective_date`.
    #[tracing::instrument(skip(self, event), fields(queue = %self.composite_name))]
    pub async fn record_future_notification(
        &self,
        effective_date: DateTime<Utc>,
        event: &E,
        metadata: NotificationMetadata,
    ) -> QueueResult<i64> {
        let entry = self.prepare_notification(effective_date, event, metadata)?;
        self.queue.insert_entry(entry).await
    }

    async fn main_table_entries(&self, keys: SearchKeys) -> QueueResult<Vec<QueueEntry>> {
        self.queue
            .storage()
            .get_entries_for_search_keys(keys, Some(&self.composite_name), self.queue.table())
            .await
    }

    /// Notifications not yet claimed, whatever their effective date.
    pub async fn get_future_notifications(&self, keys: SearchKeys) -> QueueResult<Vec<QueueEntry>> {
        Ok(self
            .main_table_entries(keys)
            .await?
            .into_iter()
            .filter(|e| e.processing_state == ProcessingState::Available)
            .collect())
    }

    pub async fn get_future_or_in_processing_notifications(
        &self,
        keys: SearchKeys,
    ) -> QueueResult<Vec<QueueEntry>> {
        self.main_table_entries(keys).await
    }

    pub async fn get_historical_notifications(
        &self,
        keys: SearchKeys,
    ) -> QueueResult<Vec<QueueEntry>> {
        self.queue
            .storage()
            .get_history_for_search_keys(keys, Some(&self.composite_name), self.queue.table())
            .await
    }

    /// Retire one notification of this queue as `REMOVED`. Returns false if
    /// it is not pending in this queue.
    pub async fn remove_notification(&self, record_id: i64) -> QueueResult<bool> {
        let entry = self
            .queue
            .storage()
            .get_entries_from_ids(&[record_id], self.queue.table())
            .await?
            .into_iter()
            .find(|e| e.queue_name.as_deref() == Some(self.composite_name.as_str()));

        match entry {
            Some(entry) => {
                self.queue
                    .move_entry_to_history(&entry, ProcessingState::Removed)
                    .await
            }
            None => Ok(false),
        }
    }

    /// Retire every unclaimed notification matching `keys`. Returns how many
    /// were removed.
    pub async fn remove_future_notifications(&self, keys: SearchKeys) -> QueueResult<usize> {
        let mut removed = 0;
        for entry in self.get_future_notifications(keys).await? {
            if self
                .queue
                .move_entry_to_history(&entry, ProcessingState::Removed)
                .await?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(queue = %self.composite_name, removed, "Future notifications removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busq_core::{HandlerError, MockClock};
    use busq_db::InMemoryQueueStorage;
    use chrono::Duration;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TrialEnding {
        subscription_id: u64,
    }

    impl QueueEvent for TrialEnding {
        const EVENT_TYPE: &'static str = "billing.trial_ending.v1";
    }

    struct Noop;

    #[async_trait::async_trait]
    impl EventHandler<TrialEnding> for Noop {
        async fn handle(&self, _: &TrialEnding, _: &EventMetadata) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn service() -> (NotificationQueueService, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(Utc::now()));
        let service = NotificationQueueService::new(
            QueueConfig::notification_defaults(),
            Arc::new(InMemoryQueueStorage::new()),
            clock.clone(),
        )
        .unwrap();
        (service, clock)
    }

    #[test]
    fn test_composite_name() {
        assert_eq!(composite_name("billing", "trials"), "billing:trials");
    }

    #[tokio::test]
    async fn test_duplicate_queue_is_rejected() {
        let (service, _) = service();
        service
            .create_notification_queue::<TrialEnding, _>("billing", "trials", Noop)
            .unwrap();
        assert!(service
            .create_notification_queue::<TrialEnding, _>("billing", "trials", Noop)
            .is_err());
        assert_eq!(service.queue_names(), vec!["billing:trials".to_string()]);

        service.delete_notification_queue("billing", "trials").unwrap();
        assert!(matches!(
            service.delete_notification_queue("billing", "trials"),
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inflight_cache_always_disabled() {
        let config = QueueConfig {
            use_inflight_queue: true,
            ..QueueConfig::notification_defaults()
        };
        let service = NotificationQueueService::new(
            config,
            Arc::new(InMemoryQueueStorage::new()),
            Arc::new(MockClock::default()),
        )
        .unwrap();
        assert!(!service.queue().config().use_inflight_queue);
    }

    #[tokio::test]
    async fn test_missing_handler_is_retryable() {
        let (service, clock) = service();
        let queue = service
            .create_notification_queue::<TrialEnding, _>("billing", "trials", Noop)
            .unwrap();
        let id = queue
            .record_future_notification(
                clock.now(),
                &TrialEnding { subscription_id: 3 },
                NotificationMetadata::new(1, 0),
            )
            .await
            .unwrap();
        service.delete_notification_queue("billing", "trials").unwrap();

        let entry = service
            .queue()
            .storage()
            .get_entries_from_ids(&[id], service.queue().table())
            .await
            .unwrap()
            .remove(0);
        let err = service.dispatcher.dispatch(&entry).await.unwrap_err();
        assert!(matches!(err, CallbackError::NoHandler { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_queries_are_scoped_to_the_queue() {
        let (service, clock) = service();
        let trials = service
            .create_notification_queue::<TrialEnding, _>("billing", "trials", Noop)
            .unwrap();
        let renewals = service
            .create_notification_queue::<TrialEnding, _>("billing", "renewals", Noop)
            .unwrap();
        let later = clock.now() + Duration::days(7);

        trials
            .record_future_notification(
                later,
                &TrialEnding { subscription_id: 1 },
                NotificationMetadata::new(42, 0),
            )
            .await
            .unwrap();
        renewals
            .record_future_notification(
                later,
                &TrialEnding { subscription_id: 2 },
                NotificationMetadata::new(42, 0),
            )
            .await
            .unwrap();

        let pending = trials
            .get_future_notifications(SearchKeys::key1(42))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].queue_name.as_deref(), Some("billing:trials"));
        assert_eq!(pending[0].effective_date, Some(later));
    }

    #[tokio::test]
    async fn test_remove_notifications() {
        let (service, clock) = service();
        let trials = service
            .create_notification_queue::<TrialEnding, _>("billing", "trials", Noop)
            .unwrap();
        let other = service
            .create_notification_queue::<TrialEnding, _>("billing", "other", Noop)
            .unwrap();
        let later = clock.now() + Duration::days(1);

        let first = trials
            .record_future_notification(
                later,
                &TrialEnding { subscription_id: 1 },
                NotificationMetadata::new(5, 0),
            )
            .await
            .unwrap();
        for id in 2..4 {
            trials
                .record_future_notification(
                    later,
                    &TrialEnding { subscription_id: id },
                    NotificationMetadata::new(6, 0),
                )
                .await
                .unwrap();
        }

        // Not part of the other queue.
        assert!(!other.remove_notification(first).await.unwrap());
        assert!(trials.remove_notification(first).await.unwrap());
        assert!(!trials.remove_notification(first).await.unwrap());

        assert_eq!(
            trials
                .remove_future_notifications(SearchKeys::key1(6))
                .await
                .unwrap(),
            2
        );
        assert!(trials
            .get_future_or_in_processing_notifications(SearchKeys::default())
            .await
            .unwrap()
            .is_empty());

        let history = trials
            .get_historical_notifications(SearchKeys::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert!(history
            .iter()
            .all(|e| e.processing_state == ProcessingState::Removed));
    }
}
