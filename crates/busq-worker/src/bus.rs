//! Persistent bus: typed events dispatched as soon as possible, fanned out to
//! every handler subscribed to the event type.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use busq_core::models::{NewQueueEntry, QueueEntry, QueueEvent, SearchKeys};
use busq_core::models::{EventEnvelope, QueueFlavor};
use busq_core::{Clock, QueueConfig, QueueError, QueueResult};
use busq_db::QueueStorage;
use uuid::Uuid;

use crate::callback::{
    CallbackError, DynHandler, EntryDispatcher, EventHandler, EventMetadata, EventRegistry,
    TypedHandler,
};
use crate::coordinator::{DbBackedQueue, QueueMode, QueueStats};
use crate::lifecycle::QueueLifecycle;

/// Producer-side metadata of a posted event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostMetadata {
    pub user_token: Option<Uuid>,
    pub search_key1: i64,
    pub search_key2: i64,
}

impl PostMetadata {
    pub fn new(search_key1: i64, search_key2: i64) -> Self {
        Self {
            user_token: None,
            search_key1,
            search_key2,
        }
    }

    pub fn with_user_token(mut self, user_token: Uuid) -> Self {
        self.user_token = Some(user_token);
        self
    }
}

#[derive(Default)]
struct Subscribers {
    registry: EventRegistry,
    handlers: HashMap<String, Vec<Arc<dyn DynHandler>>>,
}

#[derive(Default)]
struct BusDispatcher {
    subscribers: RwLock<Subscribers>,
}

#[async_trait::async_trait]
impl EntryDispatcher for BusDispatcher {
    async fn dispatch(&self, entry: &QueueEntry) -> Result<(), CallbackError> {
        let (event, handlers) = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let handlers = subscribers
                .handlers
                .get(&entry.class_name)
                .cloned()
                .unwrap_or_default();
            if handlers.is_empty() {
                tracing::debug!(
                    record_id = entry.record_id,
                    class_name = %entry.class_name,
                    "No subscriber for bus event, retiring it"
                );
                return Ok(());
            }
            (subscribers.registry.decode(&entry.envelope())?, handlers)
        };

        let metadata = EventMetadata::from_entry(entry);
        let mut first_error: Option<CallbackError> = None;
        for handler in handlers {
            if let Err(e) = handler.handle_dyn(event.clone(), &metadata).await {
                tracing::debug!(
                    record_id = entry.record_id,
                    event_type = handler.event_type(),
                    error = %e,
                    "Bus subscriber failed"
                );
                // A fatal failure wins over a retryable one.
                let replace = match &first_error {
                    None => true,
                    Some(previous) => previous.is_retryable() && !e.is_retryable(),
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub struct PersistentBus {
    queue: Arc<DbBackedQueue>,
    dispatcher: Arc<BusDispatcher>,
    lifecycle: QueueLifecycle,
}

impl PersistentBus {
    pub fn new(
        config: QueueConfig,
        storage: Arc<dyn QueueStorage>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        if config.flavor != QueueFlavor::Bus {
            return Err(QueueError::InvalidConfig(
                "persistent bus requires a bus table configuration".to_string(),
            ));
        }
        let queue = Arc::new(DbBackedQueue::new(config, storage, clock)?);
        let dispatcher = Arc::new(BusDispatcher::default());
        let lifecycle = QueueLifecycle::new(queue.clone(), dispatcher.clone());
        Ok(Self {
            queue,
            dispatcher,
            lifecycle,
        })
    }

    pub async fn start(&self) -> QueueResult<()> {
        if !self.lifecycle.start().await? {
            tracing::debug!("Persistent bus already started");
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }

    pub async fn is_started(&self) -> bool {
        self.lifecycle.is_started().await
    }

    /// Subscribe `handler` to events of type `E`. Several handlers may
    /// subscribe to the same type; each receives every event.
    pub fn register<E, H>(&self, handler: H)
    where
        E: QueueEvent,
        H: EventHandler<E>,
    {
        let mut subscribers = self
            .dispatcher
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.registry.register::<E>();
        subscribers
            .handlers
            .entry(E::EVENT_TYPE.to_string())
            .or_default()
            .push(Arc::new(TypedHandler::new(handler)));
        tracing::info!(event_type = E::EVENT_TYPE, "Bus handler registered");
    }

    /// Build the row for `event` without writing it, for producers that
    /// insert inside their own transaction. Call [`Self::track_committed`]
    /// with the record id once committed.
    pub fn prepare_entry<E: QueueEvent>(
        &self,
        event: &E,
        metadata: PostMetadata,
    ) -> QueueResult<NewQueueEntry> {
        let config = self.queue.config();
        Ok(NewQueueEntry::new(
            EventEnvelope::encode(event)?,
            &config.owner,
            self.queue.clock().now(),
        )
        .with_user_token(metadata.user_token)
        .with_search_keys(metadata.search_key1, metadata.search_key2))
    }

    /// Persist `event`; it is dispatched once the bus is running.
    #[tracing::instrument(skip(self, event), fields(event_type = E::EVENT_TYPE))]
    pub async fn post<E: QueueEvent>(&self, event: &E, metadata: PostMetadata) -> QueueResult<i64> {
        let entry = self.prepare_entry(event, metadata)?;
        self.queue.insert_entry(entry).await
    }

    pub fn track_committed(&self, record_id: i64) {
        self.queue.track_committed(record_id);
    }

    /// Events not yet retired, optionally filtered by search keys.
    pub async fn get_available_or_in_processing_events(
        &self,
        keys: SearchKeys,
    ) -> QueueResult<Vec<QueueEntry>> {
        self.queue
            .storage()
            .get_entries_for_search_keys(keys, None, self.queue.table())
            .await
    }

    pub async fn get_historical_events(&self, keys: SearchKeys) -> QueueResult<Vec<QueueEntry>> {
        self.queue
            .storage()
            .get_history_for_search_keys(keys, None, self.queue.table())
            .await
    }

    pub async fn nb_ready_entries(&self) -> QueueResult<i64> {
        self.queue.nb_ready_entries().await
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn mode(&self) -> QueueMode {
        self.queue.mode()
    }

    pub fn queue(&self) -> &Arc<DbBackedQueue> {
        &self.queue
    }
}
