//! Callback contract
//!
//! Decodes a row into its typed event, invokes the application handler and
//! maps the outcome to a row transition:
//!
//! * success: move to history as `PROCESSED`
//! * decode failure or fatal handler error: move to history as `FAILED`
//! * retryable failure with budget left: release the row with `error_count + 1`
//! * retryable failure without budget: move to history as `FAILED` (data loss)

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use busq_core::models::{EventEnvelope, ProcessingState, QueueEntry, QueueEvent};
use busq_core::{HandlerError, QueueResult};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::coordinator::DbBackedQueue;

/// Everything a handler gets besides the event itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMetadata {
    pub record_id: i64,
    /// Effective date for notifications, creation date for bus events.
    pub event_date: DateTime<Utc>,
    pub created_date: DateTime<Utc>,
    pub user_token: Option<Uuid>,
    pub future_user_token: Option<Uuid>,
    pub search_key1: i64,
    pub search_key2: i64,
    pub queue_name: Option<String>,
    /// Failed attempts before this one.
    pub error_count: i32,
}

impl EventMetadata {
    pub fn from_entry(entry: &QueueEntry) -> Self {
        Self {
            record_id: entry.record_id,
            event_date: entry.event_date(),
            created_date: entry.created_date,
            user_token: entry.user_token,
            future_user_token: entry.future_user_token,
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
            queue_name: entry.queue_name.clone(),
            error_count: entry.error_count,
        }
    }
}

/// Application handler for one event type.
///
/// Return [`HandlerError::fatal`] for failures that will never succeed on
/// retry; any other error is retried up to `max_failure_retries`. Delivery
/// is at-least-once, so handlers must tolerate duplicates.
#[async_trait::async_trait]
pub trait EventHandler<E: QueueEvent>: Send + Sync + 'static {
    async fn handle(&self, event: &E, metadata: &EventMetadata) -> Result<(), HandlerError>;
}

/// Failure of one dispatch attempt, carrying its original cause.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Failed to decode event of type '{class_name}': {source}")]
    Decode {
        class_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown event type '{0}'")]
    UnknownEventType(String),

    #[error(transparent)]
    Handler(HandlerError),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("No handler registered for notification queue '{queue_name}'")]
    NoHandler { queue_name: String },
}

impl CallbackError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CallbackError::Decode { .. } | CallbackError::UnknownEventType(_) => false,
            CallbackError::Handler(e) => e.is_retryable(),
            CallbackError::Panicked(_) | CallbackError::NoHandler { .. } => true,
        }
    }
}

pub type DecodedEvent = Arc<dyn Any + Send + Sync>;

type Decoder = fn(&str) -> Result<DecodedEvent, serde_json::Error>;

fn decode_as<E: QueueEvent>(payload: &str) -> Result<DecodedEvent, serde_json::Error> {
    let event: E = serde_json::from_str(payload)?;
    Ok(Arc::new(event))
}

/// Event type name to decoder.
#[derive(Default, Clone)]
pub struct EventRegistry {
    decoders: HashMap<String, Decoder>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same type twice is a no-op.
    pub fn register<E: QueueEvent>(&mut self) {
        self.decoders
            .entry(E::EVENT_TYPE.to_string())
            .or_insert(decode_as::<E>);
    }

    pub fn is_registered(&self, class_name: &str) -> bool {
        self.decoders.contains_key(class_name)
    }

    pub fn decode(&self, envelope: &EventEnvelope) -> Result<DecodedEvent, CallbackError> {
        let decoder = self
            .decoders
            .get(&envelope.class_name)
            .ok_or_else(|| CallbackError::UnknownEventType(envelope.class_name.clone()))?;
        decoder(&envelope.payload).map_err(|source| CallbackError::Decode {
            class_name: envelope.class_name.clone(),
            source,
        })
    }
}

/// Object-safe handler, stored per event type or per notification queue.
#[async_trait::async_trait]
pub(crate) trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        event: DecodedEvent,
        metadata: &EventMetadata,
    ) -> Result<(), CallbackError>;

    fn event_type(&self) -> &'static str;
}

pub(crate) struct TypedHandler<E: QueueEvent, H: EventHandler<E>> {
    handler: H,
    _marker: PhantomData<fn(E)>,
}

impl<E: QueueEvent, H: EventHandler<E>> TypedHandler<E, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<E: QueueEvent, H: EventHandler<E>> DynHandler for TypedHandler<E, H> {
    async fn handle_dyn(
        &self,
        event: DecodedEvent,
        metadata: &EventMetadata,
    ) -> Result<(), CallbackError> {
        let event = event
            .downcast_ref::<E>()
            .ok_or_else(|| CallbackError::UnknownEventType(E::EVENT_TYPE.to_string()))?;
        self.handler
            .handle(event, metadata)
            .await
            .map_err(CallbackError::Handler)
    }

    fn event_type(&self) -> &'static str {
        E::EVENT_TYPE
    }
}

/// Runs the application side of one claimed row.
#[async_trait::async_trait]
pub trait EntryDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, entry: &QueueEntry) -> Result<(), CallbackError>;
}

/// Transition chosen for a finished dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Processed,
    Retried { error_count: i32 },
    Failed { error_count: i32 },
}

/// Map an attempt result to the row transition. `error_count` is the count
/// before this attempt.
pub(crate) fn resolve_outcome(
    result: &Result<(), CallbackError>,
    error_count: i32,
    max_failure_retries: i32,
) -> DispatchOutcome {
    match result {
        Ok(()) => DispatchOutcome::Processed,
        Err(e) if !e.is_retryable() => DispatchOutcome::Failed {
            error_count: error_count + 1,
        },
        Err(_) if error_count <= max_failure_retries => DispatchOutcome::Retried {
            error_count: error_count + 1,
        },
        Err(_) => DispatchOutcome::Failed {
            error_count: error_count + 1,
        },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Aborts the handler task when the dispatch task is dropped or aborted, so
/// a forced pool shutdown also stops the handler.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Invoke the dispatcher on its own task so that a panicking handler becomes
/// a [`CallbackError::Panicked`] instead of tearing down the worker.
async fn invoke(dispatcher: Arc<dyn EntryDispatcher>, entry: QueueEntry) -> Result<(), CallbackError> {
    let mut handle = AbortOnDrop(tokio::spawn(async move { dispatcher.dispatch(&entry).await }));
    match (&mut handle.0).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(CallbackError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(CallbackError::Panicked(e.to_string())),
    }
}

/// Dispatch one claimed row and apply the resulting transition.
#[tracing::instrument(skip(queue, dispatcher, entry), fields(
    record_id = entry.record_id,
    class_name = %entry.class_name,
    error_count = entry.error_count
))]
pub(crate) async fn process_entry(
    queue: &DbBackedQueue,
    dispatcher: Arc<dyn EntryDispatcher>,
    entry: QueueEntry,
) -> QueueResult<DispatchOutcome> {
    let result = invoke(dispatcher, entry.clone()).await;
    let outcome = resolve_outcome(&result, entry.error_count, queue.config().max_failure_retries);

    match (&outcome, &result) {
        (DispatchOutcome::Processed, _) => {
            if !queue
                .move_entry_to_history(&entry, ProcessingState::Processed)
                .await?
            {
                tracing::warn!(
                    record_id = entry.record_id,
                    "Processed entry was no longer in the queue table"
                );
            }
            tracing::debug!(record_id = entry.record_id, "Entry processed");
        }
        (DispatchOutcome::Retried { error_count }, Err(e)) => {
            tracing::info!(
                record_id = entry.record_id,
                error = %e,
                error_count = *error_count,
                max_failure_retries = queue.config().max_failure_retries,
                "Entry dispatch failed, releasing for retry"
            );
            queue.update_on_error(&entry, *error_count).await?;
        }
        (DispatchOutcome::Failed { error_count }, Err(e)) => {
            if e.is_retryable() {
                tracing::error!(
                    record_id = entry.record_id,
                    class_name = %entry.class_name,
                    payload = %entry.payload,
                    error = %e,
                    error_count = *error_count,
                    "Entry failed after max retries, moving to history as FAILED"
                );
            } else {
                tracing::error!(
                    record_id = entry.record_id,
                    class_name = %entry.class_name,
                    error = %e,
                    "Entry failed with unrecoverable error, moving to history as FAILED"
                );
            }
            let mut failed = entry.clone();
            failed.error_count = *error_count;
            queue
                .move_entry_to_history(&failed, ProcessingState::Failed)
                .await?;
        }
        (_, Ok(())) => {}
    }

    Ok(outcome)
}
