//! Queue lifecycle: the poll loop plus the reaper around one coordinator.
//!
//! Shutdown order: close the coordinator (no new claims), stop the poll loop,
//! drain the dispatch pool within `shutdown_timeout`, stop the reaper. Rows
//! still `IN_PROCESSING` afterwards are recovered by a reaper, here or on
//! another node.

use std::sync::Arc;

use busq_core::QueueResult;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::callback::{process_entry, EntryDispatcher};
use crate::coordinator::DbBackedQueue;
use crate::dispatch::DispatchPool;
use crate::reaper::spawn_reaper;

struct Running {
    pool: Arc<DispatchPool>,
    poll_shutdown_tx: mpsc::Sender<()>,
    poll_handle: JoinHandle<()>,
    reaper: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
}

pub(crate) struct QueueLifecycle {
    queue: Arc<DbBackedQueue>,
    dispatcher: Arc<dyn EntryDispatcher>,
    running: Mutex<Option<Running>>,
}

impl QueueLifecycle {
    pub(crate) fn new(queue: Arc<DbBackedQueue>, dispatcher: Arc<dyn EntryDispatcher>) -> Self {
        Self {
            queue,
            dispatcher,
            running: Mutex::new(None),
        }
    }

    pub(crate) async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Initialize the coordinator and spawn the poll loop and reaper.
    /// Returns false if already started.
    pub(crate) async fn start(&self) -> QueueResult<bool> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(false);
        }

        self.queue.initialize().await?;

        let config = self.queue.config();
        let pool = Arc::new(DispatchPool::new(
            &config.table_name,
            config.nb_dispatch_threads,
            config.saturation_policy,
            config.shutdown_timeout,
        ));

        let (poll_shutdown_tx, poll_shutdown_rx) = mpsc::channel(1);
        let poll_handle = tokio::spawn(poll_loop(
            self.queue.clone(),
            self.dispatcher.clone(),
            pool.clone(),
            poll_shutdown_rx,
        ));

        let reaper = if config.reap_schedule.is_zero() {
            None
        } else {
            let (tx, rx) = mpsc::channel(1);
            Some((tx, spawn_reaper(self.queue.clone(), rx)))
        };

        tracing::info!(
            table = %config.table_name,
            nb_dispatch_threads = config.nb_dispatch_threads,
            polling_sleep_ms = config.polling_sleep_time.as_millis() as u64,
            reaper = reaper.is_some(),
            "Queue started"
        );

        *running = Some(Running {
            pool,
            poll_shutdown_tx,
            poll_handle,
            reaper,
        });
        Ok(true)
    }

    /// Returns false if the queue was not running.
    pub(crate) async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };
        let table = self.queue.table().table_name.clone();
        tracing::info!(table = %table, "Stopping queue");

        self.queue.close();
        let _ = running.poll_shutdown_tx.send(()).await;
        running.pool.shutdown().await;
        if let Err(e) = running.poll_handle.await {
            tracing::error!(error = %e, table = %table, "Poll loop ended abnormally");
        }

        if let Some((tx, handle)) = running.reaper {
            let _ = tx.send(()).await;
            let _ = handle.await;
        }

        tracing::info!(table = %table, "Queue stopped");
        true
    }
}

async fn poll_loop(
    queue: Arc<DbBackedQueue>,
    dispatcher: Arc<dyn EntryDispatcher>,
    pool: Arc<DispatchPool>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let polling_sleep_time = queue.config().polling_sleep_time;

    loop {
        let scheduled = poll_once(&queue, &dispatcher, &pool).await;

        if scheduled > 0 {
            // More may be ready; poll again unless asked to stop.
            match shutdown_rx.try_recv() {
                Err(mpsc::error::TryRecvError::Empty) => continue,
                _ => break,
            }
        }

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = queue.wait_for_new_entries() => {}
            _ = sleep(polling_sleep_time) => {}
        }
    }

    tracing::debug!(table = %queue.table().table_name, "Poll loop stopped");
}

/// Claim ready rows and hand them to the pool. Returns how many were scheduled.
async fn poll_once(
    queue: &Arc<DbBackedQueue>,
    dispatcher: &Arc<dyn EntryDispatcher>,
    pool: &Arc<DispatchPool>,
) -> usize {
    let entries = match queue.get_ready_entries().await {
        Ok(entries) => entries,
        Err(e) if e.is_transient() => {
            tracing::error!(
                error = %e,
                table = %queue.table().table_name,
                "Storage error while fetching ready entries, will retry on next poll"
            );
            return 0;
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                table = %queue.table().table_name,
                "Failed to fetch ready entries"
            );
            return 0;
        }
    };

    let mut scheduled = 0;
    for entry in entries {
        let record_id = entry.record_id;
        let queue = queue.clone();
        let dispatcher = dispatcher.clone();
        let submitted = pool
            .submit(record_id, async move {
                if let Err(e) = process_entry(&queue, dispatcher, entry).await {
                    tracing::error!(
                        error = %e,
                        record_id,
                        "Failed to record dispatch outcome, entry is left for the reaper"
                    );
                }
            })
            .await;
        if submitted {
            scheduled += 1;
        }
    }
    scheduled
}
