//! Reaper: recovery of rows abandoned by crashed workers.
//!
//! A row is left behind when it is still `IN_PROCESSING` and its claim
//! expired more than `reap_threshold` ago. The reset is conditional on the
//! same owner and expiry, so a row that completes concurrently is untouched.
//! The reaping node becomes the row's creating owner, which keeps it visible
//! to sticky pollers once the crashed node is gone.

use std::sync::Arc;

use busq_core::QueueResult;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coordinator::DbBackedQueue;

/// One sweep. Returns the ids reset to `AVAILABLE`.
pub async fn reap_left_behind_entries(queue: &DbBackedQueue) -> QueueResult<Vec<i64>> {
    let config = queue.config();
    let cutoff = queue.clock().now() - config.reap_threshold_chrono();

    let candidates = queue
        .storage()
        .get_in_processing_entries_older_than(cutoff, config.max_re_dispatch_count, queue.table())
        .await?;

    let mut reaped = Vec::with_capacity(candidates.len());
    for entry in candidates {
        let (Some(owner), Some(next_available_date)) =
            (entry.processing_owner.as_deref(), entry.next_available_date)
        else {
            continue;
        };

        let rows = queue
            .storage()
            .reap_entry(
                entry.record_id,
                owner,
                next_available_date,
                &config.owner,
                queue.table(),
            )
            .await?;
        if rows == 1 {
            tracing::warn!(
                record_id = entry.record_id,
                processing_owner = %owner,
                claim_expired_at = %next_available_date,
                error_count = entry.error_count,
                table = %queue.table().table_name,
                "Reaped entry left behind by its owner"
            );
            reaped.push(entry.record_id);
        }
    }

    if !reaped.is_empty() {
        queue.on_entries_reaped(&reaped);
    }
    Ok(reaped)
}

/// Run a sweep every `reap_schedule` until a message arrives on `shutdown_rx`.
pub(crate) fn spawn_reaper(
    queue: Arc<DbBackedQueue>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    let reap_schedule = queue.config().reap_schedule;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_schedule);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = reap_left_behind_entries(&queue).await {
                        tracing::error!(
                            error = %e,
                            table = %queue.table().table_name,
                            "Reaper sweep failed"
                        );
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::debug!(table = %queue.table().table_name, "Reaper stopped");
    })
}
