//! Dispatch pool: bounded concurrent execution of claimed rows.
//!
//! Capacity is a semaphore with `nb_dispatch_threads` permits. When every
//! permit is taken, [`SaturationPolicy::Block`] waits for one and
//! [`SaturationPolicy::Drop`] gives up on the scheduling attempt. A dropped
//! row stays `IN_PROCESSING` in storage and is recovered by the reaper.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use busq_core::SaturationPolicy;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

pub struct DispatchPool {
    name: String,
    nb_threads: usize,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    policy: SaturationPolicy,
    shutdown_timeout: Duration,
    accepting: AtomicBool,
}

impl DispatchPool {
    pub fn new(
        name: &str,
        nb_threads: usize,
        policy: SaturationPolicy,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            nb_threads,
            semaphore: Arc::new(Semaphore::new(nb_threads)),
            tasks: Mutex::new(JoinSet::new()),
            policy,
            shutdown_timeout,
            accepting: AtomicBool::new(true),
        }
    }

    /// Number of tasks currently holding a permit.
    pub fn active(&self) -> usize {
        self.nb_threads
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Schedule `task`. Returns false when the attempt was dropped, either by
    /// the saturation policy or because the pool is shutting down.
    pub async fn submit<F>(&self, record_id: i64, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_accepting() {
            tracing::debug!(pool = %self.name, record_id, "Dispatch pool stopped, not scheduling entry");
            return false;
        }

        let permit = match self.policy {
            SaturationPolicy::Block => match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!(pool = %self.name, record_id, "Dispatch pool closed while waiting");
                    return false;
                }
            },
            SaturationPolicy::Drop => match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(
                        pool = %self.name,
                        record_id,
                        nb_threads = self.nb_threads,
                        "Dispatch pool saturated, dropping scheduling attempt; entry will be reaped"
                    );
                    return false;
                }
            },
        };

        let mut tasks = self.tasks.lock().await;
        // shutdown() may have drained the set while we waited for the lock
        if !self.is_accepting() {
            return false;
        }
        Self::reap_finished(&self.name, &mut tasks);
        tasks.spawn(async move {
            let _permit = permit;
            task.await;
        });
        true
    }

    fn reap_finished(name: &str, tasks: &mut JoinSet<()>) {
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(pool = %name, error = %e, "Dispatch task panicked");
                }
            }
        }
    }

    /// Stop accepting work and give running tasks `shutdown_timeout` to
    /// finish before aborting them.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        self.semaphore.close();

        let mut tasks = self.tasks.lock().await;
        let pending = tasks.len();
        if pending > 0 {
            tracing::info!(pool = %self.name, pending, "Waiting for dispatch tasks to finish");
        }

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                pool = %self.name,
                remaining = tasks.len(),
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Dispatch tasks did not finish in time, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        tracing::info!(pool = %self.name, "Dispatch pool stopped");
    }
}
