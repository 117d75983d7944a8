//! Shared fixtures for the busq-worker integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use busq_worker::{
    EventEnvelope, EventHandler, EventMetadata, HandlerError, QueueConfig, QueueEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCreated {
    pub account_id: u64,
}

impl QueueEvent for AccountCreated {
    const EVENT_TYPE: &'static str = "accounts.account_created.v1";
}

pub fn envelope(account_id: u64) -> EventEnvelope {
    EventEnvelope::encode(&AccountCreated { account_id }).unwrap()
}

/// Bus configuration tuned for fast tests.
pub fn bus_config(owner: &str) -> QueueConfig {
    QueueConfig {
        owner: owner.to_string(),
        polling_sleep_time: Duration::from_millis(10),
        reap_schedule: Duration::ZERO,
        nb_dispatch_threads: 4,
        shutdown_timeout: Duration::from_secs(2),
        inflight_lookup_initial_backoff: Duration::from_millis(1),
        inflight_lookup_max_attempts: 3,
        ..QueueConfig::bus_defaults()
    }
}

pub fn notification_config(owner: &str) -> QueueConfig {
    QueueConfig {
        owner: owner.to_string(),
        polling_sleep_time: Duration::from_millis(10),
        reap_schedule: Duration::ZERO,
        shutdown_timeout: Duration::from_secs(2),
        ..QueueConfig::notification_defaults()
    }
}

/// Succeeds and counts calls.
#[derive(Clone, Default)]
pub struct Recording {
    pub calls: Arc<AtomicUsize>,
}

impl Recording {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EventHandler<AccountCreated> for Recording {
    async fn handle(&self, _: &AccountCreated, _: &EventMetadata) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails with a retryable error for the first `failures` attempts.
#[derive(Clone)]
pub struct FailingFirst {
    pub failures: usize,
    pub attempts: Arc<AtomicUsize>,
}

impl FailingFirst {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EventHandler<AccountCreated> for FailingFirst {
    async fn handle(&self, _: &AccountCreated, _: &EventMetadata) -> Result<(), HandlerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(anyhow::anyhow!("downstream unavailable").into());
        }
        Ok(())
    }
}

/// Waits for a permit on `gate` before succeeding; counts completions.
#[derive(Clone)]
pub struct Gated {
    pub gate: Arc<Semaphore>,
    pub started: Arc<AtomicUsize>,
    pub completed: Arc<AtomicUsize>,
}

impl Gated {
    pub fn closed() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            started: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EventHandler<AccountCreated> for Gated {
    async fn handle(&self, _: &AccountCreated, _: &EventMetadata) -> Result<(), HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| anyhow::anyhow!("gate closed: {}", e))?;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Panicking;

#[async_trait::async_trait]
impl EventHandler<AccountCreated> for Panicking {
    async fn handle(&self, _: &AccountCreated, _: &EventMetadata) -> Result<(), HandlerError> {
        panic!("handler bug");
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
