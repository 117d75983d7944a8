//! Configuration module
//!
//! `QueueConfig` carries every knob of one persistent queue (bus or
//! notification table). Values come from the environment with
//! parse-or-default semantics, using a per-queue prefix such as `BUS` or
//! `NOTIFICATION` (`BUS_PREFETCH_ENTRIES`, `NOTIFICATION_CLAIMED_TIME_MS`, ...).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::error::QueueError;
use crate::models::{is_valid_table_name, QueueFlavor, QueueTable};

// Common constants
const PREFETCH_ENTRIES: usize = 100;
const MAX_ENTRIES_CLAIMED: usize = 10;
const QUEUE_CAPACITY: usize = 30_000;
const CLAIMED_TIME_MS: u64 = 5 * 60 * 1000;
const MAX_FAILURE_RETRIES: i32 = 3;
const REAP_THRESHOLD_MS: u64 = 10 * 60 * 1000;
const REAP_SCHEDULE_MS: u64 = 3 * 60 * 1000;
const MAX_RE_DISPATCH_COUNT: usize = 10;
const BUS_POLLING_SLEEP_TIME_MS: u64 = 3000;
const NOTIFICATION_POLLING_SLEEP_TIME_MS: u64 = 3000;
const BUS_NB_DISPATCH_THREADS: usize = 30;
const NOTIFICATION_NB_DISPATCH_THREADS: usize = 10;
const SHUTDOWN_TIMEOUT_MS: u64 = 15_000;
const INFLIGHT_LOOKUP_INITIAL_BACKOFF_MS: u64 = 10;
const INFLIGHT_LOOKUP_MAX_ATTEMPTS: u32 = 10;
/// Upper bound for every configured duration; keeps lease and cutoff
/// arithmetic on timestamps in range.
const MAX_CONFIG_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Which rows a node polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistentQueueMode {
    /// Any node may claim any ready row.
    #[default]
    Polling,
    /// A node only claims rows it created itself.
    StickyPolling,
}

impl FromStr for PersistentQueueMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "polling" => Ok(PersistentQueueMode::Polling),
            "sticky_polling" => Ok(PersistentQueueMode::StickyPolling),
            _ => Err(anyhow::anyhow!("Invalid persistent queue mode: {}", s)),
        }
    }
}

/// What the dispatch pool does with a claimed entry when every worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaturationPolicy {
    /// Wait for a worker to free up.
    #[default]
    Block,
    /// Log and drop the scheduling attempt; the row is recovered by the reaper.
    Drop,
}

impl FromStr for SaturationPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(SaturationPolicy::Block),
            "drop" => Ok(SaturationPolicy::Drop),
            _ => Err(anyhow::anyhow!("Invalid saturation policy: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub flavor: QueueFlavor,
    pub table_name: String,
    pub history_table_name: String,
    /// Identifier of this process, written to `creating_owner` / `processing_owner`.
    pub owner: String,
    pub persistent_queue_mode: PersistentQueueMode,
    /// Enables the in-memory fast path of the coordinator.
    pub use_inflight_queue: bool,
    pub prefetch_entries: usize,
    pub max_entries_claimed: usize,
    /// Capacity of the inflight id FIFO.
    pub queue_capacity: usize,
    /// Lease granted by a claim.
    pub claimed_time: Duration,
    pub max_failure_retries: i32,
    pub reap_threshold: Duration,
    /// Interval between reaper sweeps. Zero disables the reaper.
    pub reap_schedule: Duration,
    pub max_re_dispatch_count: usize,
    pub polling_sleep_time: Duration,
    pub nb_dispatch_threads: usize,
    pub shutdown_timeout: Duration,
    pub saturation_policy: SaturationPolicy,
    pub inflight_lookup_initial_backoff: Duration,
    pub inflight_lookup_max_attempts: u32,
}

impl QueueConfig {
    pub fn bus_defaults() -> Self {
        Self {
            flavor: QueueFlavor::Bus,
            table_name: "bus_events".to_string(),
            history_table_name: "bus_events_history".to_string(),
            owner: default_owner(),
            persistent_queue_mode: PersistentQueueMode::Polling,
            use_inflight_queue: true,
            prefetch_entries: PREFETCH_ENTRIES,
            max_entries_claimed: MAX_ENTRIES_CLAIMED,
            queue_capacity: QUEUE_CAPACITY,
            claimed_time: Duration::from_millis(CLAIMED_TIME_MS),
            max_failure_retries: MAX_FAILURE_RETRIES,
            reap_threshold: Duration::from_millis(REAP_THRESHOLD_MS),
            reap_schedule: Duration::from_millis(REAP_SCHEDULE_MS),
            max_re_dispatch_count: MAX_RE_DISPATCH_COUNT,
            polling_sleep_time: Duration::from_millis(BUS_POLLING_SLEEP_TIME_MS),
            nb_dispatch_threads: BUS_NB_DISPATCH_THREADS,
            shutdown_timeout: Duration::from_millis(SHUTDOWN_TIMEOUT_MS),
            saturation_policy: SaturationPolicy::Block,
            inflight_lookup_initial_backoff: Duration::from_millis(
                INFLIGHT_LOOKUP_INITIAL_BACKOFF_MS,
            ),
            inflight_lookup_max_attempts: INFLIGHT_LOOKUP_MAX_ATTEMPTS,
        }
    }

    pub fn notification_defaults() -> Self {
        Self {
            flavor: QueueFlavor::Notification,
            table_name: "notifications".to_string(),
            history_table_name: "notifications_history".to_string(),
            // Notifications are not ready when written, the cache cannot help.
            use_inflight_queue: false,
            polling_sleep_time: Duration::from_millis(NOTIFICATION_POLLING_SLEEP_TIME_MS),
            nb_dispatch_threads: NOTIFICATION_NB_DISPATCH_THREADS,
            ..Self::bus_defaults()
        }
    }

    /// Load a queue configuration from `{prefix}_*` environment variables,
    /// falling back to `defaults` for anything unset or unparsable.
    pub fn from_env(prefix: &str, defaults: QueueConfig) -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let key = |name: &str| format!("{}_{}", prefix, name);

        let config = QueueConfig {
            flavor: defaults.flavor,
            table_name: env::var(key("TABLE_NAME")).unwrap_or(defaults.table_name),
            history_table_name: env::var(key("HISTORY_TABLE_NAME"))
                .unwrap_or(defaults.history_table_name),
            owner: env::var(key("OWNER"))
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.owner),
            persistent_queue_mode: env_or(&key("PERSISTENT_QUEUE_MODE"), defaults.persistent_queue_mode),
            use_inflight_queue: env::var(key("USE_INFLIGHT_QUEUE"))
                .ok()
                .and_then(|s| s.to_lowercase().parse().ok())
                .unwrap_or(defaults.use_inflight_queue),
            prefetch_entries: env_or(&key("PREFETCH_ENTRIES"), defaults.prefetch_entries),
            max_entries_claimed: env_or(&key("MAX_ENTRIES_CLAIMED"), defaults.max_entries_claimed),
            queue_capacity: env_or(&key("QUEUE_CAPACITY"), defaults.queue_capacity),
            claimed_time: env_millis_or(&key("CLAIMED_TIME_MS"), defaults.claimed_time),
            max_failure_retries: env_or(&key("MAX_FAILURE_RETRIES"), defaults.max_failure_retries),
            reap_threshold: env_millis_or(&key("REAP_THRESHOLD_MS"), defaults.reap_threshold),
            reap_schedule: env_millis_or(&key("REAP_SCHEDULE_MS"), defaults.reap_schedule),
            max_re_dispatch_count: env_or(
                &key("MAX_RE_DISPATCH_COUNT"),
                defaults.max_re_dispatch_count,
            ),
            polling_sleep_time: env_millis_or(
                &key("POLLING_SLEEP_TIME_MS"),
                defaults.polling_sleep_time,
            ),
            nb_dispatch_threads: env_or(&key("NB_DISPATCH_THREADS"), defaults.nb_dispatch_threads),
            shutdown_timeout: env_millis_or(&key("SHUTDOWN_TIMEOUT_MS"), defaults.shutdown_timeout),
            saturation_policy: env_or(&key("SATURATION_POLICY"), defaults.saturation_policy),
            inflight_lookup_initial_backoff: env_millis_or(
                &key("INFLIGHT_LOOKUP_INITIAL_BACKOFF_MS"),
                defaults.inflight_lookup_initial_backoff,
            ),
            inflight_lookup_max_attempts: env_or(
                &key("INFLIGHT_LOOKUP_MAX_ATTEMPTS"),
                defaults.inflight_lookup_max_attempts,
            ),
        };

        config
            .validate()
            .with_context(|| format!("invalid {} queue configuration", prefix))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if !is_valid_table_name(&self.table_name) {
            return Err(QueueError::InvalidConfig(format!(
                "table name '{}' is not a plain SQL identifier",
                self.table_name
            )));
        }
        if !is_valid_table_name(&self.history_table_name) {
            return Err(QueueError::InvalidConfig(format!(
                "history table name '{}' is not a plain SQL identifier",
                self.history_table_name
            )));
        }
        if self.table_name == self.history_table_name {
            return Err(QueueError::InvalidConfig(
                "table and history table must differ".to_string(),
            ));
        }
        if self.owner.trim().is_empty() {
            return Err(QueueError::InvalidConfig("owner must be set".to_string()));
        }
        if self.prefetch_entries == 0 || self.max_entries_claimed == 0 {
            return Err(QueueError::InvalidConfig(
                "prefetch_entries and max_entries_claimed must be positive".to_string(),
            ));
        }
        if self.max_entries_claimed > self.prefetch_entries {
            return Err(QueueError::InvalidConfig(format!(
                "max_entries_claimed ({}) cannot exceed prefetch_entries ({})",
                self.max_entries_claimed, self.prefetch_entries
            )));
        }
        if self.use_inflight_queue && self.queue_capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "queue_capacity must be positive when the inflight queue is enabled".to_string(),
            ));
        }
        if self.nb_dispatch_threads == 0 {
            return Err(QueueError::InvalidConfig(
                "nb_dispatch_threads must be positive".to_string(),
            ));
        }
        if self.max_failure_retries < 0 {
            return Err(QueueError::InvalidConfig(
                "max_failure_retries cannot be negative".to_string(),
            ));
        }
        if self.claimed_time.is_zero() {
            return Err(QueueError::InvalidConfig(
                "claimed_time must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("claimed_time", self.claimed_time),
            ("reap_threshold", self.reap_threshold),
            ("reap_schedule", self.reap_schedule),
            ("polling_sleep_time", self.polling_sleep_time),
            ("shutdown_timeout", self.shutdown_timeout),
            ("inflight_lookup_initial_backoff", self.inflight_lookup_initial_backoff),
        ] {
            if value > MAX_CONFIG_DURATION {
                return Err(QueueError::InvalidConfig(format!(
                    "{} of {}s exceeds the maximum of {}s",
                    name,
                    value.as_secs(),
                    MAX_CONFIG_DURATION.as_secs()
                )));
            }
        }
        if self.inflight_lookup_max_attempts == 0 {
            return Err(QueueError::InvalidConfig(
                "inflight_lookup_max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn table(&self) -> QueueTable {
        QueueTable::new(&self.table_name, &self.history_table_name, self.flavor)
    }

    /// The inflight cache only makes sense for rows that are ready when written.
    pub fn inflight_queue_enabled(&self) -> bool {
        self.use_inflight_queue && self.flavor == QueueFlavor::Bus
    }

    pub fn claimed_time_chrono(&self) -> chrono::Duration {
        to_chrono(self.claimed_time)
    }

    pub fn reap_threshold_chrono(&self) -> chrono::Duration {
        to_chrono(self.reap_threshold)
    }
}

/// Hostname of this machine, used as the default queue owner.
pub fn default_owner() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis_or(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Configured durations are bounded by `validate`, so the conversion never
/// saturates for a validated config.
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_CONFIG_DURATION)).unwrap_or(chrono::Duration::MAX)
}
