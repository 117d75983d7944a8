use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::EventEnvelope;

/// Lifecycle state of a queue row.
///
/// `Available` and `InProcessing` rows live in the main table; the terminal
/// states only ever appear in the history table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Available,
    InProcessing,
    Processed,
    Failed,
    /// Explicitly removed by the producer before dispatch.
    Removed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Available => "AVAILABLE",
            ProcessingState::InProcessing => "IN_PROCESSING",
            ProcessingState::Processed => "PROCESSED",
            ProcessingState::Failed => "FAILED",
            ProcessingState::Removed => "REMOVED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingState::Processed | ProcessingState::Failed | ProcessingState::Removed
        )
    }
}

impl Display for ProcessingState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(ProcessingState::Available),
            "IN_PROCESSING" => Ok(ProcessingState::InProcessing),
            "PROCESSED" => Ok(ProcessingState::Processed),
            "FAILED" => Ok(ProcessingState::Failed),
            "REMOVED" => Ok(ProcessingState::Removed),
            _ => Err(anyhow::anyhow!("Invalid processing state: {}", s)),
        }
    }
}

/// A persisted queue row (bus event or notification).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub record_id: i64,
    pub class_name: String,
    pub payload: String,
    pub creating_owner: String,
    pub created_date: DateTime<Utc>,
    pub user_token: Option<Uuid>,
    pub search_key1: i64,
    pub search_key2: i64,
    pub processing_state: ProcessingState,
    pub processing_owner: Option<String>,
    /// Claim expiry while `InProcessing`, `None` otherwise.
    pub next_available_date: Option<DateTime<Utc>>,
    pub error_count: i32,
    // Notification flavor only
    pub effective_date: Option<DateTime<Utc>>,
    pub future_user_token: Option<Uuid>,
    pub queue_name: Option<String>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for QueueEntry {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(QueueEntry {
            record_id: row.try_get("record_id")?,
            class_name: row.try_get("class_name")?,
            payload: row.try_get("event_json")?,
            creating_owner: row.try_get("creating_owner")?,
            created_date: row.try_get("created_date")?,
            user_token: row.try_get("user_token")?,
            search_key1: row.try_get("search_key1")?,
            search_key2: row.try_get("search_key2")?,
            processing_state: row
                .try_get::<String, _>("processing_state")?
                .parse()
                .map_err(|e| {
                    sqlx::Error::Decode(format!("Failed to parse processing_state: {}", e).into())
                })?,
            processing_owner: row.try_get("processing_owner")?,
            next_available_date: row.try_get("processing_available_date")?,
            error_count: row.try_get("error_count")?,
            effective_date: row.try_get("effective_date")?,
            future_user_token: row.try_get("future_user_token")?,
            queue_name: row.try_get("queue_name")?,
        })
    }
}

impl QueueEntry {
    /// A row is ready when it is available and, for notifications, its
    /// effective date has passed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.processing_state == ProcessingState::Available
            && self.effective_date.is_none_or(|effective| effective <= now)
    }

    pub fn is_claimed_by(&self, owner: &str) -> bool {
        self.processing_state == ProcessingState::InProcessing
            && self.processing_owner.as_deref() == Some(owner)
    }

    /// Date handed to handlers: the effective date for notifications, the
    /// creation date for bus events.
    pub fn event_date(&self) -> DateTime<Utc> {
        self.effective_date.unwrap_or(self.created_date)
    }

    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            class_name: self.class_name.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Local view of the row after a successful conditional claim.
    pub fn claimed(mut self, owner: &str, next_available_date: DateTime<Utc>) -> Self {
        self.processing_state = ProcessingState::InProcessing;
        self.processing_owner = Some(owner.to_string());
        self.next_available_date = Some(next_available_date);
        self
    }
}

/// A row about to be inserted; storage assigns `record_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueEntry {
    pub class_name: String,
    pub payload: String,
    pub creating_owner: String,
    pub created_date: DateTime<Utc>,
    pub user_token: Option<Uuid>,
    pub search_key1: i64,
    pub search_key2: i64,
    pub effective_date: Option<DateTime<Utc>>,
    pub future_user_token: Option<Uuid>,
    pub queue_name: Option<String>,
}

impl NewQueueEntry {
    pub fn new(envelope: EventEnvelope, creating_owner: &str, created_date: DateTime<Utc>) -> Self {
        Self {
            class_name: envelope.class_name,
            payload: envelope.payload,
            creating_owner: creating_owner.to_string(),
            created_date,
            user_token: None,
            search_key1: 0,
            search_key2: 0,
            effective_date: None,
            future_user_token: None,
            queue_name: None,
        }
    }

    pub fn with_user_token(mut self, user_token: Option<Uuid>) -> Self {
        self.user_token = user_token;
        self
    }

    pub fn with_search_keys(mut self, search_key1: i64, search_key2: i64) -> Self {
        self.search_key1 = search_key1;
        self.search_key2 = search_key2;
        self
    }

    pub fn with_notification(
        mut self,
        queue_name: &str,
        effective_date: DateTime<Utc>,
        future_user_token: Option<Uuid>,
    ) -> Self {
        self.queue_name = Some(queue_name.to_string());
        self.effective_date = Some(effective_date);
        self.future_user_token = future_user_token;
        self
    }

    /// The row as storage holds it right after insertion.
    pub fn into_entry(self, record_id: i64) -> QueueEntry {
        QueueEntry {
            record_id,
            class_name: self.class_name,
            payload: self.payload,
            creating_owner: self.creating_owner,
            created_date: self.created_date,
            user_token: self.user_token,
            search_key1: self.search_key1,
            search_key2: self.search_key2,
            processing_state: ProcessingState::Available,
            processing_owner: None,
            next_available_date: None,
            error_count: 0,
            effective_date: self.effective_date,
            future_user_token: self.future_user_token,
            queue_name: self.queue_name,
        }
    }
}

/// Optional filter on the two caller-defined search keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchKeys {
    pub search_key1: Option<i64>,
    pub search_key2: Option<i64>,
}

impl SearchKeys {
    pub fn both(search_key1: i64, search_key2: i64) -> Self {
        Self {
            search_key1: Some(search_key1),
            search_key2: Some(search_key2),
        }
    }

    pub fn key1(search_key1: i64) -> Self {
        Self {
            search_key1: Some(search_key1),
            search_key2: None,
        }
    }

    pub fn key2(search_key2: i64) -> Self {
        Self {
            search_key1: None,
            search_key2: Some(search_key2),
        }
    }

    pub fn matches(&self, entry: &QueueEntry) -> bool {
        self.search_key1.is_none_or(|k| k == entry.search_key1)
            && self.search_key2.is_none_or(|k| k == entry.search_key2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_entry() -> NewQueueEntry {
        NewQueueEntry::new(
            EventEnvelope {
                class_name: "account.created.v1".to_string(),
                payload: "{}".to_string(),
            },
            "node-a",
            Utc::now(),
        )
    }

    #[test]
    fn test_processing_state_display() {
        assert_eq!(ProcessingState::Available.to_string(), "AVAILABLE");
        assert_eq!(ProcessingState::InProcessing.to_string(), "IN_PROCESSING");
        assert_eq!(ProcessingState::Processed.to_string(), "PROCESSED");
        assert_eq!(ProcessingState::Failed.to_string(), "FAILED");
        assert_eq!(ProcessingState::Removed.to_string(), "REMOVED");
    }

    #[test]
    fn test_processing_state_from_str() {
        assert_eq!(
            "IN_PROCESSING".parse::<ProcessingState>().unwrap(),
            ProcessingState::InProcessing
        );
        assert_eq!(
            "FAILED".parse::<ProcessingState>().unwrap(),
            ProcessingState::Failed
        );
        assert!("in_processing".parse::<ProcessingState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ProcessingState::Available.is_terminal());
        assert!(!ProcessingState::InProcessing.is_terminal());
        assert!(ProcessingState::Processed.is_terminal());
        assert!(ProcessingState::Failed.is_terminal());
        assert!(ProcessingState::Removed.is_terminal());
    }

    #[test]
    fn test_inserted_entry_is_available_and_unowned() {
        let entry = new_entry().with_search_keys(7, 3).into_entry(42);
        assert_eq!(entry.record_id, 42);
        assert_eq!(entry.processing_state, ProcessingState::Available);
        assert_eq!(entry.processing_owner, None);
        assert_eq!(entry.next_available_date, None);
        assert_eq!(entry.error_count, 0);
        assert_eq!(entry.search_key1, 7);
        assert_eq!(entry.search_key2, 3);
    }

    #[test]
    fn test_bus_entry_is_ready_immediately() {
        let entry = new_entry().into_entry(1);
        assert!(entry.is_ready(Utc::now()));
    }

    #[test]
    fn test_notification_not_ready_before_effective_date() {
        let now = Utc::now();
        let entry = new_entry()
            .with_notification("invoice", now + Duration::minutes(5), None)
            .into_entry(1);
        assert!(!entry.is_ready(now));
        assert!(entry.is_ready(now + Duration::minutes(5)));
        assert_eq!(entry.event_date(), now + Duration::minutes(5));
    }

    #[test]
    fn test_claimed_entry_is_not_ready() {
        let now = Utc::now();
        let entry = new_entry()
            .into_entry(1)
            .claimed("worker-1", now + Duration::minutes(5));
        assert!(!entry.is_ready(now));
        assert!(entry.is_claimed_by("worker-1"));
        assert!(!entry.is_claimed_by("worker-2"));
    }

    #[test]
    fn test_search_keys_matching() {
        let entry = new_entry().with_search_keys(7, 3).into_entry(1);
        assert!(SearchKeys::default().matches(&entry));
        assert!(SearchKeys::key1(7).matches(&entry));
        assert!(SearchKeys::key2(3).matches(&entry));
        assert!(SearchKeys::both(7, 3).matches(&entry));
        assert!(!SearchKeys::both(7, 4).matches(&entry));
        assert!(!SearchKeys::key1(8).matches(&entry));
    }
}
