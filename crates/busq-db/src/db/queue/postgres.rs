use busq_core::models::{NewQueueEntry, ProcessingState, QueueEntry, QueueTable, SearchKeys};
use busq_core::{QueueError, QueueResult};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres};

use super::QueueStorage;
use crate::db::transaction::TransactionGuard;

const BUS_COLUMNS: &str = r#"
    record_id, class_name, event_json, creating_owner, created_date, user_token,
    search_key1, search_key2, processing_state, processing_owner,
    processing_available_date, error_count,
    NULL::timestamptz AS effective_date,
    NULL::uuid AS future_user_token,
    NULL::varchar AS queue_name
"#;

const NOTIFICATION_COLUMNS: &str = r#"
    record_id, class_name, event_json, creating_owner, created_date, user_token,
    search_key1, search_key2, processing_state, processing_owner,
    processing_available_date, error_count,
    effective_date, future_user_token, queue_name
"#;

fn columns(table: &QueueTable) -> &'static str {
    if table.is_notification() {
        NOTIFICATION_COLUMNS
    } else {
        BUS_COLUMNS
    }
}

fn db_error(operation: &'static str, table: &str, err: sqlx::Error) -> QueueError {
    tracing::error!(
        error = %err,
        db.operation = operation,
        db.table = %table,
        "Queue storage operation failed"
    );
    QueueError::from(err)
}

/// `WHERE` clause of the ready query. Parameters: `$1` now (notifications
/// only), then the owner when sticky. Returns the clause and the next free
/// parameter number.
fn ready_filter(table: &QueueTable, sticky: bool) -> (String, usize) {
    let mut clause = String::from("WHERE processing_state = 'AVAILABLE'");
    let mut next = 1;
    if table.is_notification() {
        clause.push_str(&format!(" AND effective_date <= ${}", next));
        next += 1;
    }
    if sticky {
        clause.push_str(&format!(" AND creating_owner = ${}", next));
        next += 1;
    }
    (clause, next)
}

/// `WHERE` clause for search-key lookups. Parameters are bound in the order
/// search_key1, search_key2, queue_name, each only when present.
fn search_filter(keys: &SearchKeys, queue_name: Option<&str>, table: &QueueTable) -> String {
    let mut conditions: Vec<String> = Vec::new();
    let mut next = 1;
    if keys.search_key1.is_some() {
        conditions.push(format!("search_key1 = ${}", next));
        next += 1;
    }
    if keys.search_key2.is_some() {
        conditions.push(format!("search_key2 = ${}", next));
        next += 1;
    }
    if table.is_notification() && queue_name.is_some() {
        conditions.push(format!("queue_name = ${}", next));
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

fn order_by(table: &QueueTable) -> &'static str {
    if table.is_notification() {
        "ORDER BY effective_date ASC, record_id ASC"
    } else {
        "ORDER BY record_id ASC"
    }
}

/// PostgreSQL implementation of [`QueueStorage`].
///
/// Table names come from validated configuration and are interpolated; every
/// value is bound.
#[derive(Clone)]
pub struct PgQueueStorage {
    pool: PgPool,
}

impl PgQueueStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> QueueResult<()> {
        crate::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| db_error("migrate", "_sqlx_migrations", sqlx::Error::from(e)))
    }

    /// Insert a row inside a transaction owned by the caller. The row becomes
    /// visible to pollers when that transaction commits; hand the returned id
    /// to the queue's `track_committed` afterwards to use the fast path.
    #[tracing::instrument(skip(self, conn, entry), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "insert"
    ))]
    pub async fn insert_entry_in_tx(
        &self,
        conn: &mut PgConnection,
        entry: &NewQueueEntry,
        table: &QueueTable,
    ) -> QueueResult<i64> {
        Self::insert_with(conn, entry, table).await
    }

    async fn insert_with<'e, E>(
        executor: E,
        entry: &NewQueueEntry,
        table: &QueueTable,
    ) -> QueueResult<i64>
    where
        E: PgExecutor<'e>,
    {
        let sql = if table.is_notification() {
            format!(
                r#"
                INSERT INTO {} (
                    class_name, event_json, creating_owner, created_date, user_token,
                    search_key1, search_key2, processing_state, error_count,
                    effective_date, future_user_token, queue_name
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'AVAILABLE', 0, $8, $9, $10)
                RETURNING record_id
                "#,
                table.table_name
            )
        } else {
            format!(
                r#"
                INSERT INTO {} (
                    class_name, event_json, creating_owner, created_date, user_token,
                    search_key1, search_key2, processing_state, error_count
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'AVAILABLE', 0)
                RETURNING record_id
                "#,
                table.table_name
            )
        };

        let mut query = sqlx::query_scalar::<Postgres, i64>(&sql)
            .bind(&entry.class_name)
            .bind(&entry.payload)
            .bind(&entry.creating_owner)
            .bind(entry.created_date)
            .bind(entry.user_token)
            .bind(entry.search_key1)
            .bind(entry.search_key2);
        if table.is_notification() {
            query = query
                .bind(entry.effective_date.unwrap_or(entry.created_date))
                .bind(entry.future_user_token)
                .bind(&entry.queue_name);
        }

        let record_id = query
            .fetch_one(executor)
            .await
            .map_err(|e| db_error("insert", &table.table_name, e))?;

        tracing::debug!(
            record_id,
            class_name = %entry.class_name,
            table = %table.table_name,
            "Queue entry inserted"
        );

        Ok(record_id)
    }

    async fn select_for_search_keys(
        &self,
        keys: SearchKeys,
        queue_name: Option<&str>,
        table: &QueueTable,
        table_name: &str,
        operation: &'static str,
    ) -> QueueResult<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT {} FROM {} {} {}",
            columns(table),
            table_name,
            search_filter(&keys, queue_name, table),
            order_by(table)
        );

        let mut query = sqlx::query_as::<Postgres, QueueEntry>(&sql);
        if let Some(key) = keys.search_key1 {
            query = query.bind(key);
        }
        if let Some(key) = keys.search_key2 {
            query = query.bind(key);
        }
        if table.is_notification() {
            if let Some(name) = queue_name {
                query = query.bind(name);
            }
        }

        query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error(operation, table_name, e))
    }
}

#[async_trait::async_trait]
impl QueueStorage for PgQueueStorage {
    #[tracing::instrument(skip(self, entry), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "insert"
    ))]
    async fn insert_entry(&self, entry: NewQueueEntry, table: &QueueTable) -> QueueResult<i64> {
        Self::insert_with(&self.pool, &entry, table).await
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "select_ready"
    ))]
    async fn get_ready_entries(
        &self,
        now: DateTime<Utc>,
        owner: Option<&str>,
        limit: usize,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        let (filter, limit_param) = ready_filter(table, owner.is_some());
        let sql = format!(
            "SELECT {} FROM {} {} {} LIMIT ${}",
            columns(table),
            table.table_name,
            filter,
            order_by(table),
            limit_param
        );

        let mut query = sqlx::query_as::<Postgres, QueueEntry>(&sql);
        if table.is_notification() {
            query = query.bind(now);
        }
        if let Some(owner) = owner {
            query = query.bind(owner);
        }

        query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("select_ready", &table.table_name, e))
    }

    #[tracing::instrument(skip(self, record_ids), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "select_by_ids",
        count = record_ids.len()
    ))]
    async fn get_entries_from_ids(
        &self,
        record_ids: &[i64],
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        if record_ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE record_id = ANY($1) ORDER BY record_id ASC",
            columns(table),
            table.table_name
        );

        sqlx::query_as::<Postgres, QueueEntry>(&sql)
            .bind(record_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("select_by_ids", &table.table_name, e))
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "claim"
    ))]
    async fn claim_entry(
        &self,
        record_id: i64,
        now: DateTime<Utc>,
        owner: &str,
        next_available_date: DateTime<Utc>,
        table: &QueueTable,
    ) -> QueueResult<u64> {
        let effective_filter = if table.is_notification() {
            "AND effective_date <= $4"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE {}
            SET processing_state = 'IN_PROCESSING',
                processing_owner = $1,
                processing_available_date = $2
            WHERE record_id = $3
                AND processing_state = 'AVAILABLE'
                AND processing_owner IS NULL
                {}
            "#,
            table.table_name, effective_filter
        );

        let mut query = sqlx::query(&sql)
            .bind(owner)
            .bind(next_available_date)
            .bind(record_id);
        if table.is_notification() {
            query = query.bind(now);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("claim", &table.table_name, e))?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "update_on_error"
    ))]
    async fn update_on_error(
        &self,
        record_id: i64,
        _now: DateTime<Utc>,
        error_count: i32,
        table: &QueueTable,
    ) -> QueueResult<()> {
        // error_count never decreases
        let sql = format!(
            r#"
            UPDATE {}
            SET processing_state = 'AVAILABLE',
                processing_owner = NULL,
                processing_available_date = NULL,
                error_count = $2
            WHERE record_id = $1
                AND error_count <= $2
            "#,
            table.table_name
        );

        let result = sqlx::query(&sql)
            .bind(record_id)
            .bind(error_count)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("update_on_error", &table.table_name, e))?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                record_id,
                error_count,
                table = %table.table_name,
                "Entry to release after error was not found"
            );
        }

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "delete"
    ))]
    async fn remove_entry(&self, record_id: i64, table: &QueueTable) -> QueueResult<()> {
        let sql = format!("DELETE FROM {} WHERE record_id = $1", table.table_name);
        sqlx::query(&sql)
            .bind(record_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete", &table.table_name, e))?;
        Ok(())
    }

    #[tracing::instrument(skip(self, record_ids), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "delete_many",
        count = record_ids.len()
    ))]
    async fn remove_entries(&self, record_ids: &[i64], table: &QueueTable) -> QueueResult<()> {
        if record_ids.is_empty() {
            return Ok(());
        }
        let sql = format!("DELETE FROM {} WHERE record_id = ANY($1)", table.table_name);
        sqlx::query(&sql)
            .bind(record_ids)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete_many", &table.table_name, e))?;
        Ok(())
    }

    #[tracing::instrument(skip(self, entry), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "move_to_history",
        record_id = entry.record_id
    ))]
    async fn move_entry_to_history(
        &self,
        entry: &QueueEntry,
        final_state: ProcessingState,
        table: &QueueTable,
    ) -> QueueResult<bool> {
        let mut tx = TransactionGuard::begin(&self.pool, "move_to_history").await?;

        let delete_sql = format!(
            "DELETE FROM {} WHERE record_id = $1 RETURNING {}",
            table.table_name,
            columns(table)
        );
        let removed: Option<QueueEntry> = sqlx::query_as::<Postgres, QueueEntry>(&delete_sql)
            .bind(entry.record_id)
            .fetch_optional(tx.conn()?)
            .await
            .map_err(|e| db_error("move_to_history", &table.table_name, e))?;

        let Some(removed) = removed else {
            tx.rollback().await?;
            return Ok(false);
        };

        let insert_sql = if table.is_notification() {
            format!(
                r#"
                INSERT INTO {} (
                    record_id, class_name, event_json, creating_owner, created_date,
                    user_token, search_key1, search_key2, processing_state,
                    processing_owner, processing_available_date, error_count,
                    effective_date, future_user_token, queue_name
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
                table.history_table_name
            )
        } else {
            format!(
                r#"
                INSERT INTO {} (
                    record_id, class_name, event_json, creating_owner, created_date,
                    user_token, search_key1, search_key2, processing_state,
                    processing_owner, processing_available_date, error_count
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
                table.history_table_name
            )
        };

        let mut insert = sqlx::query(&insert_sql)
            .bind(removed.record_id)
            .bind(&removed.class_name)
            .bind(&removed.payload)
            .bind(&removed.creating_owner)
            .bind(removed.created_date)
            .bind(removed.user_token)
            .bind(removed.search_key1)
            .bind(removed.search_key2)
            .bind(final_state.as_str())
            .bind(&removed.processing_owner)
            .bind(removed.next_available_date)
            .bind(entry.error_count.max(removed.error_count));
        if table.is_notification() {
            insert = insert
                .bind(removed.effective_date)
                .bind(removed.future_user_token)
                .bind(&removed.queue_name);
        }

        insert
            .execute(tx.conn()?)
            .await
            .map_err(|e| db_error("move_to_history", &table.history_table_name, e))?;

        tx.commit().await?;
        Ok(true)
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "count_ready"
    ))]
    async fn get_nb_ready_entries(
        &self,
        now: DateTime<Utc>,
        owner: Option<&str>,
        table: &QueueTable,
    ) -> QueueResult<i64> {
        let (filter, _) = ready_filter(table, owner.is_some());
        let sql = format!("SELECT COUNT(*) FROM {} {}", table.table_name, filter);

        let mut query = sqlx::query_scalar::<Postgres, i64>(&sql);
        if table.is_notification() {
            query = query.bind(now);
        }
        if let Some(owner) = owner {
            query = query.bind(owner);
        }

        query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("count_ready", &table.table_name, e))
    }

    async fn get_entries_for_search_keys(
        &self,
        keys: SearchKeys,
        queue_name: Option<&str>,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        self.select_for_search_keys(keys, queue_name, table, &table.table_name, "select_by_keys")
            .await
    }

    async fn get_history_for_search_keys(
        &self,
        keys: SearchKeys,
        queue_name: Option<&str>,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        self.select_for_search_keys(
            keys,
            queue_name,
            table,
            &table.history_table_name,
            "select_history_by_keys",
        )
        .await
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "select_left_behind"
    ))]
    async fn get_in_processing_entries_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        table: &QueueTable,
    ) -> QueueResult<Vec<QueueEntry>> {
        let sql = format!(
            r#"
            SELECT {} FROM {}
            WHERE processing_state = 'IN_PROCESSING'
                AND processing_available_date < $1
            ORDER BY record_id ASC
            LIMIT $2
            "#,
            columns(table),
            table.table_name
        );

        sqlx::query_as::<Postgres, QueueEntry>(&sql)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("select_left_behind", &table.table_name, e))
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = %table.table_name,
        db.operation = "reap"
    ))]
    async fn reap_entry(
        &self,
        record_id: i64,
        owner: &str,
        next_available_date: DateTime<Utc>,
        new_owner: &str,
        table: &QueueTable,
    ) -> QueueResult<u64> {
        let sql = format!(
            r#"
            UPDATE {}
            SET processing_state = 'AVAILABLE',
                processing_owner = NULL,
                processing_available_date = NULL,
                creating_owner = $4
            WHERE record_id = $1
                AND processing_state = 'IN_PROCESSING'
                AND processing_owner = $2
                AND processing_available_date = $3
            "#,
            table.table_name
        );

        let result = sqlx::query(&sql)
            .bind(record_id)
            .bind(owner)
            .bind(next_available_date)
            .bind(new_owner)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("reap", &table.table_name, e))?;

        Ok(result.rows_affected())
    }

    async fn history_count(
        &self,
        state: Option<ProcessingState>,
        table: &QueueTable,
    ) -> QueueResult<i64> {
        let (sql, state) = match state {
            Some(state) => (
                format!(
                    "SELECT COUNT(*) FROM {} WHERE processing_state = $1",
                    table.history_table_name
                ),
                Some(state),
            ),
            None => (
                format!("SELECT COUNT(*) FROM {}", table.history_table_name),
                None,
            ),
        };

        let mut query = sqlx::query_scalar::<Postgres, i64>(&sql);
        if let Some(state) = state {
            query = query.bind(state.as_str());
        }

        query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("count_history", &table.history_table_name, e))
    }
}
