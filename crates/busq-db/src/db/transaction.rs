//! Database transaction utilities
//!
//! Moving a row to history is two statements (delete from the main table,
//! insert into the history table) that must commit together.

use busq_core::{QueueError, QueueResult};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

/// A transaction wrapper that names the queue operation it belongs to.
///
/// sqlx rolls back a transaction that is dropped without commit; the guard only
/// adds a warning so that such paths show up in the logs.
///
/// # Example
///
/// ```ignore
/// use busq_db::TransactionGuard;
///
/// async fn example(pool: &sqlx::PgPool) -> busq_core::QueueResult<()> {
///     let mut tx = TransactionGuard::begin(pool, "move_to_history").await?;
///     sqlx::query("DELETE FROM bus_events WHERE record_id = 1")
///         .execute(tx.conn()?)
///         .await?;
///     tx.commit().await
/// }
/// ```
pub struct TransactionGuard {
    transaction: Option<Transaction<'static, Postgres>>,
    operation: &'static str,
}

impl TransactionGuard {
    pub async fn begin(pool: &PgPool, operation: &'static str) -> QueueResult<Self> {
        let transaction = pool.begin().await.map_err(|e| {
            tracing::error!(error = %e, operation, "Failed to begin database transaction");
            QueueError::from(e)
        })?;

        Ok(Self {
            transaction: Some(transaction),
            operation,
        })
    }

    /// Connection bound to the open transaction.
    pub fn conn(&mut self) -> QueueResult<&mut PgConnection> {
        match self.transaction.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(QueueError::Internal(format!(
                "transaction for {} already finished",
                self.operation
            ))),
        }
    }

    pub async fn commit(mut self) -> QueueResult<()> {
        if let Some(tx) = self.transaction.take() {
            tx.commit().await.map_err(|e| {
                tracing::error!(
                    error = %e,
                    operation = self.operation,
                    "Failed to commit database transaction"
                );
                QueueError::from(e)
            })?;
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> QueueResult<()> {
        if let Some(tx) = self.transaction.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            tracing::warn!(
                operation = self.operation,
                "Transaction dropped without explicit commit or rollback, rolling back"
            );
        }
    }
}
