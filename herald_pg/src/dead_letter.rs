use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::dead_letter::{
    DeadLetterRecord, DeadLetterStatus, DeadLetterStore, DeadLetterStoreError, NewDeadLetter,
};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::migrations::{MigrationError, Migrator};

const COLUMNS: &str = "id, subject, event_id, data, error, retry_count, max_retries, service, \
    status, next_retry_at, created_at, processor_id, processing_started_at, completed_at";

/// Postgres representation of a dead letter.
#[derive(Debug, FromRow)]
struct PgDeadLetterRow {
    id: Uuid,
    subject: String,
    event_id: String,
    data: serde_json::Value,
    error: String,
    retry_count: i64,
    max_retries: i64,
    service: String,
    status: String,
    next_retry_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    processor_id: Option<String>,
    processing_started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

fn to_count(column: &str, value: i64) -> Result<u32, DeadLetterStoreError> {
    u32::try_from(value)
        .map_err(|_| DeadLetterStoreError::Serialization(format!("{column} out of range: {value}")))
}

impl TryFrom<PgDeadLetterRow> for DeadLetterRecord {
    type Error = DeadLetterStoreError;

    fn try_from(row: PgDeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterRecord {
            id: row.id,
            subject: row.subject,
            event_id: row.event_id,
            data: row.data,
            error: row.error,
            retry_count: to_count("retry_count", row.retry_count)?,
            max_retries: to_count("max_retries", row.max_retries)?,
            service: row.service,
            next_retry_at: row.next_retry_at,
            timestamp: row.created_at,
            status: row.status.parse()?,
            processor_id: row.processor_id,
            processing_started_at: row.processing_started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Maps driver errors onto the store's error kinds.
///
/// SQLSTATE `23505` (unique violation) becomes
/// [`DeadLetterStoreError::DuplicateKey`]; pool and I/O failures become
/// [`DeadLetterStoreError::Unavailable`].
fn store_error(err: sqlx::Error) -> DeadLetterStoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            DeadLetterStoreError::DuplicateKey(db.message().to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DeadLetterStoreError::Unavailable(err.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::Encode(_) => {
            DeadLetterStoreError::Serialization(err.to_string())
        }
        _ => DeadLetterStoreError::Database(err.to_string()),
    }
}

/// A postgres based dead letter store.
///
/// Claims run as a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
/// LOCKED)`, so concurrent reconcilers never claim the same row and never
/// block on each other.
#[derive(Clone, Debug)]
pub struct PgDeadLetterStore {
    postgres: PgPool,
}

impl PgDeadLetterStore {
    /// Creates a new `PgDeadLetterStore`.
    pub fn new(postgres: PgPool) -> Self {
        log::debug!("Creating a new PgDeadLetterStore");
        Self { postgres }
    }

    /// Applies pending schema migrations.
    pub async fn initialize(&self) -> Result<(), MigrationError> {
        Migrator::new(self.postgres.clone()).run().await?;
        Ok(())
    }

    async fn fetch_one_record(
        &self,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, PgDeadLetterRow, sqlx::postgres::PgArguments>,
    ) -> Result<Option<DeadLetterRecord>, DeadLetterStoreError> {
        query
            .fetch_optional(&self.postgres)
            .await
            .map_err(store_error)?
            .map(DeadLetterRecord::try_from)
            .transpose()
    }

    async fn execute(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<u64, DeadLetterStoreError> {
        Ok(query
            .execute(&self.postgres)
            .await
            .map_err(store_error)?
            .rows_affected())
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn insert(&self, record: NewDeadLetter) -> Result<DeadLetterRecord, DeadLetterStoreError> {
        let sql = format!(
            r#"
            INSERT INTO herald_dead_letters
                (id, subject, event_id, data, error, retry_count, max_retries, service,
                 status, next_retry_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10)
            RETURNING {COLUMNS}
            "#
        );
        let id = Uuid::new_v4();
        log::debug!(
            "Storing dead letter {} for event '{}' on '{}'",
            id,
            record.event_id,
            record.subject
        );
        let row = sqlx::query_as::<_, PgDeadLetterRow>(&sql)
            .bind(id)
            .bind(&record.subject)
            .bind(&record.event_id)
            .bind(&record.data)
            .bind(&record.error)
            .bind(i64::from(record.retry_count))
            .bind(i64::from(record.max_retries))
            .bind(&record.service)
            .bind(record.next_retry_at)
            .bind(record.timestamp)
            .fetch_one(&self.postgres)
            .await
            .map_err(store_error)?;
        row.try_into()
    }

    async fn claim_next(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<DeadLetterRecord>, DeadLetterStoreError> {
        let sql = format!(
            r#"
            UPDATE herald_dead_letters
            SET status = 'processing', processor_id = $1, processing_started_at = $2
            WHERE id = (
                SELECT id FROM herald_dead_letters
                WHERE (status = 'pending' AND next_retry_at <= $2 AND retry_count < max_retries)
                   OR (status = 'processing' AND processing_started_at < $3)
                ORDER BY next_retry_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        );
        self.fetch_one_record(
            sqlx::query_as(&sql)
                .bind(processor_id)
                .bind(now)
                .bind(stuck_before),
        )
        .await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        processor_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DeadLetterStoreError> {
        let updated = self
            .execute(
                sqlx::query(
                    r#"
                    UPDATE herald_dead_letters
                    SET status = 'completed', completed_at = $3
                    WHERE id = $1 AND status = 'processing' AND processor_id = $2
                    "#,
                )
                .bind(id)
                .bind(processor_id)
                .bind(completed_at),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        processor_id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, DeadLetterStoreError> {
        let updated = self
            .execute(
                sqlx::query(
                    r#"
                    UPDATE herald_dead_letters
                    SET status = 'pending', retry_count = $3, next_retry_at = $4, error = $5,
                        processor_id = NULL, processing_started_at = NULL
                    WHERE id = $1 AND status = 'processing' AND processor_id = $2
                    "#,
                )
                .bind(id)
                .bind(processor_id)
                .bind(i64::from(retry_count))
                .bind(next_retry_at)
                .bind(error),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        processor_id: &str,
        retry_count: u32,
        error: &str,
    ) -> Result<bool, DeadLetterStoreError> {
        let updated = self
            .execute(
                sqlx::query(
                    r#"
                    UPDATE herald_dead_letters
                    SET status = 'failed', retry_count = $3, error = $4
                    WHERE id = $1 AND status = 'processing' AND processor_id = $2
                    "#,
                )
                .bind(id)
                .bind(processor_id)
                .bind(i64::from(retry_count))
                .bind(error),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn reset_stuck(&self, stuck_before: DateTime<Utc>) -> Result<u64, DeadLetterStoreError> {
        self.execute(
            sqlx::query(
                r#"
                UPDATE herald_dead_letters
                SET status = 'pending', processor_id = NULL, processing_started_at = NULL
                WHERE status = 'processing' AND processing_started_at < $1
                "#,
            )
            .bind(stuck_before),
        )
        .await
    }

    async fn requeue(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool, DeadLetterStoreError> {
        let updated = self
            .execute(
                sqlx::query(
                    r#"
                    UPDATE herald_dead_letters
                    SET status = 'pending', next_retry_at = $2, completed_at = NULL,
                        max_retries = GREATEST(max_retries, retry_count + 1)
                    WHERE id = $1 AND status <> 'processing'
                    "#,
                )
                .bind(id)
                .bind(next_retry_at),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, DeadLetterStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM herald_dead_letters WHERE id = $1");
        self.fetch_one_record(sqlx::query_as(&sql).bind(id)).await
    }

    async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeadLetterRecord>, DeadLetterStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM herald_dead_letters
            WHERE ($1::VARCHAR IS NULL OR status = $1)
            ORDER BY created_at ASC
            LIMIT $2 OFFSET $3
            "#
        );
        let rows = sqlx::query_as::<_, PgDeadLetterRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.postgres)
            .await
            .map_err(store_error)?;
        rows.into_iter().map(DeadLetterRecord::try_from).collect()
    }

    async fn count(&self, status: Option<DeadLetterStatus>) -> Result<u64, DeadLetterStoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM herald_dead_letters WHERE ($1::VARCHAR IS NULL OR status = $1)",
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_one(&self.postgres)
        .await
        .map_err(store_error)?;
        Ok(count.max(0) as u64)
    }

    async fn remove(&self, id: Uuid) -> Result<bool, DeadLetterStoreError> {
        let deleted = self
            .execute(sqlx::query("DELETE FROM herald_dead_letters WHERE id = $1").bind(id))
            .await?;
        Ok(deleted == 1)
    }
}
