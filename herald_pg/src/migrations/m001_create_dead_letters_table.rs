//! Migration 001: the dead-letter table and the indexes behind claiming.

use super::Migration;

/// Creates `herald_dead_letters`.
///
/// The partial indexes back the two claim predicates: due `pending` records
/// ordered by `next_retry_at`, and `processing` records older than the stuck
/// cut-off.
pub struct CreateDeadLettersTable;

impl Migration for CreateDeadLettersTable {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_dead_letters_table"
    }

    fn statements(&self) -> &'static [&'static str] {
        &[
            r#"
            CREATE TABLE IF NOT EXISTS herald_dead_letters (
                id UUID PRIMARY KEY,
                subject VARCHAR(255) NOT NULL,
                event_id VARCHAR(512) NOT NULL,
                data JSONB NOT NULL,
                error TEXT NOT NULL,
                retry_count BIGINT NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
                max_retries BIGINT NOT NULL CHECK (max_retries >= 0),
                service VARCHAR(255) NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
                next_retry_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                processor_id VARCHAR(255),
                processing_started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_herald_dead_letters_due
            ON herald_dead_letters (next_retry_at)
            WHERE status = 'pending'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_herald_dead_letters_stuck
            ON herald_dead_letters (processing_started_at)
            WHERE status = 'processing'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_herald_dead_letters_event
            ON herald_dead_letters (subject, event_id)
            "#,
        ]
    }
}
