//! Migration 002: index for the operator listing, filtered by status and
//! ordered by age.

use super::Migration;

/// Adds `(status, created_at)` on `herald_dead_letters`.
pub struct AddDeadLetterListingIndex;

impl Migration for AddDeadLetterListingIndex {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "add_dead_letter_listing_index"
    }

    fn statements(&self) -> &'static [&'static str] {
        &[r#"
            CREATE INDEX IF NOT EXISTS idx_herald_dead_letters_status_created
            ON herald_dead_letters (status, created_at)
            "#]
    }
}
