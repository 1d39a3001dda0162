//! # Herald postgres store
//!
//! A [`DeadLetterStore`](herald_core::dead_letter::DeadLetterStore) on
//! PostgreSQL, with the embedded migrations that create its schema.

#![deny(missing_docs)]

/// The dead_letter module exports the postgres implementation of the DeadLetterStore
pub mod dead_letter;

/// Database migrations for herald_pg schema management
pub mod migrations;

pub use dead_letter::PgDeadLetterStore;
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
