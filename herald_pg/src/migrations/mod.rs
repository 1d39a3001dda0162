//! Embedded, forward-only schema migrations for herald_pg.
//!
//! Applied migrations are recorded in `_herald_migrations` together with a
//! SHA-256 checksum of their version, name and SQL, so that editing a migration
//! after it shipped is detected instead of silently diverging.
//!
//! ```rust,ignore
//! use herald_pg::Migrator;
//!
//! let migrator = Migrator::new(pool);
//! let applied = migrator.run().await?;
//! log::info!("schema at version {}", migrator.current_version().await?);
//! ```
//!
//! New migrations go in a new `mXXX_description.rs` file and at the end of
//! [`MIGRATIONS`].

mod m001_create_dead_letters_table;
mod m002_add_dead_letter_listing_index;

use m001_create_dead_letters_table::CreateDeadLettersTable;
use m002_add_dead_letter_listing_index::AddDeadLetterListingIndex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;

/// All migrations, in the order they are applied.
const MIGRATIONS: &[&dyn Migration] = &[&CreateDeadLettersTable, &AddDeadLetterListingIndex];

/// Errors that can occur while migrating.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An applied migration no longer matches its definition.
    #[error("Migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// Version of the migration.
        version: i64,
        /// Name of the migration.
        name: String,
        /// Checksum recorded when it was applied.
        expected: String,
        /// Checksum of the current definition.
        found: String,
    },

    /// A migration statement failed.
    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        /// Version of the migration.
        version: i64,
        /// Name of the migration.
        name: String,
        /// The database error.
        reason: String,
    },
}

/// A single schema change.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, increasing version number.
    fn version(&self) -> i64;

    /// Human-readable name, e.g. `create_dead_letters_table`.
    fn name(&self) -> &'static str;

    /// The SQL statements of this migration, executed in order.
    fn statements(&self) -> &'static [&'static str];

    /// Executes the migration inside the migrator's transaction.
    ///
    /// Must not commit or roll back.
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        for statement in self.statements() {
            sqlx::query(statement).execute(&mut **tx).await?;
        }
        Ok(())
    }

    /// SHA-256 over version, name and statements.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_le_bytes());
        hasher.update(self.name().as_bytes());
        for statement in self.statements() {
            hasher.update(statement.trim().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A migration recorded in `_herald_migrations`.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    /// Version of the migration.
    pub version: i64,
    /// Name of the migration.
    pub name: String,
    /// When it was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// Checksum recorded when it was applied.
    pub checksum: String,
}

/// Applies herald's migrations in order, each exactly once.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a migrator on the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _herald_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn verify(applied: &[AppliedMigration]) -> Result<(), MigrationError> {
        for record in applied {
            let Some(migration) = MIGRATIONS.iter().find(|m| m.version() == record.version) else {
                log::warn!(
                    "Applied migration {} ({}) is unknown to this version of herald_pg",
                    record.version,
                    record.name
                );
                continue;
            };
            let found = migration.checksum();
            if found != record.checksum {
                return Err(MigrationError::ChecksumMismatch {
                    version: record.version,
                    name: record.name.clone(),
                    expected: record.checksum.clone(),
                    found,
                });
            }
        }
        Ok(())
    }

    async fn apply(&self, migration: &dyn Migration) -> Result<(), MigrationError> {
        log::info!(
            "Running migration {} ({})...",
            migration.version(),
            migration.name()
        );
        let mut tx = self.pool.begin().await?;

        migration.up(&mut tx).await.map_err(|e| match e {
            MigrationError::Database(db_err) => MigrationError::MigrationFailed {
                version: migration.version(),
                name: migration.name().to_string(),
                reason: db_err.to_string(),
            },
            other => other,
        })?;

        sqlx::query("INSERT INTO _herald_migrations (version, name, checksum) VALUES ($1, $2, $3)")
            .bind(migration.version())
            .bind(migration.name())
            .bind(migration.checksum())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        log::info!(
            "Migration {} ({}) applied",
            migration.version(),
            migration.name()
        );
        Ok(())
    }

    /// Applies every pending migration, each in its own transaction.
    ///
    /// Fails without applying anything if an applied migration's checksum
    /// changed. Returns how many migrations were applied.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        let applied = self.applied().await?;
        Self::verify(&applied)?;

        let done: HashSet<i64> = applied.iter().map(|m| m.version).collect();
        let mut count = 0;
        for migration in MIGRATIONS.iter().filter(|m| !done.contains(&m.version())) {
            self.apply(*migration).await?;
            count += 1;
        }
        if count == 0 {
            log::debug!("Schema is up to date");
        }
        Ok(count)
    }

    /// Highest applied version, `0` if none.
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_tracking_table().await?;
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM _herald_migrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    /// Migrations not applied yet, in order.
    pub async fn pending(&self) -> Result<Vec<&'static dyn Migration>, MigrationError> {
        let done: HashSet<i64> = self.applied().await?.iter().map(|m| m.version).collect();
        Ok(MIGRATIONS
            .iter()
            .filter(|m| !done.contains(&m.version()))
            .copied()
            .collect())
    }

    /// Applied migrations, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;
        let rows = sqlx::query(
            "SELECT version, name, applied_at, checksum FROM _herald_migrations ORDER BY version ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AppliedMigration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: row.get("applied_at"),
                checksum: row.get("checksum"),
            })
            .collect())
    }
}
