//! Ordered, exactly-once schema migrations.
//!
//! Applied migrations are recorded by name in `schema_versions`. A run applies every
//! pending migration in name order inside one transaction, each under its own
//! savepoint. The first failure rolls back its savepoint, the migrations applied
//! before it are still committed, and the run reports which one failed.

use std::collections::HashSet;

use rusqlite::{Connection, params};
use thiserror::Error;

use crate::error::ErrorKind;

const BOOKKEEPING: &str = "
    CREATE TABLE IF NOT EXISTS schema_versions (
        id INTEGER PRIMARY KEY,
        script_name TEXT NOT NULL UNIQUE,
        applied TEXT NOT NULL
    );
";

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration '{name}' failed after applying {}: {source}", .applied.len())]
    Failed {
        name: String,
        applied: Vec<String>,
        source: rusqlite::Error,
    },

    #[error("Duplicate migration name: {0}")]
    DuplicateName(String),
}

impl MigrationError {
    /// Every migration failure is a schema failure.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SchemaMigrationFailed
    }
}

/// One schema step.
pub trait Migration: Send + Sync {
    /// Unique name. Ordering is lexicographic on this.
    fn name(&self) -> &str;

    /// Apply the step. Runs inside a savepoint.
    fn apply(&self, conn: &Connection) -> rusqlite::Result<()>;
}

/// A migration that is a plain SQL script.
#[derive(Debug, Clone, Copy)]
pub struct SqlMigration {
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration for SqlMigration {
    fn name(&self) -> &str {
        self.name
    }

    fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(self.sql)
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Names applied by this run, in order.
    pub applied: Vec<String>,
    /// Migrations that were already recorded.
    pub skipped: usize,
}

/// Applies a fixed, name-ordered set of migrations.
pub struct Migrator {
    migrations: Vec<Box<dyn Migration>>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.migrations.iter().map(|m| m.name()))
            .finish()
    }
}

impl Migrator {
    /// Sort migrations by name and reject duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::DuplicateName`] if two migrations share a name.
    pub fn new(mut migrations: Vec<Box<dyn Migration>>) -> Result<Self, MigrationError> {
        migrations.sort_by(|a, b| a.name().cmp(b.name()));
        for pair in migrations.windows(2) {
            if pair[0].name() == pair[1].name() {
                return Err(MigrationError::DuplicateName(pair[0].name().to_string()));
            }
        }
        Ok(Self { migrations })
    }

    /// Names recorded in the bookkeeping table.
    ///
    /// # Errors
    ///
    /// Propagates SQLite errors.
    pub fn applied(conn: &Connection) -> Result<Vec<String>, MigrationError> {
        conn.execute_batch(BOOKKEEPING)?;
        let mut stmt = conn.prepare("SELECT script_name FROM schema_versions ORDER BY script_name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    /// Apply every pending migration.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Failed`] naming the failing migration. Migrations
    /// applied earlier in the same run stay committed.
    pub fn run(&self, conn: &mut Connection) -> Result<MigrationReport, MigrationError> {
        let done: HashSet<String> = Self::applied(conn)?.into_iter().collect();
        let mut report = MigrationReport::default();
        let mut failure = None;

        let mut tx = conn.transaction()?;
        for (index, migration) in self.migrations.iter().enumerate() {
            let name = migration.name();
            if done.contains(name) {
                report.skipped += 1;
                continue;
            }

            tracing::info!(migration = name, "applying schema migration");
            let mut savepoint = tx.savepoint_with_name(format!("migration_{index}"))?;
            let result = migration.apply(&savepoint).and_then(|()| {
                savepoint
                    .execute(
                        "INSERT INTO schema_versions (script_name, applied) VALUES (?1, ?2)",
                        params![name, chrono::Utc::now().to_rfc3339()],
                    )
                    .map(|_| ())
            });

            match result {
                Ok(()) => {
                    savepoint.commit()?;
                    report.applied.push(name.to_string());
                }
                Err(source) => {
                    savepoint.rollback()?;
                    failure = Some((name.to_string(), source));
                    break;
                }
            }
        }
        tx.commit()?;

        match failure {
            Some((name, source)) => {
                tracing::warn!(migration = %name, error = %source, "schema migration failed");
                Err(MigrationError::Failed {
                    name,
                    applied: report.applied,
                    source,
                })
            }
            None => Ok(report),
        }
    }
}
