//! # SQLite backend
//!
//! [`SqliteBackend`] runs migrations against a SQLite database file using the
//! [`rusqlite`](https://crates.io/crates/rusqlite) crate.
//!
//! ## Locking and transactions
//!
//! SQLite has no advisory locks, so the migration lock is an outer `BEGIN EXCLUSIVE`
//! transaction. While it is held no other connection can write to the database, and
//! another runner trying to take the lock waits for up to `busy_timeout_ms` before
//! failing. The session transaction is a savepoint nested inside it, and each script
//! runs in its own savepoint so a failing script leaves nothing half-applied.
//!
//! Because everything runs inside that outer transaction, migration scripts must not
//! contain their own `BEGIN`/`COMMIT` statements.
//!
//! ## Configuration
//!
//! ```toml
//! [flux]
//! backend = "sqlite"
//! migration_directory = "migrations"
//!
//! [backend]
//! database = "app.db"              # default ":memory:"
//! migrations_table = "_flux_migrations"
//! busy_timeout_ms = 30000
//! ```
//!
//! ## Example
//!
//! ```
//! use flux::sqlite::SqliteBackend;
//! use flux::{Migration, MigrationSet, Runner, StaticSource};
//!
//! let dir = tempfile::TempDir::new().unwrap();
//! let mut backend = SqliteBackend::new(dir.path().join("app.db").to_string_lossy());
//! let source = StaticSource::new(MigrationSet::from_migrations(vec![
//!     Migration::new(
//!         "20200101_001_users",
//!         "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);",
//!         Some("DROP TABLE users;".to_string()),
//!     ),
//! ]).unwrap());
//!
//! let applied = Runner::session(&mut backend, &source, |runner| {
//!     runner.validate_applied_migrations()?;
//!     runner.apply_migrations(None)
//! }).unwrap();
//! assert_eq!(applied, vec!["20200101_001_users".to_string()]);
//! ```

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::backend::{
    integer_option, string_option, validate_table_name, MigrationBackend,
    DEFAULT_MIGRATIONS_TABLE,
};
use crate::error::Error;
use crate::{AppliedMigration, Migration};

/// Default database when `backend.database` is omitted.
pub const DEFAULT_DATABASE: &str = ":memory:";

/// Default time to wait for another runner's lock, in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

const SESSION_SAVEPOINT: &str = "flux_session";
const STEP_SAVEPOINT: &str = "flux_step";

/// A [`MigrationBackend`] for SQLite. See the [module docs](self).
#[derive(Debug)]
pub struct SqliteBackend {
    database: String,
    migrations_table: String,
    busy_timeout: Duration,
    conn: Option<Connection>,
}

impl SqliteBackend {
    /// Create a backend for the database at `database` (a path, or `:memory:`).
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            conn: None,
        }
    }

    /// Build a backend from a `[backend]` config table.
    pub fn from_config(config: &toml::Table) -> Result<Self, Error> {
        let database =
            string_option(config, "database")?.unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        let mut backend = Self::new(database);
        if let Some(table) = string_option(config, "migrations_table")? {
            backend = backend.with_migrations_table(table)?;
        }
        if let Some(ms) = integer_option(config, "busy_timeout_ms")? {
            let ms = u64::try_from(ms).map_err(|_| {
                Error::Config(format!("backend.busy_timeout_ms must not be negative, got {}", ms))
            })?;
            backend = backend.with_busy_timeout(Duration::from_millis(ms));
        }
        Ok(backend)
    }

    /// Set a custom name for the history table.
    /// Defaults to `_flux_migrations`.
    pub fn with_migrations_table(mut self, name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        validate_table_name(&name)?;
        self.migrations_table = name;
        Ok(self)
    }

    /// How long to wait for another connection's lock before failing.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn migrations_table(&self) -> &str {
        &self.migrations_table
    }

    fn conn(&self) -> Result<&Connection, Error> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Generic("not connected".to_string()))
    }

    /// Run `f` inside its own savepoint, undoing its partial effects if it fails.
    fn in_savepoint<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let conn = self.conn()?;
        conn.execute_batch(&format!("SAVEPOINT {}", STEP_SAVEPOINT))?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch(&format!("RELEASE SAVEPOINT {}", STEP_SAVEPOINT))?;
                Ok(value)
            }
            Err(error) => {
                if !conn.is_autocommit() {
                    conn.execute_batch(&format!(
                        "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
                        STEP_SAVEPOINT
                    ))?;
                }
                Err(error)
            }
        }
    }
}

impl MigrationBackend for SqliteBackend {
    fn connect(&mut self) -> Result<(), Error> {
        let conn = Connection::open(&self.database)?;
        conn.busy_timeout(self.busy_timeout)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(database = %self.database, "Connected to SQLite database");

        self.conn = Some(conn);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| Error::from(e))?;
        }
        Ok(())
    }

    fn acquire_lock(&mut self) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        tracing::debug!("Waiting for exclusive database lock");

        self.conn()?.execute_batch("BEGIN EXCLUSIVE")?;
        Ok(())
    }

    fn release_lock(&mut self) -> Result<(), Error> {
        let conn = self.conn()?;
        // Some errors make SQLite roll back the whole transaction by itself.
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.conn()?
            .execute_batch(&format!("SAVEPOINT {}", SESSION_SAVEPOINT))?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.conn()?
            .execute_batch(&format!("RELEASE SAVEPOINT {}", SESSION_SAVEPOINT))?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
                SESSION_SAVEPOINT
            ))?;
        }
        Ok(())
    }

    fn is_initialized(&mut self) -> Result<bool, Error> {
        let exists = self
            .conn()?
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                [&self.migrations_table],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    fn initialize(&mut self) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        tracing::info!("Creating migration history table: {}", self.migrations_table);

        self.conn()?.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (id text primary key not null, hash text not null, applied_at text not null)",
                self.migrations_table
            ),
            [],
        )?;
        Ok(())
    }

    fn register_migration(&mut self, migration: &Migration) -> Result<AppliedMigration, Error> {
        let applied = AppliedMigration {
            id: migration.id().to_string(),
            hash: migration.up_hash(),
            applied_at: Utc::now(),
        };
        self.in_savepoint(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (id, hash, applied_at) VALUES (?1, ?2, ?3)",
                    self.migrations_table
                ),
                params![applied.id, applied.hash, applied.applied_at.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(applied)
    }

    fn unregister_migration(&mut self, migration: &Migration) -> Result<(), Error> {
        self.conn()?.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.migrations_table),
            [migration.id()],
        )?;
        Ok(())
    }

    fn apply_migration(&mut self, content: &str) -> Result<(), Error> {
        self.in_savepoint(|conn| {
            conn.execute_batch(content)?;
            Ok(())
        })
    }

    fn get_applied_migrations(&mut self) -> Result<Vec<AppliedMigration>, Error> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, hash, applied_at FROM {} ORDER BY id",
            self.migrations_table
        ))?;

        let migrations = stmt
            .query_map([], |row| {
                let applied_at_str: String = row.get(2)?;
                let applied_at = chrono::DateTime::parse_from_rfc3339(&applied_at_str)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?
                    .with_timezone(&Utc);

                Ok(AppliedMigration {
                    id: row.get(0)?,
                    hash: row.get(1)?,
                    applied_at,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(migrations)
    }
}
