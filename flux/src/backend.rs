//! The contract between the runner and a database.
//!
//! A backend owns exactly one connection at a time. The runner drives it through a
//! fixed bracket:
//!
//! ```text
//! connect -> acquire_lock -> begin -> ... -> commit | rollback -> release_lock -> disconnect
//! ```
//!
//! Every acquire is paired with its release by the runner's session guard, on success,
//! on error, and when the guard is dropped during unwinding. Backends only have to make
//! each step do what it says.
//!
//! `apply_migration`, `register_migration` and `unregister_migration` run inside the
//! transaction opened by `begin`; none of them may commit or roll back on their own.

use crate::error::Error;
use crate::{AppliedMigration, Migration};

/// Default name of the history table.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "_flux_migrations";

/// A database the runner can apply migrations to.
pub trait MigrationBackend {
    /// Open the connection used for the rest of the session.
    fn connect(&mut self) -> Result<(), Error>;

    /// Close the connection opened by [`connect`](Self::connect).
    fn disconnect(&mut self) -> Result<(), Error>;

    /// Take the cross-process migration lock, blocking until it is available.
    ///
    /// This must exclude other runner *processes*, not just other threads, from opening
    /// a session against the same database until [`release_lock`](Self::release_lock).
    fn acquire_lock(&mut self) -> Result<(), Error>;

    /// Release the migration lock.
    fn release_lock(&mut self) -> Result<(), Error>;

    /// Start the session transaction.
    fn begin(&mut self) -> Result<(), Error>;

    /// Commit the session transaction.
    fn commit(&mut self) -> Result<(), Error>;

    /// Discard everything done since [`begin`](Self::begin).
    fn rollback(&mut self) -> Result<(), Error>;

    /// Whether the history storage exists.
    fn is_initialized(&mut self) -> Result<bool, Error>;

    /// Create the history storage. Only called when `is_initialized` returned false.
    fn initialize(&mut self) -> Result<(), Error>;

    /// Record `migration` as applied with its current `up_hash`.
    /// Fails if a record with the same id already exists.
    fn register_migration(&mut self, migration: &Migration) -> Result<AppliedMigration, Error>;

    /// Remove the applied record for `migration`.
    fn unregister_migration(&mut self, migration: &Migration) -> Result<(), Error>;

    /// Execute a script. Used for both forward and reverse scripts; must not touch the
    /// history storage.
    fn apply_migration(&mut self, content: &str) -> Result<(), Error>;

    /// Read the full history storage.
    fn get_applied_migrations(&mut self) -> Result<Vec<AppliedMigration>, Error>;
}

impl<B: MigrationBackend + ?Sized> MigrationBackend for Box<B> {
    fn connect(&mut self) -> Result<(), Error> {
        (**self).connect()
    }
    fn disconnect(&mut self) -> Result<(), Error> {
        (**self).disconnect()
    }
    fn acquire_lock(&mut self) -> Result<(), Error> {
        (**self).acquire_lock()
    }
    fn release_lock(&mut self) -> Result<(), Error> {
        (**self).release_lock()
    }
    fn begin(&mut self) -> Result<(), Error> {
        (**self).begin()
    }
    fn commit(&mut self) -> Result<(), Error> {
        (**self).commit()
    }
    fn rollback(&mut self) -> Result<(), Error> {
        (**self).rollback()
    }
    fn is_initialized(&mut self) -> Result<bool, Error> {
        (**self).is_initialized()
    }
    fn initialize(&mut self) -> Result<(), Error> {
        (**self).initialize()
    }
    fn register_migration(&mut self, migration: &Migration) -> Result<AppliedMigration, Error> {
        (**self).register_migration(migration)
    }
    fn unregister_migration(&mut self, migration: &Migration) -> Result<(), Error> {
        (**self).unregister_migration(migration)
    }
    fn apply_migration(&mut self, content: &str) -> Result<(), Error> {
        (**self).apply_migration(content)
    }
    fn get_applied_migrations(&mut self) -> Result<Vec<AppliedMigration>, Error> {
        (**self).get_applied_migrations()
    }
}

/// History table names are interpolated into SQL, so only `[A-Za-z0-9_]+` is allowed.
pub(crate) fn validate_table_name(name: &str) -> Result<(), Error> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid migrations table name '{}'. Only letters, digits and '_' are allowed.",
            name
        )))
    }
}

/// Read an optional string key from a backend's `[backend]` table.
pub(crate) fn string_option(config: &toml::Table, key: &str) -> Result<Option<String>, Error> {
    match config.get(key) {
        None => Ok(None),
        Some(toml::Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(Error::Config(format!(
            "backend.{} must be a string, found {}",
            key,
            other.type_str()
        ))),
    }
}

/// Read an optional integer key from a backend's `[backend]` table.
pub(crate) fn integer_option(config: &toml::Table, key: &str) -> Result<Option<i64>, Error> {
    match config.get(key) {
        None => Ok(None),
        Some(toml::Value::Integer(value)) => Ok(Some(*value)),
        Some(other) => Err(Error::Config(format!(
            "backend.{} must be an integer, found {}",
            key,
            other.type_str()
        ))),
    }
}
