use crate::error::Error;
use chrono::Utc;
use sha2::{Digest, Sha256};

/// A single migration: an id, a forward script and an optional reverse script.
///
/// Scripts are opaque to the runner; they are handed to the backend unchanged.
///
/// # IMPORTANT WARNING
///
/// **Once a migration has been applied to any database, neither its id nor its `up`
/// content may change.** The id decides execution order and the hash of `up` is
/// recorded when the migration is applied; editing either makes validation fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    id: String,
    up: String,
    down: Option<String>,
}

impl Migration {
    /// Create a migration. `id`s sort lexicographically in execution order,
    /// conventionally a date-time prefix, a sequence number and a slug
    /// (e.g. `20200101_001_create_users`).
    pub fn new(id: impl Into<String>, up: impl Into<String>, down: Option<String>) -> Self {
        Self {
            id: id.into(),
            up: up.into(),
            down,
        }
    }

    /// Returns the id of this migration.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the forward script.
    pub fn up(&self) -> &str {
        &self.up
    }

    /// Returns the reverse script, if the migration is reversible.
    pub fn down(&self) -> Option<&str> {
        self.down.as_deref()
    }

    /// SHA-256 hex digest of the forward script.
    /// Recomputed on every call so edits to `up` are always observed.
    pub fn up_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.up.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Represents a migration that has been applied to the database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppliedMigration {
    /// The id of the migration.
    pub id: String,
    /// The hash of the migration's `up` script at the time it was applied.
    pub hash: String,
    /// The timestamp when the migration was applied.
    pub applied_at: chrono::DateTime<Utc>,
}

/// The three ordered migration lists a session works with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSet {
    pre_apply: Vec<Migration>,
    migrations: Vec<Migration>,
    post_apply: Vec<Migration>,
}

impl MigrationSet {
    /// Create a new MigrationSet, validating migration invariants.
    /// Each list must have non-empty, unique ids in strictly increasing order.
    pub fn try_new(
        pre_apply: Vec<Migration>,
        migrations: Vec<Migration>,
        post_apply: Vec<Migration>,
    ) -> Result<Self, Error> {
        check_order("pre-apply", &pre_apply)?;
        check_order("ordinary", &migrations)?;
        check_order("post-apply", &post_apply)?;
        Ok(Self {
            pre_apply,
            migrations,
            post_apply,
        })
    }

    /// Convenience constructor for a set with only ordinary migrations.
    pub fn from_migrations(migrations: Vec<Migration>) -> Result<Self, Error> {
        Self::try_new(vec![], migrations, vec![])
    }

    /// Repeatable migrations run before the ordinary ones.
    pub fn pre_apply(&self) -> &[Migration] {
        &self.pre_apply
    }

    /// Ordinary migrations, sorted by id.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Repeatable migrations run after the ordinary ones.
    pub fn post_apply(&self) -> &[Migration] {
        &self.post_apply
    }
}

fn check_order(kind: &str, migrations: &[Migration]) -> Result<(), Error> {
    for (i, migration) in migrations.iter().enumerate() {
        if migration.id().is_empty() {
            return Err(Error::Loading(format!(
                "Found a {} migration with an empty id",
                kind
            )));
        }
        if i == 0 {
            continue;
        }
        let previous = migrations[i - 1].id();
        if previous == migration.id() {
            return Err(Error::Loading(format!(
                "Duplicate {} migration id found: {}",
                kind,
                migration.id()
            )));
        }
        if previous > migration.id() {
            return Err(Error::Loading(format!(
                "{} migrations are out of order: {} is listed after {}",
                kind,
                migration.id(),
                previous
            )));
        }
    }
    Ok(())
}
