//! The migration runner.
//!
//! A [`Runner`] is one session against a backend. Opening it connects, takes the
//! migration lock and starts a transaction, in that order, then reads the migration
//! lists and the applied history. Closing it commits (or rolls back), releases the
//! lock and disconnects, in that order. The lock therefore covers the whole
//! transaction and no other runner can register or unregister anything mid-session.
//!
//! The transaction is the only durability boundary. Inside a session, migrations
//! registered before a failing one stay registered and show up in
//! [`Runner::applied_migrations`]; whether they survive depends on how the session
//! ends. [`Runner::close`] commits them, [`Runner::abort`] and dropping the runner roll
//! everything back, and [`Runner::session`] commits on `Ok` and rolls back on `Err`.
//!
//! ```
//! use flux::memory::MemoryBackend;
//! use flux::{Migration, MigrationSet, Runner, StaticSource};
//!
//! let source = StaticSource::new(MigrationSet::from_migrations(vec![
//!     Migration::new("20200101_001_users", "create table users (id int);", Some("drop table users;".into())),
//!     Migration::new("20200102_001_posts", "create table posts (id int);", Some("drop table posts;".into())),
//! ]).unwrap());
//! let mut backend = MemoryBackend::new();
//!
//! let mut runner = Runner::open(&mut backend, &source).unwrap();
//! runner.validate_applied_migrations().unwrap();
//! runner.apply_migrations(Some(1)).unwrap();
//! assert_eq!(runner.applied_migrations().len(), 1);
//! assert_eq!(runner.pending_migrations().len(), 1);
//! runner.close().unwrap();
//! ```

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::backend::MigrationBackend;
use crate::core::MigrationSet;
use crate::error::Error;
use crate::source::MigrationSource;
use crate::{AppliedMigration, Migration};

type StartHook = Box<dyn Fn(&str) + Send + Sync>;
type CompleteHook = Box<dyn Fn(&str, Duration) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&str, &Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    PreApply,
    Up,
    PostApply,
    Down,
}

impl Step {
    #[cfg(feature = "tracing")]
    fn as_str(self) -> &'static str {
        match self {
            Step::PreApply => "pre-apply",
            Step::Up => "up",
            Step::PostApply => "post-apply",
            Step::Down => "down",
        }
    }
}

/// Connection, lock and transaction held for the lifetime of a session.
///
/// Acquired in that order, released in reverse. Anything still held when the guard is
/// dropped is released with a rollback.
struct Session<'b, B: MigrationBackend + ?Sized> {
    backend: &'b mut B,
    connected: bool,
    locked: bool,
    in_transaction: bool,
}

impl<'b, B: MigrationBackend + ?Sized> Session<'b, B> {
    fn open(backend: &'b mut B) -> Result<Self, Error> {
        let mut session = Session {
            backend,
            connected: false,
            locked: false,
            in_transaction: false,
        };
        session.backend.connect()?;
        session.connected = true;
        session.backend.acquire_lock()?;
        session.locked = true;
        session.backend.begin()?;
        session.in_transaction = true;

        #[cfg(feature = "tracing")]
        tracing::debug!("Session opened");

        Ok(session)
    }

    fn finish(&mut self, commit: bool) -> Result<(), Error> {
        let mut result = Ok(());
        if self.in_transaction {
            self.in_transaction = false;
            let outcome = if commit {
                self.backend.commit()
            } else {
                self.backend.rollback()
            };
            keep_first_error(&mut result, outcome);
        }
        if self.locked {
            self.locked = false;
            keep_first_error(&mut result, self.backend.release_lock());
        }
        if self.connected {
            self.connected = false;
            keep_first_error(&mut result, self.backend.disconnect());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(committed = commit, ok = result.is_ok(), "Session closed");

        result
    }
}

impl<B: MigrationBackend + ?Sized> Drop for Session<'_, B> {
    fn drop(&mut self) {
        if self.connected || self.locked || self.in_transaction {
            if let Err(_error) = self.finish(false) {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_error, "Failed to release session resources");
            }
        }
    }
}

fn keep_first_error(result: &mut Result<(), Error>, outcome: Result<(), Error>) {
    if result.is_ok() {
        *result = outcome;
    }
}

fn sorted(mut applied: Vec<AppliedMigration>) -> Vec<AppliedMigration> {
    applied.sort_by(|a, b| a.id.cmp(&b.id));
    applied
}

/// One open migration session. See the [module docs](self).
pub struct Runner<'b, B: MigrationBackend + ?Sized> {
    session: Session<'b, B>,
    set: MigrationSet,
    applied: Vec<AppliedMigration>,
    on_migration_start: Option<StartHook>,
    on_migration_complete: Option<CompleteHook>,
    on_migration_error: Option<ErrorHook>,
}

// Manual Debug impl since closures and backends don't implement Debug
impl<B: MigrationBackend + ?Sized> std::fmt::Debug for Runner<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("migrations", &self.set)
            .field("applied", &self.applied)
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

impl<'b, B: MigrationBackend + ?Sized> Runner<'b, B> {
    /// Open a session: connect, lock, begin, initialize the history storage if needed,
    /// then read the migration lists and the applied history.
    ///
    /// If any step fails, whatever was already acquired is released before returning.
    pub fn open<S: MigrationSource + ?Sized>(backend: &'b mut B, source: &S) -> Result<Self, Error> {
        let session = Session::open(backend)?;
        let mut runner = Runner {
            session,
            set: MigrationSet::default(),
            applied: vec![],
            on_migration_start: None,
            on_migration_complete: None,
            on_migration_error: None,
        };

        if !runner.session.backend.is_initialized()? {
            #[cfg(feature = "tracing")]
            tracing::info!("Creating migration history storage");
            runner.session.backend.initialize()?;
        }

        runner.set = source.read_all()?;
        runner.refresh_applied()?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            migrations = runner.set.migrations().len(),
            pre_apply = runner.set.pre_apply().len(),
            post_apply = runner.set.post_apply().len(),
            applied = runner.applied.len(),
            "Loaded migrations"
        );

        Ok(runner)
    }

    /// Run `f` inside a session. The transaction commits if `f` returns `Ok` and rolls
    /// back if it returns `Err`.
    pub fn session<S, T, F>(backend: &'b mut B, source: &S, f: F) -> Result<T, Error>
    where
        S: MigrationSource + ?Sized,
        F: FnOnce(&mut Runner<'b, B>) -> Result<T, Error>,
    {
        let mut runner = Self::open(backend, source)?;
        match f(&mut runner) {
            Ok(value) => {
                runner.close()?;
                Ok(value)
            }
            Err(error) => {
                if let Err(_teardown) = runner.abort() {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_teardown, "Failed to roll back session");
                }
                Err(error)
            }
        }
    }

    /// Commit the transaction, release the lock and disconnect.
    pub fn close(mut self) -> Result<(), Error> {
        self.session.finish(true)
    }

    /// Roll back the transaction, release the lock and disconnect.
    pub fn abort(mut self) -> Result<(), Error> {
        self.session.finish(false)
    }

    /// Set a callback to be invoked when a migration starts.
    /// The callback receives the migration id.
    pub fn on_migration_start<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration finishes successfully.
    /// The callback receives the migration id and how long it took.
    pub fn on_migration_complete<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration fails.
    pub fn on_migration_error<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    /// Ordinary migrations, in execution order.
    pub fn migrations(&self) -> &[Migration] {
        self.set.migrations()
    }

    /// Pre-apply migrations, run at the start of every apply.
    pub fn pre_apply_migrations(&self) -> &[Migration] {
        self.set.pre_apply()
    }

    /// Post-apply migrations, run at the end of every apply.
    pub fn post_apply_migrations(&self) -> &[Migration] {
        self.set.post_apply()
    }

    /// Applied history as of the last read, sorted by id.
    pub fn applied_migrations(&self) -> &[AppliedMigration] {
        &self.applied
    }

    /// Ordinary migrations that `apply_migrations(None)` would run, in order.
    pub fn pending_migrations(&self) -> Vec<&Migration> {
        let applied = self.applied_ids();
        self.set
            .migrations()
            .iter()
            .filter(|m| !applied.contains(m.id()))
            .collect()
    }

    /// Ordinary migrations that `rollback_migrations(n)` would undo, in the order it
    /// would undo them (most recent first).
    pub fn preview_rollback(&self, n: Option<usize>) -> Vec<&Migration> {
        let applied = self.applied_ids();
        let applied_in_order: Vec<&Migration> = self
            .set
            .migrations()
            .iter()
            .filter(|m| applied.contains(m.id()))
            .collect();
        let count = n
            .unwrap_or(applied_in_order.len())
            .min(applied_in_order.len());
        applied_in_order[applied_in_order.len() - count..]
            .iter()
            .rev()
            .copied()
            .collect()
    }

    /// Check that the applied history is a contiguous prefix of the ordinary migrations
    /// and that no applied migration's forward script has changed.
    ///
    /// Read-only; fails with [`Error::Corrupted`].
    pub fn validate_applied_migrations(&self) -> Result<(), Error> {
        let Some(last) = self.applied.last() else {
            return Ok(());
        };

        let expected: Vec<&Migration> = self
            .set
            .migrations()
            .iter()
            .filter(|m| m.id() <= last.id.as_str())
            .collect();

        let expected_ids = expected.iter().map(|m| m.id());
        let applied_ids = self.applied.iter().map(|a| a.id.as_str());
        if !expected_ids.eq(applied_ids) {
            #[cfg(feature = "tracing")]
            tracing::error!(
                expected = ?expected.iter().map(|m| m.id()).collect::<Vec<_>>(),
                applied = ?self.applied.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
                "Applied migrations are not a prefix of the migration list"
            );
            return Err(Error::Corrupted(
                "There is a discontinuity in the applied migrations".to_string(),
            ));
        }

        for (migration, applied) in expected.iter().zip(&self.applied) {
            if migration.up_hash() != applied.hash {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    id = %migration.id(),
                    recorded = %applied.hash,
                    current = %migration.up_hash(),
                    "Applied migration hash mismatch"
                );
                return Err(Error::Corrupted(format!(
                    "Migration {} has changed since it was applied",
                    migration.id()
                )));
            }
        }

        Ok(())
    }

    /// Apply the first `n` pending ordinary migrations (all of them if `n` is `None`).
    ///
    /// Every pre-apply migration runs first and every post-apply migration runs last,
    /// even when nothing is pending. Stops at the first failure with [`Error::Apply`];
    /// migrations registered before the failure stay registered in this session.
    ///
    /// Returns the ids of the ordinary migrations that were applied.
    pub fn apply_migrations(&mut self, n: Option<usize>) -> Result<Vec<String>, Error> {
        let selected: Vec<Migration> = self
            .pending_migrations()
            .into_iter()
            .take(n.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            requested = ?n,
            selected = ?selected.iter().map(|m| m.id()).collect::<Vec<_>>(),
            "Considering migrations to apply"
        );

        let outcome = self.apply_selected(&selected);
        let refreshed = self.refresh_applied();
        let applied = outcome?;
        refreshed?;
        Ok(applied)
    }

    fn apply_selected(&mut self, selected: &[Migration]) -> Result<Vec<String>, Error> {
        for migration in self.set.pre_apply().to_vec() {
            self.run_step(&migration, Step::PreApply)?;
        }

        let mut applied = Vec::with_capacity(selected.len());
        for migration in selected {
            self.run_step(migration, Step::Up)?;
            applied.push(migration.id().to_string());
        }

        for migration in self.set.post_apply().to_vec() {
            self.run_step(&migration, Step::PostApply)?;
        }

        Ok(applied)
    }

    /// Roll back the last `n` applied ordinary migrations (all of them if `n` is `None`),
    /// most recent first. Migrations without a reverse script are only unregistered.
    ///
    /// Returns the ids that were rolled back, in the order they were rolled back.
    pub fn rollback_migrations(&mut self, n: Option<usize>) -> Result<Vec<String>, Error> {
        let selected: Vec<Migration> = self.preview_rollback(n).into_iter().cloned().collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            requested = ?n,
            selected = ?selected.iter().map(|m| m.id()).collect::<Vec<_>>(),
            "Considering migrations to roll back"
        );

        let outcome = self.rollback_selected(&selected);
        let refreshed = self.refresh_applied();
        let rolled_back = outcome?;
        refreshed?;
        Ok(rolled_back)
    }

    fn rollback_selected(&mut self, selected: &[Migration]) -> Result<Vec<String>, Error> {
        let mut rolled_back = Vec::with_capacity(selected.len());
        for migration in selected {
            self.run_step(migration, Step::Down)?;
            rolled_back.push(migration.id().to_string());
        }
        Ok(rolled_back)
    }

    /// Roll back the applied migration `id` together with every applied migration after
    /// it, most recent first, so the history stays a prefix. Returns the ids rolled back.
    ///
    /// Fails with [`Error::Usage`] if `id` is not currently applied, or is applied but
    /// no longer present in the migration list.
    pub fn rollback_migration(&mut self, id: &str) -> Result<Vec<String>, Error> {
        if !self.applied.iter().any(|a| a.id == id) {
            return Err(Error::Usage(format!("Migration {} is not applied", id)));
        }
        if !self.set.migrations().iter().any(|m| m.id() == id) {
            return Err(Error::Usage(format!(
                "Migration {} is applied but no longer exists in the migration list",
                id
            )));
        }

        let selected: Vec<Migration> = self
            .preview_rollback(None)
            .into_iter()
            .take_while(|m| m.id() >= id)
            .cloned()
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            target_id = id,
            selected = ?selected.iter().map(|m| m.id()).collect::<Vec<_>>(),
            "Considering migrations to roll back"
        );

        let outcome = self.rollback_selected(&selected);
        let refreshed = self.refresh_applied();
        let rolled_back = outcome?;
        refreshed?;
        Ok(rolled_back)
    }

    fn applied_ids(&self) -> HashSet<&str> {
        self.applied.iter().map(|a| a.id.as_str()).collect()
    }

    fn refresh_applied(&mut self) -> Result<(), Error> {
        self.applied = sorted(self.session.backend.get_applied_migrations()?);
        Ok(())
    }

    fn run_step(&mut self, migration: &Migration, step: Step) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "flux_migration",
            id = %migration.id(),
            step = step.as_str()
        )
        .entered();

        #[cfg(feature = "tracing")]
        tracing::info!("Starting migration");

        if let Some(ref callback) = self.on_migration_start {
            callback(migration.id());
        }

        let started = Instant::now();
        let backend = &mut *self.session.backend;
        let result = match step {
            Step::PreApply | Step::PostApply => backend.apply_migration(migration.up()),
            Step::Up => backend
                .apply_migration(migration.up())
                .and_then(|_| backend.register_migration(migration).map(|_| ())),
            Step::Down => {
                let reversed = match migration.down() {
                    Some(down) => backend.apply_migration(down),
                    None => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("No reverse script, unregistering only");
                        Ok(())
                    }
                };
                reversed.and_then(|_| backend.unregister_migration(migration))
            }
        };

        match result {
            Ok(()) => {
                let duration = started.elapsed();

                #[cfg(feature = "tracing")]
                tracing::info!(
                    duration_ms = duration.as_millis(),
                    "Migration completed successfully"
                );

                if let Some(ref callback) = self.on_migration_complete {
                    callback(migration.id(), duration);
                }
                Ok(())
            }
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %error, "Migration failed");

                if let Some(ref callback) = self.on_migration_error {
                    callback(migration.id(), &error);
                }
                Err(Error::apply(migration.id(), error))
            }
        }
    }
}
