//! In-memory reference backend.
//!
//! [`MemoryBackend`] keeps its "database" in process memory: the history table plus a
//! log of every script it executed. Clones share the same state, so two clones on two
//! threads behave like two runner processes pointed at one database: the migration lock
//! blocks the second until the first releases it.
//!
//! Everything done inside a transaction is staged and only becomes visible to other
//! handles on commit. Rollback throws the staged copy away, including executed scripts.
//!
//! ```
//! use flux::memory::MemoryBackend;
//! use flux::{Migration, MigrationSet, Runner, StaticSource};
//!
//! let mut backend = MemoryBackend::new();
//! let source = StaticSource::new(MigrationSet::from_migrations(vec![
//!     Migration::new("20200101_001_users", "create table users (id int);", None),
//! ]).unwrap());
//!
//! Runner::session(&mut backend, &source, |runner| {
//!     runner.apply_migrations(None)?;
//!     Ok(())
//! }).unwrap();
//!
//! assert_eq!(backend.applied_ids(), vec!["20200101_001_users".to_string()]);
//! assert_eq!(backend.executed_scripts(), vec!["create table users (id int);".to_string()]);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use chrono::Utc;

use crate::backend::MigrationBackend;
use crate::error::Error;
use crate::{AppliedMigration, Migration};

#[derive(Debug, Default, Clone)]
struct Database {
    initialized: bool,
    applied: BTreeMap<String, AppliedMigration>,
    executed: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: Database,
    locked: bool,
    failing_scripts: HashSet<String>,
}

/// A [`MigrationBackend`] that stores everything in memory.
#[derive(Debug)]
pub struct MemoryBackend {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    connected: bool,
    holds_lock: bool,
    staged: Option<Database>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryBackend {
    /// A new, disconnected handle onto the same database.
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            connected: false,
            holds_lock: false,
            staged: None,
        }
    }
}

impl MemoryBackend {
    /// Create an empty, uninitialized database.
    pub fn new() -> Self {
        Self {
            shared: Arc::new((Mutex::new(Shared::default()), Condvar::new())),
            connected: false,
            holds_lock: false,
            staged: None,
        }
    }

    /// Make every future execution of `script` fail.
    pub fn fail_on(&self, script: impl Into<String>) {
        if let Ok(mut shared) = self.shared.0.lock() {
            shared.failing_scripts.insert(script.into());
        }
    }

    /// Committed applied migration ids, sorted.
    pub fn applied_ids(&self) -> Vec<String> {
        self.shared
            .0
            .lock()
            .map(|shared| shared.committed.applied.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed history records, sorted by id.
    pub fn applied_records(&self) -> Vec<AppliedMigration> {
        self.shared
            .0
            .lock()
            .map(|shared| shared.committed.applied.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every script executed by committed transactions, in execution order.
    pub fn executed_scripts(&self) -> Vec<String> {
        self.shared
            .0
            .lock()
            .map(|shared| shared.committed.executed.clone())
            .unwrap_or_default()
    }

    /// Whether any handle currently holds the migration lock.
    pub fn is_locked(&self) -> bool {
        self.shared
            .0
            .lock()
            .map(|shared| shared.locked)
            .unwrap_or(false)
    }

    /// Overwrite a committed history record, e.g. to simulate a stale hash.
    pub fn set_recorded_hash(&self, id: &str, hash: impl Into<String>) {
        if let Ok(mut shared) = self.shared.0.lock() {
            if let Some(record) = shared.committed.applied.get_mut(id) {
                record.hash = hash.into();
            }
        }
    }

    fn lock_shared(&self) -> Result<MutexGuard<'_, Shared>, Error> {
        self.shared
            .0
            .lock()
            .map_err(|_| Error::Generic("in-memory database state is poisoned".to_string()))
    }

    fn require_connection(&self) -> Result<(), Error> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::Generic("not connected".to_string()))
        }
    }

    fn staged(&mut self) -> Result<&mut Database, Error> {
        self.staged
            .as_mut()
            .ok_or_else(|| Error::Generic("no open transaction".to_string()))
    }

    fn unlock(&mut self) -> Result<(), Error> {
        let (_, condvar) = &*self.shared;
        let mut shared = self.lock_shared()?;
        shared.locked = false;
        drop(shared);
        self.holds_lock = false;
        condvar.notify_all();
        Ok(())
    }
}

impl Drop for MemoryBackend {
    // A dropped connection gives up its lock, like a closed database session would.
    fn drop(&mut self) {
        if self.holds_lock {
            let _ = self.unlock();
        }
    }
}

impl MigrationBackend for MemoryBackend {
    fn connect(&mut self) -> Result<(), Error> {
        if self.connected {
            return Err(Error::Generic("already connected".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.staged = None;
        if self.holds_lock {
            self.unlock()?;
        }
        self.connected = false;
        Ok(())
    }

    fn acquire_lock(&mut self) -> Result<(), Error> {
        self.require_connection()?;
        if self.holds_lock {
            return Err(Error::Generic("migration lock already held".to_string()));
        }
        let (mutex, condvar) = &*self.shared;
        let mut shared = mutex
            .lock()
            .map_err(|_| Error::Generic("in-memory database state is poisoned".to_string()))?;
        while shared.locked {
            shared = condvar
                .wait(shared)
                .map_err(|_| Error::Generic("in-memory database state is poisoned".to_string()))?;
        }
        shared.locked = true;
        drop(shared);
        self.holds_lock = true;
        Ok(())
    }

    fn release_lock(&mut self) -> Result<(), Error> {
        if !self.holds_lock {
            return Err(Error::Generic("migration lock not held".to_string()));
        }
        self.unlock()
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.require_connection()?;
        if self.staged.is_some() {
            return Err(Error::Generic("transaction already open".to_string()));
        }
        let snapshot = self.lock_shared()?.committed.clone();
        self.staged = Some(snapshot);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| Error::Generic("no open transaction".to_string()))?;
        self.lock_shared()?.committed = staged;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.staged
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::Generic("no open transaction".to_string()))
    }

    fn is_initialized(&mut self) -> Result<bool, Error> {
        Ok(self.staged()?.initialized)
    }

    fn initialize(&mut self) -> Result<(), Error> {
        self.staged()?.initialized = true;
        Ok(())
    }

    fn register_migration(&mut self, migration: &Migration) -> Result<AppliedMigration, Error> {
        let db = self.staged()?;
        if !db.initialized {
            return Err(Error::Generic("history table does not exist".to_string()));
        }
        if db.applied.contains_key(migration.id()) {
            return Err(Error::Generic(format!(
                "migration {} is already registered",
                migration.id()
            )));
        }
        let applied = AppliedMigration {
            id: migration.id().to_string(),
            hash: migration.up_hash(),
            applied_at: Utc::now(),
        };
        db.applied.insert(applied.id.clone(), applied.clone());
        Ok(applied)
    }

    fn unregister_migration(&mut self, migration: &Migration) -> Result<(), Error> {
        self.staged()?.applied.remove(migration.id());
        Ok(())
    }

    fn apply_migration(&mut self, content: &str) -> Result<(), Error> {
        let fails = self.lock_shared()?.failing_scripts.contains(content);
        let db = self.staged()?;
        if fails {
            return Err(Error::Generic(format!("script failed: {}", content)));
        }
        db.executed.push(content.to_string());
        Ok(())
    }

    fn get_applied_migrations(&mut self) -> Result<Vec<AppliedMigration>, Error> {
        let db = self.staged()?;
        if !db.initialized {
            return Err(Error::Generic("history table does not exist".to_string()));
        }
        Ok(db.applied.values().cloned().collect())
    }
}
