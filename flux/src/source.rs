//! Where migrations come from.
//!
//! A [`MigrationSource`] hands the runner three sorted lists once per session. The
//! runner never looks at files itself.
//!
//! ## Directory layout
//!
//! [`DirectorySource`] reads a directory laid out like this:
//!
//! ```text
//! migrations/
//! ├── 20200101_001_create_users.sql        forward script
//! ├── 20200101_001_create_users.undo.sql   optional reverse script
//! ├── 20200102_001_add_email.sql
//! ├── pre-apply/
//! │   └── 20200101_000_settings.sql        run before every apply
//! └── post-apply/
//!     └── 20200101_000_refresh_views.sql   run after every apply
//! ```
//!
//! The file stem is the migration id. Pre-apply and post-apply migrations are re-run
//! every time, so they cannot have an `.undo.sql` file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::MigrationSet;
use crate::error::Error;
use crate::Migration;

pub const PRE_APPLY_DIRECTORY: &str = "pre-apply";
pub const POST_APPLY_DIRECTORY: &str = "post-apply";

const UP_SUFFIX: &str = ".sql";
const UNDO_SUFFIX: &str = ".undo.sql";

/// Supplies the migrations for a session. Each list must be sorted by id.
pub trait MigrationSource {
    /// Ordinary, versioned migrations.
    fn read_migrations(&self) -> Result<Vec<Migration>, Error>;

    /// Migrations re-run at the start of every apply.
    fn read_pre_apply_migrations(&self) -> Result<Vec<Migration>, Error>;

    /// Migrations re-run at the end of every apply.
    fn read_post_apply_migrations(&self) -> Result<Vec<Migration>, Error>;

    /// Read all three lists and check their ordering.
    fn read_all(&self) -> Result<MigrationSet, Error> {
        MigrationSet::try_new(
            self.read_pre_apply_migrations()?,
            self.read_migrations()?,
            self.read_post_apply_migrations()?,
        )
    }
}

/// A source over lists that are already in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    set: MigrationSet,
}

impl StaticSource {
    pub fn new(set: MigrationSet) -> Self {
        Self { set }
    }
}

impl MigrationSource for StaticSource {
    fn read_migrations(&self) -> Result<Vec<Migration>, Error> {
        Ok(self.set.migrations().to_vec())
    }

    fn read_pre_apply_migrations(&self) -> Result<Vec<Migration>, Error> {
        Ok(self.set.pre_apply().to_vec())
    }

    fn read_post_apply_migrations(&self) -> Result<Vec<Migration>, Error> {
        Ok(self.set.post_apply().to_vec())
    }
}

/// A source that reads `.sql` files from a directory. See the [module docs](self).
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MigrationSource for DirectorySource {
    fn read_migrations(&self) -> Result<Vec<Migration>, Error> {
        if !self.root.is_dir() {
            return Err(Error::Loading(format!(
                "Migration directory {} does not exist",
                self.root.display()
            )));
        }
        read_directory(&self.root, true)
    }

    fn read_pre_apply_migrations(&self) -> Result<Vec<Migration>, Error> {
        read_repeatable(&self.root.join(PRE_APPLY_DIRECTORY))
    }

    fn read_post_apply_migrations(&self) -> Result<Vec<Migration>, Error> {
        read_repeatable(&self.root.join(POST_APPLY_DIRECTORY))
    }
}

fn read_repeatable(dir: &Path) -> Result<Vec<Migration>, Error> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    read_directory(dir, false)
}

#[derive(Default)]
struct FilePair {
    up: Option<PathBuf>,
    undo: Option<PathBuf>,
}

fn read_directory(dir: &Path, allow_undo: bool) -> Result<Vec<Migration>, Error> {
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::Loading(format!("Error reading directory {}: {}", dir.display(), e))
    })?;

    // BTreeMap keeps ids sorted, which is the execution order.
    let mut pairs: BTreeMap<String, FilePair> = BTreeMap::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(id) = file_name.strip_suffix(UNDO_SUFFIX) {
            pairs.entry(id.to_string()).or_default().undo = Some(path.clone());
        } else if let Some(id) = file_name.strip_suffix(UP_SUFFIX) {
            pairs.entry(id.to_string()).or_default().up = Some(path.clone());
        }
    }

    let mut migrations = Vec::with_capacity(pairs.len());
    for (id, pair) in pairs {
        let Some(up_path) = pair.up else {
            return Err(Error::Loading(format!(
                "Found {}{} without a matching {}{}",
                id, UNDO_SUFFIX, id, UP_SUFFIX
            )));
        };
        if pair.undo.is_some() && !allow_undo {
            return Err(Error::Loading(format!(
                "Repeatable migration {} in {} cannot have an undo script",
                id,
                dir.display()
            )));
        }
        let up = read_script(&up_path)?;
        let down = pair.undo.as_deref().map(read_script).transpose()?;
        migrations.push(Migration::new(id, up, down));
    }
    Ok(migrations)
}

fn read_script(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path)
        .map_err(|e| Error::Loading(format!("Error reading {}: {}", path.display(), e)))
}
