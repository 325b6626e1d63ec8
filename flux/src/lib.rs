#![cfg_attr(docsrs, feature(doc_cfg))]
//! `flux` is a database migration runner built around one consistency rule: **the
//! applied migrations are always a contiguous prefix of the known migrations, and none
//! of them has changed since it was applied.**
//!
//! # Concepts
//!
//! - A [`Migration`] is an id plus a forward (`up`) script and an optional reverse
//!   (`down`) script. Ids sort lexicographically in execution order.
//! - Pre-apply and post-apply migrations are re-run at the start and end of every apply
//!   and are never recorded in the history.
//! - A [`MigrationSource`] supplies the three lists; [`DirectorySource`] reads them from
//!   `.sql` files.
//! - A [`MigrationBackend`] executes scripts and stores the applied history. Built-in
//!   backends: [`memory`], [`sqlite`](crate::sqlite) and [`postgres`](crate::postgres).
//! - A [`Runner`] is one session: connection, migration lock and transaction held
//!   together. All changes in a session commit or roll back as one.
//!
//! # Example
//!
//! ```
//! use flux::memory::MemoryBackend;
//! use flux::{Migration, MigrationSet, Runner, StaticSource};
//!
//! let source = StaticSource::new(MigrationSet::from_migrations(vec![
//!     Migration::new("20200101_001_users", "create table users (id int);", None),
//! ]).unwrap());
//! let mut backend = MemoryBackend::new();
//!
//! Runner::session(&mut backend, &source, |runner| {
//!     runner.validate_applied_migrations()?;
//!     runner.apply_migrations(None)
//! }).unwrap();
//! ```
//!
//! # Features
//!
//! - `sqlite` (default) - the [SQLite backend](crate::sqlite).
//! - `postgres` - the [PostgreSQL backend](crate::postgres).
//! - `tracing` - span and event output through the `tracing` crate.

mod core;
pub use core::{AppliedMigration, Migration, MigrationSet};

mod error;
pub use error::Error;

pub mod backend;
pub use backend::MigrationBackend;

pub mod config;
pub use config::FluxConfig;

pub mod memory;

mod registry;
pub use registry::{BackendFactory, BackendRegistry};

pub mod runner;
pub use runner::Runner;

pub mod source;
pub use source::{DirectorySource, MigrationSource, StaticSource};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
