//! Backends by name.
//!
//! The command line turns `flux.backend` from the config file into a backend through a
//! [`BackendRegistry`]. Embedders can register their own backends alongside the
//! built-in ones.

use std::collections::BTreeMap;

use crate::backend::MigrationBackend;
use crate::error::Error;
use crate::memory::MemoryBackend;

/// Builds a backend from the `[backend]` config table.
pub type BackendFactory = fn(&toml::Table) -> Result<Box<dyn MigrationBackend>, Error>;

#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every backend compiled into this build: `in_memory`, plus
    /// `sqlite` and `postgres` when their features are enabled.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("in_memory", |_| Ok(Box::new(MemoryBackend::new())));
        #[cfg(feature = "sqlite")]
        registry.register("sqlite", |config| {
            Ok(Box::new(crate::sqlite::SqliteBackend::from_config(config)?))
        });
        #[cfg(feature = "postgres")]
        registry.register("postgres", |config| {
            Ok(Box::new(crate::postgres::PostgresBackend::from_config(
                config,
            )?))
        });
        registry
    }

    /// Add or replace the backend called `name`.
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> &mut Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the backend called `name` from its config table.
    pub fn create(
        &self,
        name: &str,
        config: &toml::Table,
    ) -> Result<Box<dyn MigrationBackend>, Error> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::BackendNotInstalled(name.to_string()))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(backend = name, "Creating backend");

        factory(config)
    }
}
