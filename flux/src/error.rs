/// Error type for the flux crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The migration definitions and the recorded history have diverged.
    #[error("migration directory corrupted: {0}")]
    Corrupted(String),
    /// A script, register or unregister call failed for the named migration.
    #[error("failed to apply migration {id}: {source}")]
    Apply {
        id: String,
        #[source]
        source: Box<Error>,
    },
    /// The caller asked for something that does not make sense in the current state.
    #[error("{0}")]
    Usage(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to load migrations: {0}")]
    Loading(String),
    #[error("backend {0} is not installed")]
    BackendNotInstalled(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Toml(#[from] toml::de::Error),
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    pub(crate) fn apply(id: &str, source: Error) -> Self {
        Self::Apply {
            id: id.to_string(),
            source: Box::new(source),
        }
    }

    /// The id of the migration an [`Error::Apply`] refers to.
    pub fn migration_id(&self) -> Option<&str> {
        match self {
            Self::Apply { id, .. } => Some(id),
            _ => None,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}
