//! `flux.toml` configuration.
//!
//! ```toml
//! [flux]
//! backend = "sqlite"
//! migration_directory = "migrations"
//! log_level = "info"
//!
//! [backend]
//! database = "app.db"
//! ```
//!
//! The `[backend]` table is passed as-is to the backend named by `flux.backend`.

use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "flux.toml";

/// Default directory for migration files.
pub const DEFAULT_MIGRATION_DIRECTORY: &str = "migrations";

/// Default log level when `flux.log_level` is omitted.
pub const DEFAULT_LOG_LEVEL: &str = "INFO";

#[derive(Debug, Clone, PartialEq)]
pub struct FluxConfig {
    pub backend: String,
    pub migration_directory: String,
    pub log_level: String,
    pub backend_config: toml::Table,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    flux: RawGeneral,
    #[serde(default)]
    backend: toml::Table,
}

#[derive(Debug, Default, Deserialize)]
struct RawGeneral {
    backend: Option<String>,
    migration_directory: Option<String>,
    log_level: Option<String>,
}

impl FluxConfig {
    /// Read and validate a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Could not read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate config text.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let raw: RawConfig = toml::from_str(text)?;

        let backend = raw.flux.backend.ok_or_else(|| {
            Error::Config("No backend configuration found in config file".to_string())
        })?;
        let migration_directory = raw.flux.migration_directory.ok_or_else(|| {
            Error::Config("No migration directory found in config file".to_string())
        })?;

        Ok(Self {
            backend,
            migration_directory,
            log_level: raw
                .flux
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            backend_config: raw.backend,
        })
    }

    /// The text `flux init` writes for a new project.
    pub fn render_template(
        backend: &str,
        migration_directory: &str,
        log_level: Option<&str>,
    ) -> String {
        let quote = |value: &str| toml::Value::String(value.to_string()).to_string();
        let mut out = format!(
            "[flux]\nbackend = {}\nmigration_directory = {}\n",
            quote(backend),
            quote(migration_directory)
        );
        if let Some(level) = log_level {
            out.push_str(&format!("log_level = {}\n", quote(level)));
        }
        out.push_str("\n[backend]\n# Add backend-specific configuration here\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSTGRES_CONFIG: &str = r#"
[flux]
backend = "postgres"
migration_directory = "migrations"
log_level = "info"

[backend]
host = "localhost"
port = 5432
user = "your_username"
password = "your_password"
database = "your_database"
sslmode = "require"
"#;

    #[test]
    fn parses_full_config() {
        let config = FluxConfig::from_toml_str(POSTGRES_CONFIG).unwrap();
        assert_eq!(config.backend, "postgres");
        assert_eq!(config.migration_directory, "migrations");
        assert_eq!(config.log_level, "info");
        assert_eq!(
            config.backend_config.get("port").and_then(|v| v.as_integer()),
            Some(5432)
        );
        assert_eq!(
            config.backend_config.get("sslmode").and_then(|v| v.as_str()),
            Some("require")
        );
        assert_eq!(config.backend_config.len(), 6);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = FluxConfig::from_toml_str(
            "[flux]\nbackend = \"postgres\"\nmigration_directory = \"migrations\"\n",
        )
        .unwrap();
        assert_eq!(config.log_level, "INFO");
        assert!(config.backend_config.is_empty());
    }

    #[test]
    fn missing_backend_is_rejected() {
        let err = FluxConfig::from_toml_str("[flux]\nmigration_directory = \"migrations\"\n")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_migration_directory_is_rejected() {
        let err = FluxConfig::from_toml_str("[flux]\nbackend = \"sqlite\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let err = FluxConfig::from_toml_str("[flux\nbackend = ").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn template_round_trips() {
        let text = FluxConfig::render_template("sqlite", "db/migrations", Some("debug"));
        let config = FluxConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.backend, "sqlite");
        assert_eq!(config.migration_directory, "db/migrations");
        assert_eq!(config.log_level, "debug");
        assert!(config.backend_config.is_empty());
    }

    #[test]
    fn template_escapes_paths_and_quotes() {
        let text = FluxConfig::render_template("sqlite", r"C:\db\migrations", None);
        let config = FluxConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.migration_directory, r"C:\db\migrations");

        let text = FluxConfig::render_template("sqlite", r#"odd "name""#, Some("info"));
        let config = FluxConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.migration_directory, r#"odd "name""#);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn from_file_reports_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = FluxConfig::from_file(dir.path().join(CONFIG_FILE)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
