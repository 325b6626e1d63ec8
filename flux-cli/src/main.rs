//! `flux` command line.
//!
//! Reads `flux.toml` from the working directory, builds the configured backend and runs
//! one migration session per command.

use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use flux::config::{CONFIG_FILE, DEFAULT_MIGRATION_DIRECTORY};
use flux::{BackendRegistry, DirectorySource, FluxConfig, MigrationBackend, Runner};
use tracing_subscriber::EnvFilter;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Parser)]
#[command(name = "flux", version, about = "Database migration runner")]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new flux.toml in the current directory
    Init {
        /// Backend name, e.g. sqlite or postgres
        #[arg(default_value = "sqlite")]
        backend: String,
        /// Directory holding the migration files
        #[arg(long = "migration-dir", default_value = DEFAULT_MIGRATION_DIRECTORY)]
        migration_dir: String,
        /// Log level written to the config
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Show applied and pending migrations
    Status,
    /// Check the applied history against the migration directory
    Validate,
    /// Apply pending migrations
    Apply {
        /// Number of migrations to apply (default: all)
        n: Option<usize>,
    },
    /// Roll back applied migrations, most recent first
    Rollback {
        /// Number of migrations to roll back (default: all)
        n: Option<usize>,
    },
    /// Roll back one migration and every migration applied after it
    RollbackOne {
        /// Id of the migration to roll back
        id: String,
    },
    /// Create a new migration file
    New {
        /// Name appended to the timestamp, e.g. create_users
        name: String,
        /// Also create an .undo.sql file
        #[arg(long)]
        undo: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let mut stdout = std::io::stdout().lock();
    execute(cli, &cwd, &mut stdout, true)
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase())),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn execute(
    cli: Cli,
    cwd: &Path,
    out: &mut impl Write,
    logging: bool,
) -> Result<(), Box<dyn Error>> {
    let config_path = cwd.join(&cli.config);

    if let Commands::Init {
        backend,
        migration_dir,
        log_level,
    } = &cli.command
    {
        return init(&config_path, cwd, backend, migration_dir, log_level.as_deref(), out);
    }

    let config = FluxConfig::from_file(&config_path)?;
    if logging {
        init_logging(&config.log_level);
    }
    let migration_dir = cwd.join(&config.migration_directory);

    if let Commands::New { name, undo } = &cli.command {
        return new_migration(&migration_dir, name, *undo, out);
    }

    let registry = BackendRegistry::with_builtins();
    let mut backend = registry.create(&config.backend, &config.backend_config)?;
    let source = DirectorySource::new(&migration_dir);

    tracing::debug!(
        backend = %config.backend,
        migration_directory = %migration_dir.display(),
        "Running command"
    );

    match cli.command {
        Commands::Status => status(backend.as_mut(), &source, out),
        Commands::Validate => {
            Runner::session(backend.as_mut(), &source, |runner| {
                runner.validate_applied_migrations()
            })?;
            writeln!(out, "Migration directory is consistent with the database.")?;
            Ok(())
        }
        Commands::Apply { n } => {
            let applied = Runner::session(backend.as_mut(), &source, |runner| {
                runner.validate_applied_migrations()?;
                report_progress(runner);
                runner.apply_migrations(n)
            })?;
            if applied.is_empty() {
                writeln!(out, "No migrations to apply.")?;
            }
            for id in applied {
                writeln!(out, "Applied {}", id)?;
            }
            Ok(())
        }
        Commands::Rollback { n } => {
            let rolled_back = Runner::session(backend.as_mut(), &source, |runner| {
                runner.validate_applied_migrations()?;
                report_progress(runner);
                runner.rollback_migrations(n)
            })?;
            if rolled_back.is_empty() {
                writeln!(out, "No migrations to roll back.")?;
            }
            for id in rolled_back {
                writeln!(out, "Rolled back {}", id)?;
            }
            Ok(())
        }
        Commands::RollbackOne { id } => {
            let rolled_back = Runner::session(backend.as_mut(), &source, |runner| {
                runner.validate_applied_migrations()?;
                report_progress(runner);
                runner.rollback_migration(&id)
            })?;
            for id in rolled_back {
                writeln!(out, "Rolled back {}", id)?;
            }
            Ok(())
        }
        Commands::Init { .. } | Commands::New { .. } => Ok(()),
    }
}

fn report_progress<B: MigrationBackend + ?Sized>(runner: &mut Runner<'_, B>) {
    runner
        .on_migration_complete(|id, duration| {
            eprintln!("  {} ({} ms)", id, duration.as_millis())
        })
        .on_migration_error(|id, e| eprintln!("  {} failed: {}", id, e));
}

fn init(
    config_path: &Path,
    cwd: &Path,
    backend: &str,
    migration_dir: &str,
    log_level: Option<&str>,
    out: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()).into());
    }
    fs::write(
        config_path,
        FluxConfig::render_template(backend, migration_dir, log_level),
    )?;
    fs::create_dir_all(cwd.join(migration_dir))?;
    writeln!(out, "Created {}", config_path.display())?;
    Ok(())
}

fn status(
    backend: &mut dyn MigrationBackend,
    source: &DirectorySource,
    out: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    let (applied, pending, consistent) = Runner::session(backend, source, |runner| {
        let applied: Vec<String> = runner
            .applied_migrations()
            .iter()
            .map(|a| format!("{}  (applied {})", a.id, a.applied_at.to_rfc3339()))
            .collect();
        let pending: Vec<String> = runner
            .pending_migrations()
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        let consistent = runner.validate_applied_migrations();
        Ok((applied, pending, consistent))
    })?;

    writeln!(out, "Applied migrations ({}):", applied.len())?;
    for line in &applied {
        writeln!(out, "  {}", line)?;
    }
    writeln!(out, "Pending migrations ({}):", pending.len())?;
    for id in &pending {
        writeln!(out, "  {}", id)?;
    }
    if let Err(e) = consistent {
        writeln!(out, "Warning: {}", e)?;
    }
    Ok(())
}

fn new_migration(
    migration_dir: &Path,
    name: &str,
    undo: bool,
    out: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(format!("Invalid migration name '{}'", name).into());
    }
    let id = format!(
        "{}_{}",
        chrono::Local::now().format(TIMESTAMP_FORMAT),
        name
    );

    fs::create_dir_all(migration_dir)?;
    let mut files = vec![migration_dir.join(format!("{}.sql", id))];
    if undo {
        files.push(migration_dir.join(format!("{}.undo.sql", id)));
    }
    if let Some(existing) = files.iter().find(|f| f.exists()) {
        return Err(format!("{} already exists", existing.display()).into());
    }
    for file in &files {
        fs::write(file, "")?;
        writeln!(out, "Created {}", file.display())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_in(dir: &Path, args: &[&str]) -> Result<String, Box<dyn Error>> {
        let cli = Cli::try_parse_from(std::iter::once("flux").chain(args.iter().copied()))?;
        let mut out = Vec::new();
        execute(cli, dir, &mut out, false)?;
        Ok(String::from_utf8(out)?)
    }

    fn sqlite_project() -> TempDir {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("app.db");
        fs::write(
            dir.path().join(CONFIG_FILE),
            format!(
                "[flux]\nbackend = \"sqlite\"\nmigration_directory = \"migrations\"\n\n[backend]\ndatabase = \"{}\"\n",
                db.display().to_string().replace('\\', "\\\\")
            ),
        )
        .unwrap();
        let migrations = dir.path().join("migrations");
        fs::create_dir_all(&migrations).unwrap();
        fs::write(
            migrations.join("20200101_001_users.sql"),
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
        )
        .unwrap();
        fs::write(migrations.join("20200101_001_users.undo.sql"), "DROP TABLE users;").unwrap();
        fs::write(
            migrations.join("20200102_001_posts.sql"),
            "CREATE TABLE posts (id INTEGER PRIMARY KEY);",
        )
        .unwrap();
        dir
    }

    #[test]
    fn init_writes_config_once() {
        let dir = TempDir::new().unwrap();
        let out = run_in(dir.path(), &["init", "postgres", "--migration-dir", "db"]).unwrap();
        assert!(out.contains("Created"));
        assert!(dir.path().join("db").is_dir());

        let config = FluxConfig::from_file(dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.backend, "postgres");
        assert_eq!(config.migration_directory, "db");

        assert!(run_in(dir.path(), &["init"]).is_err());
    }

    #[test]
    fn new_creates_timestamped_files() {
        let dir = TempDir::new().unwrap();
        run_in(dir.path(), &["init"]).unwrap();
        run_in(dir.path(), &["new", "create_users", "--undo"]).unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path().join(DEFAULT_MIGRATION_DIRECTORY))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("_create_users.sql"));
        assert!(names[1].ends_with("_create_users.undo.sql"));
        // yyyymmdd_hhmmss_
        assert_eq!(names[0].find("_create_users"), Some(15));

        assert!(run_in(dir.path(), &["new", "../escape"]).is_err());
    }

    #[test]
    fn apply_status_and_rollback() {
        let dir = sqlite_project();

        let out = run_in(dir.path(), &["status"]).unwrap();
        assert!(out.contains("Applied migrations (0)"));
        assert!(out.contains("Pending migrations (2)"));

        let out = run_in(dir.path(), &["apply", "1"]).unwrap();
        assert_eq!(out, "Applied 20200101_001_users\n");

        let out = run_in(dir.path(), &["apply"]).unwrap();
        assert_eq!(out, "Applied 20200102_001_posts\n");
        let out = run_in(dir.path(), &["apply"]).unwrap();
        assert_eq!(out, "No migrations to apply.\n");

        run_in(dir.path(), &["validate"]).unwrap();

        let out = run_in(dir.path(), &["rollback-one", "20200101_001_users"]).unwrap();
        assert_eq!(
            out,
            "Rolled back 20200102_001_posts\nRolled back 20200101_001_users\n"
        );
        run_in(dir.path(), &["validate"]).unwrap();

        let out = run_in(dir.path(), &["status"]).unwrap();
        assert!(out.contains("Applied migrations (0)"));
        assert!(!out.contains("Warning:"));

        assert!(run_in(dir.path(), &["rollback-one", "20200101_001_users"]).is_err());
    }

    #[test]
    fn rollback_reverses_in_order() {
        let dir = sqlite_project();
        run_in(dir.path(), &["apply"]).unwrap();
        let out = run_in(dir.path(), &["rollback"]).unwrap();
        assert_eq!(
            out,
            "Rolled back 20200102_001_posts\nRolled back 20200101_001_users\n"
        );
        let out = run_in(dir.path(), &["rollback"]).unwrap();
        assert_eq!(out, "No migrations to roll back.\n");
    }

    #[test]
    fn validate_rejects_edited_migration() {
        let dir = sqlite_project();
        run_in(dir.path(), &["apply"]).unwrap();
        fs::write(
            dir.path().join("migrations").join("20200101_001_users.sql"),
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);",
        )
        .unwrap();
        let err = run_in(dir.path(), &["validate"]).unwrap_err();
        assert!(err.to_string().contains("20200101_001_users has changed"));
        // apply validates first and refuses to run
        assert!(run_in(dir.path(), &["apply"]).is_err());
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = run_in(dir.path(), &["status"]).unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn unknown_backend_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[flux]\nbackend = \"oracle\"\nmigration_directory = \"migrations\"\n",
        )
        .unwrap();
        let err = run_in(dir.path(), &["apply"]).unwrap_err();
        assert_eq!(err.to_string(), "backend oracle is not installed");
    }
}
