mod output;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use schemashare_core::config::{CliOverrides, SchemaShareConfig};
use schemashare_core::error::SchemaShareError;
use schemashare_core::{Migrator, SchemaDb};

#[derive(Parser)]
#[command(
    name = "schemashare",
    about = "Per-module, per-schema PostgreSQL migrations",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file path
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Database URL (overrides config)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Target schema (overrides config)
    #[arg(long, value_name = "SCHEMA")]
    schema: Option<String>,

    /// Module whose migrations to manage (overrides config)
    #[arg(short, long, value_name = "NAME")]
    module: Option<String>,

    /// Migration directory (overrides config)
    #[arg(short, long, value_name = "PATH")]
    directory: Option<PathBuf>,

    /// Ledger table name (overrides config)
    #[arg(long, value_name = "TABLE")]
    table: Option<String>,

    /// Number of retries when connecting to the database
    #[arg(long, value_name = "N")]
    connect_retries: Option<u32>,

    /// SSL/TLS mode: disable, prefer, require
    #[arg(long, value_name = "MODE")]
    ssl_mode: Option<String>,

    /// Connection timeout in seconds (default: 30, 0 = no timeout)
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u32>,

    /// Statement timeout in seconds (default: 0 = no limit)
    #[arg(long, value_name = "SECS")]
    statement_timeout: Option<u32>,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Migrate {
        /// Show the resolved SQL of pending migrations without running it
        #[arg(long)]
        dry_run: bool,

        /// Create the target schema first if it does not exist
        #[arg(long)]
        create_schema: bool,
    },

    /// Show migration status
    Status,

    /// Validate applied migrations against files on disk
    Validate,

    /// Show the module's ledger, most recent first
    History {
        /// Maximum number of rows
        #[arg(long, value_name = "N")]
        limit: Option<u32>,
    },

    /// Create a new numbered migration file
    New {
        /// Migration name, e.g. "add users table"
        name: String,
    },

    /// Attach rollback SQL to an applied migration
    AnnotateRollback {
        /// Version of the applied migration
        version: String,

        /// File containing the rollback SQL
        sql_file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json || cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .without_time()
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(exit_code(&e));
    }
}

/// Map error types to differentiated exit codes.
fn exit_code(error: &SchemaShareError) -> i32 {
    match error {
        SchemaShareError::ConfigError(_) => 2,
        SchemaShareError::ValidationFailed(_)
        | SchemaShareError::ChecksumMismatch { .. }
        | SchemaShareError::DuplicateVersion { .. } => 3,
        SchemaShareError::DatabaseError(_)
        | SchemaShareError::ConnectionError(_)
        | SchemaShareError::PoolClosed => 4,
        SchemaShareError::MigrationFailed { .. } => 5,
        SchemaShareError::LockError(_) => 6,
        SchemaShareError::NotFound { .. } => 7,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<(), SchemaShareError> {
    let json_output = cli.json;

    let overrides = CliOverrides {
        url: cli.url,
        schema: cli.schema,
        module: cli.module,
        directory: cli.directory,
        table: cli.table,
        connect_retries: cli.connect_retries,
        ssl_mode: cli.ssl_mode,
        connect_timeout: cli.connect_timeout,
        statement_timeout: cli.statement_timeout,
    };

    let config = SchemaShareConfig::load(cli.config.as_deref(), &overrides)?;

    // Creating a file needs no database.
    if let Commands::New { name } = &cli.command {
        return new_migration(&config, name, json_output);
    }

    let db = SchemaDb::connect(&config.database).await?;
    let result = dispatch(&db, &config, cli.command, json_output).await;
    db.close();
    result
}

async fn dispatch(
    db: &SchemaDb,
    config: &SchemaShareConfig,
    command: Commands,
    json_output: bool,
) -> Result<(), SchemaShareError> {
    let migrator = Migrator::from_config(db, &config.migrations)?;

    match command {
        Commands::Migrate {
            dry_run,
            create_schema,
        } => {
            if create_schema && !dry_run {
                db.ensure_schema().await?;
            }
            let report = migrator.apply_pending(dry_run).await?;
            if json_output {
                output::print_json(&report);
            } else {
                output::print_migrate_summary(&report);
            }
        }
        Commands::Status => {
            let statuses = migrator.status().await?;
            if json_output {
                output::print_json(&statuses);
            } else {
                output::print_status_table(&statuses);
            }
        }
        Commands::Validate => {
            let report = migrator.validate().await?;
            if json_output {
                output::print_json(&report);
            } else {
                output::print_validate_result(&report);
            }
        }
        Commands::History { limit } => {
            let records = migrator.history(limit).await?;
            if json_output {
                output::print_json(&records);
            } else {
                output::print_history_table(&records);
            }
        }
        Commands::AnnotateRollback { version, sql_file } => {
            let rollback_sql = std::fs::read_to_string(&sql_file)?;
            migrator.annotate_rollback(&version, &rollback_sql).await?;
            if json_output {
                output::print_json(&serde_json::json!({
                    "module": migrator.module(),
                    "version": version,
                    "annotated": true,
                }));
            } else {
                println!(
                    "{}",
                    format!(
                        "Recorded rollback SQL for {} version {}.",
                        migrator.module(),
                        version
                    )
                    .green()
                    .bold()
                );
            }
        }
        Commands::New { name } => new_migration(config, &name, json_output)?,
    }

    Ok(())
}

fn new_migration(
    config: &SchemaShareConfig,
    name: &str,
    json_output: bool,
) -> Result<(), SchemaShareError> {
    let directory = &config.migrations.directory;
    let filename = schemashare_core::migration::create_migration_file(directory, name, "")?;
    let path = directory.join(&filename);
    if json_output {
        output::print_json(&serde_json::json!({
            "module": config.migrations.module,
            "filename": filename,
            "path": path.display().to_string(),
        }));
    } else {
        println!("{} {}", "Created".green().bold(), path.display());
    }
    Ok(())
}

fn print_error(error: &SchemaShareError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    // Provide actionable guidance
    match error {
        SchemaShareError::ConfigError(_) => {
            eprintln!(
                "{}",
                "Hint: Check your schemashare.toml or set SCHEMASHARE_DATABASE_URL environment variable."
                    .dimmed()
            );
        }
        SchemaShareError::DatabaseError(_) | SchemaShareError::ConnectionError(_) => {
            eprintln!(
                "{}",
                "Hint: Verify database is running and connection details are correct.".dimmed()
            );
        }
        SchemaShareError::ChecksumMismatch { .. } => {
            eprintln!(
                "{}",
                "Hint: Applied migrations must not be edited. Restore the original file and add a new migration instead."
                    .dimmed()
            );
        }
        SchemaShareError::DuplicateVersion { .. } => {
            eprintln!(
                "{}",
                "Hint: Rename one of the files so every migration in the module has its own version."
                    .dimmed()
            );
        }
        SchemaShareError::MigrationFailed { applied_before, .. } => {
            eprintln!(
                "{}",
                format!(
                    "Hint: {} migration(s) before the failing one were applied and stay recorded. Fix the file and re-run migrate to resume.",
                    applied_before
                )
                .dimmed()
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_limit_parses() {
        let cli = Cli::try_parse_from(["schemashare", "history", "--limit", "20"]).unwrap();
        assert!(matches!(cli.command, Commands::History { limit: Some(20) }));

        let cli = Cli::try_parse_from(["schemashare", "history"]).unwrap();
        assert!(matches!(cli.command, Commands::History { limit: None }));
    }

    #[test]
    fn test_history_rejects_negative_limit() {
        assert!(Cli::try_parse_from(["schemashare", "history", "--limit", "-1"]).is_err());
        assert!(Cli::try_parse_from(["schemashare", "history", "--limit=-5"]).is_err());
    }
}
