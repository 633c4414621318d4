pub mod checksum;
pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod ledger;
pub mod migration;
pub mod template;
pub mod version;

use std::path::{Path, PathBuf};

use config::MigrationSettings;
use error::{Result, SchemaShareError};

pub use commands::migrate::{ApplyResult, ApplyStatus, MigrateReport};
pub use commands::status::{MigrationState, MigrationStatus};
pub use commands::validate::ValidateReport;
pub use config::{CliOverrides, DatabaseConfig, SchemaShareConfig};
pub use context::{ContextState, PoolRef, PoolStats, SchemaConnection, SchemaDb, SchemaTransaction};
pub use ledger::{Ledger, MigrationRecord, DEFAULT_LEDGER_TABLE};
pub use migration::MigrationFile;
pub use template::{resolve, SchemaContext};
pub use version::{extract_version, VersionKey, VersionStrategy};

/// Applies one module's migrations to the schema bound to a [`SchemaDb`].
///
/// The ledger lives in the same schema as the migrations, so the same
/// directory can be applied to many schemas independently.
pub struct Migrator<'a> {
    db: &'a SchemaDb,
    ledger: Ledger,
    directory: PathBuf,
    module: String,
}

impl<'a> Migrator<'a> {
    /// Create a migrator for `module` reading `directory`, using the default ledger table.
    pub fn new(db: &'a SchemaDb, module: &str, directory: impl Into<PathBuf>) -> Self {
        Self {
            db,
            ledger: Ledger::new(db.context().clone(), DEFAULT_LEDGER_TABLE),
            directory: directory.into(),
            module: module.to_string(),
        }
    }

    pub fn from_config(db: &'a SchemaDb, settings: &MigrationSettings) -> Result<Self> {
        Self::new(db, &settings.module, &settings.directory).with_table(&settings.table)
    }

    /// Use a different ledger table name.
    pub fn with_table(mut self, table: &str) -> Result<Self> {
        db::validate_identifier(table)?;
        self.ledger = Ledger::new(self.db.context().clone(), table);
        Ok(self)
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Migrations not yet applied, in version order.
    pub async fn pending_migrations(&self) -> Result<Vec<MigrationFile>> {
        commands::migrate::pending_migrations(self.db, &self.ledger, &self.directory, &self.module)
            .await
    }

    /// Apply pending migrations. With `dry_run`, report what would run instead.
    pub async fn apply_pending(&self, dry_run: bool) -> Result<MigrateReport> {
        commands::migrate::execute(self.db, &self.ledger, &self.directory, &self.module, dry_run)
            .await
    }

    /// Apply one migration file.
    pub async fn apply_single(&self, migration: &MigrationFile) -> Result<ApplyResult> {
        commands::migrate::apply_single(self.db, &self.ledger, migration).await
    }

    /// Write a new numbered migration into the directory. Returns its filename.
    pub fn create_migration(&self, name: &str, content: &str) -> Result<String> {
        migration::create_migration_file(&self.directory, name, content)
    }

    /// Show migration status information.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        commands::status::execute(self.db, &self.ledger, &self.directory, &self.module).await
    }

    /// Validate applied migrations against local files.
    pub async fn validate(&self) -> Result<ValidateReport> {
        commands::validate::execute(self.db, &self.ledger, &self.directory, &self.module).await
    }

    /// Ledger rows of this module, most recent first.
    pub async fn history(&self, limit: Option<u32>) -> Result<Vec<MigrationRecord>> {
        let conn = self.db.acquire().await?;
        if !self.ledger.exists(conn.client()).await? {
            return Ok(Vec::new());
        }
        self.ledger
            .history(conn.client(), Some(&self.module), limit.map(i64::from))
            .await
    }

    /// Attach rollback SQL to an applied migration of this module.
    pub async fn annotate_rollback(&self, version: &str, rollback_sql: &str) -> Result<()> {
        let conn = self.db.acquire().await?;
        if !self.ledger.exists(conn.client()).await? {
            return Err(SchemaShareError::NotFound {
                module: self.module.clone(),
                version: version.to_string(),
            });
        }
        self.ledger
            .annotate_rollback(conn.client(), &self.module, version, rollback_sql)
            .await?;
        tracing::info!(module = %self.module, version = %version, "Rollback SQL recorded");
        Ok(())
    }
}
