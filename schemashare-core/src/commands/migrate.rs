use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::context::SchemaDb;
use crate::db;
use crate::error::{format_db_error, Result, SchemaShareError};
use crate::ledger::{Ledger, MigrationRecord};
use crate::migration::{check_unique_versions, scan_migrations, MigrationFile};
use crate::template;

/// Report returned after a migrate operation.
#[derive(Debug, Serialize)]
pub struct MigrateReport {
    pub module: String,
    pub dry_run: bool,
    pub migrations_applied: usize,
    pub total_time_ms: i32,
    pub results: Vec<ApplyResult>,
}

/// What happened to one migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplyStatus {
    Applied,
    /// Another runner recorded it between planning and locking.
    Skipped,
    DryRun,
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyStatus::Applied => write!(f, "Applied"),
            ApplyStatus::Skipped => write!(f, "Skipped"),
            ApplyStatus::DryRun => write!(f, "Dry Run"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub module: String,
    pub version: String,
    pub filename: String,
    pub checksum: String,
    pub status: ApplyStatus,
    pub execution_time_ms: i32,
    /// The SQL that would run, for dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_sql: Option<String>,
}

impl ApplyResult {
    fn new(migration: &MigrationFile, status: ApplyStatus) -> Self {
        Self {
            module: migration.module.clone(),
            version: migration.version.to_string(),
            filename: migration.filename.clone(),
            checksum: migration.checksum.clone(),
            status,
            execution_time_ms: 0,
            resolved_sql: None,
        }
    }
}

pub(crate) fn checksum_mismatch(
    migration: &MigrationFile,
    record: &MigrationRecord,
) -> SchemaShareError {
    SchemaShareError::ChecksumMismatch {
        module: migration.module.clone(),
        version: migration.version.to_string(),
        filename: migration.filename.clone(),
        expected: record.checksum.clone(),
        found: migration.checksum.clone(),
    }
}

/// Migrations in `directory` not yet recorded for `module`, in version order.
///
/// Read-only: a missing ledger table means everything is pending. An applied
/// migration whose file changed fails with `ChecksumMismatch`.
pub async fn pending_migrations(
    db: &SchemaDb,
    ledger: &Ledger,
    directory: &Path,
    module: &str,
) -> Result<Vec<MigrationFile>> {
    let migrations = scan_migrations(directory, module)?;
    check_unique_versions(&migrations)?;

    let conn = db.acquire().await?;
    if !ledger.exists(conn.client()).await? {
        return Ok(migrations);
    }

    let applied: HashMap<String, MigrationRecord> = ledger
        .applied(conn.client(), module)
        .await?
        .into_iter()
        .map(|r| (r.version.clone(), r))
        .collect();

    let mut pending = Vec::new();
    for migration in migrations {
        match applied.get(migration.version.as_str()) {
            Some(record) if record.checksum != migration.checksum => {
                return Err(checksum_mismatch(&migration, record));
            }
            Some(_) => continue,
            None => pending.push(migration),
        }
    }

    Ok(pending)
}

/// Execute the migrate command.
///
/// Stops at the first failure. Migrations applied earlier in the call stay
/// recorded and the error reports how many there were.
pub async fn execute(
    db: &SchemaDb,
    ledger: &Ledger,
    directory: &Path,
    module: &str,
    dry_run: bool,
) -> Result<MigrateReport> {
    let start = Instant::now();

    if !dry_run {
        ensure_ledger(db, ledger).await?;
    }

    let pending = pending_migrations(db, ledger, directory, module).await?;

    let mut report = MigrateReport {
        module: module.to_string(),
        dry_run,
        migrations_applied: 0,
        total_time_ms: 0,
        results: Vec::with_capacity(pending.len()),
    };

    for migration in &pending {
        if dry_run {
            let mut result = ApplyResult::new(migration, ApplyStatus::DryRun);
            result.resolved_sql = Some(db.resolve(migration.sql()?));
            tracing::info!(
                module = %module,
                migration = %migration.filename,
                "Would apply migration (dry run)"
            );
            report.results.push(result);
            continue;
        }

        match apply_one(db, ledger, migration).await {
            Ok(result) => {
                if result.status == ApplyStatus::Applied {
                    report.migrations_applied += 1;
                }
                report.results.push(result);
            }
            Err(e) => return Err(with_progress(migration, e, report.migrations_applied)),
        }
    }

    report.total_time_ms = start.elapsed().as_millis() as i32;

    tracing::info!(
        module = %module,
        schema = %db.context(),
        migrations_applied = report.migrations_applied,
        total_time_ms = report.total_time_ms,
        dry_run = dry_run,
        "Migrate completed"
    );

    Ok(report)
}

/// Apply one migration, creating the ledger table first if needed.
pub async fn apply_single(
    db: &SchemaDb,
    ledger: &Ledger,
    migration: &MigrationFile,
) -> Result<ApplyResult> {
    ensure_ledger(db, ledger).await?;
    apply_one(db, ledger, migration).await
}

/// Create the ledger table in its own transaction.
///
/// A cancelled call drops the transaction, which rolls back before the
/// connection is reused.
async fn ensure_ledger(db: &SchemaDb, ledger: &Ledger) -> Result<()> {
    let mut conn = db.acquire().await?;
    let tx = conn.transaction().await?;
    ledger.ensure_table(tx.client()).await?;
    tx.commit().await
}

/// Attach the batch's progress to an error from `migration`.
fn with_progress(
    migration: &MigrationFile,
    err: SchemaShareError,
    applied_before: usize,
) -> SchemaShareError {
    match err {
        SchemaShareError::MigrationFailed {
            filename, reason, ..
        } => SchemaShareError::MigrationFailed {
            filename,
            reason,
            applied_before,
        },
        other => SchemaShareError::MigrationFailed {
            filename: migration.filename.clone(),
            reason: other.to_string(),
            applied_before,
        },
    }
}

fn failure_reason(err: SchemaShareError) -> String {
    match err {
        SchemaShareError::MigrationFailed { reason, .. } => reason,
        SchemaShareError::DatabaseError(e) => format_db_error(&e),
        other => other.to_string(),
    }
}

/// Apply `migration`, reporting any failure as `MigrationFailed`.
///
/// A changed checksum found on re-check keeps its own error.
async fn apply_one(db: &SchemaDb, ledger: &Ledger, migration: &MigrationFile) -> Result<ApplyResult> {
    match apply_in_transaction(db, ledger, migration).await {
        Ok(result) => Ok(result),
        Err(e @ SchemaShareError::ChecksumMismatch { .. }) => Err(e),
        Err(e) => {
            let reason = failure_reason(e);
            tracing::error!(
                module = %migration.module,
                migration = %migration.filename,
                reason = %reason,
                "Migration failed"
            );
            Err(SchemaShareError::MigrationFailed {
                filename: migration.filename.clone(),
                reason,
                applied_before: 0,
            })
        }
    }
}

/// Lock, re-check, execute, record and commit in one transaction.
///
/// The advisory lock is released by the commit (or the rollback on any
/// early return), so the ledger row and the migration's effects land together.
/// Deferred constraints fire at commit, so a commit error is a failure of
/// this migration too.
async fn apply_in_transaction(
    db: &SchemaDb,
    ledger: &Ledger,
    migration: &MigrationFile,
) -> Result<ApplyResult> {
    let raw_sql = migration.sql()?;
    if db.schema().is_some() && !template::has_placeholders(raw_sql) {
        tracing::warn!(
            module = %migration.module,
            migration = %migration.filename,
            "Migration has no table placeholders; its objects follow search_path, not the bound schema"
        );
    }
    let sql = db.resolve(raw_sql);
    let version = migration.version.as_str();

    let mut conn = db.acquire().await?;
    let tx = conn.transaction().await?;

    db::acquire_xact_lock(tx.client(), &ledger.lock_key(Some(&migration.module))).await?;

    if let Some(record) = ledger.find(tx.client(), &migration.module, version).await? {
        if record.checksum != migration.checksum {
            return Err(checksum_mismatch(migration, &record));
        }
        tracing::debug!(
            module = %migration.module,
            migration = %migration.filename,
            "Already applied by another runner, skipping"
        );
        return Ok(ApplyResult::new(migration, ApplyStatus::Skipped));
    }

    tracing::info!(
        module = %migration.module,
        migration = %migration.filename,
        schema = %db.context(),
        "Applying migration"
    );

    let started = Instant::now();
    tx.client().batch_execute(&sql).await?;
    let execution_time_ms = started.elapsed().as_millis() as i32;

    let record = MigrationRecord {
        module_name: migration.module.clone(),
        version: version.to_string(),
        filename: migration.filename.clone(),
        checksum: migration.checksum.clone(),
        applied_at: Utc::now(),
        execution_time_ms,
        rollback_sql: None,
    };
    ledger.record_applied(tx.client(), &record).await?;
    tx.commit().await?;

    let mut result = ApplyResult::new(migration, ApplyStatus::Applied);
    result.execution_time_ms = execution_time_ms;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_names_both_digests() {
        let migration = MigrationFile::from_bytes("users", "001_init.sql", b"SELECT 2;".to_vec());
        let record = MigrationRecord {
            module_name: "users".to_string(),
            version: "001".to_string(),
            filename: "001_init.sql".to_string(),
            checksum: "abc".to_string(),
            applied_at: Utc::now(),
            execution_time_ms: 1,
            rollback_sql: None,
        };
        match checksum_mismatch(&migration, &record) {
            SchemaShareError::ChecksumMismatch {
                module,
                version,
                expected,
                found,
                ..
            } => {
                assert_eq!(module, "users");
                assert_eq!(version, "001");
                assert_eq!(expected, "abc");
                assert_eq!(found, migration.checksum);
            }
            other => panic!("expected ChecksumMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_with_progress_counts_earlier_successes() {
        let migration = MigrationFile::from_bytes("m", "002_b.sql", b"SELECT 1;".to_vec());
        let failed = SchemaShareError::MigrationFailed {
            filename: "002_b.sql".to_string(),
            reason: "boom".to_string(),
            applied_before: 0,
        };
        match with_progress(&migration, failed, 3) {
            SchemaShareError::MigrationFailed {
                filename,
                reason,
                applied_before,
            } => {
                assert_eq!(filename, "002_b.sql");
                assert_eq!(reason, "boom");
                assert_eq!(applied_before, 3);
            }
            other => panic!("expected MigrationFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_with_progress_wraps_other_errors_with_filename() {
        let migration = MigrationFile::from_bytes("m", "002_b.sql", b"SELECT 1;".to_vec());
        let record = MigrationRecord {
            module_name: "m".to_string(),
            version: "002".to_string(),
            filename: "002_b.sql".to_string(),
            checksum: "abc".to_string(),
            applied_at: Utc::now(),
            execution_time_ms: 1,
            rollback_sql: None,
        };
        let wrapped = [
            SchemaShareError::LockError("lock timeout".to_string()),
            SchemaShareError::PoolClosed,
            checksum_mismatch(&migration, &record),
        ];
        for err in wrapped {
            let message = err.to_string();
            match with_progress(&migration, err, 1) {
                SchemaShareError::MigrationFailed {
                    filename,
                    reason,
                    applied_before,
                } => {
                    assert_eq!(filename, "002_b.sql");
                    assert_eq!(reason, message);
                    assert_eq!(applied_before, 1);
                }
                other => panic!("expected MigrationFailed, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_failure_reason_keeps_inner_reason() {
        let failed = SchemaShareError::MigrationFailed {
            filename: "001_a.sql".to_string(),
            reason: "syntax error".to_string(),
            applied_before: 2,
        };
        assert_eq!(failure_reason(failed), "syntax error");
        assert_eq!(
            failure_reason(SchemaShareError::LockError("denied".to_string())),
            SchemaShareError::LockError("denied".to_string()).to_string()
        );
    }

    #[test]
    fn test_dry_run_result_serializes_resolved_sql_only_when_present() {
        let migration = MigrationFile::from_bytes("m", "001_a.sql", b"SELECT 1;".to_vec());
        let applied = serde_json::to_value(ApplyResult::new(&migration, ApplyStatus::Applied)).unwrap();
        assert!(applied.get("resolved_sql").is_none());
        assert_eq!(applied["status"], "Applied");

        let mut dry = ApplyResult::new(&migration, ApplyStatus::DryRun);
        dry.resolved_sql = Some("SELECT 1;".to_string());
        let dry = serde_json::to_value(dry).unwrap();
        assert_eq!(dry["resolved_sql"], "SELECT 1;");
    }
}
