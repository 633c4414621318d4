use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::context::SchemaDb;
use crate::error::{Result, SchemaShareError};
use crate::ledger::{Ledger, MigrationRecord};
use crate::migration::{scan_migrations, MigrationFile};

/// Report returned after a validate operation.
#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub module: String,
    pub valid: bool,
    pub checked: usize,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

/// Execute the validate command.
///
/// For each ledger row of `module`:
/// - Find the corresponding file on disk
/// - Compare checksums; drift is an issue
/// - Warn if the file is missing
pub async fn execute(
    db: &SchemaDb,
    ledger: &Ledger,
    directory: &Path,
    module: &str,
) -> Result<ValidateReport> {
    let files = scan_migrations(directory, module)?;

    let conn = db.acquire().await?;
    if !ledger.exists(conn.client()).await? {
        return Ok(ValidateReport {
            module: module.to_string(),
            valid: true,
            checked: 0,
            issues: Vec::new(),
            warnings: vec!["No ledger table found, nothing to validate.".to_string()],
        });
    }

    let applied = ledger.applied(conn.client(), module).await?;
    drop(conn);
    let report = check(module, &applied, &files);

    tracing::info!(
        module = %module,
        valid = report.valid,
        issue_count = report.issues.len(),
        warning_count = report.warnings.len(),
        "Validation completed"
    );

    if !report.valid {
        return Err(SchemaShareError::ValidationFailed(report.issues.join("\n")));
    }

    Ok(report)
}

fn check(module: &str, applied: &[MigrationRecord], files: &[MigrationFile]) -> ValidateReport {
    let by_version: HashMap<&str, &MigrationFile> =
        files.iter().map(|f| (f.version.as_str(), f)).collect();

    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    for record in applied {
        match by_version.get(record.version.as_str()) {
            Some(file) if file.checksum != record.checksum => issues.push(format!(
                "Checksum mismatch for version {}: applied={}, on disk={}. \
                 Migration file '{}' has been modified after it was applied.",
                record.version, record.checksum, file.checksum, file.filename
            )),
            Some(_) => {}
            None => warnings.push(format!(
                "Applied migration version {} (file: {}) not found on disk.",
                record.version, record.filename
            )),
        }
    }

    ValidateReport {
        module: module.to_string(),
        valid: issues.is_empty(),
        checked: applied.len(),
        issues,
        warnings,
    }
}
