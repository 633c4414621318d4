use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::SchemaDb;
use crate::error::Result;
use crate::ledger::{Ledger, MigrationRecord};
use crate::migration::{scan_migrations, MigrationFile};
use crate::version::VersionKey;

/// The state of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    Pending,
    Applied,
    /// Applied, but the file on disk has changed since.
    ChecksumMismatch,
    /// Recorded in the ledger, no longer on disk.
    Missing,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Pending => write!(f, "Pending"),
            MigrationState::Applied => write!(f, "Applied"),
            MigrationState::ChecksumMismatch => write!(f, "Checksum Mismatch"),
            MigrationState::Missing => write!(f, "Missing"),
        }
    }
}

/// Combined view of a migration (file + ledger row).
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub module: String,
    pub version: String,
    pub filename: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i32>,
    pub checksum: String,
}

/// Merge discovered files with the module's ledger rows, ordered by version.
///
/// Unlike computing pending migrations, drift is reported, not raised.
pub async fn execute(
    db: &SchemaDb,
    ledger: &Ledger,
    directory: &Path,
    module: &str,
) -> Result<Vec<MigrationStatus>> {
    let files = scan_migrations(directory, module)?;

    let conn = db.acquire().await?;
    let applied = if ledger.exists(conn.client()).await? {
        ledger.applied(conn.client(), module).await?
    } else {
        Vec::new()
    };

    Ok(merge(module, &files, applied))
}

fn merge(module: &str, files: &[MigrationFile], applied: Vec<MigrationRecord>) -> Vec<MigrationStatus> {
    let mut by_version: HashMap<String, MigrationRecord> = applied
        .into_iter()
        .map(|r| (r.version.clone(), r))
        .collect();

    let mut statuses: Vec<MigrationStatus> = files
        .iter()
        .map(|file| match by_version.remove(file.version.as_str()) {
            Some(record) => MigrationStatus {
                module: module.to_string(),
                version: record.version,
                filename: file.filename.clone(),
                state: if record.checksum == file.checksum {
                    MigrationState::Applied
                } else {
                    MigrationState::ChecksumMismatch
                },
                applied_at: Some(record.applied_at),
                execution_time_ms: Some(record.execution_time_ms),
                checksum: record.checksum,
            },
            None => MigrationStatus {
                module: module.to_string(),
                version: file.version.to_string(),
                filename: file.filename.clone(),
                state: MigrationState::Pending,
                applied_at: None,
                execution_time_ms: None,
                checksum: file.checksum.clone(),
            },
        })
        .collect();

    statuses.extend(by_version.into_values().map(|record| MigrationStatus {
        module: module.to_string(),
        version: record.version,
        filename: record.filename,
        state: MigrationState::Missing,
        applied_at: Some(record.applied_at),
        execution_time_ms: Some(record.execution_time_ms),
        checksum: record.checksum,
    }));

    statuses.sort_by(|a, b| {
        VersionKey::from(a.version.as_str())
            .cmp(&VersionKey::from(b.version.as_str()))
            .then_with(|| a.filename.cmp(&b.filename))
    });
    statuses
}
