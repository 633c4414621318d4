//! Migration file discovery and creation.
//!
//! A migration is any `*.sql` file directly inside a module's directory.
//! Files are re-read on every scan so edits to applied migrations are caught.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::checksum::calculate_checksum;
use crate::error::{Result, SchemaShareError};
use crate::version::{extract_version_with_strategy, VersionKey, VersionStrategy};

/// A migration file discovered on disk.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationFile {
    pub module: String,
    pub filename: String,
    pub version: VersionKey,
    pub strategy: VersionStrategy,
    pub checksum: String,
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub raw_content: Vec<u8>,
}

impl MigrationFile {
    /// Build a migration from content already in memory.
    pub fn from_bytes(module: &str, filename: &str, raw_content: Vec<u8>) -> Self {
        let (version, strategy) = extract_version_with_strategy(filename);
        Self {
            module: module.to_string(),
            filename: filename.to_string(),
            version,
            strategy,
            checksum: calculate_checksum(&raw_content),
            path: PathBuf::from(filename),
            raw_content,
        }
    }

    /// Migration text as UTF-8, before template resolution.
    pub fn sql(&self) -> Result<&str> {
        std::str::from_utf8(&self.raw_content).map_err(|e| {
            SchemaShareError::MigrationParseError(format!(
                "Migration file '{}' is not valid UTF-8: {}",
                self.filename, e
            ))
        })
    }
}

/// Scan `directory` for `*.sql` files and read them as migrations of `module`.
///
/// The result is sorted by version (ties broken by filename). A missing
/// directory yields no migrations.
pub fn scan_migrations(directory: &Path, module: &str) -> Result<Vec<MigrationFile>> {
    if !directory.exists() {
        tracing::warn!(
            directory = %directory.display(),
            module = %module,
            "Migration directory does not exist"
        );
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(directory).map_err(|e| {
        SchemaShareError::IoError(std::io::Error::new(
            e.kind(),
            format!(
                "Failed to read migration directory '{}': {}",
                directory.display(),
                e
            ),
        ))
    })?;

    let mut migrations = Vec::new();

    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        if !path.is_file() {
            continue;
        }

        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        if !filename.ends_with(".sql") {
            continue;
        }

        let raw_content = std::fs::read(&path)?;
        let mut migration = MigrationFile::from_bytes(module, &filename, raw_content);
        migration.path = path;
        migrations.push(migration);
    }

    migrations.sort_by(|a, b| {
        a.version
            .cmp(&b.version)
            .then_with(|| a.filename.cmp(&b.filename))
    });

    Ok(migrations)
}

/// Fail if two files of one module share a version.
///
/// Expects `migrations` sorted by version, as returned by [`scan_migrations`].
pub fn check_unique_versions(migrations: &[MigrationFile]) -> Result<()> {
    for pair in migrations.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(SchemaShareError::DuplicateVersion {
                module: pair[0].module.clone(),
                version: pair[0].version.to_string(),
                first: pair[0].filename.clone(),
                second: pair[1].filename.clone(),
            });
        }
    }
    Ok(())
}

/// Turn a free-form migration name into a filename-safe slug.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

/// Next `NNN_slug.sql` filename for `directory`.
///
/// The number is one past the highest numeric prefix present, zero-padded
/// to the widest existing prefix (at least three digits).
pub fn next_migration_filename(directory: &Path, name: &str) -> Result<String> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(SchemaShareError::MigrationParseError(format!(
            "Migration name '{}' has no usable characters",
            name
        )));
    }

    let mut highest: u64 = 0;
    let mut width: usize = 3;

    if directory.exists() {
        for entry in std::fs::read_dir(directory)? {
            let entry = entry?;
            let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !filename.ends_with(".sql") {
                continue;
            }
            let (version, strategy) = extract_version_with_strategy(&filename);
            if strategy != VersionStrategy::NumericPrefix {
                continue;
            }
            if let Ok(n) = version.as_str().parse::<u64>() {
                highest = highest.max(n);
                width = width.max(version.as_str().len());
            }
        }
    }

    Ok(format!("{:0width$}_{}.sql", highest + 1, slug, width = width))
}

/// Write a new migration file into `directory`, returning its filename.
///
/// Creates the directory if needed and never overwrites an existing file.
pub fn create_migration_file(directory: &Path, name: &str, content: &str) -> Result<String> {
    std::fs::create_dir_all(directory)?;
    let filename = next_migration_filename(directory, name)?;
    let path = directory.join(&filename);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| {
            SchemaShareError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to create migration '{}': {}", path.display(), e),
            ))
        })?;
    file.write_all(content.as_bytes())?;

    tracing::info!(file = %path.display(), "Created migration");
    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_scan_sorts_by_version_and_skips_non_sql() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "003_c.sql", "SELECT 3;");
        write(dir.path(), "001_a.sql", "SELECT 1;");
        write(dir.path(), "002_b.sql", "SELECT 2;");
        write(dir.path(), "README.md", "notes");
        std::fs::create_dir(dir.path().join("004_dir.sql")).unwrap();

        let migrations = scan_migrations(dir.path(), "users").unwrap();
        let names: Vec<&str> = migrations.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["001_a.sql", "002_b.sql", "003_c.sql"]);
        assert!(migrations.iter().all(|m| m.module == "users"));
        assert_eq!(migrations[0].version.as_str(), "001");
        assert_eq!(migrations[0].sql().unwrap(), "SELECT 1;");
    }

    #[test]
    fn test_scan_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(scan_migrations(&missing, "m").unwrap().is_empty());
    }

    #[test]
    fn test_rescan_sees_edits() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_a.sql", "SELECT 1;");
        let before = scan_migrations(dir.path(), "m").unwrap();
        write(dir.path(), "001_a.sql", "SELECT 2;");
        let after = scan_migrations(dir.path(), "m").unwrap();
        assert_ne!(before[0].checksum, after[0].checksum);
    }

    #[test]
    fn test_duplicate_versions_detected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_a.sql", "SELECT 1;");
        write(dir.path(), "001_b.sql", "SELECT 2;");
        let migrations = scan_migrations(dir.path(), "m").unwrap();
        match check_unique_versions(&migrations) {
            Err(SchemaShareError::DuplicateVersion { version, first, second, .. }) => {
                assert_eq!(version, "001");
                assert_eq!(first, "001_a.sql");
                assert_eq!(second, "001_b.sql");
            }
            other => panic!("expected DuplicateVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_mixed_styles_sharing_version_are_duplicates() {
        let migrations = vec![
            MigrationFile::from_bytes("m", "1_a.sql", b"SELECT 1;".to_vec()),
            MigrationFile::from_bytes("m", "V1__b.sql", b"SELECT 1;".to_vec()),
        ];
        assert!(check_unique_versions(&migrations).is_err());
    }

    #[test]
    fn test_non_utf8_content_errors_on_sql() {
        let m = MigrationFile::from_bytes("m", "001_bin.sql", vec![0xff, 0xfe]);
        assert!(matches!(m.sql(), Err(SchemaShareError::MigrationParseError(_))));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Create Users Table"), "create_users_table");
        assert_eq!(slugify("  add-index (email) "), "add_index_email");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_next_filename_in_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            next_migration_filename(dir.path(), "init").unwrap(),
            "001_init.sql"
        );
    }

    #[test]
    fn test_next_filename_follows_highest_and_width() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001_a.sql", "");
        write(dir.path(), "0007_b.sql", "");
        write(dir.path(), "V99__flyway.sql", "");
        write(dir.path(), "seed.sql", "");
        assert_eq!(
            next_migration_filename(dir.path(), "Add Orders").unwrap(),
            "0008_add_orders.sql"
        );
    }

    #[test]
    fn test_create_migration_file_writes_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("users");

        let first = create_migration_file(&target, "init", "CREATE TABLE {{tables.users}} (id INT);").unwrap();
        let second = create_migration_file(&target, "add email", "ALTER TABLE {{tables.users}} ADD email TEXT;").unwrap();

        assert_eq!(first, "001_init.sql");
        assert_eq!(second, "002_add_email.sql");
        assert_eq!(
            std::fs::read_to_string(target.join(&first)).unwrap(),
            "CREATE TABLE {{tables.users}} (id INT);"
        );
    }

    #[test]
    fn test_create_migration_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        assert!(create_migration_file(dir.path(), "---", "SELECT 1;").is_err());
    }
}
