use thiserror::Error;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        if let Some(position) = db_err.position() {
            msg.push_str(&format!("\n  Position: {:?}", position));
        }
        return msg;
    }
    // Fallback: walk the source chain
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    msg
}

#[derive(Error, Debug)]
pub enum SchemaShareError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Database error: {}", format_db_error(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    #[error("Migration parse error: {0}")]
    MigrationParseError(String),

    #[error(
        "Checksum mismatch for migration {filename} (module '{module}', version {version}): \
         recorded {expected}, file has {found}. Applied migrations must not be edited."
    )]
    ChecksumMismatch {
        module: String,
        version: String,
        filename: String,
        expected: String,
        found: String,
    },

    #[error("Migration version {version} of module '{module}' is already recorded")]
    DuplicateMigration { module: String, version: String },

    #[error("Module '{module}' has two migrations with version {version}: {first} and {second}")]
    DuplicateVersion {
        module: String,
        version: String,
        first: String,
        second: String,
    },

    #[error("Migration failed for {filename} after {applied_before} successful migration(s): {reason}")]
    MigrationFailed {
        filename: String,
        reason: String,
        applied_before: usize,
    },

    #[error("No migration record for version {version} of module '{module}'")]
    NotFound { module: String, version: String },

    #[error("Validation failed:\n{0}")]
    ValidationFailed(String),

    #[error("Failed to acquire advisory lock: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchemaShareError>;
