//! Pool construction, TLS support, advisory locking, and transaction execution.

use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use tokio_postgres::GenericClient;

use crate::config::{DatabaseConfig, SslMode};
use crate::error::{format_db_error, Result, SchemaShareError};

/// Quote a SQL identifier to prevent SQL injection.
///
/// Doubles any embedded double-quotes and wraps in double-quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate that a SQL identifier contains only safe characters.
///
/// Returns an error for names with characters outside `[a-zA-Z0-9_]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SchemaShareError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SchemaShareError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}

/// Build a rustls ClientConfig using the Mozilla CA bundle.
fn make_rustls_config() -> Result<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SchemaShareError::ConfigError(format!("Invalid TLS configuration: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}

/// Check if a postgres error is a permanent authentication failure that should not be retried.
fn is_permanent_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        return code == "28P01" || code == "28000";
    }
    false
}

/// Translate a pool checkout failure into the crate's error taxonomy.
pub(crate) fn map_pool_error(e: PoolError) -> SchemaShareError {
    match e {
        PoolError::Closed => SchemaShareError::PoolClosed,
        PoolError::Backend(e) => SchemaShareError::ConnectionError(format_db_error(&e)),
        PoolError::Timeout(kind) => SchemaShareError::ConnectionError(format!(
            "Timed out waiting for a pooled connection ({:?})",
            kind
        )),
        other => SchemaShareError::ConnectionError(other.to_string()),
    }
}

/// Build a connection pool from config without opening any connection.
///
/// Connections are created on first checkout.
pub fn build_pool(config: &DatabaseConfig) -> Result<Pool> {
    let conn_string = config.connection_string()?;
    let mut pg_config: tokio_postgres::Config = conn_string.parse().map_err(|e| {
        SchemaShareError::ConfigError(format!("Invalid connection string: {}", e))
    })?;

    if config.connect_timeout_secs > 0 {
        pg_config.connect_timeout(Duration::from_secs(config.connect_timeout_secs as u64));
    }
    if config.statement_timeout_secs > 0 {
        pg_config.options(&format!(
            "-c statement_timeout={}s",
            config.statement_timeout_secs
        ));
    }

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let manager = match config.ssl_mode {
        SslMode::Disable => {
            pg_config.ssl_mode(tokio_postgres::config::SslMode::Disable);
            Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
        }
        SslMode::Prefer | SslMode::Require => {
            let mode = if config.ssl_mode == SslMode::Require {
                tokio_postgres::config::SslMode::Require
            } else {
                tokio_postgres::config::SslMode::Prefer
            };
            pg_config.ssl_mode(mode);
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_rustls_config()?);
            Manager::from_config(pg_config, tls, mgr_config)
        }
    };

    let acquire_timeout = if config.acquire_timeout_secs > 0 {
        Some(Duration::from_secs(config.acquire_timeout_secs as u64))
    } else {
        None
    };

    let pool = Pool::builder(manager)
        .max_size(config.max_connections)
        .wait_timeout(acquire_timeout)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| SchemaShareError::ConfigError(format!("Failed to create pool: {}", e)))?;

    Ok(pool)
}

/// Build a pool and verify it can reach the database.
///
/// Retries up to `connect_retries` times with exponential backoff + jitter:
/// each retry waits `min(2^attempt, 30)s + rand(0..1000ms)`.
/// Permanent errors (authentication failures) are not retried.
pub async fn connect_pool(config: &DatabaseConfig) -> Result<Pool> {
    let pool = build_pool(config)?;
    let retries = config.connect_retries;
    let mut last_err = None;

    for attempt in 0..=retries {
        if attempt > 0 {
            let base_delay = std::cmp::min(1u64 << attempt.min(5), 30);
            let jitter_ms = fastrand::u64(0..1000);
            let delay = Duration::from_secs(base_delay) + Duration::from_millis(jitter_ms);
            tracing::info!(
                attempt = attempt + 1,
                max_attempts = retries + 1,
                delay_ms = delay.as_millis() as u64,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        match pool.get().await {
            Ok(_client) => {
                let status = pool.status();
                tracing::info!(
                    max_connections = status.max_size,
                    ssl_mode = ?config.ssl_mode,
                    "Connection pool ready"
                );
                return Ok(pool);
            }
            Err(PoolError::Backend(e)) if is_permanent_error(&e) => {
                tracing::error!(error = %e, "Permanent connection error, not retrying");
                pool.close();
                return Err(SchemaShareError::ConnectionError(format_db_error(&e)));
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = attempt + 1, "Connection attempt failed");
                last_err = Some(map_pool_error(e));
            }
        }
    }

    pool.close();
    Err(last_err.unwrap_or_else(|| {
        SchemaShareError::ConnectionError("Unable to connect".to_string())
    }))
}

/// Compute a stable i64 lock ID from a lock key using CRC32.
///
/// CRC32 rather than DefaultHasher: the ID must be identical across
/// processes and compiler versions.
pub fn advisory_lock_id(key: &str) -> i64 {
    crc32fast::hash(key.as_bytes()) as i64
}

/// Take a transaction-scoped advisory lock keyed by `key`.
///
/// Blocks until the lock is free. It is released on commit or rollback.
pub async fn acquire_xact_lock<C>(client: &C, key: &str) -> Result<()>
where
    C: GenericClient + Sync,
{
    let lock_id = advisory_lock_id(key);
    tracing::debug!(lock_id = lock_id, key = %key, "Acquiring advisory lock");

    client
        .execute("SELECT pg_advisory_xact_lock($1)", &[&lock_id])
        .await
        .map_err(|e| SchemaShareError::LockError(format_db_error(&e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("tenant_42").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a-b").is_err());
        assert!(validate_identifier("x\"; DROP SCHEMA public; --").is_err());
    }

    #[test]
    fn test_advisory_lock_id_stable() {
        assert_eq!(advisory_lock_id("s.schema_migrations:users"), advisory_lock_id("s.schema_migrations:users"));
        assert_ne!(advisory_lock_id("s.schema_migrations:users"), advisory_lock_id("s.schema_migrations:orders"));
        assert!(advisory_lock_id("anything") >= 0);
    }

    #[test]
    fn test_build_pool_is_lazy() {
        let config = DatabaseConfig {
            url: Some("host=127.0.0.1 port=1 user=nobody dbname=nothing".to_string()),
            ssl_mode: SslMode::Disable,
            max_connections: 3,
            ..Default::default()
        };
        let pool = build_pool(&config).unwrap();
        let status = pool.status();
        assert_eq!(status.max_size, 3);
        assert_eq!(status.size, 0);
    }

    #[test]
    fn test_build_pool_rejects_bad_connection_string() {
        let config = DatabaseConfig {
            url: Some("host=localhost port=notaport user=x dbname=y".to_string()),
            ..Default::default()
        };
        assert!(matches!(build_pool(&config), Err(SchemaShareError::ConfigError(_))));
    }
}
