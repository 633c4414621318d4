//! The per-schema migration ledger table.
//!
//! The ledger lives inside the schema its migrations target, so dropping
//! the schema drops its migration history with it. Rows are keyed by
//! `(module_name, version)`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::{GenericClient, Row};

use crate::db::{self, quote_ident};
use crate::error::{Result, SchemaShareError};
use crate::template::SchemaContext;

pub const DEFAULT_LEDGER_TABLE: &str = "schema_migrations";

/// A row of the ledger table.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub module_name: String,
    pub version: String,
    pub filename: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i32,
    pub rollback_sql: Option<String>,
}

impl MigrationRecord {
    fn from_row(row: &Row) -> Self {
        Self {
            module_name: row.get(0),
            version: row.get(1),
            filename: row.get(2),
            checksum: row.get(3),
            applied_at: row.get(4),
            execution_time_ms: row.get(5),
            rollback_sql: row.get(6),
        }
    }
}

const COLUMNS: &str =
    "module_name, version, filename, checksum, applied_at, execution_time_ms, rollback_sql";

/// Ledger table bound to one schema context.
#[derive(Debug, Clone)]
pub struct Ledger {
    context: SchemaContext,
    table: String,
}

impl Ledger {
    pub fn new(context: SchemaContext, table: &str) -> Self {
        Self {
            context,
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn context(&self) -> &SchemaContext {
        &self.context
    }

    /// Schema-qualified, quoted table reference.
    fn fq(&self) -> String {
        match self.context.schema() {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.table)),
            None => quote_ident(&self.table),
        }
    }

    /// Key for advisory locks that serialize work on this ledger.
    pub fn lock_key(&self, module: Option<&str>) -> String {
        let schema = self.context.schema().unwrap_or("");
        match module {
            Some(module) => format!("schemashare:{}.{}:{}", schema, self.table, module),
            None => format!("schemashare:{}.{}", schema, self.table),
        }
    }

    /// Create the ledger table if it does not exist.
    ///
    /// Serialized with a transaction-scoped advisory lock so concurrent first
    /// runs do not race on the catalog. `client` must be a transaction; the
    /// lock is held until it commits or rolls back.
    pub async fn ensure_table<C>(&self, client: &C) -> Result<()>
    where
        C: GenericClient + Sync,
    {
        db::acquire_xact_lock(client, &self.lock_key(None)).await?;

        let fq = self.fq();
        let sql = format!(
            r#"
CREATE TABLE IF NOT EXISTS {fq} (
    id                SERIAL PRIMARY KEY,
    module_name       VARCHAR(255) NOT NULL,
    version           VARCHAR(255) NOT NULL,
    filename          VARCHAR(1000) NOT NULL,
    checksum          VARCHAR(64) NOT NULL,
    applied_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    execution_time_ms INTEGER NOT NULL,
    rollback_sql      TEXT,
    UNIQUE (module_name, version)
);

CREATE INDEX IF NOT EXISTS {idx_name} ON {fq} (module_name);
"#,
            fq = fq,
            idx_name = quote_ident(&format!("{}_module_idx", self.table)),
        );

        client.batch_execute(&sql).await?;
        Ok(())
    }

    /// Check if the ledger table exists.
    pub async fn exists<C>(&self, client: &C) -> Result<bool>
    where
        C: GenericClient + Sync,
    {
        let row = client
            .query_one(
                "SELECT EXISTS (
                    SELECT FROM information_schema.tables
                    WHERE table_schema::TEXT = COALESCE($1::TEXT, current_schema()::TEXT)
                      AND table_name::TEXT = $2::TEXT
                )",
                &[&self.context.schema(), &self.table],
            )
            .await?;

        Ok(row.get::<_, bool>(0))
    }

    /// All records of `module`, ordered by version.
    pub async fn applied<C>(&self, client: &C, module: &str) -> Result<Vec<MigrationRecord>>
    where
        C: GenericClient + Sync,
    {
        let sql = format!(
            "SELECT {} FROM {} WHERE module_name = $1 ORDER BY version",
            COLUMNS,
            self.fq()
        );
        let rows = client.query(&sql, &[&module]).await?;
        Ok(rows.iter().map(MigrationRecord::from_row).collect())
    }

    /// Look up one record.
    pub async fn find<C>(
        &self,
        client: &C,
        module: &str,
        version: &str,
    ) -> Result<Option<MigrationRecord>>
    where
        C: GenericClient + Sync,
    {
        let sql = format!(
            "SELECT {} FROM {} WHERE module_name = $1 AND version = $2",
            COLUMNS,
            self.fq()
        );
        let row = client.query_opt(&sql, &[&module, &version]).await?;
        Ok(row.as_ref().map(MigrationRecord::from_row))
    }

    /// Insert a record.
    ///
    /// The insert is conditional on the `(module_name, version)` key, so a
    /// concurrent writer cannot slip in between a check and the write.
    /// Fails with [`SchemaShareError::DuplicateMigration`] if the key exists.
    pub async fn record_applied<C>(&self, client: &C, record: &MigrationRecord) -> Result<()>
    where
        C: GenericClient + Sync,
    {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (module_name, version) DO NOTHING",
            self.fq(),
            COLUMNS
        );

        let inserted = client
            .execute(
                &sql,
                &[
                    &record.module_name,
                    &record.version,
                    &record.filename,
                    &record.checksum,
                    &record.applied_at,
                    &record.execution_time_ms,
                    &record.rollback_sql,
                ],
            )
            .await?;

        if inserted == 0 {
            return Err(SchemaShareError::DuplicateMigration {
                module: record.module_name.clone(),
                version: record.version.clone(),
            });
        }
        Ok(())
    }

    /// Attach rollback SQL to an existing record.
    pub async fn annotate_rollback<C>(
        &self,
        client: &C,
        module: &str,
        version: &str,
        rollback_sql: &str,
    ) -> Result<()>
    where
        C: GenericClient + Sync,
    {
        let sql = format!(
            "UPDATE {} SET rollback_sql = $1 WHERE module_name = $2 AND version = $3",
            self.fq()
        );
        let updated = client.execute(&sql, &[&rollback_sql, &module, &version]).await?;
        if updated == 0 {
            return Err(SchemaShareError::NotFound {
                module: module.to_string(),
                version: version.to_string(),
            });
        }
        Ok(())
    }

    /// Most recent records first, optionally filtered by module.
    pub async fn history<C>(
        &self,
        client: &C,
        module: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<MigrationRecord>>
    where
        C: GenericClient + Sync,
    {
        let sql = format!(
            "SELECT {} FROM {} \
             WHERE ($1::TEXT IS NULL OR module_name = $1) \
             ORDER BY applied_at DESC, id DESC \
             LIMIT $2",
            COLUMNS,
            self.fq()
        );
        let rows = client.query(&sql, &[&module, &limit]).await?;
        Ok(rows.iter().map(MigrationRecord::from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fq_with_schema() {
        let ledger = Ledger::new(SchemaContext::with_schema("users"), "schema_migrations");
        assert_eq!(ledger.fq(), r#""users"."schema_migrations""#);
    }

    #[test]
    fn test_fq_without_schema() {
        let ledger = Ledger::new(SchemaContext::unscoped(), "schema_migrations");
        assert_eq!(ledger.fq(), r#""schema_migrations""#);
    }

    #[test]
    fn test_lock_keys_distinguish_schema_and_module() {
        let a = Ledger::new(SchemaContext::with_schema("a"), DEFAULT_LEDGER_TABLE);
        let b = Ledger::new(SchemaContext::with_schema("b"), DEFAULT_LEDGER_TABLE);
        assert_ne!(a.lock_key(Some("users")), b.lock_key(Some("users")));
        assert_ne!(a.lock_key(Some("users")), a.lock_key(Some("orders")));
        assert_ne!(a.lock_key(None), a.lock_key(Some("users")));
    }
}
