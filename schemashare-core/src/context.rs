//! Schema-bound views over a shared connection pool.
//!
//! A [`SchemaDb`] either owns its pool or borrows one. Only the owner can
//! close the pool; a borrower's `close` just detaches it. Once the pool is
//! closed every context sharing it fails with [`SchemaShareError::PoolClosed`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use deadpool_postgres::{Object, Pool};
use serde::Serialize;
use tokio_postgres::types::{FromSqlOwned, ToSql};
use tokio_postgres::{Client, GenericClient, Row};

use crate::config::DatabaseConfig;
use crate::db::{self, quote_ident, validate_identifier};
use crate::error::{Result, SchemaShareError};
use crate::template::{self, SchemaContext};

/// Non-owning handle to a pool. It cannot close the pool.
#[derive(Clone)]
pub struct PoolRef(Pool);

impl PoolRef {
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats::from(&self.0)
    }
}

/// Wrap a pool the caller keeps ownership of.
impl From<Pool> for PoolRef {
    fn from(pool: Pool) -> Self {
        PoolRef(pool)
    }
}

/// How a context holds its pool.
pub enum PoolHandle {
    Owning(Pool),
    Borrowing(PoolRef),
}

impl PoolHandle {
    fn pool(&self) -> &Pool {
        match self {
            PoolHandle::Owning(pool) => pool,
            PoolHandle::Borrowing(pool_ref) => &pool_ref.0,
        }
    }
}

/// Lifecycle state of a context. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContextState {
    Connected,
    Closed,
}

/// Pool occupancy as reported by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently open.
    pub size: usize,
    /// Open connections checked out.
    pub used: usize,
    /// Open connections idle in the pool.
    pub free: usize,
    pub max_size: usize,
    /// Tasks waiting for a connection.
    pub waiting: usize,
}

impl From<&Pool> for PoolStats {
    fn from(pool: &Pool) -> Self {
        let status = pool.status();
        let free = status.available as usize;
        Self {
            size: status.size,
            used: status.size.saturating_sub(free),
            free,
            max_size: status.max_size,
            waiting: status.waiting,
        }
    }
}

/// A schema-bound database context.
///
/// Every query method resolves `{{tables.NAME}}` / `{{schema}}` against the
/// bound schema before handing SQL to the driver.
pub struct SchemaDb {
    handle: PoolHandle,
    context: SchemaContext,
    closed: AtomicBool,
}

impl fmt::Debug for SchemaDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaDb")
            .field("schema", &self.context.schema())
            .field("owner", &self.is_owner())
            .field("state", &self.state())
            .finish()
    }
}

impl SchemaDb {
    /// Create a pool from config and own it. The schema comes from `config.schema`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if let Some(ref schema) = config.schema {
            validate_identifier(schema)?;
        }
        let pool = db::connect_pool(config).await?;
        Self::adopt(pool, config.schema.as_deref())
    }

    /// Take ownership of a pool built elsewhere.
    pub fn adopt(pool: Pool, schema: Option<&str>) -> Result<Self> {
        Self::with_handle(PoolHandle::Owning(pool), schema)
    }

    /// Share `pool` without owning it.
    pub fn borrowing(pool: PoolRef, schema: Option<&str>) -> Result<Self> {
        Self::with_handle(PoolHandle::Borrowing(pool), schema)
    }

    fn with_handle(handle: PoolHandle, schema: Option<&str>) -> Result<Self> {
        if let Some(schema) = schema {
            validate_identifier(schema)?;
        }
        let context = SchemaContext::new(schema);
        let owner = matches!(handle, PoolHandle::Owning(_));
        tracing::debug!(schema = %context, owner = owner, "Schema context created");
        Ok(Self {
            handle,
            context,
            closed: AtomicBool::new(false),
        })
    }

    /// A borrowing context over the same pool, bound to `schema`.
    pub fn with_schema(&self, schema: &str) -> Result<SchemaDb> {
        self.ensure_open()?;
        Self::borrowing(self.pool_ref(), Some(schema))
    }

    /// Non-owning handle to this context's pool.
    pub fn pool_ref(&self) -> PoolRef {
        PoolRef(self.handle.pool().clone())
    }

    pub fn context(&self) -> &SchemaContext {
        &self.context
    }

    pub fn schema(&self) -> Option<&str> {
        self.context.schema()
    }

    pub fn is_owner(&self) -> bool {
        matches!(self.handle, PoolHandle::Owning(_))
    }

    pub fn state(&self) -> ContextState {
        if self.closed.load(Ordering::Acquire) || self.handle.pool().is_closed() {
            ContextState::Closed
        } else {
            ContextState::Connected
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ContextState::Connected => Ok(()),
            ContextState::Closed => Err(SchemaShareError::PoolClosed),
        }
    }

    /// Resolve templates in `sql` against this context's schema.
    pub fn resolve(&self, sql: &str) -> String {
        template::resolve(sql, &self.context)
    }

    /// Check out one connection from the pool.
    pub async fn acquire(&self) -> Result<SchemaConnection> {
        self.ensure_open()?;
        let client = self
            .handle
            .pool()
            .get()
            .await
            .map_err(db::map_pool_error)?;
        Ok(SchemaConnection {
            client,
            context: self.context.clone(),
        })
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.acquire().await?.execute(sql, params).await
    }

    /// First row of the result, if any.
    pub async fn fetch_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        self.acquire().await?.fetch_one(sql, params).await
    }

    pub async fn fetch_all(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        self.acquire().await?.fetch_all(sql, params).await
    }

    /// First column of the first row, if any.
    pub async fn fetch_value<T>(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<T>>
    where
        T: FromSqlOwned,
    {
        self.acquire().await?.fetch_value(sql, params).await
    }

    /// Run one statement once per parameter set, all in a single transaction.
    pub async fn execute_many(
        &self,
        sql: &str,
        param_sets: &[&[&(dyn ToSql + Sync)]],
    ) -> Result<u64> {
        let mut conn = self.acquire().await?;
        let tx = conn.transaction().await?;
        let affected = tx.execute_many(sql, param_sets).await?;
        tx.commit().await?;
        Ok(affected)
    }

    /// Whether `table` exists in the bound schema (or the current schema).
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let exists = self
            .fetch_value::<bool>(
                "SELECT EXISTS (
                    SELECT FROM information_schema.tables
                    WHERE table_schema::TEXT = COALESCE($1::TEXT, current_schema()::TEXT)
                      AND table_name::TEXT = $2::TEXT
                )",
                &[&self.context.schema(), &table],
            )
            .await?;
        Ok(exists.unwrap_or(false))
    }

    /// `CREATE SCHEMA IF NOT EXISTS` for the bound schema. No-op without one.
    pub async fn ensure_schema(&self) -> Result<()> {
        let Some(schema) = self.context.schema() else {
            return Ok(());
        };
        let conn = self.acquire().await?;
        conn.client()
            .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
            .await?;
        tracing::info!(schema = %schema, "Ensured schema exists");
        Ok(())
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats::from(self.handle.pool())
    }

    /// Close this context.
    ///
    /// An owner closes the pool for every context sharing it. A borrower
    /// only detaches itself. Calling `close` again does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.handle {
            PoolHandle::Owning(pool) => {
                pool.close();
                tracing::info!(schema = %self.context, "Connection pool closed");
            }
            PoolHandle::Borrowing(_) => {
                tracing::debug!(schema = %self.context, "Detached from shared pool");
            }
        }
    }
}

async fn execute_with<C>(
    client: &C,
    context: &SchemaContext,
    sql: &str,
    params: &[&(dyn ToSql + Sync)],
) -> Result<u64>
where
    C: GenericClient + Sync,
{
    let sql = template::resolve(sql, context);
    Ok(client.execute(sql.as_str(), params).await?)
}

async fn fetch_all_with<C>(
    client: &C,
    context: &SchemaContext,
    sql: &str,
    params: &[&(dyn ToSql + Sync)],
) -> Result<Vec<Row>>
where
    C: GenericClient + Sync,
{
    let sql = template::resolve(sql, context);
    Ok(client.query(sql.as_str(), params).await?)
}

fn first_value<T: FromSqlOwned>(row: Option<Row>) -> Result<Option<T>> {
    match row {
        Some(row) => Ok(Some(row.try_get::<_, T>(0)?)),
        None => Ok(None),
    }
}

/// One pooled connection bound to a schema context.
///
/// Returned to the pool on drop.
pub struct SchemaConnection {
    client: Object,
    context: SchemaContext,
}

impl SchemaConnection {
    /// The raw driver client. SQL sent through it is not template-resolved.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn context(&self) -> &SchemaContext {
        &self.context
    }

    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        execute_with(self.client(), &self.context, sql, params).await
    }

    pub async fn fetch_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    pub async fn fetch_all(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        fetch_all_with(self.client(), &self.context, sql, params).await
    }

    pub async fn fetch_value<T>(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<T>>
    where
        T: FromSqlOwned,
    {
        first_value(self.fetch_one(sql, params).await?)
    }

    /// Run several statements separated by semicolons, without parameters.
    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        let sql = template::resolve(sql, &self.context);
        self.client().batch_execute(&sql).await?;
        Ok(())
    }

    /// Begin a transaction. It rolls back unless committed.
    pub async fn transaction(&mut self) -> Result<SchemaTransaction<'_>> {
        let tx = self.client.transaction().await?;
        Ok(SchemaTransaction {
            tx,
            context: &self.context,
        })
    }
}

/// A transaction on a [`SchemaConnection`]; rolled back when dropped uncommitted.
pub struct SchemaTransaction<'a> {
    tx: deadpool_postgres::Transaction<'a>,
    context: &'a SchemaContext,
}

impl<'a> SchemaTransaction<'a> {
    /// The raw driver transaction. SQL sent through it is not template-resolved.
    pub fn client(&self) -> &tokio_postgres::Transaction<'a> {
        &self.tx
    }

    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        execute_with(self.client(), self.context, sql, params).await
    }

    pub async fn fetch_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    pub async fn fetch_all(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        fetch_all_with(self.client(), self.context, sql, params).await
    }

    pub async fn fetch_value<T>(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<T>>
    where
        T: FromSqlOwned,
    {
        first_value(self.fetch_one(sql, params).await?)
    }

    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        let sql = template::resolve(sql, self.context);
        self.client().batch_execute(&sql).await?;
        Ok(())
    }

    /// Prepare once, execute for each parameter set. Returns total affected rows.
    pub async fn execute_many(
        &self,
        sql: &str,
        param_sets: &[&[&(dyn ToSql + Sync)]],
    ) -> Result<u64> {
        let sql = template::resolve(sql, self.context);
        let statement = self.client().prepare(&sql).await?;
        let mut affected = 0;
        for params in param_sets {
            affected += self.client().execute(&statement, params).await?;
        }
        Ok(affected)
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
