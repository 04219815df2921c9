//! The `Connection` trait.
//!
//! Implemented by `SingleConnection`, `MasterSlaveConnection` and
//! `RoleProxy`. Required methods expose handles and lifecycle; everything
//! else is provided on top of `BaseConnection`.

use super::base::BaseConnection;
use super::endpoint::HandleGuard;
use super::query_cache::QueryCacheScope;
use super::schema::{QueryBuilder, Schema};
use super::transaction::Transaction;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel, Role};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Connection: Send + Sync {
    fn base(&self) -> &BaseConnection;

    /// DSN of the master endpoint: the active one once connected, otherwise
    /// the configured one.
    fn dsn(&self) -> Option<String>;

    /// DSN the master endpoint is configured with, independent of which pool
    /// member is connected. Stable across reconnects and failover.
    fn configured_dsn(&self) -> Option<String> {
        self.dsn()
    }

    /// True while a driver handle is open.
    fn is_active(&self) -> bool;

    async fn master_handle(&self) -> DbResult<HandleGuard>;

    /// Handle for reads. Connections without slaves read from the master.
    async fn slave_handle(&self) -> DbResult<HandleGuard> {
        self.master_handle().await
    }

    /// The master handle if it is open; never connects.
    async fn existing_master_handle(&self) -> Option<HandleGuard>;

    async fn server_version(&self) -> DbResult<String>;

    /// Close all handles, kill the active transaction and reset lazy state.
    async fn close(&self);

    /// Routing intent for the next command.
    fn role(&self) -> Role {
        Role::Auto
    }

    fn id(&self) -> &str {
        &self.base().options().id
    }

    fn table_prefix(&self) -> &str {
        &self.base().options().table_prefix
    }

    /// Driver family resolved from the DSN scheme.
    fn database_type(&self) -> DbResult<DatabaseType> {
        let dsn = self
            .dsn()
            .ok_or_else(|| DbError::configuration("The DSN is not set for this connection"))?;
        DatabaseType::from_connection_string(&dsn).ok_or_else(|| {
            DbError::configuration(format!("Cannot resolve a driver from DSN scheme of '{}'", dsn))
        })
    }

    /// Driver tag, e.g. `mysql` or `pgsql`.
    fn driver_name(&self) -> DbResult<&'static str> {
        Ok(self.database_type()?.driver_name())
    }

    fn schema(&self) -> DbResult<Arc<Schema>> {
        Ok(self.base().schema(self.database_type()?))
    }

    fn query_builder(&self) -> DbResult<Arc<QueryBuilder>> {
        Ok(self.base().query_builder(self.database_type()?))
    }

    fn quote_table_name(&self, name: &str) -> DbResult<String> {
        Ok(self.schema()?.quote_table_name(name))
    }

    /// The currently active transaction, if any.
    fn transaction(&self) -> Option<Arc<Transaction>> {
        self.base().active_transaction()
    }

    /// Begin a transaction (or a savepoint inside a running one) on the master.
    async fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<Arc<Transaction>> {
        let transaction = self.base().transaction_for_begin()?;
        let mut handle = self.master_handle().await?;
        transaction.begin(&mut **handle, isolation).await?;
        Ok(transaction)
    }

    async fn commit_transaction(&self) -> DbResult<()> {
        let transaction = self
            .base()
            .active_transaction()
            .ok_or_else(|| DbError::transaction("Failed to commit transaction: no active transaction"))?;
        let mut handle = self.master_handle().await?;
        transaction.commit(&mut **handle).await
    }

    async fn rollback_transaction(&self) -> DbResult<()> {
        let Some(transaction) = self.base().active_transaction() else {
            return Ok(());
        };
        let mut handle = self.master_handle().await?;
        transaction.rollback(&mut **handle).await
    }

    /// Last id inserted on the master handle. `sequence` is quoted for the driver.
    async fn last_insert_id(&self, sequence: Option<&str>) -> DbResult<String> {
        let sequence = match sequence {
            Some(name) => Some(self.schema()?.quote_sequence_name(name)),
            None => None,
        };
        let mut handle = self.existing_master_handle().await.ok_or_else(|| {
            DbError::invalid_operation("get last insert id", "the DB connection is not active")
        })?;
        handle.last_insert_id(sequence.as_deref()).await
    }

    fn current_query_cache_scope(&self) -> Option<QueryCacheScope> {
        self.base().current_query_cache_scope()
    }
}
