//! Role-pinned views of a master/slave connection.
//!
//! A `RoleProxy` is a borrowed connection plus a fixed role. It is `Copy`, so
//! handing one to another caller never lets that caller change the role seen
//! by the holder. Transactions and insert ids are master-only; a slave-pinned
//! proxy rejects them up front.

use super::base::BaseConnection;
use super::command::Command;
use super::connection::Connection;
use super::endpoint::HandleGuard;
use super::master_slave::MasterSlaveConnection;
use super::transaction::Transaction;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, Role};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RoleProxy<'c> {
    conn: &'c MasterSlaveConnection,
    role: Role,
}

impl PartialEq for RoleProxy<'_> {
    /// Same connection instance, same role.
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.conn, other.conn) && self.role == other.role
    }
}

impl Eq for RoleProxy<'_> {}

impl<'c> RoleProxy<'c> {
    pub(crate) fn new(conn: &'c MasterSlaveConnection, role: Role) -> Self {
        Self { conn, role }
    }

    pub fn connection(&self) -> &'c MasterSlaveConnection {
        self.conn
    }

    /// The role this proxy is pinned to.
    pub fn pinned_role(&self) -> Role {
        self.role
    }

    pub fn use_master(self) -> Self {
        self.with_pinned(Role::Master)
    }

    pub fn use_slave(self) -> Self {
        self.with_pinned(Role::Slave)
    }

    pub fn use_auto(self) -> Self {
        self.with_pinned(Role::Auto)
    }

    fn with_pinned(self, role: Role) -> Self {
        if self.role == role {
            self
        } else {
            Self::new(self.conn, role)
        }
    }

    /// A command resolved under this proxy's role.
    pub fn create_command(&self, sql: impl Into<String>) -> Command<'c, MasterSlaveConnection> {
        match self.role {
            Role::Auto => self.conn.create_command(sql),
            role => self.conn.with_role(role, |conn| conn.create_command(sql)),
        }
    }

    pub async fn cache<F, Fut, T>(
        self,
        duration: Option<Duration>,
        dependency: Option<String>,
        op: F,
    ) -> T
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = T>,
    {
        self.conn
            .base()
            .cache(duration, dependency, || op(self))
            .await
    }

    pub async fn no_cache<F, Fut, T>(self, op: F) -> T
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = T>,
    {
        self.conn.base().no_cache(|| op(self)).await
    }

    fn reject_on_slave(&self, operation: &str) -> DbResult<()> {
        if self.role == Role::Slave {
            return Err(DbError::invalid_operation(
                operation,
                "the connection is pinned to a slave",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for RoleProxy<'_> {
    fn base(&self) -> &BaseConnection {
        self.conn.base()
    }

    fn dsn(&self) -> Option<String> {
        self.conn.dsn()
    }

    fn configured_dsn(&self) -> Option<String> {
        self.conn.configured_dsn()
    }

    fn is_active(&self) -> bool {
        self.conn.is_active()
    }

    fn role(&self) -> Role {
        match self.role {
            Role::Auto => self.conn.role(),
            pinned => pinned,
        }
    }

    async fn master_handle(&self) -> DbResult<HandleGuard> {
        self.conn.master_handle().await
    }

    async fn slave_handle(&self) -> DbResult<HandleGuard> {
        self.conn.slave_handle().await
    }

    async fn existing_master_handle(&self) -> Option<HandleGuard> {
        self.conn.existing_master_handle().await
    }

    async fn server_version(&self) -> DbResult<String> {
        self.conn.server_version().await
    }

    async fn close(&self) {
        self.conn.close().await;
    }

    fn transaction(&self) -> Option<Arc<Transaction>> {
        match self.role {
            Role::Slave => None,
            _ => self.conn.transaction(),
        }
    }

    async fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> DbResult<Arc<Transaction>> {
        self.reject_on_slave("begin transaction")?;
        self.conn.begin_transaction(isolation).await
    }

    async fn commit_transaction(&self) -> DbResult<()> {
        self.reject_on_slave("commit transaction")?;
        self.conn.commit_transaction().await
    }

    async fn rollback_transaction(&self) -> DbResult<()> {
        self.reject_on_slave("roll back transaction")?;
        self.conn.rollback_transaction().await
    }

    async fn last_insert_id(&self, sequence: Option<&str>) -> DbResult<String> {
        self.reject_on_slave("get last insert id")?;
        self.conn.last_insert_id(sequence).await
    }
}
