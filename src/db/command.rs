//! SQL commands bound to a connection.
//!
//! A `Command` captures the connection's role when it is created, so a
//! command built inside `master(..)`/`slave(..)` keeps routing to that
//! endpoint after the role region ends.

use super::connection::Connection;
use super::endpoint::HandleGuard;
use super::query_cache::query_cache_key;
use crate::error::{DbError, DbResult};
use crate::models::Role;
use serde_json::Value;
use tracing::debug;

pub struct Command<'c, C: Connection + ?Sized> {
    conn: &'c C,
    sql: String,
    role: Role,
}

impl<'c, C: Connection + ?Sized> Command<'c, C> {
    pub fn new(conn: &'c C, sql: impl Into<String>, role: Role) -> Self {
        Self {
            conn,
            sql: sql.into(),
            role,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Run the query and return the first column of the first row.
    ///
    /// Inside an active `cache()` scope the result is read from and written to
    /// the query cache, keyed by the configured DSN so that a failover to
    /// another pool member still hits the same entry.
    pub async fn query_scalar(&self) -> DbResult<Option<Value>> {
        let scope = self
            .conn
            .current_query_cache_scope()
            .filter(|scope| scope.is_active());
        let key = scope
            .as_ref()
            .map(|_| query_cache_key(self.conn.id(), self.conn.configured_dsn().as_deref(), &self.sql));

        if let (Some(scope), Some(key)) = (&scope, &key) {
            if let Some(cached) = scope.lookup(key).await {
                debug!(sql = %self.sql, "Query result served from cache");
                return Ok(Some(cached).filter(|value| !value.is_null()));
            }
        }

        let value = {
            let mut handle = self.read_handle().await?;
            handle.query_scalar(&self.sql).await?
        };

        if let (Some(scope), Some(key)) = (&scope, &key) {
            scope
                .store(key, value.as_ref().unwrap_or(&Value::Null))
                .await;
        }
        Ok(value)
    }

    /// Run a statement on the master and return the affected row count.
    pub async fn execute(&self) -> DbResult<u64> {
        if self.role == Role::Slave {
            return Err(DbError::invalid_operation(
                "execute",
                "the command is bound to a slave connection",
            ));
        }
        let mut handle = self.conn.master_handle().await?;
        handle.execute(&self.sql).await
    }

    async fn read_handle(&self) -> DbResult<HandleGuard> {
        match self.role {
            Role::Master => self.conn.master_handle().await,
            Role::Slave => self.conn.slave_handle().await,
            Role::Auto if self.conn.transaction().is_some() => self.conn.master_handle().await,
            Role::Auto => self.conn.slave_handle().await,
        }
    }
}

impl<C: Connection + ?Sized> std::fmt::Debug for Command<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("sql", &self.sql)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
