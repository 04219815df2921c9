//! Connection with a master and a slave endpoint.
//!
//! Writes and transactions go to the master, reads in `auto` role go to the
//! slave. The current role is connection state changed only through scoped
//! regions (`master(..)`, `slave(..)`, `with_role(..)`) whose guard restores
//! the previous role on every exit path.

use super::base::BaseConnection;
use super::command::Command;
use super::connection::Connection;
use super::endpoint::{Endpoint, HandleGuard};
use super::factory::{HandleFactory, PoolHandleFactory};
use super::handle::Connector;
use super::lock_unpoisoned;
use super::proxy::RoleProxy;
use super::selector::{PoolKind, PoolSelector, SelectorSettings, ServerPool};
use super::single::SingleConnection;
use crate::cache::CacheBackend;
use crate::config::{PoolConfig, ServerConfig};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionOptions, Role};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Restores the previous role when dropped.
struct RoleGuard<'a> {
    role: &'a Mutex<Role>,
    prior: Role,
}

impl<'a> RoleGuard<'a> {
    fn enter(role: &'a Mutex<Role>, new: Role) -> Self {
        let prior = std::mem::replace(&mut *lock_unpoisoned(role), new);
        Self { role, prior }
    }
}

impl Drop for RoleGuard<'_> {
    fn drop(&mut self) {
        *lock_unpoisoned(self.role) = self.prior;
    }
}

#[derive(Debug)]
pub struct MasterSlaveConnection {
    master: SingleConnection,
    slave: Endpoint,
    role: Mutex<Role>,
    selector: Option<Arc<PoolSelector>>,
}

impl MasterSlaveConnection {
    pub fn new(
        options: ConnectionOptions,
        master_factory: Arc<dyn HandleFactory>,
        slave_factory: Arc<dyn HandleFactory>,
    ) -> Self {
        Self {
            master: SingleConnection::new(options, master_factory),
            slave: Endpoint::new("slave", slave_factory),
            role: Mutex::new(Role::Auto),
            selector: None,
        }
    }

    /// Connection whose master and slave handles come from the pools of
    /// `pool`. `cache` backs the failure counters and, when query caching is
    /// enabled, the query cache.
    pub fn from_pool_config(
        options: ConnectionOptions,
        pool: &PoolConfig,
        connector: Arc<dyn Connector>,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> Self {
        let selector = Self::build_selector(&options, pool, connector, cache.clone());
        let (master_factory, slave_factory) = Self::pool_factories(&selector, pool);

        let mut conn = Self::new(options, master_factory, slave_factory);
        conn.selector = Some(selector);
        match cache {
            Some(cache) => conn.with_query_cache(cache),
            None => conn,
        }
    }

    /// Swap in a new pool configuration. Open handles stay open until `close()`.
    pub fn set_pool_config(
        &mut self,
        pool: &PoolConfig,
        connector: Arc<dyn Connector>,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> DbResult<()> {
        pool.validate()?;
        let selector = Self::build_selector(self.master.options(), pool, connector, cache);
        let (master_factory, slave_factory) = Self::pool_factories(&selector, pool);

        self.master.set_factory(master_factory);
        self.slave.set_factory(slave_factory);
        self.selector = Some(selector);
        if self.master.options().enable_logging {
            info!(
                connection = %self.id(),
                masters = pool.masters.len(),
                slaves = pool.slaves.len(),
                "Pool configuration replaced"
            );
        }
        Ok(())
    }

    fn build_selector(
        options: &ConnectionOptions,
        pool: &PoolConfig,
        connector: Arc<dyn Connector>,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> Arc<PoolSelector> {
        Arc::new(PoolSelector::new(
            connector,
            cache,
            SelectorSettings::new(pool, options),
        ))
    }

    fn pool_factories(
        selector: &Arc<PoolSelector>,
        pool: &PoolConfig,
    ) -> (Arc<dyn HandleFactory>, Arc<dyn HandleFactory>) {
        let master = PoolHandleFactory::new(
            Arc::clone(selector),
            ServerPool::new(pool.masters.clone(), pool.defaults.clone()),
            PoolKind::Master,
        );
        let slave = PoolHandleFactory::new(
            Arc::clone(selector),
            ServerPool::new(pool.slaves.clone(), pool.defaults.clone()),
            PoolKind::Slave,
        );
        (Arc::new(master), Arc::new(slave))
    }

    pub fn with_query_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.master = self.master.with_query_cache(cache);
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        self.master.options()
    }

    pub fn selector(&self) -> Option<&Arc<PoolSelector>> {
        self.selector.as_ref()
    }

    /// Last config the selector connected to for `kind`.
    pub fn last_successful_config(&self, kind: PoolKind) -> Option<ServerConfig> {
        self.selector
            .as_ref()
            .and_then(|selector| selector.last_successful_config(kind))
    }

    /// DSN of the open master handle.
    pub fn active_dsn(&self) -> Option<String> {
        self.master.active_dsn()
    }

    /// DSN of the open slave handle.
    pub fn active_slave_dsn(&self) -> Option<String> {
        self.slave.active_dsn()
    }

    pub fn is_slave_active(&self) -> bool {
        self.slave.is_active()
    }

    /// Run `op` with the role set to master.
    pub async fn master<'a, F, Fut, T>(&'a self, op: F) -> T
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = T>,
    {
        let _role = RoleGuard::enter(&self.role, Role::Master);
        op(self).await
    }

    /// Run `op` with the role set to slave.
    pub async fn slave<'a, F, Fut, T>(&'a self, op: F) -> T
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = T>,
    {
        let _role = RoleGuard::enter(&self.role, Role::Slave);
        op(self).await
    }

    /// Synchronous role region.
    pub fn with_role<'a, R>(&'a self, role: Role, f: impl FnOnce(&'a Self) -> R) -> R {
        let _role = RoleGuard::enter(&self.role, role);
        f(self)
    }

    pub fn use_master(&self) -> RoleProxy<'_> {
        RoleProxy::new(self, Role::Master)
    }

    pub fn use_slave(&self) -> RoleProxy<'_> {
        RoleProxy::new(self, Role::Slave)
    }

    /// The connection itself already routes automatically.
    pub fn use_auto(&self) -> &Self {
        self
    }

    /// A command bound to the current role.
    pub fn create_command(&self, sql: impl Into<String>) -> Command<'_, Self> {
        Command::new(self, sql, self.role())
    }

    pub async fn cache<'a, F, Fut, T>(
        &'a self,
        duration: Option<Duration>,
        dependency: Option<String>,
        op: F,
    ) -> T
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = T>,
    {
        self.base().cache(duration, dependency, || op(self)).await
    }

    pub async fn no_cache<'a, F, Fut, T>(&'a self, op: F) -> T
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = T>,
    {
        self.base().no_cache(|| op(self)).await
    }

    fn can_fall_back(&self, error: &DbError) -> bool {
        self.options().fallback_to_master
            && matches!(
                error,
                DbError::ConnectionUnavailable { .. } | DbError::Connection { .. }
            )
    }
}

impl Clone for MasterSlaveConnection {
    /// A closed copy in `auto` role sharing options, factories and selector.
    fn clone(&self) -> Self {
        Self {
            master: self.master.clone(),
            slave: self.slave.duplicate(),
            role: Mutex::new(Role::Auto),
            selector: self.selector.clone(),
        }
    }
}

#[async_trait]
impl Connection for MasterSlaveConnection {
    fn base(&self) -> &BaseConnection {
        self.master.base()
    }

    fn dsn(&self) -> Option<String> {
        self.master.dsn()
    }

    fn configured_dsn(&self) -> Option<String> {
        self.master.configured_dsn()
    }

    fn is_active(&self) -> bool {
        self.master.is_active() || self.slave.is_active()
    }

    fn role(&self) -> Role {
        *lock_unpoisoned(&self.role)
    }

    async fn master_handle(&self) -> DbResult<HandleGuard> {
        self.master.handle().await
    }

    async fn slave_handle(&self) -> DbResult<HandleGuard> {
        if !self.options().enable_slaves {
            return self.master.handle().await;
        }
        match self.slave.handle(self.options()).await {
            Ok(handle) => Ok(handle),
            Err(e) if self.can_fall_back(&e) => {
                if self.options().enable_logging {
                    warn!(connection = %self.id(), error = %e, "No slave available, reading from master");
                }
                self.master.handle().await
            }
            Err(e) => Err(e),
        }
    }

    async fn existing_master_handle(&self) -> Option<HandleGuard> {
        self.master.existing_master_handle().await
    }

    /// Reported by the slave when one is reachable.
    async fn server_version(&self) -> DbResult<String> {
        if self.options().enable_slaves {
            match self.slave.server_version(self.options()).await {
                Ok(version) => return Ok(version),
                Err(e) if self.can_fall_back(&e) => {}
                Err(e) => return Err(e),
            }
        }
        self.master.server_version().await
    }

    async fn close(&self) {
        self.slave.close(self.options()).await;
        self.master.close().await;
    }
}
