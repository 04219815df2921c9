//! Connection with one lazily opened driver handle.

use super::base::BaseConnection;
use super::command::Command;
use super::connection::Connection;
use super::endpoint::{Endpoint, HandleGuard};
use super::factory::{FixedDsnFactory, HandleFactory, PoolHandleFactory};
use super::handle::{Connector, SqlxConnector};
use super::selector::{PoolKind, PoolSelector, SelectorSettings, ServerPool};
use crate::cache::CacheBackend;
use crate::config::{PoolConfig, ServerConfig};
use crate::error::DbResult;
use crate::models::ConnectionOptions;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct SingleConnection {
    base: BaseConnection,
    endpoint: Endpoint,
}

impl SingleConnection {
    pub fn new(options: ConnectionOptions, factory: Arc<dyn HandleFactory>) -> Self {
        Self {
            base: BaseConnection::new(options),
            endpoint: Endpoint::new("master", factory),
        }
    }

    /// Connection to one fixed server.
    pub fn from_server_config(
        options: ConnectionOptions,
        config: ServerConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::new(options, Arc::new(FixedDsnFactory::new(config, connector)))
    }

    /// Connection to one DSN through sqlx.
    pub fn from_dsn(options: ConnectionOptions, dsn: impl Into<String>) -> Self {
        Self::from_server_config(
            options,
            ServerConfig::from_dsn(dsn),
            Arc::new(SqlxConnector::new()),
        )
    }

    /// Connection that picks its server from the master pool of `pool`.
    /// `cache` backs the failure counters.
    pub fn from_pool_config(
        options: ConnectionOptions,
        pool: &PoolConfig,
        connector: Arc<dyn Connector>,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> Self {
        let selector = Arc::new(PoolSelector::new(
            connector,
            cache,
            SelectorSettings::new(pool, &options),
        ));
        let factory = PoolHandleFactory::new(
            selector,
            ServerPool::new(pool.masters.clone(), pool.defaults.clone()),
            PoolKind::Master,
        );
        Self::new(options, Arc::new(factory))
    }

    pub fn with_query_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.base = self.base.with_query_cache(cache);
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        self.base.options()
    }

    /// The driver handle, opened on first use.
    pub async fn handle(&self) -> DbResult<HandleGuard> {
        self.endpoint.handle(self.base.options()).await
    }

    /// DSN of the server the open handle is connected to.
    pub fn active_dsn(&self) -> Option<String> {
        self.endpoint.active_dsn()
    }

    pub fn active_config(&self) -> Option<ServerConfig> {
        self.endpoint.active_config()
    }

    pub fn create_command(&self, sql: impl Into<String>) -> Command<'_, Self> {
        Command::new(self, sql, self.role())
    }

    /// Run `op` with query caching enabled.
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
        self.base.cache(duration, dependency, || op(self)).await
    }

    /// Run `op` with query caching suspended.
    pub async fn no_cache<'a, F, Fut, T>(&'a self, op: F) -> T
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = T>,
    {
        self.base.no_cache(|| op(self)).await
    }

    pub(crate) fn set_factory(&mut self, factory: Arc<dyn HandleFactory>) {
        self.endpoint.set_factory(factory);
    }
}

impl Clone for SingleConnection {
    /// A closed copy with the same options and handle factory.
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            endpoint: self.endpoint.duplicate(),
        }
    }
}

#[async_trait]
impl Connection for SingleConnection {
    fn base(&self) -> &BaseConnection {
        &self.base
    }

    fn dsn(&self) -> Option<String> {
        self.endpoint.dsn()
    }

    fn configured_dsn(&self) -> Option<String> {
        self.endpoint.configured_dsn()
    }

    fn is_active(&self) -> bool {
        self.endpoint.is_active()
    }

    async fn master_handle(&self) -> DbResult<HandleGuard> {
        self.handle().await
    }

    async fn existing_master_handle(&self) -> Option<HandleGuard> {
        self.endpoint.existing_handle().await
    }

    async fn server_version(&self) -> DbResult<String> {
        self.endpoint.server_version(self.base.options()).await
    }

    async fn close(&self) {
        self.endpoint.close(self.base.options()).await;
        if let Some(transaction) = self.base.active_transaction() {
            debug!(connection = %self.id(), "Connection closed with an active transaction");
            transaction.connection_closed();
        }
        self.base.reset();
    }
}
