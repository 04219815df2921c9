//! Handle factories.
//!
//! A connection endpoint does not know where its handle comes from: it asks
//! its `HandleFactory`. `FixedDsnFactory` always connects to one configured
//! server, `PoolHandleFactory` runs the circuit-breaker selector over a pool.

use super::handle::{Connector, DriverHandle};
use super::selector::{PoolKind, PoolSelector, ServerPool};
use crate::config::ServerConfig;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::sync::Arc;

/// A freshly opened handle and the effective config it was opened with.
pub struct CreatedHandle {
    pub handle: Box<dyn DriverHandle>,
    pub config: ServerConfig,
}

#[async_trait]
pub trait HandleFactory: Send + Sync {
    async fn create_handle(&self) -> DbResult<CreatedHandle>;

    /// DSN known before any connect, used to resolve the driver name.
    fn configured_dsn(&self) -> Option<String>;
}

/// Always connects to the same server.
pub struct FixedDsnFactory {
    config: ServerConfig,
    connector: Arc<dyn Connector>,
}

impl FixedDsnFactory {
    pub fn new(config: ServerConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[async_trait]
impl HandleFactory for FixedDsnFactory {
    async fn create_handle(&self) -> DbResult<CreatedHandle> {
        let config = self.connector.normalize_config(self.config.clone())?;
        let handle = self.connector.connect(&config).await?;
        Ok(CreatedHandle { handle, config })
    }

    fn configured_dsn(&self) -> Option<String> {
        self.connector
            .normalize_config(self.config.clone())
            .ok()
            .and_then(|config| config.dsn)
    }
}

/// Connects through the pool selector.
pub struct PoolHandleFactory {
    selector: Arc<PoolSelector>,
    pool: ServerPool,
    kind: PoolKind,
}

impl PoolHandleFactory {
    pub fn new(selector: Arc<PoolSelector>, pool: ServerPool, kind: PoolKind) -> Self {
        Self {
            selector,
            pool,
            kind,
        }
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }
}

#[async_trait]
impl HandleFactory for PoolHandleFactory {
    async fn create_handle(&self) -> DbResult<CreatedHandle> {
        match self.selector.select(&self.pool, None, self.kind).await? {
            Some(selected) => Ok(CreatedHandle {
                handle: selected.handle,
                config: selected.config,
            }),
            None => Err(DbError::connection_unavailable(
                self.kind.to_string(),
                self.pool.len(),
            )),
        }
    }

    fn configured_dsn(&self) -> Option<String> {
        let first = self.pool.servers.first()?;
        self.selector
            .effective_config(first, &self.pool.defaults)
            .ok()
            .and_then(|config| config.dsn)
    }
}
