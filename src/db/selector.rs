//! Circuit-breaker pool selection.
//!
//! `PoolSelector::select` walks a server pool and returns the first handle it
//! can open. Servers that failed repeatedly (tracked as counters in the cache
//! backend, with a TTL) are deprioritized: in a master pool they are retried
//! after every other server, in a slave pool they are skipped. Counters expire
//! on their own, so a server is never banned for longer than the retry window.

use super::handle::{Connector, DriverHandle};
use super::lock_unpoisoned;
use crate::cache::CacheBackend;
use crate::config::{PoolConfig, ServerConfig};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionOptions, masked_dsn};
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info_span, warn};

/// Prefix of failure-counter cache keys.
pub const FAILURE_KEY_PREFIX: &str = "db-pool-failures:";

/// Which pool a selection runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Master,
    Slave,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Master => write!(f, "master"),
            PoolKind::Slave => write!(f, "slave"),
        }
    }
}

/// A list of server configs plus the defaults merged under each of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerPool {
    pub servers: Vec<ServerConfig>,
    pub defaults: ServerConfig,
}

impl ServerPool {
    pub fn new(servers: Vec<ServerConfig>, defaults: ServerConfig) -> Self {
        Self { servers, defaults }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }
}

/// Selector behaviour taken from the pool config and connection options.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorSettings {
    pub shuffle: bool,
    pub failure_threshold: u32,
    pub retry_timeout: Duration,
    pub enable_logging: bool,
    pub enable_profiling: bool,
}

impl SelectorSettings {
    pub fn new(pool: &PoolConfig, options: &ConnectionOptions) -> Self {
        Self {
            shuffle: pool.shuffle,
            failure_threshold: pool.failure_threshold,
            retry_timeout: pool.retry_timeout,
            enable_logging: options.enable_logging,
            enable_profiling: options.enable_profiling,
        }
    }
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self::new(&PoolConfig::default(), &ConnectionOptions::default())
    }
}

/// The handle a selection produced and the effective config behind it.
pub struct Selected {
    pub handle: Box<dyn DriverHandle>,
    pub config: ServerConfig,
}

impl std::fmt::Debug for Selected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selected")
            .field("dsn", &self.config.dsn.as_deref().map(masked_dsn))
            .finish_non_exhaustive()
    }
}

/// Picks a reachable server from a pool.
pub struct PoolSelector {
    connector: Arc<dyn Connector>,
    cache: Option<Arc<dyn CacheBackend>>,
    settings: SelectorSettings,
    last_master: Mutex<Option<ServerConfig>>,
    last_slave: Mutex<Option<ServerConfig>>,
}

impl std::fmt::Debug for PoolSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSelector")
            .field("settings", &self.settings)
            .field("has_cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl PoolSelector {
    pub fn new(
        connector: Arc<dyn Connector>,
        cache: Option<Arc<dyn CacheBackend>>,
        settings: SelectorSettings,
    ) -> Self {
        Self {
            connector,
            cache,
            settings,
            last_master: Mutex::new(None),
            last_slave: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SelectorSettings {
        &self.settings
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Backend holding the failure counters.
    pub fn cache(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.cache.as_ref()
    }

    /// The config of the last server this selector connected to for `kind`.
    pub fn last_successful_config(&self, kind: PoolKind) -> Option<ServerConfig> {
        lock_unpoisoned(self.memo(kind)).clone()
    }

    /// Merge pool defaults under `server` and normalize the result.
    pub fn effective_config(
        &self,
        server: &ServerConfig,
        defaults: &ServerConfig,
    ) -> DbResult<ServerConfig> {
        self.connector
            .normalize_config(server.merged_over(defaults))
    }

    /// Open a handle to the first reachable server of `pool`.
    ///
    /// `shuffle = None` uses the pool-wide default. Per-server connect errors
    /// are logged and counted, never returned; `Ok(None)` means every server
    /// failed. Configuration errors abort the selection.
    pub async fn select(
        &self,
        pool: &ServerPool,
        shuffle: Option<bool>,
        kind: PoolKind,
    ) -> DbResult<Option<Selected>> {
        if pool.is_empty() {
            return Ok(None);
        }

        let mut servers: Vec<&ServerConfig> = pool.servers.iter().collect();
        if shuffle.unwrap_or(self.settings.shuffle) {
            servers.shuffle(&mut rand::thread_rng());
        }

        // A lone master is always attempted directly.
        let use_breaker =
            self.cache.is_some() && !(kind == PoolKind::Master && servers.len() < 2);

        let mut retry: Vec<&ServerConfig> = Vec::new();
        for server in servers {
            let config = self.effective_config(server, &pool.defaults)?;
            let key = use_breaker.then(|| failure_key(&config));

            let failures = match &key {
                Some(key) => self.failure_count(key).await,
                None => 0,
            };
            if key.is_some() && failures >= self.settings.failure_threshold {
                if kind == PoolKind::Master {
                    debug!(
                        dsn = %display_dsn(&config),
                        failures,
                        "Server over failure threshold, deferring to retry pass"
                    );
                    retry.push(server);
                } else {
                    debug!(
                        dsn = %display_dsn(&config),
                        failures,
                        "Server over failure threshold, skipping"
                    );
                }
                continue;
            }

            match self.attempt(&config).await {
                Ok(handle) => return Ok(Some(self.succeed(kind, handle, config))),
                Err(e @ DbError::Configuration { .. }) => return Err(e),
                Err(e) => {
                    if self.settings.enable_logging {
                        warn!(
                            pool = %kind,
                            dsn = %display_dsn(&config),
                            error = %e,
                            "Connection to server failed"
                        );
                    }
                    if let Some(key) = &key {
                        self.record_failure(key, failures + 1).await;
                    }
                }
            }
        }

        for server in retry {
            let config = self.effective_config(server, &pool.defaults)?;
            match self.attempt(&config).await {
                Ok(handle) => {
                    self.clear_failures(&failure_key(&config)).await;
                    return Ok(Some(self.succeed(kind, handle, config)));
                }
                Err(e @ DbError::Configuration { .. }) => return Err(e),
                Err(e) => {
                    if self.settings.enable_logging {
                        warn!(
                            pool = %kind,
                            dsn = %display_dsn(&config),
                            error = %e,
                            "Retry of deprioritized server failed"
                        );
                    }
                }
            }
        }

        if self.settings.enable_logging {
            error!(pool = %kind, servers = pool.len(), "No server in pool is reachable");
        }
        Ok(None)
    }

    async fn attempt(&self, config: &ServerConfig) -> DbResult<Box<dyn DriverHandle>> {
        if !self.settings.enable_profiling {
            return self.connector.connect(config).await;
        }

        let dsn = display_dsn(config);
        let start = Instant::now();
        let result = self
            .connector
            .connect(config)
            .instrument(info_span!("db.connect", dsn = %dsn))
            .await;
        debug!(
            dsn = %dsn,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Connect attempt finished"
        );
        result
    }

    fn succeed(
        &self,
        kind: PoolKind,
        handle: Box<dyn DriverHandle>,
        config: ServerConfig,
    ) -> Selected {
        if self.settings.enable_logging {
            debug!(pool = %kind, dsn = %display_dsn(&config), "Selected server");
        }
        *lock_unpoisoned(self.memo(kind)) = Some(config.clone());
        Selected { handle, config }
    }

    fn memo(&self, kind: PoolKind) -> &Mutex<Option<ServerConfig>> {
        match kind {
            PoolKind::Master => &self.last_master,
            PoolKind::Slave => &self.last_slave,
        }
    }

    async fn failure_count(&self, key: &str) -> u32 {
        let Some(cache) = &self.cache else {
            return 0;
        };
        match cache.get(key).await {
            Ok(Some(value)) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                debug!(error = %e, "Failure counter read failed");
                0
            }
        }
    }

    async fn record_failure(&self, key: &str, count: u32) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache
            .set(key, json!(count), Some(self.settings.retry_timeout))
            .await
        {
            debug!(error = %e, "Failure counter write failed");
        }
    }

    async fn clear_failures(&self, key: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache.delete(key).await {
            debug!(error = %e, "Failure counter delete failed");
        }
    }
}

/// Cache key of a server's failure counter: its DSN, or the whole config
/// when no DSN is set.
pub fn failure_key(config: &ServerConfig) -> String {
    let identity = match &config.dsn {
        Some(dsn) => dsn.clone(),
        None => serde_json::to_value(config)
            .unwrap_or(Value::Null)
            .to_string(),
    };
    format!(
        "{}{}",
        FAILURE_KEY_PREFIX,
        hex::encode(Sha256::digest(identity.as_bytes()))
    )
}

fn display_dsn(config: &ServerConfig) -> String {
    config
        .dsn
        .as_deref()
        .map(masked_dsn)
        .unwrap_or_else(|| "<unset>".to_string())
}
