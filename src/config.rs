//! Configuration handling for the connection manager.
//!
//! This module provides:
//! - `ServerConfig`: the per-server map of a pool entry (DSN or discrete fields)
//! - `PoolConfig`: master/slave server lists plus circuit-breaker settings
//! - `Config`: CLI arguments and environment variables for the binary

use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

// Pool configuration defaults
pub const DEFAULT_SHUFFLE_POOL_CONFIGS: bool = true;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RETRY_TIMEOUT_SECS: u64 = 60;

/// Keys of the pool map that are not part of the default server config.
const MASTER_KEYS: &[&str] = &["pool", "master", "masters"];
const SLAVE_KEYS: &[&str] = &["slave", "slaves"];
const SHUFFLE_KEY: &str = "shufflePoolConfigs";
const THRESHOLD_KEY: &str = "numberAttemptsBeforeServerDisable";
const RETRY_TIMEOUT_KEY: &str = "timeoutBeforeRetryingConnect";

/// Configuration of a single database server.
///
/// Either `dsn` is given directly, or it is assembled from `driver`, `host`,
/// `port`, `socket`, `dbname` and `charset` during normalization. Credentials
/// are kept out of the DSN so it can be logged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    /// Driver tag used when assembling a DSN (`mysql`, `pgsql`, `sqlite`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, alias = "unix_socket", skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Sensitive - never logged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Driver-specific options not recognized above.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl ServerConfig {
    /// Create a config from a ready-made DSN.
    pub fn from_dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Layer this server's settings over pool-wide defaults. Server keys win.
    pub fn merged_over(&self, defaults: &ServerConfig) -> ServerConfig {
        let mut attributes = defaults.attributes.clone();
        attributes.extend(
            self.attributes
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        ServerConfig {
            dsn: self.dsn.clone().or_else(|| defaults.dsn.clone()),
            driver: self.driver.clone().or_else(|| defaults.driver.clone()),
            host: self.host.clone().or_else(|| defaults.host.clone()),
            port: self.port.or(defaults.port),
            socket: self.socket.clone().or_else(|| defaults.socket.clone()),
            dbname: self.dbname.clone().or_else(|| defaults.dbname.clone()),
            charset: self.charset.clone().or_else(|| defaults.charset.clone()),
            username: self.username.clone().or_else(|| defaults.username.clone()),
            password: self.password.clone().or_else(|| defaults.password.clone()),
            attributes,
        }
    }

    /// Resolve the driver family from the DSN scheme or the `driver` tag.
    pub fn database_type(&self) -> Option<DatabaseType> {
        match (&self.dsn, &self.driver) {
            (Some(dsn), _) => DatabaseType::from_connection_string(dsn),
            (None, Some(driver)) => DatabaseType::from_driver_tag(driver),
            (None, None) => None,
        }
    }

    /// Build a URL DSN from the discrete fields.
    ///
    /// Fails with a configuration error when the driver is unknown or a
    /// required field (host or socket for network drivers, dbname for SQLite)
    /// is missing.
    pub fn assemble_dsn(&self) -> DbResult<String> {
        let driver = self.driver.as_deref().ok_or_else(|| {
            DbError::configuration("Server config needs either 'dsn' or 'driver'")
        })?;
        let db_type = DatabaseType::from_driver_tag(driver)
            .ok_or_else(|| DbError::configuration(format!("Unknown driver '{}'", driver)))?;

        if db_type == DatabaseType::SQLite {
            let path = self.dbname.as_deref().ok_or_else(|| {
                DbError::configuration("SQLite server config requires 'dbname' (a file path)")
            })?;
            return Ok(format!("sqlite:{}", path));
        }

        let host = match (&self.host, &self.socket) {
            (Some(host), _) => host.clone(),
            (None, Some(_)) => "localhost".to_string(),
            (None, None) => {
                return Err(DbError::configuration(format!(
                    "{} server config requires 'host' or 'socket'",
                    db_type
                )));
            }
        };

        let mut url = Url::parse(&format!("{}://{}", db_type.url_scheme(), host))
            .map_err(|e| DbError::configuration(format!("Invalid host '{}': {}", host, e)))?;
        if let Some(port) = self.port {
            url.set_port(Some(port))
                .map_err(|_| DbError::configuration(format!("Invalid port {}", port)))?;
        }
        if let Some(dbname) = &self.dbname {
            url.set_path(&format!("/{}", dbname.trim_start_matches('/')));
        }

        {
            let mut query = url.query_pairs_mut();
            if let Some(socket) = &self.socket {
                match db_type {
                    DatabaseType::MySQL => query.append_pair("socket", socket),
                    _ => query.append_pair("host", socket),
                };
            }
            if let Some(charset) = &self.charset {
                match db_type {
                    DatabaseType::MySQL => query.append_pair("charset", charset),
                    // PostgreSQL takes session settings through `options`.
                    _ => query.append_pair("options", &format!("-c client_encoding={}", charset)),
                };
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        Ok(url.to_string())
    }

    /// Return a copy whose `dsn` is always set, assembling it if needed.
    pub fn normalized(&self) -> DbResult<ServerConfig> {
        let mut config = self.clone();
        if config.dsn.is_none() {
            config.dsn = Some(self.assemble_dsn()?);
        }
        Ok(config)
    }
}

/// Server pools and circuit-breaker settings for master/slave connections.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub masters: Vec<ServerConfig>,
    pub slaves: Vec<ServerConfig>,
    /// Merged under every server entry.
    pub defaults: ServerConfig,
    pub shuffle: bool,
    /// Failed attempts before a server is deprioritized.
    pub failure_threshold: u32,
    /// TTL of a server's failure counter.
    pub retry_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            masters: Vec::new(),
            slaves: Vec::new(),
            defaults: ServerConfig::default(),
            shuffle: DEFAULT_SHUFFLE_POOL_CONFIGS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            retry_timeout: Duration::from_secs(DEFAULT_RETRY_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// A one-server master pool.
    pub fn single(server: ServerConfig) -> Self {
        Self {
            masters: vec![server],
            ..Self::default()
        }
    }

    /// Parse a pool configuration from a JSON string.
    pub fn parse(s: &str) -> DbResult<Self> {
        let value: Value = serde_json::from_str(s)
            .map_err(|e| DbError::configuration(format!("Invalid pool config JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Parse a pool configuration map.
    ///
    /// Recognized keys are `pool`/`master`/`masters`, `slave`/`slaves`,
    /// `shufflePoolConfigs`, `numberAttemptsBeforeServerDisable` and
    /// `timeoutBeforeRetryingConnect`. Every other key belongs to the default
    /// server config. A map without any master key is a one-server pool.
    pub fn from_value(value: &Value) -> DbResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| DbError::configuration("Pool config must be a JSON object"))?;
        let mut rest: Map<String, Value> = map.clone();

        let masters = Self::take_server_list(&mut rest, MASTER_KEYS)?;
        let slaves = Self::take_server_list(&mut rest, SLAVE_KEYS)?.unwrap_or_default();

        let shuffle = match rest.remove(SHUFFLE_KEY) {
            None => DEFAULT_SHUFFLE_POOL_CONFIGS,
            Some(Value::Bool(b)) => b,
            Some(other) => {
                return Err(DbError::configuration(format!(
                    "'{}' must be a boolean, got {}",
                    SHUFFLE_KEY, other
                )));
            }
        };
        let failure_threshold = match rest.remove(THRESHOLD_KEY) {
            None => DEFAULT_FAILURE_THRESHOLD,
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    DbError::configuration(format!(
                        "'{}' must be a non-negative integer",
                        THRESHOLD_KEY
                    ))
                })?,
        };
        let retry_timeout = match rest.remove(RETRY_TIMEOUT_KEY) {
            None => Duration::from_secs(DEFAULT_RETRY_TIMEOUT_SECS),
            Some(v) => Duration::from_secs(v.as_u64().ok_or_else(|| {
                DbError::configuration(format!(
                    "'{}' must be a number of seconds",
                    RETRY_TIMEOUT_KEY
                ))
            })?),
        };

        let remaining = Self::server_from_map(rest)?;
        let (masters, defaults) = match masters {
            Some(masters) => (masters, remaining),
            None => (vec![remaining], ServerConfig::default()),
        };

        let config = Self {
            masters,
            slaves,
            defaults,
            shuffle,
            failure_threshold,
            retry_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate settings and return a configuration error if invalid.
    pub fn validate(&self) -> DbResult<()> {
        if self.failure_threshold == 0 {
            return Err(DbError::configuration(format!(
                "'{}' must be greater than 0",
                THRESHOLD_KEY
            )));
        }
        if self.masters.is_empty() {
            return Err(DbError::configuration(
                "Pool config must list at least one master server",
            ));
        }
        Ok(())
    }

    fn take_server_list(
        map: &mut Map<String, Value>,
        keys: &[&str],
    ) -> DbResult<Option<Vec<ServerConfig>>> {
        let mut found: Option<Vec<ServerConfig>> = None;
        for key in keys {
            let Some(value) = map.remove(*key) else {
                continue;
            };
            let entries = match value {
                Value::Array(items) => items,
                single @ Value::Object(_) => vec![single],
                other => {
                    return Err(DbError::configuration(format!(
                        "'{}' must be a list of server configs, got {}",
                        key, other
                    )));
                }
            };
            let servers = found.get_or_insert_with(Vec::new);
            for entry in entries {
                match entry {
                    Value::Object(obj) => servers.push(Self::server_from_map(obj)?),
                    Value::String(dsn) => servers.push(ServerConfig::from_dsn(dsn)),
                    other => {
                        return Err(DbError::configuration(format!(
                            "Invalid server entry in '{}': {}",
                            key, other
                        )));
                    }
                }
            }
        }
        Ok(found)
    }

    fn server_from_map(map: Map<String, Value>) -> DbResult<ServerConfig> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| DbError::configuration(format!("Invalid server config: {}", e)))
    }
}

/// Configuration for the command-line probe.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-connection-manager",
    about = "Open a master/slave database connection through a failover pool and run a statement",
    version,
    author
)]
pub struct Config {
    /// Pool configuration: a path to a JSON file, or inline JSON.
    #[arg(short = 'p', long = "pool-config", value_name = "FILE|JSON", env = "DB_POOL_CONFIG")]
    pub pool_config: String,

    /// Connection identifier used in logs and cache keys.
    #[arg(long, default_value = crate::models::DEFAULT_CONNECTION_ID, env = "DB_CONNECTION_ID")]
    pub id: String,

    /// Statement to run. Without it the probe only connects and reports versions.
    #[arg(short, long, env = "DB_SQL")]
    pub sql: Option<String>,

    /// Role to pin the statement to (auto, master, slave).
    #[arg(short, long, default_value = "auto", env = "DB_ROLE")]
    pub role: crate::models::Role,

    /// Cache the statement's result for this many seconds.
    #[arg(long, env = "DB_CACHE_TTL")]
    pub cache_ttl: Option<u64>,

    /// Disable the slave pool; all statements use the master.
    #[arg(long, env = "DB_DISABLE_SLAVES")]
    pub disable_slaves: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DB_JSON_LOGS")]
    pub json_logs: bool,

    /// Wrap connect attempts in profiling spans
    #[arg(long, env = "DB_PROFILE")]
    pub profile: bool,
}

impl Config {
    /// Load the pool configuration, reading it from disk unless it is inline JSON.
    pub fn load_pool_config(&self) -> DbResult<PoolConfig> {
        let trimmed = self.pool_config.trim_start();
        if trimmed.starts_with('{') {
            return PoolConfig::parse(trimmed);
        }
        let contents = std::fs::read_to_string(&self.pool_config).map_err(|e| {
            DbError::configuration(format!(
                "Cannot read pool config '{}': {}",
                self.pool_config, e
            ))
        })?;
        PoolConfig::parse(&contents)
    }

    /// Connection options derived from the CLI flags.
    pub fn connection_options(&self) -> crate::models::ConnectionOptions {
        let mut options = crate::models::ConnectionOptions::new(self.id.clone());
        options.enable_slaves = !self.disable_slaves;
        options.enable_profiling = self.profile;
        options
    }
}
