//! Connection-related data models.
//!
//! This module defines the types describing a connection: the driver family a DSN
//! points at, the logical routing role, transaction isolation levels, and the
//! stable options a connection is created from.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONNECTION_ID: &str = "db";
pub const DEFAULT_QUERY_CACHE_DURATION_SECS: u64 = 3600;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Parse database type from a bare driver tag such as `mysql` or `pgsql`.
    pub fn from_driver_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "pgsql" | "postgres" | "postgresql" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            "sqlite" | "sqlite3" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Short driver name, stable across DSN spellings.
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "pgsql",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }

    /// URL scheme used when assembling a DSN for this driver.
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Logical routing intent for statements issued through a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reads go to a slave, writes and transactional reads go to the master.
    #[default]
    Auto,
    Master,
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "master" => Ok(Self::Master),
            "slave" => Ok(Self::Slave),
            other => Err(format!("unknown role '{other}', expected auto, master or slave")),
        }
    }
}

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

fn default_true() -> bool {
    true
}

fn default_id() -> String {
    DEFAULT_CONNECTION_ID.to_string()
}

fn default_query_cache_duration() -> u64 {
    DEFAULT_QUERY_CACHE_DURATION_SECS
}

/// Stable configuration of a connection.
///
/// These are the only fields a duplicated connection carries over; handles,
/// transactions and lazily derived helpers are always rebuilt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default = "default_id")]
    pub id: String,
    /// Replaces `%` inside `{{%table}}` placeholders.
    #[serde(default)]
    pub table_prefix: String,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
    #[serde(default)]
    pub enable_profiling: bool,
    #[serde(default = "default_true")]
    pub enable_query_cache: bool,
    /// Default TTL for `cache()` scopes that do not pass their own.
    #[serde(default = "default_query_cache_duration")]
    pub query_cache_duration_secs: u64,
    #[serde(default = "default_true")]
    pub enable_transactions: bool,
    /// When false the slave handle is the master handle.
    #[serde(default = "default_true")]
    pub enable_slaves: bool,
    /// Use the master when no slave can be reached.
    #[serde(default = "default_true")]
    pub fallback_to_master: bool,
}

impl ConnectionOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn query_cache_duration(&self) -> Duration {
        Duration::from_secs(self.query_cache_duration_secs)
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            id: default_id(),
            table_prefix: String::new(),
            enable_logging: true,
            enable_profiling: false,
            enable_query_cache: true,
            query_cache_duration_secs: DEFAULT_QUERY_CACHE_DURATION_SECS,
            enable_transactions: true,
            enable_slaves: true,
            fallback_to_master: true,
        }
    }
}

/// Get a display-safe version of a connection string (credentials masked).
pub fn masked_dsn(dsn: &str) -> String {
    let authority_start = dsn.find("://").map(|pos| pos + 3).unwrap_or(0);
    if let Some(at_offset) = dsn[authority_start..].find('@') {
        let at_pos = authority_start + at_offset;
        if let Some(colon_pos) = dsn[authority_start..at_pos].rfind(':') {
            let colon_pos = authority_start + colon_pos;
            return format!("{}****{}", &dsn[..colon_pos + 1], &dsn[at_pos..]);
        }
    }
    dsn.to_string()
}
