//! DB Connection Manager Library
//!
//! Lazily opened master/slave database connections over SQLite, PostgreSQL
//! and MySQL, with circuit-breaker failover across server pools, role-pinned
//! connection views and scoped query-result caching.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use cache::{CacheBackend, MemoryCache};
pub use config::{Config, PoolConfig, ServerConfig};
pub use db::{Connection, MasterSlaveConnection, RoleProxy, SingleConnection};
pub use error::{DbError, DbResult};
