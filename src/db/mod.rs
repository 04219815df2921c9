//! Connection management.
//!
//! This module provides:
//! - Driver handles and connectors (sqlx-backed)
//! - Circuit-breaker pool selection and handle factories
//! - Single and master/slave connections with lazily opened handles
//! - Role-pinned connection views
//! - Query-cache scopes, transactions and commands
//! - Driver dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod base;
pub mod command;
pub mod connection;
pub mod endpoint;
pub mod factory;
pub mod handle;
pub mod master_slave;
pub mod proxy;
pub mod query_cache;
pub mod schema;
pub mod selector;
pub mod single;
pub mod transaction;

pub use base::BaseConnection;
pub use command::Command;
pub use connection::Connection;
pub use endpoint::HandleGuard;
pub use factory::{CreatedHandle, FixedDsnFactory, HandleFactory, PoolHandleFactory};
pub use handle::{Connector, DriverHandle, SqlxConnection, SqlxConnector, SqlxHandle};
pub use master_slave::MasterSlaveConnection;
pub use proxy::RoleProxy;
pub use query_cache::QueryCacheScope;
pub use schema::{QueryBuilder, Schema};
pub use selector::{PoolKind, PoolSelector, Selected, SelectorSettings, ServerPool};
pub use single::SingleConnection;
pub use transaction::Transaction;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
