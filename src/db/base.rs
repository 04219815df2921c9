//! State shared by every connection variant.
//!
//! `BaseConnection` holds the stable options, the lazily created schema,
//! query builder and transaction, and the query-cache scope stack. It does not
//! own driver handles; the single and master/slave connections layer those on
//! top.

use super::lock_unpoisoned;
use super::query_cache::{QueryCacheScope, ScopeStack};
use super::schema::{QueryBuilder, Schema};
use super::transaction::Transaction;
use crate::cache::CacheBackend;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionOptions, DatabaseType};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

pub struct BaseConnection {
    options: ConnectionOptions,
    query_cache: Option<Arc<dyn CacheBackend>>,
    schema: Mutex<Option<Arc<Schema>>>,
    query_builder: Mutex<Option<Arc<QueryBuilder>>>,
    transaction: Mutex<Option<Arc<Transaction>>>,
    scopes: ScopeStack,
}

impl std::fmt::Debug for BaseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseConnection")
            .field("options", &self.options)
            .field("has_query_cache", &self.query_cache.is_some())
            .field("scope_depth", &self.scopes.depth())
            .finish_non_exhaustive()
    }
}

impl BaseConnection {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            query_cache: None,
            schema: Mutex::new(None),
            query_builder: Mutex::new(None),
            transaction: Mutex::new(None),
            scopes: ScopeStack::default(),
        }
    }

    /// Attach the backend used by `cache()` scopes.
    pub fn with_query_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.query_cache = Some(cache);
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn query_cache(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.query_cache.as_ref()
    }

    /// Schema helper, created once per connection lifetime.
    pub fn schema(&self, db_type: DatabaseType) -> Arc<Schema> {
        let mut slot = lock_unpoisoned(&self.schema);
        Arc::clone(slot.get_or_insert_with(|| {
            debug!(connection = %self.options.id, driver = %db_type, "Creating schema");
            Arc::new(Schema::new(db_type, self.options.table_prefix.clone()))
        }))
    }

    /// Query builder derived from the connection's schema.
    pub fn query_builder(&self, db_type: DatabaseType) -> Arc<QueryBuilder> {
        let schema = self.schema(db_type);
        let mut slot = lock_unpoisoned(&self.query_builder);
        Arc::clone(slot.get_or_insert_with(|| Arc::new(schema.create_query_builder())))
    }

    /// The transaction singleton, whether or not it is active.
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        lock_unpoisoned(&self.transaction).clone()
    }

    /// The transaction singleton if it is currently active.
    pub fn active_transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction().filter(|transaction| transaction.is_active())
    }

    /// The transaction singleton for a new `begin`, created on first use.
    pub(crate) fn transaction_for_begin(&self) -> DbResult<Arc<Transaction>> {
        if !self.options.enable_transactions {
            return Err(DbError::invalid_operation(
                "begin transaction",
                format!(
                    "transactions are disabled for connection '{}'",
                    self.options.id
                ),
            ));
        }
        let mut slot = lock_unpoisoned(&self.transaction);
        Ok(Arc::clone(slot.get_or_insert_with(|| Arc::new(Transaction::new()))))
    }

    /// Run `op` with query caching enabled.
    ///
    /// `duration` defaults to the connection's query cache duration. When
    /// caching is disabled or no backend is attached, `op` runs unchanged.
    pub async fn cache<F, Fut, T>(
        &self,
        duration: Option<Duration>,
        dependency: Option<String>,
        op: F,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cache = match &self.query_cache {
            Some(cache) if self.options.enable_query_cache => Arc::clone(cache),
            _ => return op().await,
        };

        let _scope = self.scopes.push(QueryCacheScope::Active {
            cache,
            duration: duration.unwrap_or_else(|| self.options.query_cache_duration()),
            dependency,
        });
        op().await
    }

    /// Run `op` with query caching suspended.
    ///
    /// Outside any `cache()` region, or directly inside another `no_cache()`,
    /// this is a plain call.
    pub async fn no_cache<F, Fut, T>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.scopes.current() {
            Some(scope) if scope.is_active() => {
                let _scope = self.scopes.push(QueryCacheScope::Suspended);
                op().await
            }
            _ => op().await,
        }
    }

    pub fn current_query_cache_scope(&self) -> Option<QueryCacheScope> {
        self.scopes.current()
    }

    pub fn query_cache_depth(&self) -> usize {
        self.scopes.depth()
    }

    /// Drop lazily created state and clear the scope stack.
    pub(crate) fn reset(&self) {
        *lock_unpoisoned(&self.schema) = None;
        *lock_unpoisoned(&self.query_builder) = None;
        *lock_unpoisoned(&self.transaction) = None;
        self.scopes.clear();
    }
}

impl Clone for BaseConnection {
    /// Copies options and the cache backend only. Schema, builder,
    /// transaction and scopes start empty.
    fn clone(&self) -> Self {
        Self {
            query_cache: self.query_cache.clone(),
            ..Self::new(self.options.clone())
        }
    }
}
