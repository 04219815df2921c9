//! Query-result cache scopes.
//!
//! A connection keeps a stack of scopes. `cache()` pushes an active scope,
//! `no_cache()` pushes a suspended one, and the top of the stack decides
//! whether the next cache-eligible query reads and populates the cache.
//! Every push returns a `ScopeGuard` that pops on drop, so the stack unwinds
//! on errors, panics and dropped futures alike.

use super::lock_unpoisoned;
use crate::cache::{CacheBackend, dependency_tag};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// One entry of the scope stack.
#[derive(Clone)]
pub enum QueryCacheScope {
    Active {
        cache: Arc<dyn CacheBackend>,
        duration: Duration,
        /// Results are stale once this dependency's tag changes.
        dependency: Option<String>,
    },
    Suspended,
}

impl std::fmt::Debug for QueryCacheScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active {
                duration,
                dependency,
                ..
            } => f
                .debug_struct("Active")
                .field("duration", duration)
                .field("dependency", dependency)
                .finish_non_exhaustive(),
            Self::Suspended => f.write_str("Suspended"),
        }
    }
}

impl QueryCacheScope {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Active { duration, .. } => Some(*duration),
            Self::Suspended => None,
        }
    }

    pub fn dependency(&self) -> Option<&str> {
        match self {
            Self::Active { dependency, .. } => dependency.as_deref(),
            Self::Suspended => None,
        }
    }

    /// Read a cached result. Cache errors and stale dependencies are misses.
    pub async fn lookup(&self, key: &str) -> Option<Value> {
        let Self::Active {
            cache, dependency, ..
        } = self
        else {
            return None;
        };

        let entry = match cache.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "Query cache read failed");
                return None;
            }
        };

        if let Some(dependency) = dependency {
            let current = Self::current_tag(cache.as_ref(), dependency).await;
            if entry.get("dependency") != Some(&current) {
                debug!(dependency = %dependency, "Cached query result is stale");
                return None;
            }
        }
        entry.get("value").cloned()
    }

    /// Populate the cache. Errors are logged and ignored.
    pub async fn store(&self, key: &str, value: &Value) {
        let Self::Active {
            cache,
            duration,
            dependency,
        } = self
        else {
            return;
        };

        let tag = match dependency {
            Some(dependency) => Self::current_tag(cache.as_ref(), dependency).await,
            None => Value::Null,
        };
        let entry = json!({ "value": value, "dependency": tag });
        if let Err(e) = cache.set(key, entry, Some(*duration)).await {
            debug!(error = %e, "Query cache write failed");
        }
    }

    async fn current_tag(cache: &dyn CacheBackend, dependency: &str) -> Value {
        match dependency_tag(cache, dependency).await {
            Ok(Some(tag)) => tag,
            Ok(None) => Value::Null,
            Err(e) => {
                debug!(error = %e, "Query cache dependency read failed");
                Value::Null
            }
        }
    }
}

/// Deterministic cache key for a query on a given connection.
pub fn query_cache_key(connection_id: &str, dsn: Option<&str>, sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(connection_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(dsn.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(sql.as_bytes());
    format!("query:{}", hex::encode(hasher.finalize()))
}

/// The scope stack of one connection.
#[derive(Debug, Default)]
pub(crate) struct ScopeStack {
    scopes: Mutex<Vec<QueryCacheScope>>,
}

impl ScopeStack {
    pub(crate) fn current(&self) -> Option<QueryCacheScope> {
        lock_unpoisoned(&self.scopes).last().cloned()
    }

    pub(crate) fn depth(&self) -> usize {
        lock_unpoisoned(&self.scopes).len()
    }

    /// Push a scope; it is popped when the guard drops.
    pub(crate) fn push(&self, scope: QueryCacheScope) -> ScopeGuard<'_> {
        let mut scopes = lock_unpoisoned(&self.scopes);
        let depth = scopes.len();
        scopes.push(scope);
        ScopeGuard { stack: self, depth }
    }

    pub(crate) fn clear(&self) {
        lock_unpoisoned(&self.scopes).clear();
    }
}

/// Pops exactly the scope it pushed.
#[must_use = "the scope is popped as soon as the guard is dropped"]
pub(crate) struct ScopeGuard<'a> {
    stack: &'a ScopeStack,
    depth: usize,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        // Truncate rather than pop: a close() inside the region already cleared the stack.
        lock_unpoisoned(&self.stack.scopes).truncate(self.depth);
    }
}
