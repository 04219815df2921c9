//! Cache backends.
//!
//! The connection manager consumes a cache for two things: the pool
//! selector's per-server failure counters and query-result caching. Both only
//! need `get`/`set`/`delete`; failures of any of these are swallowed by the
//! callers and treated as a miss.
//!
//! `MemoryCache` is the process-local implementation. With it the circuit
//! breaker is per process; a shared backend makes it cooperative across hosts.

use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Minimal key/value cache contract.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns `None` on a miss or an expired entry.
    async fn get(&self, key: &str) -> DbResult<Option<Value>>;

    /// Store a value. `ttl = None` keeps it until deleted.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> DbResult<()>;

    async fn delete(&self, key: &str) -> DbResult<()>;
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process cache with per-entry expiry.
///
/// Expired entries are dropped when read and purged in bulk on writes.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    async fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache").finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> DbResult<Option<Value>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        } // Read lock released here

        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> DbResult<()> {
        self.purge_expired().await;
        let expires_at = match ttl {
            Some(ttl) => Some(
                Instant::now()
                    .checked_add(ttl)
                    .ok_or_else(|| DbError::cache(format!("TTL {:?} is out of range", ttl)))?,
            ),
            None => None,
        };
        self.entries
            .write()
            .await
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> DbResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Invalidate every cached query result tied to `dependency`.
///
/// Cached results store the dependency tag current at write time; bumping the
/// tag makes them stale.
pub async fn touch_dependency(cache: &dyn CacheBackend, dependency: &str) -> DbResult<()> {
    cache
        .set(
            &dependency_key(dependency),
            Value::String(generate_dependency_tag()),
            None,
        )
        .await
}

/// Read the current tag for `dependency`, if any.
pub async fn dependency_tag(cache: &dyn CacheBackend, dependency: &str) -> DbResult<Option<Value>> {
    cache.get(&dependency_key(dependency)).await
}

pub(crate) fn dependency_key(dependency: &str) -> String {
    format!("dependency:{}", dependency)
}

fn generate_dependency_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", json!(1), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(cache.len().await, 1);

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let cache = MemoryCache::new();
        cache
            .set("short", json!("v"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(cache.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let cache = MemoryCache::new();
        let other = cache.clone();
        cache.set("shared", json!(true), None).await.unwrap();
        assert_eq!(other.get("shared").await.unwrap(), Some(json!(true)));
        other.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_touch_dependency_changes_tag() {
        let cache = MemoryCache::new();
        assert_eq!(dependency_tag(&cache, "users").await.unwrap(), None);

        touch_dependency(&cache, "users").await.unwrap();
        let first = dependency_tag(&cache, "users").await.unwrap();
        touch_dependency(&cache, "users").await.unwrap();
        let second = dependency_tag(&cache, "users").await.unwrap();

        assert!(first.is_some());
        assert_ne!(first, second);
    }
}
