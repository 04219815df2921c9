//! Integration tests for query-result caching scopes.
//!
//! Tests verify that:
//! - Reads inside `cache()` hit the driver once and are then served from cache
//! - `no_cache()` suspends caching only up to its matching region
//! - The scope stack is unwound after success and after errors
//! - Dependency tags invalidate cached results

mod common;

use common::{ScriptedConnector, options, pool, shared};
use db_connection_manager::cache::{MemoryCache, touch_dependency};
use db_connection_manager::db::{Connection, MasterSlaveConnection, QueryCacheScope};
use db_connection_manager::models::ConnectionOptions;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const M: &str = "mysql://master:3306/app";

fn connect(
    connector: &Arc<ScriptedConnector>,
    cache: &Arc<MemoryCache>,
    options: ConnectionOptions,
) -> MasterSlaveConnection {
    MasterSlaveConnection::from_pool_config(options, &pool(&[M], &[]), connector.clone(), shared(cache))
}

#[tokio::test]
async fn test_cached_read_hits_driver_once() {
    let connector = ScriptedConnector::new();
    let cache = Arc::new(MemoryCache::new());
    let conn = connect(&connector, &cache, options());

    for _ in 0..3 {
        let value = conn
            .cache(None, None, |c| async move {
                c.create_command("SELECT COUNT(*) FROM user").query_scalar().await
            })
            .await
            .unwrap();
        assert_eq!(value, Some(json!(M)));
    }
    assert_eq!(connector.statements_matching("SELECT COUNT(*)"), 1);

    // Outside a cache region the driver is asked every time.
    conn.create_command("SELECT COUNT(*) FROM user")
        .query_scalar()
        .await
        .unwrap();
    assert_eq!(connector.statements_matching("SELECT COUNT(*)"), 2);
}

#[tokio::test]
async fn test_scope_stack_during_and_after_query() {
    let connector = ScriptedConnector::new();
    let cache = Arc::new(MemoryCache::new());
    let conn = connect(&connector, &cache, options());

    let depth = conn
        .cache(None, None, |c| async move {
            c.create_command("SELECT 1").query_scalar().await.unwrap();
            c.base().query_cache_depth()
        })
        .await;
    assert_eq!(depth, 1);
    assert!(conn.current_query_cache_scope().is_none());

    let failed = conn
        .cache(None, None, |c| async move {
            assert!(c.current_query_cache_scope().is_some());
            c.create_command("SELECT FAIL").query_scalar().await
        })
        .await;
    assert!(failed.is_err());
    assert!(conn.current_query_cache_scope().is_none());
}

#[tokio::test]
async fn test_no_cache_nested_in_cache() {
    let connector = ScriptedConnector::new();
    let cache = Arc::new(MemoryCache::new());
    let conn = connect(&connector, &cache, options());

    let (suspended, reenabled, after_inner) = conn
        .cache(Some(Duration::from_secs(10)), None, |c| async move {
            c.no_cache(|c| async move {
                let suspended = c.current_query_cache_scope();
                let reenabled = c
                    .cache(None, None, |c| async move { c.current_query_cache_scope() })
                    .await;
                (suspended, reenabled, c.current_query_cache_scope())
            })
            .await
        })
        .await;

    assert!(matches!(suspended, Some(QueryCacheScope::Suspended)));
    assert!(reenabled.is_some_and(|scope| scope.is_active()));
    assert!(matches!(after_inner, Some(QueryCacheScope::Suspended)));
    assert!(conn.current_query_cache_scope().is_none());
}

#[tokio::test]
async fn test_no_cache_region_reads_through() {
    let connector = ScriptedConnector::new();
    let cache = Arc::new(MemoryCache::new());
    let conn = connect(&connector, &cache, options());

    conn.cache(None, None, |c| async move {
        c.create_command("SELECT 1").query_scalar().await.unwrap();
        c.no_cache(|c| async move {
            c.create_command("SELECT 1").query_scalar().await.unwrap();
        })
        .await;
        c.create_command("SELECT 1").query_scalar().await.unwrap();
    })
    .await;

    assert_eq!(connector.statements_matching("SELECT 1"), 2);
}

#[tokio::test]
async fn test_dependency_invalidates_cached_result() {
    let connector = ScriptedConnector::new();
    let cache = Arc::new(MemoryCache::new());
    let conn = connect(&connector, &cache, options());

    let read = || {
        conn.cache(None, Some("user".to_string()), |c| async move {
            c.create_command("SELECT name FROM user").query_scalar().await
        })
    };

    read().await.unwrap();
    read().await.unwrap();
    assert_eq!(connector.statements_matching("SELECT name"), 1);

    touch_dependency(cache.as_ref(), "user").await.unwrap();
    read().await.unwrap();
    assert_eq!(connector.statements_matching("SELECT name"), 2);
}

#[tokio::test]
async fn test_disabled_query_cache_runs_directly() {
    let connector = ScriptedConnector::new();
    let cache = Arc::new(MemoryCache::new());
    let options = ConnectionOptions {
        enable_query_cache: false,
        ..options()
    };
    let conn = connect(&connector, &cache, options);

    for _ in 0..2 {
        conn.cache(None, None, |c| async move {
            assert!(c.current_query_cache_scope().is_none());
            c.create_command("SELECT 1").query_scalar().await
        })
        .await
        .unwrap();
    }
    assert_eq!(connector.statements_matching("SELECT 1"), 2);
}

#[tokio::test]
async fn test_proxy_reads_share_connection_scope() {
    let connector = ScriptedConnector::new();
    let cache = Arc::new(MemoryCache::new());
    let conn = connect(&connector, &cache, options());

    let master = conn.use_master();
    for _ in 0..2 {
        master
            .cache(None, None, |p| async move {
                p.create_command("SELECT 2").query_scalar().await
            })
            .await
            .unwrap();
    }
    assert_eq!(connector.statements_matching("SELECT 2"), 1);
}

#[tokio::test]
async fn test_close_clears_scopes() {
    let connector = ScriptedConnector::new();
    let cache = Arc::new(MemoryCache::new());
    let conn = connect(&connector, &cache, options());

    conn.cache(None, None, |c| async move {
        c.create_command("SELECT 1").query_scalar().await.unwrap();
        c.close().await;
        assert!(c.current_query_cache_scope().is_none());
    })
    .await;
    assert!(conn.current_query_cache_scope().is_none());
    assert!(!conn.is_active());
}

#[tokio::test]
async fn test_cached_read_survives_master_failover() {
    const DOWN: &str = "mysql://down:3306/app";
    let connector = ScriptedConnector::with_down(&[DOWN]);
    let cache = Arc::new(MemoryCache::new());
    let conn = MasterSlaveConnection::from_pool_config(
        options(),
        &pool(&[DOWN, M], &[]),
        connector.clone(),
        shared(&cache),
    );

    for _ in 0..3 {
        let value = conn
            .use_master()
            .cache(None, None, |p| async move {
                p.create_command("SELECT COUNT(*) FROM user").query_scalar().await
            })
            .await
            .unwrap();
        assert_eq!(value, Some(json!(M)));
    }
    assert_eq!(conn.active_dsn().as_deref(), Some(M));
    assert_eq!(connector.statements_matching("SELECT COUNT(*)"), 1);

    // A reopened connection keeps hitting the same entry.
    conn.close().await;
    connector.clear_attempts();
    let value = conn
        .use_master()
        .cache(None, None, |p| async move {
            p.create_command("SELECT COUNT(*) FROM user").query_scalar().await
        })
        .await
        .unwrap();
    assert_eq!(value, Some(json!(M)));
    assert_eq!(connector.statements_matching("SELECT COUNT(*)"), 1);
    assert!(connector.attempts().is_empty());
}
