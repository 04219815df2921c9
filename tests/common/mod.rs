//! Scripted fakes shared by the integration tests.
//!
//! `ScriptedConnector` opens `FakeHandle`s for every DSN that is not marked
//! down and records each attempt. Fake handles answer `query_scalar` with the
//! DSN they are connected to, so a test can tell which endpoint served a read.

#![allow(dead_code)]

use async_trait::async_trait;
use db_connection_manager::cache::{CacheBackend, MemoryCache};
use db_connection_manager::config::{PoolConfig, ServerConfig};
use db_connection_manager::db::{Connector, DriverHandle};
use db_connection_manager::error::{DbError, DbResult};
use db_connection_manager::models::{ConnectionOptions, DatabaseType, IsolationLevel};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub type StatementLog = Arc<Mutex<Vec<String>>>;

pub struct FakeHandle {
    dsn: String,
    db_type: DatabaseType,
    log: StatementLog,
    closed: bool,
}

impl FakeHandle {
    pub fn new(dsn: &str, log: StatementLog) -> Self {
        Self {
            dsn: dsn.to_string(),
            db_type: DatabaseType::from_connection_string(dsn).unwrap_or(DatabaseType::MySQL),
            log,
            closed: false,
        }
    }

    fn record(&self, entry: impl AsRef<str>) -> DbResult<()> {
        if self.closed {
            return Err(DbError::invalid_operation("use fake handle", "closed"));
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("{}: {}", self.dsn, entry.as_ref()));
        Ok(())
    }
}

#[async_trait]
impl DriverHandle for FakeHandle {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.record(sql)?;
        Ok(1)
    }

    async fn query_scalar(&mut self, sql: &str) -> DbResult<Option<Value>> {
        self.record(sql)?;
        if sql.contains("FAIL") {
            return Err(DbError::database("scripted failure", None, ""));
        }
        Ok(Some(json!(self.dsn)))
    }

    async fn last_insert_id(&mut self, sequence: Option<&str>) -> DbResult<String> {
        self.record(format!("LAST_INSERT_ID {:?}", sequence))?;
        Ok("42".to_string())
    }

    async fn server_version(&mut self) -> DbResult<String> {
        self.record("VERSION")?;
        Ok(format!("fake-{}", self.dsn))
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> DbResult<()> {
        self.record(format!("BEGIN {:?}", isolation))
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.record("COMMIT")
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.record("ROLLBACK")
    }

    async fn close(&mut self) -> DbResult<()> {
        self.record("CLOSE")?;
        self.closed = true;
        Ok(())
    }
}

/// Connector whose servers are up unless marked down.
#[derive(Default)]
pub struct ScriptedConnector {
    down: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    log: StatementLog,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_down(dsns: &[&str]) -> Arc<Self> {
        let connector = Self::default();
        for dsn in dsns {
            connector.set_down(dsn, true);
        }
        Arc::new(connector)
    }

    pub fn set_down(&self, dsn: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(dsn.to_string());
        } else {
            set.remove(dsn);
        }
    }

    /// DSNs of every connect attempt, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn clear_attempts(&self) {
        self.attempts.lock().unwrap().clear();
    }

    /// Every statement run on any handle, as `"<dsn>: <sql>"`.
    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn statements_matching(&self, needle: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, config: &ServerConfig) -> DbResult<Box<dyn DriverHandle>> {
        let dsn = config
            .dsn
            .clone()
            .ok_or_else(|| DbError::configuration("no dsn"))?;
        self.attempts.lock().unwrap().push(dsn.clone());
        if self.down.lock().unwrap().contains(&dsn) {
            return Err(DbError::connection(
                format!("{} refused the connection", dsn),
                "Start the server",
            ));
        }
        Ok(Box::new(FakeHandle::new(&dsn, self.log.clone())))
    }
}

/// A pool with shuffling disabled so attempt order is deterministic.
pub fn pool(masters: &[&str], slaves: &[&str]) -> PoolConfig {
    PoolConfig {
        masters: masters.iter().map(|d| ServerConfig::from_dsn(*d)).collect(),
        slaves: slaves.iter().map(|d| ServerConfig::from_dsn(*d)).collect(),
        shuffle: false,
        ..PoolConfig::default()
    }
}

pub fn options() -> ConnectionOptions {
    ConnectionOptions::new("test")
}

/// The same memory cache as a shared backend.
pub fn shared(cache: &Arc<MemoryCache>) -> Option<Arc<dyn CacheBackend>> {
    Some(cache.clone() as Arc<dyn CacheBackend>)
}
