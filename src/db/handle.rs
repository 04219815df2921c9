//! Driver handles and connectors.
//!
//! A `DriverHandle` is one live connection to one endpoint. A `Connector`
//! is the backend hook the pool selector and the fixed-DSN factory use to
//! normalize a server config and open a handle from it.
//!
//! `SqlxHandle`/`SqlxConnector` are the sqlx-backed implementations. They
//! hold a single dedicated connection (not a pool) so that session state such
//! as the last insert id and an open transaction stays on one socket.

use crate::config::ServerConfig;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    ConnectOptions, Connection as _, Executor, MySqlConnection, PgConnection, SqliteConnection,
    mysql::MySqlConnectOptions, postgres::PgConnectOptions, sqlite::SqliteConnectOptions,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Attribute holding the per-attempt connect timeout in seconds.
pub const CONNECT_TIMEOUT_ATTRIBUTE: &str = "timeout";

/// A live connection to one database endpoint.
#[async_trait]
pub trait DriverHandle: Send {
    fn database_type(&self) -> DatabaseType;

    /// Run a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str) -> DbResult<u64>;

    /// Run a query and return the first column of the first row.
    async fn query_scalar(&mut self, sql: &str) -> DbResult<Option<Value>>;

    /// `sequence` is already quoted for the driver when given.
    async fn last_insert_id(&mut self, sequence: Option<&str>) -> DbResult<String>;

    async fn server_version(&mut self) -> DbResult<String>;

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Dispose of the handle. Further calls fail.
    async fn close(&mut self) -> DbResult<()>;
}

/// Backend hooks used to turn a server config into a live handle.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Fill in derived fields, most importantly the DSN.
    fn normalize_config(&self, config: ServerConfig) -> DbResult<ServerConfig> {
        config.normalized()
    }

    /// Open a handle from a normalized config.
    async fn connect(&self, config: &ServerConfig) -> DbResult<Box<dyn DriverHandle>>;
}

/// Backend-specific sqlx connection (avoids AnyConnection limitations).
#[derive(Debug)]
pub enum SqlxConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

/// Driver handle over one sqlx connection.
#[derive(Debug)]
pub struct SqlxHandle {
    conn: Option<SqlxConnection>,
    db_type: DatabaseType,
}

impl SqlxHandle {
    pub fn new(conn: SqlxConnection) -> Self {
        let db_type = match &conn {
            SqlxConnection::MySql(_) => DatabaseType::MySQL,
            SqlxConnection::Postgres(_) => DatabaseType::PostgreSQL,
            SqlxConnection::SQLite(_) => DatabaseType::SQLite,
        };
        Self {
            conn: Some(conn),
            db_type,
        }
    }

    fn conn(&mut self) -> DbResult<&mut SqlxConnection> {
        self.conn.as_mut().ok_or_else(|| {
            DbError::invalid_operation("use driver handle", "the handle has been closed")
        })
    }

    async fn execute_raw(&mut self, sql: &str) -> DbResult<u64> {
        let affected = impl_conn_dispatch!(self.conn()?, {
            MySql(c) => Executor::execute(&mut *c, sql).await?.rows_affected(),
            Postgres(c) => Executor::execute(&mut *c, sql).await?.rows_affected(),
            SQLite(c) => Executor::execute(&mut *c, sql).await?.rows_affected(),
        });
        Ok(affected)
    }
}

#[async_trait]
impl DriverHandle for SqlxHandle {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        debug!(sql = %sql, "Executing statement");
        self.execute_raw(sql).await
    }

    async fn query_scalar(&mut self, sql: &str) -> DbResult<Option<Value>> {
        debug!(sql = %sql, "Executing query");
        let value = impl_conn_dispatch!(self.conn()?, {
            MySql(c) => sqlx::query(sql)
                .fetch_optional(&mut *c)
                .await?
                .map(|row| first_column_json!(row)),
            Postgres(c) => sqlx::query(sql)
                .fetch_optional(&mut *c)
                .await?
                .map(|row| first_column_json!(row)),
            SQLite(c) => sqlx::query(sql)
                .fetch_optional(&mut *c)
                .await?
                .map(|row| first_column_json!(row)),
        });
        Ok(value)
    }

    async fn last_insert_id(&mut self, sequence: Option<&str>) -> DbResult<String> {
        let id = impl_conn_dispatch!(self.conn()?, {
            MySql(c) => sqlx::query_scalar::<_, u64>("SELECT LAST_INSERT_ID()")
                .fetch_one(&mut *c)
                .await?
                .to_string(),
            Postgres(c) => match sequence {
                Some(sequence) => {
                    let sql = format!("SELECT currval('{}')", sequence.replace('\'', "''"));
                    sqlx::query_scalar::<_, i64>(&sql)
                        .fetch_one(&mut *c)
                        .await?
                        .to_string()
                }
                None => sqlx::query_scalar::<_, i64>("SELECT lastval()")
                    .fetch_one(&mut *c)
                    .await?
                    .to_string(),
            },
            SQLite(c) => sqlx::query_scalar::<_, i64>("SELECT last_insert_rowid()")
                .fetch_one(&mut *c)
                .await?
                .to_string(),
        });
        Ok(id)
    }

    async fn server_version(&mut self) -> DbResult<String> {
        let version = impl_conn_dispatch!(self.conn()?, {
            MySql(c) => sqlx::query_scalar::<_, String>("SELECT version()")
                .fetch_one(&mut *c)
                .await?,
            Postgres(c) => sqlx::query_scalar::<_, String>("SELECT current_setting('server_version')")
                .fetch_one(&mut *c)
                .await?,
            SQLite(c) => sqlx::query_scalar::<_, String>("SELECT sqlite_version()")
                .fetch_one(&mut *c)
                .await?,
        });
        debug!(version = %version, "Got server version");
        Ok(version)
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> DbResult<()> {
        match (self.db_type, isolation) {
            (DatabaseType::MySQL, Some(level)) => {
                self.execute_raw(&format!("SET TRANSACTION ISOLATION LEVEL {}", level))
                    .await?;
                self.execute_raw("START TRANSACTION").await?;
            }
            (DatabaseType::MySQL, None) => {
                self.execute_raw("START TRANSACTION").await?;
            }
            (DatabaseType::PostgreSQL, level) => {
                self.execute_raw("BEGIN").await?;
                if let Some(level) = level {
                    self.execute_raw(&format!("SET TRANSACTION ISOLATION LEVEL {}", level))
                        .await?;
                }
            }
            (DatabaseType::SQLite, level) => {
                match level {
                    None => {}
                    Some(IsolationLevel::ReadUncommitted) => {
                        self.execute_raw("PRAGMA read_uncommitted = 1").await?;
                    }
                    Some(IsolationLevel::Serializable) => {
                        self.execute_raw("PRAGMA read_uncommitted = 0").await?;
                    }
                    Some(other) => {
                        return Err(DbError::invalid_operation(
                            "begin transaction",
                            format!(
                                "SQLite only supports READ UNCOMMITTED and SERIALIZABLE, not {}",
                                other
                            ),
                        ));
                    }
                }
                self.execute_raw("BEGIN").await?;
            }
        }
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.execute_raw("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.execute_raw("ROLLBACK").await.map(|_| ())
    }

    async fn close(&mut self) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        impl_conn_dispatch!(conn, {
            MySql(c) => c.close().await?,
            Postgres(c) => c.close().await?,
            SQLite(c) => c.close().await?,
        });
        Ok(())
    }
}

/// Connector opening `SqlxHandle`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxConnector;

impl SqlxConnector {
    pub fn new() -> Self {
        Self
    }

    /// Read the per-attempt connect timeout from the config attributes.
    fn connect_timeout(config: &ServerConfig) -> Option<Duration> {
        config
            .attributes
            .get(CONNECT_TIMEOUT_ATTRIBUTE)
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
    }

    async fn open(config: &ServerConfig, dsn: &str) -> DbResult<SqlxConnection> {
        let db_type = DatabaseType::from_connection_string(dsn).ok_or_else(|| {
            DbError::configuration(format!("Unknown database type in DSN '{}'", dsn))
        })?;

        let conn = match db_type {
            DatabaseType::MySQL => {
                let mut options = MySqlConnectOptions::from_str(dsn).map_err(|e| {
                    DbError::configuration(format!("Invalid MySQL DSN: {}", e))
                })?;
                if let Some(username) = &config.username {
                    options = options.username(username);
                }
                if let Some(password) = &config.password {
                    options = options.password(password);
                }
                SqlxConnection::MySql(
                    options
                        .connect()
                        .await
                        .map_err(|e| connect_error(db_type, &e))?,
                )
            }
            DatabaseType::PostgreSQL => {
                let mut options = PgConnectOptions::from_str(dsn).map_err(|e| {
                    DbError::configuration(format!("Invalid PostgreSQL DSN: {}", e))
                })?;
                if let Some(username) = &config.username {
                    options = options.username(username);
                }
                if let Some(password) = &config.password {
                    options = options.password(password);
                }
                SqlxConnection::Postgres(
                    options
                        .connect()
                        .await
                        .map_err(|e| connect_error(db_type, &e))?,
                )
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(dsn)
                    .map_err(|e| DbError::configuration(format!("Invalid SQLite DSN: {}", e)))?
                    .create_if_missing(true);
                SqlxConnection::SQLite(
                    options
                        .connect()
                        .await
                        .map_err(|e| connect_error(db_type, &e))?,
                )
            }
        };
        Ok(conn)
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    async fn connect(&self, config: &ServerConfig) -> DbResult<Box<dyn DriverHandle>> {
        let dsn = config
            .dsn
            .as_deref()
            .ok_or_else(|| DbError::configuration("Cannot connect: the DSN is not set"))?;

        let conn = match Self::connect_timeout(config) {
            Some(limit) => tokio::time::timeout(limit, Self::open(config, dsn))
                .await
                .map_err(|_| {
                    DbError::connection(
                        format!("Connect timed out after {}s", limit.as_secs()),
                        "Check that the server is reachable or raise the 'timeout' attribute",
                    )
                })??,
            None => Self::open(config, dsn).await?,
        };
        Ok(Box::new(SqlxHandle::new(conn)))
    }
}

/// Map a connect failure to a connection error with a helpful suggestion.
fn connect_error(db_type: DatabaseType, error: &sqlx::Error) -> DbError {
    DbError::connection(
        format!("Failed to connect: {}", error),
        connection_suggestion(db_type, error),
    )
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(db_type: DatabaseType, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            db_type
        );
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password in the server config".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    match db_type {
        DatabaseType::PostgreSQL => {
            "Verify the DSN format: postgres://host:5432/db".to_string()
        }
        DatabaseType::MySQL => "Verify the DSN format: mysql://host:3306/db".to_string(),
        DatabaseType::SQLite => {
            "Verify the file path exists and is accessible: sqlite:path/to/db.sqlite".to_string()
        }
    }
}
