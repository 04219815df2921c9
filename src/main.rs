//! DB Connection Manager - Main entry point.
//!
//! Opens a master/slave connection from a pool configuration, optionally runs
//! one statement through it, and prints a JSON report.

use clap::Parser;
use db_connection_manager::cache::MemoryCache;
use db_connection_manager::config::Config;
use db_connection_manager::db::{Connection, MasterSlaveConnection, SqlxConnector};
use db_connection_manager::models::{Role, masked_dsn};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Statements whose result is a row set rather than an affected-row count.
fn is_read_statement(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        keyword.as_str(),
        "SELECT" | "WITH" | "SHOW" | "PRAGMA" | "EXPLAIN" | "VALUES" | "DESCRIBE"
    )
}

async fn run_statement(
    conn: &MasterSlaveConnection,
    sql: &str,
    role: Role,
    cache_ttl: Option<Duration>,
) -> db_connection_manager::DbResult<Value> {
    let command = match role {
        Role::Master => conn.use_master().create_command(sql),
        Role::Slave => conn.use_slave().create_command(sql),
        Role::Auto => conn.use_auto().create_command(sql),
    };

    if !is_read_statement(sql) {
        let affected = command.execute().await?;
        return Ok(json!({ "affected_rows": affected }));
    }

    let value = match cache_ttl {
        Some(ttl) => {
            conn.cache(Some(ttl), None, |_| async { command.query_scalar().await })
                .await?
        }
        None => command.query_scalar().await?,
    };
    Ok(json!({ "value": value }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let pool = config.load_pool_config()?;
    let options = config.connection_options();

    info!(
        connection = %options.id,
        masters = pool.masters.len(),
        slaves = pool.slaves.len(),
        "Starting DB Connection Manager v{}",
        env!("CARGO_PKG_VERSION")
    );

    let cache = Arc::new(MemoryCache::new());
    let conn = MasterSlaveConnection::from_pool_config(
        options,
        &pool,
        Arc::new(SqlxConnector::new()),
        Some(cache),
    );

    let result = match &config.sql {
        Some(sql) => {
            run_statement(&conn, sql, config.role, config.cache_ttl.map(Duration::from_secs))
                .await
                .map(Some)
        }
        None => Ok(None),
    };

    let report = match result {
        Ok(result) => {
            let server_version = conn.server_version().await?;
            json!({
                "connection": conn.id(),
                "driver": conn.driver_name()?,
                "server_version": server_version,
                "master_dsn": conn.active_dsn().as_deref().map(masked_dsn),
                "slave_dsn": conn.active_slave_dsn().as_deref().map(masked_dsn),
                "result": result,
            })
        }
        Err(e) => {
            error!(error = %e, "Statement failed");
            conn.close().await;
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    conn.close().await;
    info!("Connection closed");
    Ok(())
}
