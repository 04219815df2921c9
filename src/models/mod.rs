//! Data models for the connection manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;

// Re-export commonly used types
pub use connection::{
    ConnectionOptions, DEFAULT_CONNECTION_ID, DEFAULT_QUERY_CACHE_DURATION_SECS, DatabaseType,
    IsolationLevel, Role, masked_dsn,
};
