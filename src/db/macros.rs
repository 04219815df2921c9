//! Driver dispatch macros for reducing code duplication.
//!
//! `SqlxConnection` wraps one concrete sqlx connection per backend. These
//! macros generate the per-backend match arms while keeping each arm's body
//! visible at the call site. They expand at compile time with zero runtime
//! overhead.

/// Macro for generating driver dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_conn_dispatch!(conn, {
///     MySql(c) => do_mysql(c),
///     Postgres(c) => do_postgres(c),
///     SQLite(c) => do_sqlite(c),
/// });
/// ```
#[macro_export]
macro_rules! impl_conn_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::handle::SqlxConnection::$variant($c) => $body,
            )+
        }
    };
}

/// Decode the first column of a row into JSON, trying the common scalar types
/// in order. Unsupported column types decode as `null`.
#[macro_export]
macro_rules! first_column_json {
    ($row:expr) => {{
        use sqlx::Row as _;
        let row = $row;
        if let Ok(v) = row.try_get::<Option<i64>, _>(0) {
            serde_json::json!(v)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(0) {
            serde_json::json!(v)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(0) {
            serde_json::json!(v)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(0) {
            serde_json::json!(v)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(0) {
            serde_json::json!(v)
        } else {
            serde_json::Value::Null
        }
    }};
}

pub use first_column_json;
pub use impl_conn_dispatch;
