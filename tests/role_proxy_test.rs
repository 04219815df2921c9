//! Integration tests for roles and role-pinned proxies.
//!
//! Tests verify that:
//! - Proxies are stable values: asking for the same role returns an equal proxy
//! - Slave-pinned proxies reject transactions and insert ids up front
//! - Commands route to the endpoint of the role they were created under
//! - Role regions restore the previous role on success and on error
//! - Cloned connections never share lazily created state

mod common;

use common::{ScriptedConnector, options, pool};
use db_connection_manager::db::{Connection, MasterSlaveConnection, RoleProxy};
use db_connection_manager::error::{DbError, DbResult};
use db_connection_manager::models::{ConnectionOptions, IsolationLevel, Role};
use serde_json::json;
use std::sync::Arc;

const M: &str = "mysql://master:3306/app";
const S: &str = "mysql://slave:3306/app";

fn connect(connector: &Arc<ScriptedConnector>) -> MasterSlaveConnection {
    MasterSlaveConnection::from_pool_config(
        options(),
        &pool(&[M], &[S]),
        connector.clone(),
        None,
    )
}

#[tokio::test]
async fn test_use_slave_is_stable() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    let first = conn.use_slave();
    let second = conn.use_slave();
    assert_eq!(first, second);
    assert!(std::ptr::eq(first.connection(), second.connection()));
    assert_eq!(first.use_slave(), first);
    assert_ne!(first.use_master(), first);
    assert_eq!(first.use_master().use_slave(), first);
    assert!(std::ptr::eq(conn.use_auto(), &conn));
}

#[tokio::test]
async fn test_handed_out_proxy_keeps_its_role() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    let slave: RoleProxy<'_> = conn.use_slave();
    let copy = slave;
    let master = copy.use_master();
    assert_eq!(slave.pinned_role(), Role::Slave);
    assert_eq!(master.pinned_role(), Role::Master);
}

#[tokio::test]
async fn test_slave_proxy_rejects_role_sensitive_operations() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);
    let slave = conn.use_slave();

    assert!(matches!(
        slave.begin_transaction(None).await,
        Err(DbError::InvalidOperation { .. })
    ));
    assert!(matches!(
        slave.last_insert_id(None).await,
        Err(DbError::InvalidOperation { .. })
    ));
    assert!(connector.attempts().is_empty());

    // Even with a live transaction on the connection, the slave view sees none.
    let transaction = conn.use_master().begin_transaction(None).await.unwrap();
    assert!(transaction.is_active());
    assert!(conn.transaction().is_some());
    assert!(slave.transaction().is_none());
    assert!(conn.use_master().transaction().is_some());
}

#[tokio::test]
async fn test_master_proxy_transaction_and_insert_id() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);
    let master = conn.use_master();

    master
        .begin_transaction(Some(IsolationLevel::RepeatableRead))
        .await
        .unwrap();
    master.begin_transaction(None).await.unwrap();
    assert_eq!(master.transaction().map(|t| t.level()), Some(2));

    assert_eq!(master.last_insert_id(Some("user_id_seq")).await.unwrap(), "42");
    master.commit_transaction().await.unwrap();
    master.commit_transaction().await.unwrap();
    assert!(master.transaction().is_none());

    let statements = connector.statements();
    assert_eq!(
        statements,
        vec![
            format!("{}: BEGIN Some(RepeatableRead)", M),
            format!("{}: SAVEPOINT LEVEL1", M),
            format!("{}: LAST_INSERT_ID Some(\"`user_id_seq`\")", M),
            format!("{}: RELEASE SAVEPOINT LEVEL1", M),
            format!("{}: COMMIT", M),
        ]
    );
}

#[tokio::test]
async fn test_last_insert_id_requires_open_handle() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);
    assert!(matches!(
        conn.last_insert_id(None).await,
        Err(DbError::InvalidOperation { .. })
    ));
}

#[tokio::test]
async fn test_commands_route_by_role() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    let on_slave = conn.use_slave().create_command("SELECT 1");
    let on_master = conn.use_master().create_command("SELECT 1");
    let on_auto = conn.create_command("SELECT 1");
    assert_eq!(conn.role(), Role::Auto);
    assert_eq!(on_slave.role(), Role::Slave);
    assert_eq!(on_master.role(), Role::Master);

    assert_eq!(on_slave.query_scalar().await.unwrap(), Some(json!(S)));
    assert_eq!(on_master.query_scalar().await.unwrap(), Some(json!(M)));
    assert_eq!(on_auto.query_scalar().await.unwrap(), Some(json!(S)));
}

#[tokio::test]
async fn test_auto_reads_use_master_inside_transaction() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    conn.begin_transaction(None).await.unwrap();
    let value = conn.create_command("SELECT 1").query_scalar().await.unwrap();
    assert_eq!(value, Some(json!(M)));
    conn.rollback_transaction().await.unwrap();

    let value = conn.create_command("SELECT 1").query_scalar().await.unwrap();
    assert_eq!(value, Some(json!(S)));
}

#[tokio::test]
async fn test_slave_command_rejects_writes_without_connecting() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    let result = conn
        .use_slave()
        .create_command("DELETE FROM user")
        .execute()
        .await;
    assert!(matches!(result, Err(DbError::InvalidOperation { .. })));
    assert!(connector.attempts().is_empty());

    assert_eq!(
        conn.create_command("DELETE FROM user").execute().await.unwrap(),
        1
    );
    assert_eq!(connector.attempts(), vec![M]);
}

#[tokio::test]
async fn test_role_regions_restore_prior_role() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    let inner = conn
        .master(|c| async move {
            let nested = c.slave(|c| async move { c.role() }).await;
            (nested, c.role())
        })
        .await;
    assert_eq!(inner, (Role::Slave, Role::Master));
    assert_eq!(conn.role(), Role::Auto);

    let failed: Result<(), DbError> = conn
        .slave(|c| async move {
            assert_eq!(c.role(), Role::Slave);
            Err(DbError::internal("boom"))
        })
        .await;
    assert!(failed.is_err());
    assert_eq!(conn.role(), Role::Auto);
}

#[tokio::test]
async fn test_role_restored_after_panic() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        conn.with_role(Role::Master, |_| panic!("inside role region"))
    }));
    assert!(result.is_err());
    assert_eq!(conn.role(), Role::Auto);
}

#[tokio::test]
async fn test_disabled_slaves_read_from_master() {
    let connector = ScriptedConnector::new();
    let options = ConnectionOptions {
        enable_slaves: false,
        ..options()
    };
    let conn = MasterSlaveConnection::from_pool_config(
        options,
        &pool(&[M], &[S]),
        connector.clone(),
        None,
    );

    let value = conn.create_command("SELECT 1").query_scalar().await.unwrap();
    assert_eq!(value, Some(json!(M)));
    assert_eq!(connector.attempts(), vec![M]);
}

#[tokio::test]
async fn test_transactions_disabled() {
    let connector = ScriptedConnector::new();
    let options = ConnectionOptions {
        enable_transactions: false,
        ..options()
    };
    let conn = MasterSlaveConnection::from_pool_config(
        options,
        &pool(&[M], &[]),
        connector.clone(),
        None,
    );
    assert!(matches!(
        conn.begin_transaction(None).await,
        Err(DbError::InvalidOperation { .. })
    ));
}

#[tokio::test]
async fn test_close_kills_active_transaction() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    let transaction = conn.begin_transaction(None).await.unwrap();
    drop(conn.slave_handle().await.unwrap());
    assert!(conn.is_active());

    conn.close().await;
    assert!(!conn.is_active());
    assert!(!transaction.is_active());
    assert!(conn.transaction().is_none());
    assert_eq!(connector.statements_matching("CLOSE"), 2);

    // A new transaction can be started on a fresh handle.
    let fresh = conn.begin_transaction(None).await.unwrap();
    assert!(!Arc::ptr_eq(&fresh, &transaction));
}

#[tokio::test]
async fn test_clone_does_not_share_lazy_state() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    let schema = conn.schema().unwrap();
    let builder = conn.query_builder().unwrap();
    let transaction = conn.begin_transaction(None).await.unwrap();

    let copy = conn.clone();
    assert!(!copy.is_active());
    assert!(copy.transaction().is_none());
    assert!(!Arc::ptr_eq(&schema, &copy.schema().unwrap()));
    assert!(!Arc::ptr_eq(&builder, &copy.query_builder().unwrap()));
    let copied = copy.begin_transaction(None).await.unwrap();
    assert!(!Arc::ptr_eq(&transaction, &copied));
    assert_eq!(copy.id(), conn.id());
}

#[tokio::test]
async fn test_driver_name_and_quoting() {
    let connector = ScriptedConnector::new();
    let conn = connect(&connector);

    assert_eq!(conn.driver_name().unwrap(), "mysql");
    assert_eq!(conn.quote_table_name("user").unwrap(), "`user`");
    assert_eq!(conn.use_slave().driver_name().unwrap(), "mysql");
    assert!(connector.attempts().is_empty());
    assert_eq!(
        conn.server_version().await.unwrap(),
        format!("fake-{}", S)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handles_held_across_await_in_spawned_tasks() {
    let connector = ScriptedConnector::new();
    let conn = Arc::new(connect(&connector));

    let writer = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move {
            {
                let mut handle = conn.master_handle().await?;
                handle.execute("INSERT INTO user (name) VALUES ('a')").await?;
            }
            conn.begin_transaction(None).await?;
            let id = conn.last_insert_id(None).await?;
            conn.commit_transaction().await?;
            DbResult::Ok(id)
        }
    });
    let reader = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move { conn.server_version().await }
    });

    assert_eq!(writer.await.unwrap().unwrap(), "42");
    assert_eq!(reader.await.unwrap().unwrap(), format!("fake-{}", S));
    assert_eq!(connector.statements_matching(&format!("{}: BEGIN", M)), 1);
    assert_eq!(connector.statements_matching(&format!("{}: COMMIT", M)), 1);
    assert_eq!(connector.attempts().len(), 2);
}
