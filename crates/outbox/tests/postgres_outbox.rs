//! PostgreSQL integration tests for the outbox tables.
//!
//! These tests use a shared PostgreSQL container. Run with:
//!
//! ```bash
//! cargo test -p outbox --test postgres_outbox -- --test-threads=1
//! ```

use std::sync::Arc;

use broker::InMemoryBroker;
use outbox::postgres::{insert_event, insert_processed, processed_exists};
use outbox::{
    DispatcherConfig, NewOutboxEvent, OutboxDispatcher, OutboxStatus, OutboxStore,
    PostgresOutboxStore, ProcessedMessage,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/order/0001_create_order_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn setup() -> PgPool {
    let info = get_container_info().await;
    let pool = PgPool::connect(&info.connection_string).await.unwrap();
    sqlx::query("TRUNCATE outbox_events, processed_messages RESTART IDENTITY")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

#[tokio::test]
#[serial]
async fn test_rolled_back_insert_is_never_dispatched() {
    let pool = setup().await;
    let store = PostgresOutboxStore::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    insert_event(&mut tx, &NewOutboxEvent::new("ORDER_CANCELLED", "{}")).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(store.fetch_dispatchable(50, 10).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_dispatcher_marks_rows_sent() {
    let pool = setup().await;
    let store = PostgresOutboxStore::new(pool.clone());
    let broker = InMemoryBroker::new();

    let mut tx = pool.begin().await.unwrap();
    let id = insert_event(&mut tx, &NewOutboxEvent::new("PAYMENT_SUCCEEDED", r#"{"order_no":"n"}"#))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let dispatcher = OutboxDispatcher::new(
        Arc::new(store.clone()),
        Arc::new(broker.clone()),
        DispatcherConfig::new("order-service", "order_events"),
    );
    let report = dispatcher.dispatch_once().await.unwrap();

    assert_eq!(report.sent, 1);
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.attempts, 1);
    assert_eq!(broker.published_with_tag("PAYMENT_SUCCEEDED").await.len(), 1);

    dispatcher.dispatch_once().await.unwrap();
    assert_eq!(broker.published().await.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_failed_rows_are_reselected() {
    let pool = setup().await;
    let store = PostgresOutboxStore::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    let id = insert_event(&mut tx, &NewOutboxEvent::new("PAYMENT_FAILED", "{}")).await.unwrap();
    tx.commit().await.unwrap();

    store.mark_failed(id, "broker down", 1).await.unwrap();
    let batch = store.fetch_dispatchable(50, 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].status, OutboxStatus::Failed);

    store.mark_failed(id, "broker down", 10).await.unwrap();
    assert!(store.fetch_dispatchable(50, 10).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_processed_marker_unique() {
    let pool = setup().await;
    let mut conn = pool.acquire().await.unwrap();

    let marker = ProcessedMessage::new("msg-1", "USER_FOLLOW");
    assert!(!processed_exists(&mut conn, "msg-1").await.unwrap());
    insert_processed(&mut conn, &marker).await.unwrap();
    assert!(processed_exists(&mut conn, "msg-1").await.unwrap());

    let err = insert_processed(&mut conn, &marker).await.unwrap_err();
    assert!(err.is_duplicate());
}
