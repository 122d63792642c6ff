//! End-to-end pool behaviour on the in-process channel transport.
//!
//! Run with: cargo test --test pool_recovery
//!
//! Covers the full lifecycle: start, dispatch, connection loss, supervisor
//! replacement and request/reply over the replacement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brokerpool::transport::{ChannelBroker, ChannelConnector, Connection};
use brokerpool::utils::bootstrap;
use brokerpool::{
    ConnectionPool, Error, EventDispatcher, EventProcessor, HandlerError, HealthSupervisor,
    PoolConfig, ProcessorRegistry, RequestClient, SubscribeDeclaration,
};
use serde::{Deserialize, Serialize};

const EVENTS_SUBJECT: &str = "inventory.events";

#[derive(Serialize, Deserialize)]
struct Reservation {
    sku: String,
    quantity: u32,
}

/// Confirms reservations, echoing the reserved quantity.
struct ReserveProcessor;

#[async_trait]
impl EventProcessor for ReserveProcessor {
    fn event_type(&self) -> &str {
        "reserve"
    }

    async fn handle(
        &self,
        body: &str,
        _connection: Arc<dyn Connection>,
    ) -> Result<String, HandlerError> {
        let reservation: Reservation = serde_json::from_str(body)?;
        if reservation.quantity == 0 {
            return Err("quantity must be positive".into());
        }
        Ok(serde_json::to_string(&reservation)?)
    }
}

/// Pool of `size` connections with the inventory dispatcher subscribed.
async fn inventory_pool(size: usize) -> (Arc<ChannelConnector>, Arc<ConnectionPool>) {
    let connector = Arc::new(ChannelConnector::new(ChannelBroker::new()));
    let config = PoolConfig {
        connection_total: size,
        ..Default::default()
    };
    let pool = Arc::new(
        ConnectionPool::connect(connector.clone(), &config)
            .await
            .expect("pool should start"),
    );

    let registry = ProcessorRegistry::builder()
        .register(ReserveProcessor)
        .build()
        .expect("registry should build");
    let dispatcher = Arc::new(EventDispatcher::new(Arc::new(registry)));
    pool.register(
        dispatcher,
        &SubscribeDeclaration::new(EVENTS_SUBJECT).with_queue("inventory"),
    )
    .await
    .expect("dispatcher should subscribe");

    (connector, pool)
}

fn client(pool: &Arc<ConnectionPool>) -> RequestClient {
    RequestClient::new(Arc::clone(pool)).with_default_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_request_reply_through_dispatcher() {
    let (_connector, pool) = inventory_pool(3).await;

    let response = client(&pool)
        .call_json(
            EVENTS_SUBJECT,
            "reserve",
            &Reservation {
                sku: "A-1".to_string(),
                quantity: 2,
            },
        )
        .await
        .unwrap();

    assert!(response.success);
    let reserved: Reservation = response.json().unwrap();
    assert_eq!(reserved.sku, "A-1");
    assert_eq!(reserved.quantity, 2);
}

#[tokio::test]
async fn test_processor_failure_reaches_caller() {
    let (_connector, pool) = inventory_pool(2).await;

    let response = client(&pool)
        .call(EVENTS_SUBJECT, "reserve", r#"{"sku":"A-1","quantity":0}"#)
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.data, "quantity must be positive");
}

#[tokio::test]
async fn test_unknown_event_type_reaches_caller() {
    let (_connector, pool) = inventory_pool(2).await;

    let response = client(&pool)
        .call(EVENTS_SUBJECT, "mystery", "")
        .await
        .unwrap();

    assert!(!response.success);
    assert!(response.data.contains("mystery"));
}

#[tokio::test]
async fn test_subscription_survives_connection_loss() {
    let (connector, pool) = inventory_pool(2).await;
    let original = pool.snapshot()[0].id();
    for connection in pool.snapshot().iter() {
        connection.close().await;
    }
    assert_eq!(connector.broker().subscribers_of(EVENTS_SUBJECT), 0);

    let report = HealthSupervisor::new(pool.clone(), Duration::ZERO, Duration::from_secs(8))
        .tick()
        .await;

    assert_eq!(report.closed, 2);
    assert_eq!(report.replaced, 2);
    assert!(pool.get(original).is_none());
    assert_eq!(pool.subscription_count().await, 1);
    assert_eq!(connector.broker().subscribers_of(EVENTS_SUBJECT), 1);

    let response = client(&pool)
        .call(EVENTS_SUBJECT, "reserve", r#"{"sku":"B-7","quantity":1}"#)
        .await
        .unwrap();
    assert!(response.success);
}

#[tokio::test]
async fn test_call_times_out_without_subscriber() {
    let connector = Arc::new(ChannelConnector::new(ChannelBroker::new()));
    let pool = Arc::new(
        ConnectionPool::connect(connector.clone(), &PoolConfig::default())
            .await
            .unwrap(),
    );

    let result = client(&pool)
        .call_with_timeout("nobody.listens", "reserve", "{}", Duration::from_millis(50))
        .await;

    assert!(matches!(result, Err(Error::RequestTimeout(_))));
    assert_eq!(connector.broker().subscription_count(), 0);
}

#[tokio::test]
async fn test_supervised_runtime_heals_pool() {
    let connector = Arc::new(ChannelConnector::new(ChannelBroker::new()));
    let config = PoolConfig {
        connection_total: 2,
        health_check: brokerpool::config::HealthCheckConfig {
            initial_delay_ms: 5,
            interval_ms: 10,
        },
        ..Default::default()
    };
    let runtime = bootstrap::start(connector.clone(), &config).await.unwrap();
    runtime.pool().pick().unwrap().close().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !runtime.pool().closed_connections().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "pool was not healed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(runtime.pool().len(), 2);
    assert_eq!(connector.connections_opened(), 3);
    runtime.shutdown().await;
}
