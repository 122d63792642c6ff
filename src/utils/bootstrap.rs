//! Bootstrap utilities for host applications.
//!
//! Shared initialization: tracing, pool startup and the health supervisor.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::RequestClient;
use crate::config::{PoolConfig, LOG_ENV_VAR};
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::supervisor::{HealthSupervisor, SupervisorHandle};
use crate::transport::Connector;

/// Initialize tracing with the BROKERPOOL_LOG environment variable.
///
/// Defaults to "info" level if BROKERPOOL_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// A started pool plus its supervisor.
pub struct PoolRuntime {
    pool: Arc<ConnectionPool>,
    supervisor: Option<SupervisorHandle>,
    event_source: String,
}

impl PoolRuntime {
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Request/reply client over this pool using the configured timeout.
    pub fn client(&self, config: &PoolConfig) -> RequestClient {
        RequestClient::new(Arc::clone(&self.pool)).with_default_timeout(config.request_timeout())
    }

    /// Identity this service reported to the broker.
    pub fn event_source(&self) -> &str {
        &self.event_source
    }

    pub fn is_supervised(&self) -> bool {
        self.supervisor.is_some()
    }

    /// Stop the supervisor, then close every pooled connection.
    pub async fn shutdown(self) {
        if let Some(supervisor) = self.supervisor {
            supervisor.join().await;
        }
        self.pool.close().await;
    }
}

/// Open the pool and, when `reconnect_when_closed` is set, start the health
/// supervisor.
pub async fn start(connector: Arc<dyn Connector>, config: &PoolConfig) -> Result<PoolRuntime> {
    let event_source = config.event_source();
    let pool = Arc::new(ConnectionPool::connect(connector, config).await?);

    let supervisor = config
        .reconnect_when_closed
        .then(|| HealthSupervisor::from_config(Arc::clone(&pool), config).spawn());

    info!(
        event_source = %event_source,
        connections = pool.len(),
        supervised = supervisor.is_some(),
        "Broker pool ready"
    );

    Ok(PoolRuntime {
        pool,
        supervisor,
        event_source,
    })
}
