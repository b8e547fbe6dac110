//! API server entry point.
//!
//! Schema migrations are not run here; apply `migrations/wallet` and
//! `migrations/order` to their databases before starting.

use std::sync::Arc;

use api::config::{AppConfig, ConfigHandle, LogFormat, ObservabilityConfig, PoolManager};
use api::{AppState, OrderBackend, UserBackend};
use broker::{InMemoryBroker, MessageBroker};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use order::{InMemoryOrderStore, PostgresOrderStore};
use saga::Platform;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wallet::{InMemoryUserStore, PostgresUserStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_tracing(settings: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let (text, json) = match settings.log_format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    tracing_subscriber::registry().with(filter).with(text).with(json).init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Reloads the configuration on SIGHUP. Only the pools follow a change;
/// stores, workers and the listener keep their startup settings.
#[cfg(unix)]
fn watch_reload(config: ConfigHandle, pools: Arc<PoolManager>) -> std::io::Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let next = match AppConfig::load() {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(error = %e, "configuration reload rejected");
                    continue;
                }
            };
            let change = config.reload(next.clone()).await;
            if change.database {
                if let Err(e) = pools.apply(&next.database).await {
                    tracing::warn!(error = %e, "database pools not rebuilt");
                }
            }
            if change.server || change.outbox || change.transactional || change.consumer {
                tracing::warn!(version = change.version, "some changes take effect after a restart");
            }
        }
    });
    Ok(())
}

async fn run<U: UserBackend, O: OrderBackend>(
    config: AppConfig,
    user_store: U,
    order_store: O,
    pools: Arc<PoolManager>,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError> {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let platform = Arc::new(Platform::new(broker, user_store, order_store, config.platform_options()).await?);
    let workers = platform.spawn().await;

    let handle = ConfigHandle::new(config.clone());
    #[cfg(unix)]
    watch_reload(handle.clone(), pools.clone())?;

    let state = Arc::new(AppState {
        platform,
        config: handle,
        pools,
    });
    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;

    workers.shutdown().await;
    served?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = AppConfig::load()?;
    init_tracing(&config.observability);

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    let pools = Arc::new(PoolManager::new());
    pools.apply(&config.database).await?;

    match pools.pools().await {
        Some(service_pools) => {
            tracing::info!("using PostgreSQL stores");
            let users = PostgresUserStore::new(service_pools.users);
            let orders = PostgresOrderStore::new(service_pools.orders);
            run(config, users, orders, pools, metrics_handle).await
        }
        None => {
            tracing::info!("no database configured, using in-memory stores");
            run(config, InMemoryUserStore::new(), InMemoryOrderStore::new(), pools, metrics_handle).await
        }
    }
}
