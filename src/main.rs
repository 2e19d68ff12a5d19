//! Chat Gateway daemon
//!
//! - Runs this process's shards through a `LocalSessionManager`
//! - Logs every event it receives
//! - Exposes health/ready/shard endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use chat_gateway::config::{Credentials, GatewayConfig};
use chat_gateway::health::{self, AppState};
use chat_gateway::metrics::GatewayMetrics;
use chat_gateway::rest::RestClient;
use chat_gateway::{
    handler_fn, ApInfo, AppAccessTokenSource, Event, EventCategory, LifecycleEvent,
    LocalSessionManager, PoolAssigner, SessionManager, TokenSource,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("chat_gateway={}", gateway_config.log_level).parse()?)
                .add_directive("tokio_tungstenite=info".parse()?)
                .add_directive("reqwest=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        api_base_url = %gateway_config.api_base_url,
        intents = %gateway_config.intents,
        total_shards = ?gateway_config.total_shards,
        "Starting Chat Gateway"
    );

    let metrics = GatewayMetrics::install()?;
    info!("Prometheus metrics initialized");

    let token: Arc<dyn TokenSource> = match &gateway_config.credentials {
        Credentials::Static(token) => Arc::new(token.clone()),
        Credentials::AppSecret {
            app_id,
            client_secret,
            token_url,
        } => Arc::new(AppAccessTokenSource::new(
            token_url.clone(),
            *app_id,
            client_secret.clone(),
            Duration::from_secs(10),
        )?),
    };

    let rest = RestClient::new(&gateway_config.api_base_url, Duration::from_secs(10))?;

    let mut manager = LocalSessionManager::new(Arc::new(rest))
        .with_policy(gateway_config.policy.clone())
        .with_metrics(metrics.clone());
    if let Some(pool) = gateway_config.pool {
        manager = manager.with_assigner(Arc::new(PoolAssigner::new(
            pool.pool_id,
            pool.shards_per_pool,
        )));
    }

    manager.register_handler(
        EventCategory::All,
        handler_fn(|event| {
            match event {
                Event::Dispatch(dispatch) => info!(
                    shard_id = dispatch.shard_id,
                    seq = ?dispatch.sequence,
                    event_type = %dispatch.event_type,
                    event_id = %dispatch.event_id,
                    "Event received"
                ),
                Event::Lifecycle(LifecycleEvent::Closed { shard_id, exit }) => {
                    warn!(shard_id, exit = exit.label(), "Shard closed")
                }
                Event::Lifecycle(lifecycle) => info!(?lifecycle, "Shard lifecycle"),
            }
            Ok(())
        }),
    );

    manager
        .start(
            ApInfo {
                shards: gateway_config.total_shards,
                url: None,
            },
            token,
            gateway_config.intents,
        )
        .await?;

    let shard_state = manager.shard_state();
    info!(shard_count = shard_state.shard_count(), "Shards started");

    // Start health server
    let app_state = AppState {
        shard_state,
        metrics,
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();

    info!(port = gateway_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down gateway...");

    if let Err(e) = manager.stop().await {
        error!(error = %e, "Shutdown incomplete");
    }

    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
