use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use order_dispatch::api;
use order_dispatch::config::Config;
use order_dispatch::error::AppError;
use order_dispatch::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let shared_state = Arc::new(AppState::new(&config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = shared_state.spawn_workers(shutdown_rx);

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        auto_assign_threshold = config.dispatch.auto_assign_threshold,
        broadcast_fanout = config.dispatch.broadcast_fanout,
        queue_table = config.queue_table_enabled,
        "dispatch engine started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(err) = worker.await {
            tracing::error!(error = %err, "background worker panicked");
        }
    }

    tracing::info!("dispatch engine stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
