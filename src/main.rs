use junction_flow::aggregate::Aggregator;
use junction_flow::api::{self, ApiState};
use junction_flow::config;
use junction_flow::controller::SignalController;
use junction_flow::pipeline::Pipeline;
use junction_flow::sink::{JsonLinesSink, MemorySink, MetricsSink};
use junction_flow::source::{JsonFileSource, spawn_refresh_task};
use junction_flow::state::AppState;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

fn init_tracing(level: tracing::Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_default()?;
    init_tracing(config.log_level());
    tracing::info!(
        config_path = config::DEFAULT_CONFIG_PATH,
        app = %config.app.name,
        "junction-flow starting"
    );

    let timing = config.signal_timing()?;
    let state = Arc::new(RwLock::new(AppState::new()));
    let cancel = CancellationToken::new();

    let sink: Box<dyn MetricsSink> = match config.sink_path() {
        Some(path) => {
            tracing::info!(path = %path.display(), "Appending window metrics to file");
            Box::new(JsonLinesSink::append_to_path(path)?)
        }
        None => {
            tracing::info!("No sink path configured, keeping metrics in memory");
            Box::new(MemorySink::new())
        }
    };

    let directions = config.directions();
    let pipeline = Pipeline::new(
        Aggregator::new(config.grace_period()),
        timing,
        directions.clone(),
        config.sensor_id(),
        sink,
        Arc::clone(&state),
    );

    let refresh_handle = match config.source_path() {
        Some(path) => {
            tracing::info!(
                path = %path.display(),
                interval_secs = config.poll_interval().as_secs(),
                "Starting detection refresh task"
            );
            Some(spawn_refresh_task(
                JsonFileSource::new(path),
                pipeline,
                config.poll_interval(),
                cancel.clone(),
            ))
        }
        None => {
            tracing::warn!("No detection source configured - metrics will stay empty");
            None
        }
    };

    let counts_rx = {
        let guard = state.read().map_err(|_| "state lock poisoned")?;
        guard.subscribe_direction_counts()
    };
    let controller = SignalController::new(
        directions.into_iter().map(|d| d.name).collect(),
        config.controller_params(),
        counts_rx,
    )?;
    let signal_rx = controller.subscribe();
    let controller_handle = tokio::spawn(controller.run(cancel.clone()));

    let app = api::router(ApiState {
        app: Arc::clone(&state),
        signal: signal_rx,
    });
    let port = config.server_port();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
            shutdown.cancel();
        })
        .await?;

    // The controller finishes its current phase before exiting.
    cancel.cancel();
    if let Some(handle) = refresh_handle {
        handle.await?;
    }
    controller_handle.await?;
    tracing::info!("junction-flow stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::config;

    #[test]
    fn default_config_is_valid_toml() -> Result<(), Box<dyn std::error::Error>> {
        let _config = config::load_default()?;
        Ok(())
    }
}
