pub mod api;
pub mod config;
pub mod sse;

use tokio::signal;

use anyhow::Context;
pub use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub use sse::{EventManager, SseEvent, create_sse_response};

pub async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    config.validate()?;

    init_tracing(&config);

    let prometheus_handle = if config.observability.metrics_enabled {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let builder = PrometheusBuilder::new();
        let handle = builder
            .install_recorder()
            .context("Failed to install Prometheus recorder")?;
        info!("Prometheus metrics recorder initialized");
        Some(handle)
    } else {
        None
    };

    run_server(config, prometheus_handle).await
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.general.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_server(
    config: Config,
    prometheus_handle: Option<PrometheusHandle>,
) -> anyhow::Result<()> {
    let server_enabled = config.server.enabled;
    let port = config.server.port;

    let state = api::AppState::new(config, prometheus_handle);
    let events = state.events.clone();

    let server_handle: Option<tokio::task::JoinHandle<()>> = if server_enabled {
        info!("Starting SSE API on port {}", port);

        let app = api::router(state);
        let addr = format!("0.0.0.0:{port}");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        Some(tokio::spawn(async move {
            info!("SSE server running at http://0.0.0.0:{}", port);
            if let Err(e) = axum::serve(listener, app).await {
                error!("Web server error: {}", e);
            }
        }))
    } else {
        info!("HTTP server disabled in config");
        None
    };

    info!("Running. Press Ctrl+C to stop.");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
        }
        Err(e) => {
            error!("Error listening for shutdown: {}", e);
        }
    }

    events.shutdown();
    if let Some(handle) = server_handle {
        handle.abort();
    }
    info!("Stopped");

    Ok(())
}
