//! Camera API Server
//!
//! HTTP front end for one machine-vision camera: MJPEG and WebSocket preview
//! streams, single-shot captures, health, device listing and Prometheus
//! metrics.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::{routing::get, Router};
use camera_control::{CameraSession, StopSignal};
use camera_driver::CameraDriver;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_governor::GovernorLayer;
use tower_http::trace::TraceLayer;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

pub mod config;
pub mod error;
pub mod rate_limit;
pub mod routes;

pub use config::AppConfig;
pub use error::ApiError;

use rate_limit::{create_governor_config, RateLimitConfig};

/// Application state shared across handlers
pub struct AppState<D: CameraDriver> {
    pub session: CameraSession<D>,
    /// Renders `/metrics`; `None` when no recorder is installed
    pub metrics: Option<PrometheusHandle>,
    /// Raised on server shutdown, ends every stream
    pub shutdown: StopSignal,
    /// Encoded frames buffered per stream client
    pub stream_queue: usize,
    pub version: String,
    pub start_time: Instant,
}

impl<D: CameraDriver> AppState<D> {
    pub fn new(
        session: CameraSession<D>,
        metrics: Option<PrometheusHandle>,
        stream_queue: usize,
    ) -> Self {
        Self {
            session,
            metrics,
            shutdown: StopSignal::new(),
            stream_queue: stream_queue.max(1),
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Instant::now(),
        }
    }
}

/// Create the application router
pub fn create_router<D: CameraDriver>(
    state: Arc<AppState<D>>,
    rate_limit: &RateLimitConfig,
) -> Router {
    let mut captures = Router::new()
        .route("/capture", get(routes::capture::capture::<D>))
        .route("/capture1", get(routes::capture::capture_region::<D>));
    match create_governor_config(rate_limit) {
        Some(config) => captures = captures.layer(GovernorLayer { config }),
        None => warn!("Capture rate limiting disabled: per_second and burst_size must be non-zero"),
    }

    Router::new()
        .route("/stream", get(routes::stream::mjpeg::<D>))
        .route("/ws/stream", get(routes::stream::websocket::<D>))
        .route("/preview", get(routes::capture::preview::<D>))
        .route("/api/v1/health", get(routes::status::health::<D>))
        .route("/api/v1/devices", get(routes::status::devices::<D>))
        .route("/metrics", get(routes::status::metrics::<D>))
        .merge(captures)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run `f` against the session on a blocking worker
pub(crate) async fn blocking<D, T, F>(state: &Arc<AppState<D>>, f: F) -> Result<T, ApiError>
where
    D: CameraDriver,
    T: Send + 'static,
    F: FnOnce(&CameraSession<D>) -> camera_control::Result<T> + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(&state.session))
        .await
        .map_err(|e| ApiError::Worker(e.to_string()))?
        .map_err(ApiError::from)
}

/// Initialize logging at `level` (falls back to INFO), as JSON lines when `json` is set
pub fn init_logging(level: &str, json: bool) -> Result<(), SetGlobalDefaultError> {
    let builder = FmtSubscriber::builder()
        .with_max_level(Level::from_str(level).unwrap_or(Level::INFO))
        .with_target(true);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
}

/// Open the camera and serve until Ctrl-C
pub async fn run_server<D: CameraDriver>(
    config: AppConfig,
    driver: D,
) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = PrometheusBuilder::new().install_recorder()?;

    let settings = config.camera.clone();
    let session =
        tokio::task::spawn_blocking(move || CameraSession::open(driver, settings)).await??;
    let state = Arc::new(AppState::new(session, Some(metrics), config.server.stream_queue));
    let app = create_router(Arc::clone(&state), &config.rate_limit);

    info!("Starting camera server on {}", config.server.addr);

    let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    state.session.shutdown();
    Ok(())
}

async fn shutdown_signal(stop: StopSignal) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down, closing streams");
    stop.stop();
}
