//! HTTP surface: a liveness route, the refresh report and the publish
//! directory as static files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::{Json, Router, extract::State, routing::get};
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    services::ServeDir,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info};

use crate::scheduler::{RefreshReport, SharedReport};

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub public_dir: PathBuf,
    /// Requests allowed per client IP within `rate_limit_window`.
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
}

/// Routes and middleware, without rate limiting.
///
/// Rate limiting keys on the peer address, which only exists when the router
/// is served with connect info, so [`serve`] adds it separately.
pub fn router(public_dir: PathBuf, report: SharedReport) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .with_state(report)
        .fallback_service(ServeDir::new(public_dir))
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
}

async fn root() -> &'static str {
    "gtfs_bundler is running"
}

async fn status(State(report): State<SharedReport>) -> Json<RefreshReport> {
    Json(report.read().await.clone())
}

/// Milliseconds between replenished requests so that `max` requests are
/// available per `window`.
fn replenish_interval_ms(max: u32, window: Duration) -> u64 {
    let per_request = window.as_millis() / u128::from(max.max(1));
    u64::try_from(per_request).unwrap_or(u64::MAX).max(1)
}

/// Binds the listener and serves until Ctrl-C.
pub async fn serve(settings: ServerSettings, report: SharedReport) -> Result<()> {
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(replenish_interval_ms(
                settings.rate_limit_max,
                settings.rate_limit_window,
            ))
            .burst_size(settings.rate_limit_max.max(1))
            .finish()
            .ok_or_else(|| anyhow!("invalid rate limit configuration"))?,
    );

    let app = router(settings.public_dir.clone(), report).layer(GovernorLayer {
        config: governor_conf,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, public_dir = %settings.public_dir.display(), "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
