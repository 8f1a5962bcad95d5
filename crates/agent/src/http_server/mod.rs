use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use common::prelude::Counters;
use storage::prelude::Storage;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse};
use tower_http::LatencyUnit;

mod config;
pub mod handlers;

pub use config::Config;

use crate::cert::TlsPaths;

const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// What the request handlers share.
#[derive(Debug, Clone)]
pub struct AppState {
    pub secret: Arc<str>,
    pub storage: Arc<dyn Storage>,
    pub counters: Arc<Counters>,
}

impl AppState {
    pub fn new(secret: &str, storage: Arc<dyn Storage>, counters: Arc<Counters>) -> Self {
        Self {
            secret: Arc::from(secret),
            storage,
            counters,
        }
    }
}

pub fn router(config: &Config, state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(handlers::index))
        .route("/download/:hash", get(handlers::download::handler))
        .route("/measure/:size", get(handlers::measure::handler))
        .fallback(handlers::not_found_handler)
        .with_state(state);

    if !config.access_log {
        return router;
    }

    let trace_layer = TraceLayer::new_for_http()
        .on_response(
            DefaultOnResponse::new()
                .include_headers(false)
                .level(config.log_level)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(DefaultOnFailure::new().latency_unit(LatencyUnit::Micros));
    router.layer(trace_layer)
}

/// Serve until `shutdown_rx` fires. TLS is used when certificate
/// material is given and loads; otherwise plain HTTP.
pub async fn run(
    config: Config,
    state: AppState,
    mut shutdown_rx: watch::Receiver<()>,
    tls: Option<TlsPaths>,
) -> Result<(), HttpServerError> {
    let listen_addr = config.listen_addr;
    let router = router(&config, state);

    if let Some(paths) = tls {
        // another component may have installed it already
        let _ = rustls::crypto::ring::default_provider().install_default();
        match RustlsConfig::from_pem_file(&paths.cert, &paths.key).await {
            Ok(rustls) => {
                let handle = axum_server::Handle::new();
                let shutdown = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown_rx.changed().await;
                    shutdown.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
                });

                tracing::info!(addr = ?listen_addr, "HTTPS server listening");
                axum_server::bind_rustls(listen_addr, rustls)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await?;
                return Ok(());
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load TLS certificate, falling back to HTTP");
            }
        }
    }

    tracing::info!(addr = ?listen_addr, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
}
