//! HTTP server exposing the metrics and the health endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use computeflow_core::metrics::encode_metrics;
use computeflow_core::{Error, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Readiness of the processor, set once its runners got their partitions.
#[derive(Clone, Default)]
pub(crate) struct ServerState {
    ready: Arc<AtomicBool>,
}

impl ServerState {
    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

pub(crate) async fn start_metrics_server(
    addr: SocketAddr,
    state: ServerState,
    cln_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(%addr, "Metrics server started");

    axum::serve(listener, metrics_router(state))
        .with_graceful_shutdown(async move { cln_token.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))
}

fn metrics_router(state: ServerState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics_handler() -> Response {
    match encode_metrics() {
        Ok(buffer) => {
            debug!(size = buffer.len(), "Exposing metrics");
            (
                [(
                    header::CONTENT_TYPE,
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                )],
                buffer,
            )
                .into_response()
        }
        Err(e) => {
            error!(?e, "Encoding metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn readyz(State(state): State<ServerState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
