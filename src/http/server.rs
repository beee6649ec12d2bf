//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router with every handler
//! - Wire up middleware (request id, tracing, body limit, request timeout)
//! - Serve until the shutdown future resolves

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::http::{handlers, websocket};
use crate::lifecycle::RelayRuntime;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RelayRuntime>,
}

/// HTTP surface of the relay.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(runtime: Arc<RelayRuntime>) -> Self {
        let timeout = Duration::from_secs(runtime.config().listener.request_timeout_secs);
        // JSON framing and metadata on top of the encoded value limit.
        let body_limit = runtime.config().storage.max_value_bytes.saturating_mul(2).max(64 * 1024);
        Self {
            router: build_router(AppState { runtime }, timeout, body_limit),
        }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

#[allow(deprecated)]
fn build_router(state: AppState, request_timeout: Duration, body_limit: usize) -> Router {
    let rest = Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/cluster", get(handlers::cluster))
        .route("/v1/config/{namespace}/{environment}", get(handlers::get_scope))
        .route(
            "/v1/config/{namespace}/{environment}/{key}",
            get(handlers::get_key)
                .put(handlers::put_key)
                .delete(handlers::delete_key),
        )
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/ws/{namespace}/{environment}", get(websocket::subscribe))
        .merge(rest)
        .with_state(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
