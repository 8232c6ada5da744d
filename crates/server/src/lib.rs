pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod session;
pub mod ws;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header::HeaderValue, header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use docsync_common::name::doc_name_from_path;
use futures_util::FutureExt;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::metrics::HubMetrics;
use crate::persistence::DocStore;
use crate::session::SessionHub;

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared handles for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SessionHub>,
    pub config: Arc<ServerConfig>,
    pub metrics: Arc<HubMetrics>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocStore>, config: ServerConfig) -> Self {
        let hub = Arc::new(SessionHub::new(store, config.session.clone()));
        Self { hub, config: Arc::new(config), metrics: Arc::new(HubMetrics::default()) }
    }
}

pub fn build_router(state: AppState) -> Router {
    apply_middleware(
        Router::new()
            .route("/", get(root))
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_route))
            .route("/copyFile", post(api::copy_file))
            .route("/{*doc}", get(ws::ws_route))
            .with_state(state),
    )
}

/// Serve until `shutdown` resolves, then flush every live session and close
/// the document store.
pub async fn run<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let hub = Arc::clone(&state.hub);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("docsync server exited unexpectedly")?;

    hub.shutdown().await;
    if let Err(error) = hub.store().close().await {
        warn!(%error, "failed to close document store");
    }
    info!("docsync server stopped");
    Ok(())
}

fn apply_middleware(router: Router) -> Router {
    // Tracing wraps panic containment so a panicking handler still gets a
    // request id and a log line.
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(contain_panics))
        .layer(middleware::from_fn(trace_request))
}

async fn root() -> (StatusCode, &'static str) {
    (StatusCode::OK, "okay")
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_route(State(state): State<AppState>) -> Response {
    state.metrics.set_active_sessions(state.hub.active_sessions().await);
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

/// Answer a panicking handler with a 500 instead of dropping the connection.
async fn contain_panics(request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path().to_owned();
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| (*message).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            let endpoint = metrics::normalize_endpoint(&path);
            error!(%endpoint, panic = %message, "handler panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

/// Echo or assign `x-request-id`, count the request and log it. Document
/// routes log the document name; everything else logs its endpoint.
async fn trace_request(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), ToOwned::to_owned);
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started = Instant::now();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let status = response.status();
    metrics::record_http_request(method.as_str(), &path, status.as_u16());
    let endpoint = metrics::normalize_endpoint(&path);
    let doc = (endpoint == "/{doc}").then(|| doc_name_from_path(&path)).flatten();
    info!(
        %request_id,
        %method,
        %endpoint,
        doc,
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "http request served"
    );
    response
}
