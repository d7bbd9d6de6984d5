//! axum server wiring.
//!
//! The router exposes:
//! - `/healthz` and `/readyz`
//! - a catch-all handler that matches the route spec and scatters the request to every shard of
//!   the route's service

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::sync::Semaphore;

use crate::{
    client::ReqwestShardClient,
    config::RouterConfig,
    reducer::FirstSuccessReducer,
    response::ReducedResponse,
    scatter::{ScatterConfig, ScatterGather, ScatterRequest},
    snapshot::HeaderForwardPolicy,
    spec::{CompiledSpec, RouteMatch},
    targets::StaticTargetResolver,
};

#[derive(Clone)]
struct AppState {
    spec: Arc<CompiledSpec>,
    scatter: ScatterGather,
    inflight_requests: Arc<Semaphore>,
}

fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .fallback(handle_any)
        .with_state(state)
}

pub async fn run(cfg: RouterConfig, spec: CompiledSpec) -> anyhow::Result<()> {
    let resolver = StaticTargetResolver::new(cfg.targets.clone());
    for service in spec.services() {
        if !resolver.services().any(|known| known == service.as_str()) {
            tracing::warn!(
                event = "unknown_service",
                service = %service,
                "route references a service with no configured targets"
            );
        }
    }

    let client = ReqwestShardClient::new(Duration::from_millis(cfg.connect_timeout_ms))?;
    let scatter = ScatterGather::new(
        Arc::new(client),
        Arc::new(resolver),
        HeaderForwardPolicy::try_from_cfg(&cfg.forward_headers)?,
        ScatterConfig {
            default_deadline: Duration::from_millis(cfg.default_deadline_ms),
            max_inflight_calls: cfg.max_inflight_calls,
            max_body_bytes: cfg.max_body_bytes,
        },
    );

    let state = AppState {
        spec: Arc::new(spec),
        scatter,
        inflight_requests: Arc::new(Semaphore::new(cfg.max_inflight_requests)),
    };

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    tracing::info!(listen_addr = %cfg.listen_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Catch-all handler for spec-defined routes.
async fn handle_any(State(state): State<AppState>, req: Request<Body>) -> axum::response::Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let op = match state.spec.match_request(&method, &path) {
        RouteMatch::NotFound => {
            return ReducedResponse::error(StatusCode::NOT_FOUND, "not found").into_response()
        }
        RouteMatch::MethodNotAllowed { allowed } => {
            let mut resp =
                ReducedResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            // Best-effort `Allow` header.
            let allow = allowed
                .into_iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = allow.parse() {
                resp.headers.insert(http::header::ALLOW, value);
            }
            return resp.into_response();
        }
        RouteMatch::Matched(op) => op.clone(),
    };

    let _permit = match state.inflight_requests.try_acquire() {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!(
                event = "admission_rejected",
                reason = "too_many_inflight_requests",
                method = %method,
                route = %op.route_template,
                "request rejected"
            );
            return ReducedResponse::error(StatusCode::TOO_MANY_REQUESTS, "too many requests")
                .into_response();
        }
    };

    let scatter_req = ScatterRequest::new(op.service.clone(), req)
        .with_deadline(Duration::from_millis(op.deadline_ms));
    tracing::debug!(
        event = "scatter_start",
        work_id = %scatter_req.work_id(),
        method = %method,
        route = %op.route_template,
        service = %op.service
    );

    state
        .scatter
        .request(scatter_req, &FirstSuccessReducer)
        .await
        .into_response()
}
