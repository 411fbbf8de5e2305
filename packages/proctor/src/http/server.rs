//! Minimal operational endpoints: health, a registry snapshot, and the
//! run entry points the trigger collaborators call. The dashboard's real
//! REST/WebSocket surface lives outside the core.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::routing::{get, post};
use axum::Router;
use proctor_types::{AgentId, RunId};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utils::context::AppContext;
use utils::telemetry::HttpMetrics;

use crate::config::Config;
use crate::health::SharedHealthStatus;
use crate::orchestrator::{Orchestrator, OrchestratorError, RunRequest};

#[derive(Clone)]
struct HttpState {
    orchestrator: Arc<Orchestrator>,
    health: SharedHealthStatus,
    metrics: HttpMetrics,
}

pub fn start(
    ctx: AppContext,
    config: Config,
    orchestrator: Arc<Orchestrator>,
    metrics: HttpMetrics,
    health: SharedHealthStatus,
) -> Result<()> {
    ctx.rt.clone().block_on(async move {
        let state = HttpState {
            orchestrator,
            health,
            metrics,
        };

        let mut cors = CorsLayer::new();
        for origin in &config.cors_allowed_origins {
            let origin: HeaderValue = origin
                .parse()
                .with_context(|| format!("invalid cors origin {}", origin))?;
            cors = cors.allow_origin(origin);
        }

        let router = Router::new()
            .route("/health", get(get_health))
            .route("/agents", get(get_agents))
            .route("/agents/{id}/drain", post(post_drain_agent))
            .route("/runs", post(post_run))
            .route("/runs/{id}", get(get_run))
            .route("/runs/{id}/cancel", post(post_cancel_run))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding http server on {}", addr))?;
        tracing::info!("Operational http server on {}", addr);

        let mut kill_receiver = ctx.get_kill_receiver();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = kill_receiver.recv().await;
            })
            .await
            .context("http server")
    })
}

async fn get_health(State(state): State<HttpState>) -> Response {
    state.metrics.increment_requests();
    let status = state.health.read().unwrap().clone();
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}

async fn get_agents(State(state): State<HttpState>) -> Response {
    state.metrics.increment_requests();
    Json(state.orchestrator.list_agents().await).into_response()
}

async fn post_drain_agent(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    state.metrics.increment_requests();
    let agent_id = match id.parse::<AgentId>() {
        Ok(agent_id) => agent_id,
        Err(err) => return bad_request(err.to_string()),
    };
    match state.orchestrator.drain_agent(&agent_id).await {
        Ok(()) => Json(json!({ "draining": agent_id })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn post_run(State(state): State<HttpState>, Json(request): Json<RunRequest>) -> Response {
    state.metrics.increment_requests();
    match state.orchestrator.submit_run(request).await {
        Ok(run_id) => (StatusCode::CREATED, Json(json!({ "run_id": run_id }))).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_run(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    state.metrics.increment_requests();
    let run_id = match id.parse::<RunId>() {
        Ok(run_id) => run_id,
        Err(err) => return bad_request(err.to_string()),
    };
    match state.orchestrator.get_run(&run_id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown run" })))
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize, Default)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn post_cancel_run(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> Response {
    state.metrics.increment_requests();
    let run_id = match id.parse::<RunId>() {
        Ok(run_id) => run_id,
        Err(err) => return bad_request(err.to_string()),
    };
    let reason = body
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "cancelled via api".to_string());
    match state.orchestrator.cancel_run(run_id, reason).await {
        Ok(()) => Json(json!({ "cancelled": true })).into_response(),
        Err(err) => error_response(err),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn error_response(err: OrchestratorError) -> Response {
    let code = match &err {
        OrchestratorError::UnknownService(_) => StatusCode::NOT_FOUND,
        OrchestratorError::NoTests(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(json!({ "error": err.to_string() }))).into_response()
}
