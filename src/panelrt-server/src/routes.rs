//! The HTTP surface (§6.1): panel CRUD, the trigger endpoint, health and
//! metrics exposition. Status codes follow §6.1's table: 404 for an unknown
//! panel/tool, 400 for an invalid body, 500 with `{error, message}` for a
//! handler failure.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use panelrt_core::panel::PanelConfig;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::ws;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/panels", post(create_panel).get(list_panels))
        .route("/panels/:id", get(panel_info).delete(destroy_panel))
        .route("/panels/:id/state", get(panel_state))
        .route("/panels/:id/trigger/:tool", post(trigger_tool))
        .route("/panels/:id/ws", get(panel_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
    uptime: u64,
    panels: HealthPanels,
    runtime: HealthRuntime,
    extensions: Vec<String>,
}

#[derive(Serialize)]
struct HealthPanels {
    active: usize,
    suspended: usize,
}

#[derive(Serialize)]
struct HealthRuntime {
    active_instances: usize,
    available_instances: usize,
    cache_hit_rate: f64,
    memory_bytes: u64,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (active, suspended) = state.panels.status_counts();
    let stats = state.orchestrator.pool_stats();
    Json(HealthBody {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.uptime_secs(),
        panels: HealthPanels { active, suspended },
        runtime: HealthRuntime {
            active_instances: stats.active_instances,
            available_instances: stats.available_instances,
            cache_hit_rate: stats.cache_hit_rate,
            memory_bytes: stats.total_memory_bytes,
        },
        extensions: state.extensions.list(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    ([("content-type", "text/plain; version=0.0.4")], state.prometheus.render())
}

#[derive(Serialize)]
struct CreatePanelResponse {
    id: String,
    status: panelrt_core::panel::PanelStatus,
    ws_url: String,
}

async fn create_panel(State(state): State<AppState>, Json(config): Json<PanelConfig>) -> impl IntoResponse {
    let id = state.panels.create_panel(config);
    // Dispatches the panel's `mount` hook, if it declared one, through the
    // same execute→suspend→resume pipeline as any other handler (§4.6's
    // closing paragraph) before the panel is reachable as `running`.
    let _ = state.orchestrator.run_lifecycle_hook(&id, "mount").await;
    state.panels.mark_running(&id);
    let status = state.panels.get_status(&id).unwrap_or(panelrt_core::panel::PanelStatus::Running);
    (
        StatusCode::CREATED,
        Json(CreatePanelResponse {
            ws_url: format!("/panels/{id}/ws"),
            id,
            status,
        }),
    )
}

async fn list_panels(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.panels.list_info())
}

async fn panel_info(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.panels.info(&id) {
        Some(info) => Json(info).into_response(),
        None => not_found(&id),
    }
}

async fn panel_state(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.panels.state_snapshot(&id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_found(&id),
    }
}

async fn destroy_panel(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let _ = state.orchestrator.run_lifecycle_hook(&id, "unmount").await;
    if state.orchestrator.destroy_panel(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(&id)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

async fn trigger_tool(State(state): State<AppState>, Path((id, tool)): Path<(String, String)>, body: axum::body::Bytes) -> impl IntoResponse {
    let args = if body.is_empty() {
        JsonValue::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(err) => {
                return (StatusCode::BAD_REQUEST, Json(ErrorBody { error: "INVALID_BODY", message: err.to_string() })).into_response();
            }
        }
    };
    match state.orchestrator.trigger_tool(&id, &tool, args).await {
        Ok(result) => {
            if result.status == panelrt_common::ExecutionStatus::Error {
                let message = result.error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody { error: "EXECUTION_ERROR", message }),
                )
                    .into_response()
            } else {
                Json(result).into_response()
            }
        }
        Err(panelrt_core::OrchestratorError::PanelNotFound(_)) => not_found(&id),
        Err(panelrt_core::OrchestratorError::ToolNotFound { panel, tool }) => {
            (StatusCode::NOT_FOUND, Json(ErrorBody { error: "NOT_FOUND", message: format!("panel {panel:?} has no tool {tool:?}") })).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody { error: "INTERNAL_ERROR", message: err.to_string() }),
        )
            .into_response(),
    }
}

async fn panel_ws(ws: WebSocketUpgrade, State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_socket(socket, id, state))
}

fn not_found(panel_id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "NOT_FOUND",
            message: format!("unknown panel {panel_id:?}"),
        }),
    )
        .into_response()
}
