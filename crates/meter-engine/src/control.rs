//! HTTP control channel.
//!
//! A small axum router over the engine's control handle. Every reply is a
//! single structured object: `{"code": "ok", "result": ...}` on success,
//! `{"code": <short code>, "message": <text>}` on failure.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use meter_common::Rule;

use crate::engine::{ControlHandle, ControlReply, ControlRequest, TaskSelector};

/// Body of `rm_task`: either a numeric id or a set (and optional rule)
/// name.
#[derive(Debug, Deserialize)]
pub struct RmTaskBody {
    /// Rule uid
    pub id: Option<u32>,
    /// Rule set name
    pub set: Option<String>,
    /// Rule name within the set
    pub name: Option<String>,
}

fn render(reply: ControlReply) -> (StatusCode, Json<serde_json::Value>) {
    match reply {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({ "code": "ok", "result": result })),
        ),
        Err((code, message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": code, "message": message })),
        ),
    }
}

async fn dispatch(handle: ControlHandle, req: ControlRequest) -> (StatusCode, Json<serde_json::Value>) {
    // the engine answers on its own thread; don't block the runtime
    let reply = tokio::task::spawn_blocking(move || handle.request(req))
        .await
        .unwrap_or_else(|_| Err(("internal".into(), "control worker failed".into())));
    render(reply)
}

async fn get_info(State(handle): State<ControlHandle>) -> (StatusCode, Json<serde_json::Value>) {
    dispatch(handle, ControlRequest::GetInfo).await
}

async fn get_modinfo(
    State(handle): State<ControlHandle>,
    Path(module): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    dispatch(handle, ControlRequest::GetModInfo(module)).await
}

async fn add_task(
    State(handle): State<ControlHandle>,
    Json(rule): Json<Rule>,
) -> (StatusCode, Json<serde_json::Value>) {
    dispatch(handle, ControlRequest::AddTask(Box::new(rule))).await
}

async fn rm_task(
    State(handle): State<ControlHandle>,
    Json(body): Json<RmTaskBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let sel = match (body.id, body.set) {
        (Some(id), _) => TaskSelector::Uid(id),
        (None, Some(set)) => TaskSelector::Name {
            set,
            name: body.name,
        },
        (None, None) => {
            return render(Err((
                "invalid_rule".into(),
                "rm_task needs an id or a set name".into(),
            )))
        }
    };
    dispatch(handle, ControlRequest::RmTask(sel)).await
}

/// Build the control router.
pub fn router(handle: ControlHandle) -> Router {
    Router::new()
        .route("/get_info", get(get_info))
        .route("/get_modinfo/:module", get(get_modinfo))
        .route("/add_task", post(add_task))
        .route("/rm_task", post(rm_task))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serve the control channel until the process exits.
pub async fn serve(listen: &str, handle: ControlHandle) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listen, "control channel listening");
    axum::serve(listener, router(handle)).await
}
