//! HTTP control surface.
//!
//! Thin and synchronous-feeling by design: every endpoint delegates to one
//! controller method and reports the outcome.  An invalid transition is the
//! caller's mistake, reported as 409 with `success: false`, never a crash.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::controller::{ControlError, Controller};
use crate::state::ControllerStatus;

/// Outcome of a control request.  `new_status` is the status after the
/// attempt, whether or not it succeeded.
#[derive(Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    pub new_status: ControllerStatus,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/start", post(api_start))
        .route("/api/stop", post(api_stop))
        .route("/api/pause", post(api_pause))
        .route("/api/resume", post(api_resume))
        .with_state(controller)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn api_status(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    Json(controller.status().await)
}

async fn api_start(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    let result = controller.start().await;
    respond(&controller, "controller started", result).await
}

async fn api_stop(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    let result = controller.stop().await;
    respond(&controller, "controller stopped", result).await
}

async fn api_pause(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    let result = controller.pause().await;
    respond(&controller, "controller paused", result).await
}

async fn api_resume(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    let result = controller.resume().await;
    respond(&controller, "controller resumed", result).await
}

async fn respond(
    controller: &Controller,
    ok_message: &str,
    result: Result<(), ControlError>,
) -> (StatusCode, Json<ControlResponse>) {
    let new_status = controller.status().await.status;
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(ControlResponse {
                success: true,
                message: ok_message.to_string(),
                new_status,
            }),
        ),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(ControlResponse {
                success: false,
                message: e.to_string(),
                new_status,
            }),
        ),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(controller: Arc<Controller>) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding control surface to {addr}"))?;

    info!(%addr, "control surface listening");

    axum::serve(listener, router(controller))
        .await
        .context("control surface server error")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
