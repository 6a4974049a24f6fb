// Module: Api
// Read-only HTTP surface exposing the live run snapshot and accumulated
// outputs. Reads go through the same lock the scheduler writes under.

use crate::runner::status::RunState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Handle the endpoints read through; empty until a runner attaches.
#[derive(Clone, Default)]
pub struct ApiState {
    runner: Arc<RwLock<Option<Arc<Mutex<RunState>>>>>,
}

impl ApiState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_runner(&self, shared: Arc<Mutex<RunState>>) {
        *self.runner.write().expect("api state poisoned") = Some(shared);
    }

    fn current(&self) -> Option<Arc<Mutex<RunState>>> {
        self.runner.read().expect("api state poisoned").clone()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/outputs", get(outputs))
        .with_state(state)
}

async fn status(State(state): State<ApiState>) -> Json<Value> {
    match state.current() {
        None => Json(json!({"status": "no-runner"})),
        Some(shared) => Json(shared.lock().await.status_snapshot()),
    }
}

async fn outputs(State(state): State<ApiState>) -> Json<Value> {
    match state.current() {
        None => Json(json!({})),
        Some(shared) => Json(shared.lock().await.outputs_snapshot()),
    }
}

/// Binds and serves on a background task so the caller's run loop stays
/// synchronous. Returns the bound address (useful with port 0).
pub async fn serve_in_background(host: &str, port: u16, state: ApiState) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router(state)).await {
            error!(error = %err, "status server stopped");
        }
    });
    Ok(addr)
}

/// Binds and serves in the foreground, for the `serve` command.
pub async fn serve(host: &str, port: u16, state: ApiState) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(addr = %listener.local_addr()?, "status server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
