//! HTTP surface for ad hoc sync requests and health checks.

use crate::error::{PermsSyncError, PermsSyncResult};
use crate::queue::Priority;
use crate::syncer::PermsSyncer;
use authz::{RepoId, UserId};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post}
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub user_ids: Vec<UserId>,
    #[serde(default)]
    pub repo_ids: Vec<RepoId>,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub invalidate_caches: bool
}

fn default_priority() -> Priority {
    Priority::High
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleResponse {
    pub users: usize,
    pub repos: usize,
    pub queue_size: usize
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue_size: usize,
    pub providers: usize,
    pub allow_access_by_default: bool
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string()
        })
    )
        .into_response()
}

pub fn create_router(syncer: Arc<PermsSyncer>) -> Router {
    Router::new()
        .route("/schedule-perms-sync", post(schedule_perms_sync))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(syncer)
}

/// POST /schedule-perms-sync
async fn schedule_perms_sync(
    State(syncer): State<Arc<PermsSyncer>>,
    Json(request): Json<ScheduleRequest>
) -> Response {
    if request.user_ids.is_empty() && request.repo_ids.is_empty() {
        return bad_request("at least one of user_ids and repo_ids is required");
    }

    syncer.schedule_users(request.priority, &request.user_ids, request.invalidate_caches);
    syncer.schedule_repos(request.priority, &request.repo_ids, request.invalidate_caches);
    info!(
        users = request.user_ids.len(),
        repos = request.repo_ids.len(),
        priority = %request.priority,
        "Scheduled ad hoc permissions syncs"
    );

    (
        StatusCode::ACCEPTED,
        Json(ScheduleResponse {
            users: request.user_ids.len(),
            repos: request.repo_ids.len(),
            queue_size: syncer.queue().len()
        })
    )
        .into_response()
}

/// GET /health
async fn health(State(syncer): State<Arc<PermsSyncer>>) -> Json<HealthResponse> {
    let snapshot = syncer.providers().snapshot();
    Json(HealthResponse {
        status: "healthy".to_string(),
        queue_size: syncer.queue().len(),
        providers: snapshot.providers.len(),
        allow_access_by_default: snapshot.allow_access_by_default
    })
}

pub struct ApiServer {
    syncer: Arc<PermsSyncer>,
    addr: SocketAddr
}

impl ApiServer {
    pub fn new(syncer: Arc<PermsSyncer>, host: &str, port: u16) -> PermsSyncResult<Self> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| PermsSyncError::Server(format!("Invalid address: {e}")))?;
        Ok(Self { syncer, addr })
    }

    /// Serves until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> PermsSyncResult<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| PermsSyncError::Server(format!("Failed to bind to {}: {e}", self.addr)))?;
        info!(addr = %self.addr, "Schedule API listening");

        axum::serve(listener, create_router(self.syncer))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| PermsSyncError::Server(e.to_string()))?;

        info!("Schedule API stopped");
        Ok(())
    }
}
