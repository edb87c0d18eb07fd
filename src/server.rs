use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::config::DiscoveryConfig;
use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::sync::Synchronizer;

mod handlers;


pub struct Server {
    pub scheduler: Scheduler,
    pub sync: Arc<Synchronizer>,
    pub discovery: DiscoveryConfig,
}

impl Server {
    pub fn new(
        scheduler: Scheduler,
        sync: Arc<Synchronizer>,
        discovery: DiscoveryConfig
    ) -> Self {
        Self { scheduler, sync, discovery }
    }
}


#[derive(Debug)]
pub enum ServerError {
    NotFound(Error),
    BadRequest(Error),
    Conflict(Error),
    Internal(Error),
}

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        match err {
            Error::TaskNotFound(_)
            | Error::ChainNotFound(_)
            | Error::ResourceNotFound(_) => ServerError::NotFound(err),
            Error::TaskFinished(_) | Error::ResourceBusy(_) => ServerError::Conflict(err),
            err if err.is_invalid_request() => ServerError::BadRequest(err),
            err => ServerError::Internal(err),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, err) = match self {
            ServerError::NotFound(err) => (StatusCode::NOT_FOUND, err),
            ServerError::BadRequest(err) => (StatusCode::BAD_REQUEST, err),
            ServerError::Conflict(err) => (StatusCode::CONFLICT, err),
            ServerError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err),
        };
        (status, Json(json!({ "error": err.to_string() }))).into_response()
    }
}


pub fn router(server: Arc<Server>) -> axum::Router {
    let api = axum::Router::new()
        .route("/ping", get(handlers::ping))
        .route("/stream", get(handlers::stream))
        .route("/resources", get(handlers::list_resources))
        .route("/resources/refresh", post(handlers::refresh_resources))
        .route("/resources/:name", get(handlers::get_resource))
        .route("/tasks", get(handlers::list_tasks).post(handlers::create_task))
        .route("/tasks/:task_id", get(handlers::get_task))
        .route("/tasks/:task_id/stop", post(handlers::stop_task))
        .route("/chains", get(handlers::list_chains).post(handlers::create_chain))
        .route("/chains/:chain_id", get(handlers::get_chain));

    axum::Router::new()
        .nest("/api/v1", api)
        .with_state(server)
}


pub async fn serve(
    server: Arc<Server>,
    listener: tokio::net::TcpListener
) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    axum::serve(listener, router(server)).await
}
