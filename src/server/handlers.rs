use axum::{extract::{Path, State}, response::IntoResponse, Json};
use axum_streams::StreamBodyAs;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::resources::ResourceView;
use crate::server::{Server, ServerError};
use crate::sync::{StreamMessage, Subscription};
use crate::tasks::{ChainReceipt, ChainView, SubmitTask, TaskReceipt, TaskView};


pub async fn ping() -> &'static str {
    "pong"
}


/// The current snapshot, then every patch as it is broadcast.
pub async fn stream(State(server): State<Arc<Server>>) -> impl IntoResponse {
    let Subscription { snapshot, patches } = server.sync.subscribe().await;
    let snapshot = stream::once(async move { StreamMessage::Snapshot(snapshot) });
    let patches = stream::unfold(patches, |mut patches| async move {
        patches.recv().await.map(|patch| (StreamMessage::Patch(patch), patches))
    });
    StreamBodyAs::json_nl(snapshot.chain(patches))
}


pub async fn list_resources(
    State(server): State<Arc<Server>>
) -> Result<Json<Vec<ResourceView>>, ServerError> {
    Ok(Json(server.scheduler.resources().await?))
}


pub async fn get_resource(
    State(server): State<Arc<Server>>,
    Path(name): Path<String>
) -> Result<Json<ResourceView>, ServerError> {
    Ok(Json(server.scheduler.resource(&name).await?))
}


pub async fn refresh_resources(
    State(server): State<Arc<Server>>
) -> Result<Json<Vec<ResourceView>>, ServerError> {
    let names = crate::discovery::refresh(&server.discovery, &server.scheduler).await?;
    info!(count = names.len(), "resources refreshed");
    Ok(Json(server.scheduler.resources().await?))
}


pub async fn list_tasks(
    State(server): State<Arc<Server>>
) -> Result<Json<Vec<TaskView>>, ServerError> {
    Ok(Json(server.scheduler.tasks().await?))
}


pub async fn create_task(
    State(server): State<Arc<Server>>,
    body: Json<SubmitTask>
) -> Result<Json<TaskReceipt>, ServerError> {
    let id = server.scheduler.submit(body.0).await?;
    Ok(Json(TaskReceipt { id }))
}


pub async fn get_task(
    State(server): State<Arc<Server>>,
    Path(task_id): Path<Uuid>
) -> Result<Json<TaskView>, ServerError> {
    Ok(Json(server.scheduler.task(task_id).await?))
}


pub async fn stop_task(
    State(server): State<Arc<Server>>,
    Path(task_id): Path<Uuid>
) -> Result<Json<TaskView>, ServerError> {
    server.scheduler.stop(task_id).await?;
    Ok(Json(server.scheduler.task(task_id).await?))
}


pub async fn list_chains(
    State(server): State<Arc<Server>>
) -> Result<Json<Vec<ChainView>>, ServerError> {
    Ok(Json(server.scheduler.chains().await?))
}


pub async fn create_chain(
    State(server): State<Arc<Server>>,
    body: Json<Vec<SubmitTask>>
) -> Result<Json<ChainReceipt>, ServerError> {
    Ok(Json(server.scheduler.submit_chain(body.0).await?))
}


pub async fn get_chain(
    State(server): State<Arc<Server>>,
    Path(chain_id): Path<Uuid>
) -> Result<Json<ChainView>, ServerError> {
    let tasks = server.scheduler.chain(chain_id).await?;
    Ok(Json(ChainView { chain: chain_id, tasks }))
}
