use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use v6_types::entities::*;
use v6_types::status::RunStatus;

use crate::coordinator::{Coordinator, TaskSubmission};
use crate::dispatch::Room;
use crate::error::ApiError;

pub fn build_routes(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/token/node", post(token_node))
        .route("/token/container", post(token_container))
        .route("/node/:id", get(get_node))
        .route("/organization/:id", get(get_organization).patch(patch_organization))
        .route("/run", get(list_runs))
        .route("/run/:id", patch(patch_run))
        .route("/task", post(submit_task))
        .route("/task/:id", get(get_task))
        .route("/kill/task", post(kill_task))
        .route("/kill/node", post(kill_node))
        .route("/tasks", get(tasks_socket))
        .route("/blobstream", post(upload_blob))
        .route("/blobstream/status", get(blob_status))
        .route("/blobstream/:id", get(download_blob))
        .with_state(coordinator)
}

#[derive(Deserialize)]
struct TokenNodeRequest {
    api_key: String,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    node_id: NodeId,
    organization_id: OrganizationId,
    collaboration_id: CollaborationId,
}

async fn token_node(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<TokenNodeRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let node = coordinator.store.get_node_by_api_key(&body.api_key).await?;
    let access_token =
        coordinator
            .auth
            .issue_node_token(node.id, node.organization_id, node.collaboration_id)?;
    let refresh_token = access_token.clone();
    coordinator.store.set_node_status(node.id, NodeStatus::Online).await?;
    coordinator.dispatcher.emit_node_status(node.id, true).await;
    Ok(Json(TokenResponse {
        access_token,
        refresh_token,
        node_id: node.id,
        organization_id: node.organization_id,
        collaboration_id: node.collaboration_id,
    }))
}

#[derive(Deserialize)]
struct TokenContainerRequest {
    node_id: NodeId,
    task_id: TaskId,
    image: String,
}

#[derive(Serialize)]
struct ContainerTokenResponse {
    container_token: String,
}

async fn token_container(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<TokenContainerRequest>,
) -> Result<Json<ContainerTokenResponse>, ApiError> {
    let container_token = coordinator
        .request_container_token(body.node_id, body.task_id, &body.image)
        .await?;
    Ok(Json(ContainerTokenResponse { container_token }))
}

async fn get_node(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<NodeId>,
) -> Result<Json<Node>, ApiError> {
    Ok(Json(coordinator.store.get_node(id).await?))
}

async fn get_organization(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<OrganizationId>,
) -> Result<Json<Organization>, ApiError> {
    Ok(Json(coordinator.store.get_organization(id).await?))
}

#[derive(Deserialize)]
struct PatchOrganizationRequest {
    public_key: String,
}

async fn patch_organization(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<OrganizationId>,
    Json(body): Json<PatchOrganizationRequest>,
) -> Result<Json<Organization>, ApiError> {
    coordinator
        .store
        .set_organization_public_key(id, body.public_key)
        .await?;
    Ok(Json(coordinator.store.get_organization(id).await?))
}

#[derive(Deserialize)]
struct ListRunsQuery {
    task_id: Option<TaskId>,
    node_id: Option<NodeId>,
}

async fn list_runs(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let runs = if let Some(task_id) = query.task_id {
        coordinator.store.runs_for_task(task_id).await
    } else if let Some(node_id) = query.node_id {
        coordinator.store.runs_for_node(node_id, &[]).await
    } else {
        coordinator.store.all_runs().await
    };
    Ok(Json(runs))
}

#[derive(Deserialize)]
struct PatchRunRequest {
    status: Option<RunStatus>,
    log: Option<String>,
    result: Option<String>,
    #[serde(default)]
    started: bool,
    blob_storage_used: Option<bool>,
}

async fn patch_run(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<RunId>,
    Json(body): Json<PatchRunRequest>,
) -> Result<Json<Run>, ApiError> {
    let run = coordinator
        .patch_run(id, body.status, body.log, body.result, body.started, body.blob_storage_used)
        .await?;
    Ok(Json(run))
}

#[derive(Deserialize)]
struct SubmitTaskRequest {
    name: String,
    image: String,
    action: TaskAction,
    collaboration_id: CollaborationId,
    session_id: SessionId,
    study_id: Option<StudyId>,
    parent_task_id: Option<TaskId>,
    depends_on_task_id: Option<TaskId>,
    init_org_id: OrganizationId,
    init_user_id: UserId,
    algorithm_store_id: Option<u64>,
    #[serde(default)]
    databases: Vec<Vec<DbRef>>,
    dataframe_handle: Option<String>,
    inputs_by_org: Vec<(OrganizationId, String)>,
}

async fn submit_task(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<SubmitTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = coordinator
        .submit_task(TaskSubmission {
            name: body.name,
            image: body.image,
            action: body.action,
            collaboration_id: body.collaboration_id,
            session_id: body.session_id,
            study_id: body.study_id,
            parent_task_id: body.parent_task_id,
            depends_on_task_id: body.depends_on_task_id,
            init_org_id: body.init_org_id,
            init_user_id: body.init_user_id,
            algorithm_store_id: body.algorithm_store_id,
            databases: body.databases,
            dataframe_handle: body.dataframe_handle,
            inputs_by_org: body.inputs_by_org,
        })
        .await?;
    Ok(Json(task))
}

async fn get_task(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(coordinator.store.get_task(id).await?))
}

#[derive(Deserialize)]
struct KillTaskRequest {
    id: TaskId,
}

async fn kill_task(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<KillTaskRequest>,
) -> Result<(), ApiError> {
    coordinator.kill_task(body.id).await?;
    Ok(())
}

#[derive(Deserialize)]
struct KillNodeRequest {
    id: NodeId,
}

async fn kill_node(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<KillNodeRequest>,
) -> Result<(), ApiError> {
    coordinator.kill_node(body.id).await?;
    Ok(())
}

#[derive(Deserialize)]
struct TasksSocketQuery {
    collaboration_id: CollaborationId,
}

async fn tasks_socket(
    ws: WebSocketUpgrade,
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<TasksSocketQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tasks_socket(socket, coordinator, query.collaboration_id))
}

async fn handle_tasks_socket(mut socket: WebSocket, coordinator: Arc<Coordinator>, collaboration_id: CollaborationId) {
    let mut rx = coordinator
        .dispatcher
        .join(Room::Collaboration(collaboration_id), 64)
        .await;
    while let Some(event) = rx.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                log::error!("failed to serialize dispatch event: {e}");
                continue;
            }
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }
}

#[derive(Serialize)]
struct BlobUploadResponse {
    uuid: Uuid,
}

/// Accepts an already-encrypted result body and hands back a uuid the
/// caller PATCHes into `Run.result` alongside `blob_storage_used: true`.
/// Axum buffers the request body for us; the 64 KiB chunk ceiling named in
/// the wire contract is a client-side streaming detail, not something this
/// handler enforces.
async fn upload_blob(
    State(coordinator): State<Arc<Coordinator>>,
    body: Bytes,
) -> Json<BlobUploadResponse> {
    let uuid = coordinator.blob_store.put(body.to_vec()).await;
    Json(BlobUploadResponse { uuid })
}

async fn download_blob(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<Uuid>,
) -> Result<Vec<u8>, ApiError> {
    coordinator
        .blob_store
        .get(id)
        .await
        .map_err(|e| ApiError(v6_types::V6Error::NotFound(e.to_string())))
}

#[derive(Serialize)]
struct BlobStatusResponse {
    blob_store_enabled: bool,
}

async fn blob_status(State(coordinator): State<Arc<Coordinator>>) -> Json<BlobStatusResponse> {
    Json(BlobStatusResponse {
        blob_store_enabled: coordinator.blob_store_enabled,
    })
}
