//! Local HTTP proxy the algorithm container talks to instead of the
//! coordinator directly (`HOST`/`PORT` env vars point here). It holds the
//! node's credentials and the session's key material so the container
//! itself never sees an organization's private key or the node's own
//! coordinator token.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use v6_crypto::Cryptor;
use v6_types::entities::{OrganizationId, TaskId};

use crate::client::CoordinatorClient;

#[derive(Clone)]
pub struct ProxyState {
    pub coordinator: CoordinatorClient,
    pub node_token: String,
    pub container_token: String,
    pub cryptor: Arc<Cryptor>,
    pub init_org_id: OrganizationId,
    pub init_user_id: v6_types::entities::UserId,
}

pub fn build_proxy_routes(state: ProxyState) -> Router {
    Router::new()
        .route("/task", post(create_child_task))
        .route("/task/:id/result", get(get_task_result))
        .with_state(state)
}

fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").trim() == expected)
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct CreateChildTaskRequest {
    name: String,
    image: String,
    action: v6_types::entities::TaskAction,
    collaboration_id: v6_types::entities::CollaborationId,
    session_id: v6_types::entities::SessionId,
    parent_task_id: TaskId,
    organization_ids: Vec<OrganizationId>,
    #[serde(default)]
    databases: Vec<Vec<v6_types::entities::DbRef>>,
    /// Plaintext input; the proxy encrypts one copy per destination org.
    input: String,
}

#[derive(Serialize)]
struct CreateChildTaskResponse {
    task_id: TaskId,
}

/// The container asks the proxy to fan a child task out to its peers; the
/// proxy re-encrypts the plaintext input once per destination organization
/// so the container never needs to know any peer's public key.
async fn create_child_task(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Json(body): Json<CreateChildTaskRequest>,
) -> Result<Json<CreateChildTaskResponse>, (StatusCode, String)> {
    if !authorized(&headers, &state.container_token) {
        return Err((StatusCode::UNAUTHORIZED, "invalid container token".to_string()));
    }

    let mut inputs_by_org = Vec::with_capacity(body.organization_ids.len());
    for org_id in &body.organization_ids {
        let organization = state
            .coordinator
            .get_organization(&state.node_token, *org_id)
            .await
            .map_err(|e| (StatusCode::BAD_GATEWAY, format!("unknown organization {org_id}: {e}")))?;
        let envelope = Cryptor::encrypt(body.input.as_bytes(), &organization.public_key)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("encrypt failed: {e}")))?;
        inputs_by_org.push((*org_id, envelope));
    }

    let task_id = state
        .coordinator
        .submit_child_task(
            &state.node_token,
            crate::client::ChildTaskRequest {
                name: body.name,
                image: body.image,
                action: body.action,
                collaboration_id: body.collaboration_id,
                session_id: body.session_id,
                parent_task_id: body.parent_task_id,
                init_org_id: state.init_org_id,
                init_user_id: state.init_user_id,
                databases: body.databases,
                inputs_by_org,
            },
        )
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    Ok(Json(CreateChildTaskResponse { task_id }))
}

/// The container polls the proxy for a child task's aggregated result; the
/// proxy decrypts it with this node's private key before handing it back.
async fn get_task_result(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Path(task_id): Path<TaskId>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !authorized(&headers, &state.container_token) {
        return Err((StatusCode::UNAUTHORIZED, "invalid container token".to_string()));
    }

    let runs = state
        .coordinator
        .runs_for_task(&state.node_token, task_id)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    let mut plaintext_results = Vec::new();
    for run in runs {
        if run.result.is_empty() {
            continue;
        }
        let envelope = if run.blob_storage_used {
            match state.coordinator.download_blob(&state.node_token, &run.result).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                Err(e) => {
                    log::warn!("could not download blob for run {}: {e}", run.id);
                    continue;
                }
            }
        } else {
            run.result.clone()
        };
        match state.cryptor.decrypt(&envelope) {
            Ok(bytes) => plaintext_results.push(String::from_utf8_lossy(&bytes).to_string()),
            Err(e) => log::warn!("could not decrypt result for run {}: {e}", run.id),
        }
    }

    Ok(Json(plaintext_results))
}
