use serde::{Deserialize, Serialize};
use thiserror::Error;
use v6_types::entities::{
    CollaborationId, DbRef, Node, NodeId, Organization, OrganizationId, Run, RunId, SessionId,
    Task, TaskAction, TaskId, UserId,
};
use v6_types::status::RunStatus;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("coordinator returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Thin reqwest-based client for the coordinator's HTTP surface, used by
/// the node agent (and the embedded container proxy).
#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct TokenNodeRequest<'a> {
    api_key: &'a str,
}

#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[allow(dead_code)]
    pub refresh_token: String,
    pub node_id: NodeId,
    pub organization_id: OrganizationId,
    pub collaboration_id: CollaborationId,
}

#[derive(Serialize)]
struct ContainerTokenRequest {
    node_id: NodeId,
    task_id: TaskId,
    image: String,
}

#[derive(Deserialize)]
pub struct ContainerTokenResponse {
    pub container_token: String,
}

/// A child task the embedded container proxy submits on an algorithm
/// container's behalf, with one pre-encrypted input per destination org.
pub struct ChildTaskRequest {
    pub name: String,
    pub image: String,
    pub action: TaskAction,
    pub collaboration_id: CollaborationId,
    pub session_id: SessionId,
    pub parent_task_id: TaskId,
    pub init_org_id: OrganizationId,
    pub init_user_id: UserId,
    pub databases: Vec<Vec<DbRef>>,
    pub inputs_by_org: Vec<(OrganizationId, String)>,
}

#[derive(Serialize)]
struct SubmitTaskRequest {
    name: String,
    image: String,
    action: TaskAction,
    collaboration_id: CollaborationId,
    session_id: SessionId,
    study_id: Option<u64>,
    parent_task_id: Option<TaskId>,
    depends_on_task_id: Option<TaskId>,
    init_org_id: OrganizationId,
    init_user_id: UserId,
    algorithm_store_id: Option<u64>,
    databases: Vec<Vec<DbRef>>,
    dataframe_handle: Option<String>,
    inputs_by_org: Vec<(OrganizationId, String)>,
}

#[derive(Deserialize)]
struct SubmittedTask {
    id: TaskId,
}

#[derive(Serialize, Default)]
struct PatchRunRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    started: bool,
    /// Only ever sent as `Some(true)` — never `Some(false)` — so a
    /// status-only patch can't reset a previously-set flag back to false.
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_storage_used: Option<bool>,
}

#[derive(Deserialize)]
pub struct BlobUploadResponse {
    pub uuid: String,
}

impl CoordinatorClient {
    pub fn new(base_url: String) -> Self {
        CoordinatorClient {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::Api { status, body })
        }
    }

    pub async fn authenticate(&self, api_key: &str) -> Result<TokenResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/token/node", self.base_url))
            .json(&TokenNodeRequest { api_key })
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_node(&self, token: &str, node_id: NodeId) -> Result<Node, ClientError> {
        let response = self
            .http
            .get(format!("{}/node/{node_id}", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_organization(
        &self,
        token: &str,
        org_id: OrganizationId,
    ) -> Result<Organization, ClientError> {
        let response = self
            .http
            .get(format!("{}/organization/{org_id}", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn set_organization_public_key(
        &self,
        token: &str,
        org_id: OrganizationId,
        public_key: &str,
    ) -> Result<(), ClientError> {
        #[derive(Serialize)]
        struct Body<'a> {
            public_key: &'a str,
        }
        let response = self
            .http
            .patch(format!("{}/organization/{org_id}", self.base_url))
            .bearer_auth(token)
            .json(&Body { public_key })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn request_container_token(
        &self,
        token: &str,
        node_id: NodeId,
        task_id: TaskId,
        image: &str,
    ) -> Result<String, ClientError> {
        let response = self
            .http
            .post(format!("{}/token/container", self.base_url))
            .bearer_auth(token)
            .json(&ContainerTokenRequest {
                node_id,
                task_id,
                image: image.to_string(),
            })
            .send()
            .await?;
        let body: ContainerTokenResponse = Self::check(response).await?.json().await?;
        Ok(body.container_token)
    }

    pub async fn get_task(&self, token: &str, task_id: TaskId) -> Result<Task, ClientError> {
        let response = self
            .http
            .get(format!("{}/task/{task_id}", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn runs_for_node(
        &self,
        token: &str,
        node_id: NodeId,
    ) -> Result<Vec<Run>, ClientError> {
        let response = self
            .http
            .get(format!("{}/run", self.base_url))
            .query(&[("node_id", node_id.to_string())])
            .bearer_auth(token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn submit_child_task(
        &self,
        token: &str,
        req: ChildTaskRequest,
    ) -> Result<TaskId, ClientError> {
        let response = self
            .http
            .post(format!("{}/task", self.base_url))
            .bearer_auth(token)
            .json(&SubmitTaskRequest {
                name: req.name,
                image: req.image,
                action: req.action,
                collaboration_id: req.collaboration_id,
                session_id: req.session_id,
                study_id: None,
                parent_task_id: Some(req.parent_task_id),
                depends_on_task_id: None,
                init_org_id: req.init_org_id,
                init_user_id: req.init_user_id,
                algorithm_store_id: None,
                databases: req.databases,
                dataframe_handle: None,
                inputs_by_org: req.inputs_by_org,
            })
            .send()
            .await?;
        let body: SubmittedTask = Self::check(response).await?.json().await?;
        Ok(body.id)
    }

    pub async fn runs_for_task(&self, token: &str, task_id: TaskId) -> Result<Vec<Run>, ClientError> {
        let response = self
            .http
            .get(format!("{}/run", self.base_url))
            .query(&[("task_id", task_id.to_string())])
            .bearer_auth(token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn patch_run_started(&self, token: &str, run_id: RunId) -> Result<(), ClientError> {
        self.patch_run(
            token,
            run_id,
            PatchRunRequest {
                started: true,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn patch_run_status(
        &self,
        token: &str,
        run_id: RunId,
        status: RunStatus,
    ) -> Result<(), ClientError> {
        self.patch_run(
            token,
            run_id,
            PatchRunRequest {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn patch_run_result(
        &self,
        token: &str,
        run_id: RunId,
        status: RunStatus,
        log: String,
        result: String,
        blob_storage_used: bool,
    ) -> Result<(), ClientError> {
        self.patch_run(
            token,
            run_id,
            PatchRunRequest {
                status: Some(status),
                log: Some(log),
                result: Some(result),
                started: false,
                blob_storage_used: blob_storage_used.then_some(true),
            },
        )
        .await
    }

    /// Uploads an already-encrypted result to the coordinator's external
    /// blob store, returning the uuid to PATCH into `Run.result`.
    pub async fn upload_blob(&self, token: &str, bytes: Vec<u8>) -> Result<String, ClientError> {
        let response = self
            .http
            .post(format!("{}/blobstream", self.base_url))
            .bearer_auth(token)
            .body(bytes)
            .send()
            .await?;
        let body: BlobUploadResponse = Self::check(response).await?.json().await?;
        Ok(body.uuid)
    }

    pub async fn download_blob(&self, token: &str, uuid: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http
            .get(format!("{}/blobstream/{uuid}", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(Self::check(response).await?.bytes().await?.to_vec())
    }

    async fn patch_run(
        &self,
        token: &str,
        run_id: RunId,
        body: PatchRunRequest,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .patch(format!("{}/run/{run_id}", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
