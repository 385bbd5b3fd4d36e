//! Thin SDK for submitting tasks to a coordinator and collecting their
//! results — the C1+C5 wire contract exercised from the task-initiator's
//! side rather than the node's.
//!
//! Grounded on `v6-node`'s `CoordinatorClient`: the same reqwest-based
//! wire calls, but this side holds the initiating user/organization's own
//! key material, encrypts one input copy per destination organization,
//! and decrypts the runs addressed back to it. It does not implement
//! login, session management, or any of the other surfaces a full user
//! API client would need — those are out of scope here.

mod error;

pub use error::ClientError;

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use v6_crypto::Cryptor;
use v6_types::entities::{
    CollaborationId, DbRef, Organization, OrganizationId, Run, SessionId, Task, TaskAction, TaskId,
    UserId,
};
use v6_types::status::TaskStatus;

/// What to run and where to send it; mirrors the coordinator's task
/// submission body minus the one part the client computes itself
/// (the per-organization encrypted input envelope).
pub struct TaskSpec {
    pub name: String,
    pub image: String,
    pub action: TaskAction,
    pub collaboration_id: CollaborationId,
    pub session_id: SessionId,
    pub study_id: Option<u64>,
    pub init_org_id: OrganizationId,
    pub init_user_id: UserId,
    pub algorithm_store_id: Option<u64>,
    pub databases: Vec<Vec<DbRef>>,
    pub dataframe_handle: Option<String>,
    pub organization_ids: Vec<OrganizationId>,
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

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    cryptor: Cryptor,
}

impl Client {
    /// `private_key_file` is the caller's own RSA key (generated on first
    /// use if missing), the same way a node agent manages its own key.
    pub fn new(base_url: impl Into<String>, private_key_file: &Path) -> Result<Self, ClientError> {
        Ok(Client {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            cryptor: Cryptor::load_or_generate(private_key_file)?,
        })
    }

    /// This client's own public key, for an administrator to register
    /// against the caller's organization record.
    pub fn public_key(&self) -> Result<String, ClientError> {
        Ok(self.cryptor.public_key_str()?)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::Api { status, body })
        }
    }

    pub async fn get_organization(&self, id: OrganizationId) -> Result<Organization, ClientError> {
        let response = self
            .http
            .get(format!("{}/organization/{id}", self.base_url))
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, ClientError> {
        let response = self.http.get(format!("{}/task/{id}", self.base_url)).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn runs_for_task(&self, task_id: TaskId) -> Result<Vec<Run>, ClientError> {
        let response = self
            .http
            .get(format!("{}/run?task_id={task_id}", self.base_url))
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    /// Encrypts `plaintext_input` once per destination organization
    /// (fetching each org's public key on demand) and submits the task.
    pub async fn submit_task(&self, spec: TaskSpec, plaintext_input: &[u8]) -> Result<Task, ClientError> {
        let mut inputs_by_org = Vec::with_capacity(spec.organization_ids.len());
        for org_id in &spec.organization_ids {
            let organization = self.get_organization(*org_id).await?;
            let envelope = Cryptor::encrypt(plaintext_input, &organization.public_key)?;
            inputs_by_org.push((*org_id, envelope));
        }

        let body = SubmitTaskRequest {
            name: spec.name,
            image: spec.image,
            action: spec.action,
            collaboration_id: spec.collaboration_id,
            session_id: spec.session_id,
            study_id: spec.study_id,
            parent_task_id: None,
            depends_on_task_id: None,
            init_org_id: spec.init_org_id,
            init_user_id: spec.init_user_id,
            algorithm_store_id: spec.algorithm_store_id,
            databases: spec.databases,
            dataframe_handle: spec.dataframe_handle,
            inputs_by_org,
        };
        let response = self.http.post(format!("{}/task", self.base_url)).json(&body).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    /// Rolls up a task's current status from its runs.
    pub async fn task_status(&self, task_id: TaskId) -> Result<TaskStatus, ClientError> {
        let runs = self.runs_for_task(task_id).await?;
        Ok(TaskStatus::from_run_statuses(runs.into_iter().map(|r| r.status)))
    }

    /// Polls every `poll_interval` until the task reaches a finished
    /// status (`Completed` or `Failed`), then returns the finished runs.
    pub async fn wait_for_task(&self, task_id: TaskId, poll_interval: Duration) -> Result<Vec<Run>, ClientError> {
        loop {
            let runs = self.runs_for_task(task_id).await?;
            let status = TaskStatus::from_run_statuses(runs.iter().map(|r| r.status));
            if matches!(status, TaskStatus::Completed | TaskStatus::Failed) {
                return Ok(runs);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn download_blob(&self, uuid: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http
            .get(format!("{}/blobstream/{uuid}", self.base_url))
            .send()
            .await?;
        Ok(self.check(response).await?.bytes().await?.to_vec())
    }

    /// Decrypts a run's result with this client's own private key. Only
    /// meaningful for runs whose result was encrypted to this client's
    /// organization, i.e. runs belonging to a task this client itself
    /// initiated. When the run's result was routed through external blob
    /// storage, fetches the ciphertext from `/blobstream` first.
    pub async fn decrypt_result(&self, run: &Run) -> Result<Vec<u8>, ClientError> {
        let envelope = if run.blob_storage_used {
            let bytes = self.download_blob(&run.result).await?;
            String::from_utf8_lossy(&bytes).to_string()
        } else {
            run.result.clone()
        };
        Ok(self.cryptor.decrypt(&envelope)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new("http://127.0.0.1:0", &dir.path().join("key.pem")).unwrap();
        assert_eq!(client.public_key().unwrap(), client.public_key().unwrap());
    }

    #[tokio::test]
    async fn decrypts_a_result_encrypted_to_its_own_key() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new("http://127.0.0.1:0", &dir.path().join("key.pem")).unwrap();
        let pubkey = client.public_key().unwrap();
        let envelope = Cryptor::encrypt(b"result bytes", &pubkey).unwrap();

        let run = Run::new(1, 1, 1, String::new(), TaskAction::FederatedCompute);
        let mut run = run;
        run.result = envelope;

        assert_eq!(client.decrypt_result(&run).await.unwrap(), b"result bytes");
    }
}
