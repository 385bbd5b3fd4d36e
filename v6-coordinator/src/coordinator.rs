use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use v6_types::entities::*;
use v6_types::status::{RunStatus, TaskStatus};
use v6_types::V6Error;

use crate::auth::{AuthService, ClientType};
use crate::blob::{BlobAdapter, InMemoryBlobStore};
use crate::dispatch::{DispatchEvent, Dispatcher};
use crate::sessions::DataframeLocks;
use crate::store::CoordinatorStore;

pub struct CleanupPolicy {
    pub runs_data_cleanup_days: i64,
    /// When true, cleanup also clears `input` once a run's result is
    /// cleared; off by default since some deployments want the input kept
    /// for audit even after the result has aged out.
    pub delete_input_on_cleanup: bool,
}

pub struct Coordinator {
    pub store: CoordinatorStore,
    pub dispatcher: Dispatcher,
    pub auth: AuthService,
    pub dataframe_locks: DataframeLocks,
    pub cleanup_policy: CleanupPolicy,
    pub blob_store: Arc<dyn BlobAdapter>,
    /// Whether `execute_run`/the proxy should actually route results
    /// through `blob_store` rather than inline; the adapter itself is
    /// always constructed so `GET /blobstream/status` has something to
    /// report against.
    pub blob_store_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub name: String,
    pub image: String,
    pub action: TaskAction,
    pub collaboration_id: CollaborationId,
    pub session_id: SessionId,
    pub study_id: Option<StudyId>,
    pub parent_task_id: Option<TaskId>,
    pub depends_on_task_id: Option<TaskId>,
    pub init_org_id: OrganizationId,
    pub init_user_id: UserId,
    pub algorithm_store_id: Option<u64>,
    pub databases: Vec<Vec<DbRef>>,
    pub dataframe_handle: Option<String>,
    /// Per-organization encrypted input, one entry per target organization.
    pub inputs_by_org: Vec<(OrganizationId, String)>,
}

impl Coordinator {
    pub fn new(jwt_secret: &[u8], cleanup_policy: CleanupPolicy, blob_store_enabled: bool) -> Arc<Self> {
        Arc::new(Coordinator {
            store: CoordinatorStore::new(),
            dispatcher: Dispatcher::new(),
            auth: AuthService::new(jwt_secret),
            dataframe_locks: DataframeLocks::new(),
            cleanup_policy,
            blob_store: Arc::new(InMemoryBlobStore::new()),
            blob_store_enabled,
        })
    }

    /// Submit a task: validates target organizations and same-image session
    /// policy, materializes one `Run` per target organization, and notifies
    /// the collaboration's nodes.
    pub async fn submit_task(&self, submission: TaskSubmission) -> Result<Task, V6Error> {
        let collaboration = self.store.get_collaboration(submission.collaboration_id).await?;

        let allowed_orgs: Vec<OrganizationId> = if let Some(study_id) = submission.study_id {
            self.store.get_study(study_id).await?.organization_ids
        } else {
            collaboration.organization_ids.clone()
        };
        for (org_id, _) in &submission.inputs_by_org {
            if !allowed_orgs.contains(org_id) {
                return Err(V6Error::InvalidRequest(format!(
                    "organization {org_id} is not part of collaboration {}",
                    collaboration.id
                )));
            }
        }

        if collaboration.session_restrict_to_same_image {
            let existing_images: Vec<String> = {
                let tasks_in_session = self.tasks_in_session(submission.session_id).await;
                tasks_in_session.into_iter().map(|t| t.image).collect()
            };
            if existing_images.iter().any(|img| *img != submission.image) {
                return Err(V6Error::Unauthorized(
                    "session is restricted to a single algorithm image".to_string(),
                ));
            }
        }

        let job_id = match submission.parent_task_id {
            Some(parent_id) => self.store.get_task(parent_id).await?.job_id,
            None => self.store.next_job_id().await,
        };

        // Held for the rest of this function when a handle is named, so two
        // concurrent submissions against the same (session, handle) can't
        // both pass the alive-modifier check below and both proceed.
        let _dataframe_guard;
        let dataframe_id = if let Some(handle) = &submission.dataframe_handle {
            _dataframe_guard = Some(self.dataframe_locks.acquire(submission.session_id, handle).await);

            let existing = self
                .store
                .find_dataframe_by_handle(submission.session_id, handle)
                .await;

            if submission.action.is_session_modifying() {
                if let Some(prior_task_id) = existing.as_ref().and_then(|df| df.last_session_task_id) {
                    let prior_status = self.store.task_status(prior_task_id).await;
                    if !matches!(prior_status, TaskStatus::Completed | TaskStatus::Failed) {
                        return Err(V6Error::Conflict(format!(
                            "dataframe '{handle}' already has an alive modifier task {prior_task_id}; refusing to dispatch a second modifier until it finishes"
                        )));
                    }
                }
            }

            let df = match existing {
                Some(df) => df,
                None => {
                    self.store
                        .put_dataframe(Dataframe {
                            id: 0,
                            handle: handle.clone(),
                            session_id: submission.session_id,
                            last_session_task_id: None,
                            columns: Vec::new(),
                        })
                        .await
                }
            };
            Some(df.id)
        } else {
            _dataframe_guard = None;
            None
        };

        let task = self
            .store
            .put_task(Task {
                id: 0,
                name: submission.name,
                image: submission.image,
                action: submission.action,
                collaboration_id: submission.collaboration_id,
                session_id: submission.session_id,
                study_id: submission.study_id,
                job_id,
                parent_task_id: submission.parent_task_id,
                depends_on_task_id: submission.depends_on_task_id,
                init_org_id: submission.init_org_id,
                init_user_id: submission.init_user_id,
                created_at: Utc::now(),
                algorithm_store_id: submission.algorithm_store_id,
                databases: submission.databases,
                dataframe_id,
            })
            .await;

        if let Some(df_id) = dataframe_id {
            self.store.set_dataframe_last_task(df_id, task.id).await?;
        }

        for (org_id, input) in submission.inputs_by_org {
            self.store
                .put_run(Run::new(0, task.id, org_id, input, task.action))
                .await;
        }

        self.dispatcher
            .emit_new_task(task.collaboration_id, task.id)
            .await;

        Ok(task)
    }

    async fn tasks_in_session(&self, session_id: SessionId) -> Vec<Task> {
        // O(n) scan; acceptable at this scale (see DESIGN.md).
        let mut result = Vec::new();
        for run in self.store.all_runs().await {
            if let Ok(task) = self.store.get_task(run.task_id).await {
                if task.session_id == session_id && !result.iter().any(|t: &Task| t.id == task.id) {
                    result.push(task);
                }
            }
        }
        result
    }

    /// A container (authenticated as `requesting_node_id`) requests a
    /// scoped token so it may issue child tasks or fetch prior results.
    pub async fn request_container_token(
        &self,
        requesting_node_id: NodeId,
        task_id: TaskId,
        claimed_image: &str,
    ) -> Result<String, V6Error> {
        let node = self.store.get_node(requesting_node_id).await?;
        let task = self.store.get_task(task_id).await?;

        if node.collaboration_id != task.collaboration_id {
            return Err(V6Error::Unauthorized(
                "node is not part of this task's collaboration".to_string(),
            ));
        }
        if task.action != TaskAction::CentralCompute {
            return Err(V6Error::Unauthorized(
                "Task is not a central compute task".to_string(),
            ));
        }
        let collaboration = self.store.get_collaboration(task.collaboration_id).await?;
        if collaboration.session_restrict_to_same_image && claimed_image != task.image {
            return Err(V6Error::Unauthorized(
                "claimed image does not match the task's image".to_string(),
            ));
        }
        let status = self.store.task_status(task_id).await;
        if matches!(
            status,
            v6_types::status::TaskStatus::Completed | v6_types::status::TaskStatus::Failed
        ) {
            return Err(V6Error::InvalidRequest("task is finished".to_string()));
        }

        let db_labels: Vec<String> = task
            .databases
            .iter()
            .flatten()
            .filter_map(|r| r.label.clone())
            .collect();

        self.auth.issue_container_token(
            requesting_node_id,
            node.organization_id,
            task.collaboration_id,
            task.study_id,
            Some(task.session_id),
            task_id,
            claimed_image.to_string(),
            db_labels,
        )
    }

    /// Apply a node-reported patch to one of its runs. `blob_storage_used`
    /// is only ever sent as `Some(true)` by a node — never `Some(false)` —
    /// so an unrelated status-only patch can't silently clear a
    /// previously-set flag.
    pub async fn patch_run(
        &self,
        run_id: RunId,
        new_status: Option<RunStatus>,
        log: Option<String>,
        result: Option<String>,
        started_at: bool,
        blob_storage_used: Option<bool>,
    ) -> Result<Run, V6Error> {
        let run = self
            .store
            .update_run(run_id, |run| {
                if started_at {
                    run.started_at = Some(Utc::now());
                }
                if let Some(l) = log {
                    run.log = l;
                }
                if let Some(r) = result {
                    run.result = r;
                }
                if let Some(b) = blob_storage_used {
                    run.blob_storage_used = b;
                }
                if let Some(status) = new_status {
                    run.set_status(status)?;
                }
                Ok(())
            })
            .await?;

        if let Some(status) = new_status {
            let task = self.store.get_task(run.task_id).await?;
            self.dispatcher
                .emit_status_change(
                    task.collaboration_id,
                    DispatchEvent::AlgorithmStatusChange {
                        run_id: run.id,
                        task_id: run.task_id,
                        collaboration_id: task.collaboration_id,
                        node_id: None,
                        organization_id: run.organization_id,
                        status,
                        parent_id: task.parent_task_id,
                    },
                )
                .await;
        }

        Ok(run)
    }

    pub async fn kill_task(&self, task_id: TaskId) -> Result<(), V6Error> {
        let task = self.store.get_task(task_id).await?;
        self.dispatcher
            .emit_kill(task.collaboration_id, Some(task_id), None)
            .await;
        Ok(())
    }

    pub async fn kill_node(&self, node_id: NodeId) -> Result<(), V6Error> {
        let node = self.store.get_node(node_id).await?;
        self.dispatcher
            .emit_kill(node.collaboration_id, None, Some(node_id))
            .await;
        Ok(())
    }

    /// One sweep of result-lifecycle cleanup: runs finished longer ago
    /// than `runs_data_cleanup_days` have their `result` (and, depending
    /// on policy, `input`) cleared; `log` is always retained. A run whose
    /// result was stored externally has its remote blob deleted first.
    pub async fn run_cleanup_pass(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(self.cleanup_policy.runs_data_cleanup_days);
        let mut cleaned = 0;
        for run in self.store.all_runs().await {
            if run.status == RunStatus::Completed {
                if let Some(finished_at) = run.finished_at {
                    if finished_at < cutoff && run.cleanup_at.is_none() {
                        if run.blob_storage_used {
                            if let Ok(id) = uuid::Uuid::parse_str(&run.result) {
                                if let Err(e) = self.blob_store.delete(id).await {
                                    log::warn!("failed to delete blob for run {}: {e}", run.id);
                                }
                            }
                        }
                        let delete_input = self.cleanup_policy.delete_input_on_cleanup;
                        let _ = self
                            .store
                            .update_run(run.id, |r| {
                                r.result.clear();
                                if delete_input {
                                    r.input.clear();
                                }
                                r.cleanup_at = Some(Utc::now());
                                Ok(())
                            })
                            .await;
                        cleaned += 1;
                    }
                }
            }
        }
        cleaned
    }

    pub fn client_type_requires_container(claims_type: ClientType) -> bool {
        matches!(claims_type, ClientType::Container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Arc<Coordinator> {
        Coordinator::new(
            b"test-secret",
            CleanupPolicy {
                runs_data_cleanup_days: 30,
                delete_input_on_cleanup: false,
            },
            true,
        )
    }

    async fn seed_collaboration(coordinator: &Coordinator) -> (OrganizationId, CollaborationId) {
        let org = coordinator
            .store
            .put_organization(Organization {
                id: 0,
                name: "org-a".to_string(),
                public_key: String::new(),
            })
            .await;
        let collab = coordinator
            .store
            .put_collaboration(Collaboration {
                id: 0,
                name: "collab".to_string(),
                encrypted: false,
                session_restrict_to_same_image: false,
                organization_ids: vec![org.id],
            })
            .await;
        (org.id, collab.id)
    }

    #[tokio::test]
    async fn submit_task_materializes_one_run_per_org() {
        let coordinator = coordinator();
        let (org_id, collab_id) = seed_collaboration(&coordinator).await;
        let session = coordinator
            .store
            .put_session(Session {
                id: 0,
                name: "s1".to_string(),
                collaboration_id: collab_id,
                study_id: None,
                owner_user_id: 1,
                scope: SessionScope::Collaboration,
                created_at: Utc::now(),
                last_used_at: Utc::now(),
            })
            .await;

        let task = coordinator
            .submit_task(TaskSubmission {
                name: "t1".to_string(),
                image: "harbor/algo:1".to_string(),
                action: TaskAction::FederatedCompute,
                collaboration_id: collab_id,
                session_id: session.id,
                study_id: None,
                parent_task_id: None,
                depends_on_task_id: None,
                init_org_id: org_id,
                init_user_id: 1,
                algorithm_store_id: None,
                databases: vec![],
                dataframe_handle: None,
                inputs_by_org: vec![(org_id, "ciphertext".to_string())],
            })
            .await
            .unwrap();

        let runs = coordinator.store.runs_for_task(task.id).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].organization_id, org_id);
    }

    #[tokio::test]
    async fn container_token_rejects_non_central_compute() {
        let coordinator = coordinator();
        let (org_id, collab_id) = seed_collaboration(&coordinator).await;
        let node = coordinator
            .store
            .put_node(Node {
                id: 0,
                organization_id: org_id,
                collaboration_id: collab_id,
                api_key: "key".to_string(),
                status: NodeStatus::Online,
                config: Default::default(),
            })
            .await;
        let session = coordinator
            .store
            .put_session(Session {
                id: 0,
                name: "s1".to_string(),
                collaboration_id: collab_id,
                study_id: None,
                owner_user_id: 1,
                scope: SessionScope::Collaboration,
                created_at: Utc::now(),
                last_used_at: Utc::now(),
            })
            .await;
        let task = coordinator
            .store
            .put_task(Task {
                id: 0,
                name: "t".to_string(),
                image: "img".to_string(),
                action: TaskAction::FederatedCompute,
                collaboration_id: collab_id,
                session_id: session.id,
                study_id: None,
                job_id: 1,
                parent_task_id: None,
                depends_on_task_id: None,
                init_org_id: org_id,
                init_user_id: 1,
                created_at: Utc::now(),
                algorithm_store_id: None,
                databases: vec![],
                dataframe_id: None,
            })
            .await;

        let result = coordinator
            .request_container_token(node.id, task.id, "img")
            .await;
        assert!(matches!(result, Err(V6Error::Unauthorized(_))));
    }

    #[tokio::test]
    async fn cleanup_pass_clears_old_completed_results_only() {
        let coordinator = coordinator();
        let (org_id, _collab_id) = seed_collaboration(&coordinator).await;

        let mut old_completed = Run::new(0, 1, org_id, String::new(), TaskAction::FederatedCompute);
        old_completed.status = RunStatus::Completed;
        old_completed.result = "secret".to_string();
        old_completed.finished_at = Some(Utc::now() - ChronoDuration::days(31));
        let old_completed = coordinator.store.put_run(old_completed).await;

        let mut recent_completed =
            Run::new(0, 1, org_id, String::new(), TaskAction::FederatedCompute);
        recent_completed.status = RunStatus::Completed;
        recent_completed.result = "secret".to_string();
        recent_completed.finished_at = Some(Utc::now() - ChronoDuration::days(10));
        let recent_completed = coordinator.store.put_run(recent_completed).await;

        let mut old_failed = Run::new(0, 1, org_id, String::new(), TaskAction::FederatedCompute);
        old_failed.status = RunStatus::Failed;
        old_failed.result = "secret".to_string();
        old_failed.finished_at = Some(Utc::now() - ChronoDuration::days(31));
        let old_failed = coordinator.store.put_run(old_failed).await;

        let cleaned = coordinator.run_cleanup_pass().await;
        assert_eq!(cleaned, 1);

        assert!(coordinator.store.get_run(old_completed.id).await.unwrap().result.is_empty());
        assert!(!coordinator.store.get_run(recent_completed.id).await.unwrap().result.is_empty());
        assert!(!coordinator.store.get_run(old_failed.id).await.unwrap().result.is_empty());
    }

    async fn seed_session(coordinator: &Coordinator, collab_id: CollaborationId) -> SessionId {
        coordinator
            .store
            .put_session(Session {
                id: 0,
                name: "s1".to_string(),
                collaboration_id: collab_id,
                study_id: None,
                owner_user_id: 1,
                scope: SessionScope::Collaboration,
                created_at: Utc::now(),
                last_used_at: Utc::now(),
            })
            .await
            .id
    }

    fn modifier_submission(
        collab_id: CollaborationId,
        session_id: SessionId,
        org_id: OrganizationId,
        handle: &str,
    ) -> TaskSubmission {
        TaskSubmission {
            name: "extract".to_string(),
            image: "harbor/algo:1".to_string(),
            action: TaskAction::DataExtraction,
            collaboration_id: collab_id,
            session_id,
            study_id: None,
            parent_task_id: None,
            depends_on_task_id: None,
            init_org_id: org_id,
            init_user_id: 1,
            algorithm_store_id: None,
            databases: vec![],
            dataframe_handle: Some(handle.to_string()),
            inputs_by_org: vec![(org_id, "ciphertext".to_string())],
        }
    }

    #[tokio::test]
    async fn second_modifier_is_refused_while_first_is_alive() {
        let coordinator = coordinator();
        let (org_id, collab_id) = seed_collaboration(&coordinator).await;
        let session_id = seed_session(&coordinator, collab_id).await;

        coordinator
            .submit_task(modifier_submission(collab_id, session_id, org_id, "patients"))
            .await
            .unwrap();

        let result = coordinator
            .submit_task(modifier_submission(collab_id, session_id, org_id, "patients"))
            .await;
        assert!(matches!(result, Err(V6Error::Conflict(_))));
    }

    #[tokio::test]
    async fn second_modifier_is_admitted_once_first_completes() {
        let coordinator = coordinator();
        let (org_id, collab_id) = seed_collaboration(&coordinator).await;
        let session_id = seed_session(&coordinator, collab_id).await;

        let first = coordinator
            .submit_task(modifier_submission(collab_id, session_id, org_id, "patients"))
            .await
            .unwrap();
        let runs = coordinator.store.runs_for_task(first.id).await;
        for run in runs {
            coordinator
                .patch_run(run.id, Some(RunStatus::Completed), None, None, false, None)
                .await
                .unwrap();
        }

        let second = coordinator
            .submit_task(modifier_submission(collab_id, session_id, org_id, "patients"))
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn cleanup_pass_deletes_remote_blob_for_blob_backed_results() {
        let coordinator = coordinator();
        let (org_id, _collab_id) = seed_collaboration(&coordinator).await;

        let blob_id = coordinator.blob_store.put(b"result bytes".to_vec()).await;

        let mut old_completed = Run::new(0, 1, org_id, String::new(), TaskAction::FederatedCompute);
        old_completed.status = RunStatus::Completed;
        old_completed.result = blob_id.to_string();
        old_completed.blob_storage_used = true;
        old_completed.finished_at = Some(Utc::now() - ChronoDuration::days(31));
        let old_completed = coordinator.store.put_run(old_completed).await;

        let cleaned = coordinator.run_cleanup_pass().await;
        assert_eq!(cleaned, 1);
        assert!(coordinator.store.get_run(old_completed.id).await.unwrap().result.is_empty());
        assert!(matches!(
            coordinator.blob_store.get(blob_id).await,
            Err(crate::blob::BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_pass_clears_input_only_when_policy_enables_it() {
        let coordinator = Coordinator::new(
            b"test-secret",
            CleanupPolicy {
                runs_data_cleanup_days: 30,
                delete_input_on_cleanup: true,
            },
            true,
        );
        let (org_id, _collab_id) = seed_collaboration(&coordinator).await;

        let mut old_completed = Run::new(0, 1, org_id, "secret input".to_string(), TaskAction::FederatedCompute);
        old_completed.status = RunStatus::Completed;
        old_completed.result = "secret".to_string();
        old_completed.finished_at = Some(Utc::now() - ChronoDuration::days(31));
        let old_completed = coordinator.store.put_run(old_completed).await;

        let cleaned = coordinator.run_cleanup_pass().await;
        assert_eq!(cleaned, 1);
        assert!(coordinator.store.get_run(old_completed.id).await.unwrap().input.is_empty());
    }
}
