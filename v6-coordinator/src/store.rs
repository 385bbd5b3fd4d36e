use std::collections::HashMap;

use tokio::sync::RwLock;
use v6_types::entities::*;
use v6_types::status::{RunStatus, TaskStatus};
use v6_types::{DatabaseLock, V6Error};

/// The coordinator's single source of truth: an in-process, lock-guarded
/// set of tables. A single-coordinator-instance deployment is assumed
/// here (see DESIGN.md) rather than the original relational-DB-with-
/// row-locks model, since multi-replica coordination is out of scope.
#[derive(Default)]
pub struct CoordinatorStore {
    organizations: RwLock<HashMap<OrganizationId, Organization>>,
    collaborations: RwLock<HashMap<CollaborationId, Collaboration>>,
    studies: RwLock<HashMap<StudyId, Study>>,
    nodes: RwLock<HashMap<NodeId, Node>>,
    sessions: RwLock<HashMap<SessionId, Session>>,
    dataframes: RwLock<HashMap<DataframeId, Dataframe>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    runs: RwLock<HashMap<RunId, Run>>,
    next_id: RwLock<u64>,
    next_job_id: RwLock<u64>,
    pub locks: DatabaseLock,
}

impl CoordinatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn alloc_id(&self) -> u64 {
        let mut next = self.next_id.write().await;
        *next += 1;
        *next
    }

    pub async fn next_job_id(&self) -> u64 {
        let mut next = self.next_job_id.write().await;
        *next += 1;
        *next
    }

    // --- organizations ---

    pub async fn put_organization(&self, mut org: Organization) -> Organization {
        if org.id == 0 {
            org.id = self.alloc_id().await;
        }
        self.organizations.write().await.insert(org.id, org.clone());
        org
    }

    pub async fn get_organization(&self, id: OrganizationId) -> Result<Organization, V6Error> {
        self.organizations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| V6Error::NotFound(format!("organization {id}")))
    }

    pub async fn set_organization_public_key(
        &self,
        id: OrganizationId,
        public_key: String,
    ) -> Result<(), V6Error> {
        let mut orgs = self.organizations.write().await;
        let org = orgs
            .get_mut(&id)
            .ok_or_else(|| V6Error::NotFound(format!("organization {id}")))?;
        org.public_key = public_key;
        Ok(())
    }

    // --- collaborations ---

    pub async fn put_collaboration(&self, mut collab: Collaboration) -> Collaboration {
        if collab.id == 0 {
            collab.id = self.alloc_id().await;
        }
        self.collaborations
            .write()
            .await
            .insert(collab.id, collab.clone());
        collab
    }

    pub async fn get_collaboration(&self, id: CollaborationId) -> Result<Collaboration, V6Error> {
        self.collaborations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| V6Error::NotFound(format!("collaboration {id}")))
    }

    // --- studies ---

    pub async fn put_study(&self, mut study: Study) -> Study {
        if study.id == 0 {
            study.id = self.alloc_id().await;
        }
        self.studies.write().await.insert(study.id, study.clone());
        study
    }

    pub async fn get_study(&self, id: StudyId) -> Result<Study, V6Error> {
        self.studies
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| V6Error::NotFound(format!("study {id}")))
    }

    // --- nodes ---

    pub async fn put_node(&self, mut node: Node) -> Node {
        if node.id == 0 {
            node.id = self.alloc_id().await;
        }
        self.nodes.write().await.insert(node.id, node.clone());
        node
    }

    pub async fn get_node(&self, id: NodeId) -> Result<Node, V6Error> {
        self.nodes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| V6Error::NotFound(format!("node {id}")))
    }

    pub async fn get_node_by_api_key(&self, api_key: &str) -> Result<Node, V6Error> {
        self.nodes
            .read()
            .await
            .values()
            .find(|n| n.api_key == api_key)
            .cloned()
            .ok_or_else(|| V6Error::Unauthorized("unknown api key".to_string()))
    }

    pub async fn set_node_status(&self, id: NodeId, status: NodeStatus) -> Result<(), V6Error> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&id)
            .ok_or_else(|| V6Error::NotFound(format!("node {id}")))?;
        node.status = status;
        Ok(())
    }

    // --- sessions ---

    pub async fn put_session(&self, mut session: Session) -> Session {
        if session.id == 0 {
            session.id = self.alloc_id().await;
        }
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        session
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Session, V6Error> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| V6Error::NotFound(format!("session {id}")))
    }

    /// Hard-delete a session and cascade to its dataframes and tasks.
    pub async fn delete_session_cascade(&self, id: SessionId) -> Result<(), V6Error> {
        self.sessions
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| V6Error::NotFound(format!("session {id}")))?;

        let df_ids: Vec<DataframeId> = self
            .dataframes
            .read()
            .await
            .values()
            .filter(|d| d.session_id == id)
            .map(|d| d.id)
            .collect();
        for df_id in df_ids {
            self.dataframes.write().await.remove(&df_id);
        }

        let task_ids: Vec<TaskId> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.session_id == id)
            .map(|t| t.id)
            .collect();
        for task_id in task_ids {
            self.tasks.write().await.remove(&task_id);
            let run_ids: Vec<RunId> = self
                .runs
                .read()
                .await
                .values()
                .filter(|r| r.task_id == task_id)
                .map(|r| r.id)
                .collect();
            for run_id in run_ids {
                self.runs.write().await.remove(&run_id);
            }
        }
        Ok(())
    }

    // --- dataframes ---

    pub async fn put_dataframe(&self, mut df: Dataframe) -> Dataframe {
        if df.id == 0 {
            df.id = self.alloc_id().await;
        }
        self.dataframes.write().await.insert(df.id, df.clone());
        df
    }

    pub async fn get_dataframe(&self, id: DataframeId) -> Result<Dataframe, V6Error> {
        self.dataframes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| V6Error::NotFound(format!("dataframe {id}")))
    }

    pub async fn find_dataframe_by_handle(
        &self,
        session_id: SessionId,
        handle: &str,
    ) -> Option<Dataframe> {
        self.dataframes
            .read()
            .await
            .values()
            .find(|d| d.session_id == session_id && d.handle == handle)
            .cloned()
    }

    pub async fn set_dataframe_last_task(
        &self,
        id: DataframeId,
        task_id: TaskId,
    ) -> Result<(), V6Error> {
        let mut dfs = self.dataframes.write().await;
        let df = dfs
            .get_mut(&id)
            .ok_or_else(|| V6Error::NotFound(format!("dataframe {id}")))?;
        df.last_session_task_id = Some(task_id);
        Ok(())
    }

    /// `dataframe.ready` per the data model: a last modifying task exists
    /// and every one of its runs is in a finished state.
    pub async fn dataframe_is_ready(&self, id: DataframeId) -> Result<bool, V6Error> {
        let df = self.get_dataframe(id).await?;
        let Some(task_id) = df.last_session_task_id else {
            return Ok(false);
        };
        let statuses = self.run_statuses_for_task(task_id).await;
        Ok(!statuses.is_empty() && statuses.iter().all(|s| s.is_finished()))
    }

    pub async fn delete_dataframe(&self, id: DataframeId) -> Result<(), V6Error> {
        self.dataframes
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| V6Error::NotFound(format!("dataframe {id}")))?;
        Ok(())
    }

    // --- tasks & runs ---

    pub async fn put_task(&self, mut task: Task) -> Task {
        if task.id == 0 {
            task.id = self.alloc_id().await;
        }
        self.tasks.write().await.insert(task.id, task.clone());
        task
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, V6Error> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| V6Error::NotFound(format!("task {id}")))
    }

    pub async fn put_run(&self, mut run: Run) -> Run {
        if run.id == 0 {
            run.id = self.alloc_id().await;
        }
        self.runs.write().await.insert(run.id, run.clone());
        run
    }

    pub async fn get_run(&self, id: RunId) -> Result<Run, V6Error> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| V6Error::NotFound(format!("run {id}")))
    }

    pub async fn runs_for_task(&self, task_id: TaskId) -> Vec<Run> {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }

    pub async fn runs_for_node(&self, node_id: NodeId, states: &[RunStatus]) -> Vec<Run> {
        let node = match self.get_node(node_id).await {
            Ok(n) => n,
            Err(_) => return Vec::new(),
        };
        self.runs
            .read()
            .await
            .values()
            .filter(|r| r.organization_id == node.organization_id)
            .filter(|r| states.is_empty() || states.contains(&r.status))
            .cloned()
            .collect()
    }

    async fn run_statuses_for_task(&self, task_id: TaskId) -> Vec<RunStatus> {
        self.runs_for_task(task_id).await.iter().map(|r| r.status).collect()
    }

    pub async fn task_status(&self, task_id: TaskId) -> TaskStatus {
        TaskStatus::from_run_statuses(self.run_statuses_for_task(task_id).await)
    }

    pub async fn update_run<F>(&self, id: RunId, f: F) -> Result<Run, V6Error>
    where
        F: FnOnce(&mut Run) -> Result<(), String>,
    {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| V6Error::NotFound(format!("run {id}")))?;
        f(run).map_err(V6Error::Conflict)?;
        Ok(run.clone())
    }

    pub async fn all_runs(&self) -> Vec<Run> {
        self.runs.read().await.values().cloned().collect()
    }
}
