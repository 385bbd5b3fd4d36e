use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::RunStatus;

pub type OrganizationId = u64;
pub type CollaborationId = u64;
pub type StudyId = u64;
pub type NodeId = u64;
pub type SessionId = u64;
pub type DataframeId = u64;
pub type TaskId = u64;
pub type RunId = u64;
pub type UserId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    /// PEM `SubjectPublicKeyInfo`, base64-framed for transport.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaboration {
    pub id: CollaborationId,
    pub name: String,
    pub encrypted: bool,
    pub session_restrict_to_same_image: bool,
    pub organization_ids: Vec<OrganizationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: StudyId,
    pub collaboration_id: CollaborationId,
    pub organization_ids: Vec<OrganizationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub organization_id: OrganizationId,
    pub collaboration_id: CollaborationId,
    pub api_key: String,
    pub status: NodeStatus,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    Own,
    Organization,
    Collaboration,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub collaboration_id: CollaborationId,
    pub study_id: Option<StudyId>,
    pub owner_user_id: UserId,
    pub scope: SessionScope,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataframeColumn {
    pub name: String,
    pub dtype: String,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataframe {
    pub id: DataframeId,
    pub handle: String,
    pub session_id: SessionId,
    pub last_session_task_id: Option<TaskId>,
    pub columns: Vec<DataframeColumn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    DataExtraction,
    Preprocessing,
    FederatedCompute,
    CentralCompute,
    PostProcessing,
}

impl TaskAction {
    /// Whether this action mutates the dataframe it targets and therefore
    /// must be serialized against other modifiers of the same dataframe.
    pub fn is_session_modifying(self) -> bool {
        matches!(self, TaskAction::DataExtraction | TaskAction::Preprocessing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbRefKind {
    Source,
    Dataframe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRef {
    pub kind: DbRefKind,
    pub label: Option<String>,
    pub dataframe_id: Option<DataframeId>,
    pub position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub image: String,
    pub action: TaskAction,
    pub collaboration_id: CollaborationId,
    pub session_id: SessionId,
    pub study_id: Option<StudyId>,
    pub job_id: u64,
    pub parent_task_id: Option<TaskId>,
    pub depends_on_task_id: Option<TaskId>,
    pub init_org_id: OrganizationId,
    pub init_user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub algorithm_store_id: Option<u64>,
    /// Argument slots; each inner vec is the set of DB-refs bound to one
    /// positional slot (multiple refs allow multi-database arguments).
    pub databases: Vec<Vec<DbRef>>,
    /// Set only for tasks that build a dataframe.
    pub dataframe_id: Option<DataframeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_id: TaskId,
    pub organization_id: OrganizationId,
    /// Transport-framed (possibly encrypted) input payload.
    pub input: String,
    /// Transport-framed (possibly encrypted) result payload, or empty.
    pub result: String,
    pub log: String,
    pub action: TaskAction,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub cleanup_at: Option<DateTime<Utc>>,
    pub blob_storage_used: bool,
}

impl Run {
    pub fn new(
        id: RunId,
        task_id: TaskId,
        organization_id: OrganizationId,
        input: String,
        action: TaskAction,
    ) -> Self {
        Run {
            id,
            task_id,
            organization_id,
            input,
            result: String::new(),
            log: String::new(),
            action,
            assigned_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: RunStatus::Pending,
            cleanup_at: None,
            blob_storage_used: false,
        }
    }

    /// Apply a status transition, rejecting any attempt to move a run
    /// that has already reached a finished status back to an alive one.
    pub fn set_status(&mut self, new_status: RunStatus) -> Result<(), String> {
        if self.status.is_finished() && new_status.is_alive() {
            return Err(format!(
                "cannot move run {} from finished status {:?} back to alive status {:?}",
                self.id, self.status, new_status
            ));
        }
        if new_status.is_finished() {
            self.finished_at = Some(Utc::now());
        }
        self.status = new_status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_run_always_has_finished_at() {
        let mut run = Run::new(1, 1, 1, String::new(), TaskAction::FederatedCompute);
        run.set_status(RunStatus::Completed).unwrap();
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn cannot_revive_a_finished_run() {
        let mut run = Run::new(1, 1, 1, String::new(), TaskAction::FederatedCompute);
        run.set_status(RunStatus::Completed).unwrap();
        assert!(run.set_status(RunStatus::Active).is_err());
    }
}
