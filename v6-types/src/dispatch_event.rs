use serde::{Deserialize, Serialize};

use crate::entities::{CollaborationId, NodeId, OrganizationId, RunId, TaskId};
use crate::status::RunStatus;

/// Coordinator -> node (and peer) push events, grounded on the original
/// `/tasks` namespace's event set. Shared wire type: the coordinator emits
/// these over its `/tasks` websocket, the node agent decodes the same
/// shape on the other end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum DispatchEvent {
    NewTask {
        task_id: TaskId,
    },
    KillContainers {
        task_id: Option<TaskId>,
        node_id: Option<NodeId>,
        collaboration_id: CollaborationId,
    },
    AlgorithmStatusChange {
        run_id: RunId,
        task_id: TaskId,
        collaboration_id: CollaborationId,
        node_id: Option<NodeId>,
        organization_id: OrganizationId,
        status: RunStatus,
        parent_id: Option<TaskId>,
    },
    NodeStatusChanged {
        node_id: NodeId,
        online: bool,
    },
    ExpiredToken,
    Message {
        text: String,
    },
}
