use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use v6_types::entities::{CollaborationId, NodeId, OrganizationId, TaskId};
pub use v6_types::DispatchEvent;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    AllConnections,
    AllNodes,
    Collaboration(CollaborationId),
    Node(NodeId),
    Admin,
}

/// Room-keyed broadcast registry: every subscriber of a room gets every
/// event emitted to it. Subscribers are individual node socket
/// connections; a disconnect simply drops its sender.
#[derive(Default)]
pub struct Dispatcher {
    rooms: RwLock<HashMap<Room, Vec<mpsc::Sender<DispatchEvent>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, room: Room, capacity: usize) -> mpsc::Receiver<DispatchEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.rooms.write().await.entry(room).or_default().push(tx);
        rx
    }

    pub async fn emit(&self, room: &Room, event: DispatchEvent) {
        let mut rooms = self.rooms.write().await;
        if let Some(senders) = rooms.get_mut(room) {
            senders.retain(|tx| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
            senders.retain(|tx| !tx.is_closed());
        }
    }

    pub async fn emit_new_task(&self, collaboration_id: CollaborationId, task_id: TaskId) {
        self.emit(
            &Room::Collaboration(collaboration_id),
            DispatchEvent::NewTask { task_id },
        )
        .await;
    }

    pub async fn emit_kill(
        &self,
        collaboration_id: CollaborationId,
        task_id: Option<TaskId>,
        node_id: Option<NodeId>,
    ) {
        self.emit(
            &Room::Collaboration(collaboration_id),
            DispatchEvent::KillContainers {
                task_id,
                node_id,
                collaboration_id,
            },
        )
        .await;
    }

    pub async fn emit_status_change(
        &self,
        collaboration_id: CollaborationId,
        event: DispatchEvent,
    ) {
        self.emit(&Room::Collaboration(collaboration_id), event.clone())
            .await;
        self.emit(&Room::Admin, event).await;
    }

    pub async fn emit_node_status(&self, node_id: NodeId, online: bool) {
        self.emit(
            &Room::Admin,
            DispatchEvent::NodeStatusChanged { node_id, online },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_in_room_receives_event() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.join(Room::Collaboration(1), 8).await;
        dispatcher.emit_new_task(1, 42).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, DispatchEvent::NewTask { task_id: 42 }));
    }

    #[tokio::test]
    async fn subscriber_in_other_room_does_not_receive() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.join(Room::Collaboration(2), 8).await;
        dispatcher.emit_new_task(1, 42).await;
        assert!(rx.try_recv().is_err());
    }
}
