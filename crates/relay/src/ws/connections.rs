// Live WebSocket connections of this relay process and the document rooms
// they joined.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use doclock_common::protocol::ws::LockEvent;
use doclock_common::types::Actor;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

struct ConnectionRecord {
    actor: Actor,
    outbound: mpsc::UnboundedSender<LockEvent>,
    rooms: HashSet<Uuid>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub async fn register(&self, actor: Actor, outbound: mpsc::UnboundedSender<LockEvent>) {
        let connection_id = actor.connection_id;
        self.connections
            .write()
            .await
            .insert(connection_id, ConnectionRecord { actor, outbound, rooms: HashSet::new() });
    }

    pub async fn unregister(&self, connection_id: Uuid) -> Option<Actor> {
        self.connections.write().await.remove(&connection_id).map(|record| record.actor)
    }

    pub async fn join_room(&self, connection_id: Uuid, document_id: Uuid) -> bool {
        let mut guard = self.connections.write().await;
        match guard.get_mut(&connection_id) {
            Some(record) => {
                record.rooms.insert(document_id);
                true
            }
            None => false,
        }
    }

    pub async fn in_room(&self, connection_id: Uuid, document_id: Uuid) -> bool {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|record| record.rooms.contains(&document_id))
            .unwrap_or(false)
    }

    /// Returns whether the connection is live on this process.
    pub async fn send_to(&self, connection_id: Uuid, event: LockEvent) -> bool {
        let sender = self
            .connections
            .read()
            .await
            .get(&connection_id)
            .map(|record| record.outbound.clone());

        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    pub async fn broadcast_to_room(&self, document_id: Uuid, event: LockEvent) -> usize {
        let recipients: Vec<_> = {
            let guard = self.connections.read().await;
            guard
                .values()
                .filter(|record| record.rooms.contains(&document_id))
                .map(|record| record.outbound.clone())
                .collect()
        };

        let mut sent_count = 0;
        for recipient in recipients {
            if recipient.send(event.clone()).is_ok() {
                sent_count += 1;
            }
        }

        sent_count
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> Actor {
        Actor {
            account_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            display_name: "Member".to_string(),
            workspace_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn room_broadcast_reaches_only_joined_connections() {
        let registry = ConnectionRegistry::default();
        let document_id = Uuid::new_v4();
        let joined = actor();
        let outsider = actor();
        let (joined_tx, mut joined_rx) = mpsc::unbounded_channel();
        let (outsider_tx, mut outsider_rx) = mpsc::unbounded_channel();
        registry.register(joined.clone(), joined_tx).await;
        registry.register(outsider.clone(), outsider_tx).await;
        assert!(registry.join_room(joined.connection_id, document_id).await);

        let sent =
            registry.broadcast_to_room(document_id, LockEvent::Released { document_id }).await;

        assert_eq!(sent, 1);
        assert_eq!(joined_rx.try_recv().expect("joined receives"), LockEvent::Released {
            document_id
        });
        assert!(outsider_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_connections_receive_nothing() {
        let registry = ConnectionRegistry::default();
        let member = actor();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(member.clone(), tx).await;

        assert_eq!(registry.unregister(member.connection_id).await, Some(member.clone()));
        assert!(!registry.send_to(member.connection_id, LockEvent::error(None, "gone")).await);
        assert!(!registry.join_room(member.connection_id, Uuid::new_v4()).await);
        assert_eq!(registry.connection_count().await, 0);
    }
}
