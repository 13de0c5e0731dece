// Cross-relay delivery of lock events.
//
// With a single relay the bus hands events straight to the local registry.
// With Postgres every event is published through `pg_notify` and each relay's
// listener delivers it to the connections it owns, so a holder connected to
// relay A hears about a steal started on relay B.

use std::time::Duration;

use doclock_common::protocol::ws::LockEvent;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ws::connections::ConnectionRegistry;

pub const EVENTS_CHANNEL: &str = "doclock_events";

// pg_notify rejects payloads of 8000 bytes or more.
const MAX_NOTIFY_PAYLOAD_BYTES: usize = 7900;
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusTarget {
    Connection { connection_id: Uuid },
    Room { document_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusEnvelope {
    pub target: BusTarget,
    pub event: LockEvent,
}

#[derive(Clone)]
pub enum LockBus {
    Local(ConnectionRegistry),
    Postgres { pool: PgPool, registry: ConnectionRegistry },
}

impl LockBus {
    pub fn registry(&self) -> &ConnectionRegistry {
        match self {
            Self::Local(registry) | Self::Postgres { registry, .. } => registry,
        }
    }

    pub async fn publish(&self, target: BusTarget, event: LockEvent) {
        let envelope = BusEnvelope { target, event };
        match self {
            Self::Local(registry) => {
                deliver(registry, envelope).await;
            }
            Self::Postgres { pool, registry } => {
                let payload = match serde_json::to_string(&envelope) {
                    Ok(payload) if payload.len() < MAX_NOTIFY_PAYLOAD_BYTES => payload,
                    Ok(payload) => {
                        warn!(
                            bytes = payload.len(),
                            event = envelope.event.name(),
                            "lock event too large for pg_notify, delivering locally"
                        );
                        deliver(registry, envelope).await;
                        return;
                    }
                    Err(error) => {
                        warn!(?error, "failed to encode lock event envelope");
                        return;
                    }
                };

                if let Err(error) = sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(EVENTS_CHANNEL)
                    .bind(payload)
                    .execute(pool)
                    .await
                {
                    warn!(
                        ?error,
                        event = envelope.event.name(),
                        "failed to publish lock event, delivering locally"
                    );
                    deliver(registry, envelope).await;
                }
            }
        }
    }

    /// Starts the Postgres listener task. The local bus has nothing to listen to.
    pub fn spawn_listener(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        match self {
            Self::Local(_) => None,
            Self::Postgres { pool, registry } => {
                Some(tokio::spawn(run_listener(pool.clone(), registry.clone(), shutdown)))
            }
        }
    }
}

/// Returns how many local connections received the event.
pub async fn deliver(registry: &ConnectionRegistry, envelope: BusEnvelope) -> usize {
    match envelope.target {
        BusTarget::Connection { connection_id } => {
            usize::from(registry.send_to(connection_id, envelope.event).await)
        }
        BusTarget::Room { document_id } => {
            registry.broadcast_to_room(document_id, envelope.event).await
        }
    }
}

async fn run_listener(pool: PgPool, registry: ConnectionRegistry, shutdown: CancellationToken) {
    loop {
        let mut listener = match connect_listener(&pool).await {
            Ok(listener) => listener,
            Err(error) => {
                warn!(?error, "lock event listener failed to connect, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(LISTENER_RETRY_DELAY) => continue,
                }
            }
        };
        info!(channel = EVENTS_CHANNEL, "lock event listener started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("lock event listener stopping");
                    return;
                }
                notification = listener.recv() => match notification {
                    Ok(notification) => {
                        match serde_json::from_str::<BusEnvelope>(notification.payload()) {
                            Ok(envelope) => {
                                let delivered = deliver(&registry, envelope).await;
                                debug!(delivered, "lock event delivered from bus");
                            }
                            Err(error) => warn!(?error, "discarding malformed lock event envelope"),
                        }
                    }
                    Err(error) => {
                        warn!(?error, "lock event listener lost its connection");
                        break;
                    }
                },
            }
        }
    }
}

async fn connect_listener(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(EVENTS_CHANNEL).await?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use doclock_common::types::Actor;
    use tokio::sync::mpsc;

    #[test]
    fn envelope_target_is_tagged_by_kind() {
        let document_id = Uuid::new_v4();
        let envelope = BusEnvelope {
            target: BusTarget::Room { document_id },
            event: LockEvent::Released { document_id },
        };

        let encoded = serde_json::to_value(&envelope).expect("envelope should serialize");
        assert_eq!(encoded["target"]["kind"], "room");
        assert_eq!(encoded["event"]["type"], "lock:released");
    }

    #[tokio::test]
    async fn local_bus_delivers_to_target_connection() {
        let registry = ConnectionRegistry::default();
        let actor = Actor {
            account_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            display_name: "Member".to_string(),
            workspace_id: Uuid::new_v4(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(actor.clone(), tx).await;
        let bus = LockBus::Local(registry);

        bus.publish(
            BusTarget::Connection { connection_id: actor.connection_id },
            LockEvent::error(None, "hello"),
        )
        .await;

        assert_eq!(rx.try_recv().expect("event delivered"), LockEvent::error(None, "hello"));
        assert!(bus.spawn_listener(CancellationToken::new()).is_none());
    }
}
