// Single entry point for lock commands from the transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use doclock_common::protocol::ws::{ClientMessage, DenialReason, LockEvent};
use doclock_common::types::{Actor, LockStatus};
use tracing::{debug, warn};
use uuid::Uuid;

use super::coordinator::{AcquireOutcome, DisconnectEffect};
use super::{
    LockCoordinator, LockError, LockNotifier, LockResult, LockStore, ReleaseCause,
    StealOrchestrator, StealTimings,
};
use crate::bus::LockBus;
use crate::metrics;
use crate::ws::connections::ConnectionRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockCommand {
    Join { document_id: Uuid },
    Acquire { document_id: Uuid, display_name: Option<String>, workspace_id: Option<Uuid> },
    Release { document_id: Uuid },
    Heartbeat { document_id: Uuid },
    RequestSteal { document_id: Uuid },
    DenySteal { document_id: Uuid },
    CancelSteal { document_id: Uuid },
    EarlyRelease { document_id: Uuid },
    Disconnect,
}

impl LockCommand {
    pub fn acquire(document_id: Uuid) -> Self {
        Self::Acquire { document_id, display_name: None, workspace_id: None }
    }

    /// Metric label.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Acquire { .. } => "acquire",
            Self::Release { .. } => "release",
            Self::Heartbeat { .. } => "heartbeat",
            Self::RequestSteal { .. } => "steal_request",
            Self::DenySteal { .. } => "steal_deny",
            Self::CancelSteal { .. } => "steal_cancel",
            Self::EarlyRelease { .. } => "early_release",
            Self::Disconnect => "disconnect",
        }
    }

    pub fn document_id(&self) -> Option<Uuid> {
        match self {
            Self::Join { document_id }
            | Self::Acquire { document_id, .. }
            | Self::Release { document_id }
            | Self::Heartbeat { document_id }
            | Self::RequestSteal { document_id }
            | Self::DenySteal { document_id }
            | Self::CancelSteal { document_id }
            | Self::EarlyRelease { document_id } => Some(*document_id),
            Self::Disconnect => None,
        }
    }
}

impl From<ClientMessage> for LockCommand {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Join { document_id } => Self::Join { document_id },
            ClientMessage::RequestLock { document_id, display_name, workspace_id } => {
                Self::Acquire { document_id, display_name, workspace_id }
            }
            ClientMessage::ReleaseLock { document_id } => Self::Release { document_id },
            ClientMessage::Heartbeat { document_id } => Self::Heartbeat { document_id },
            ClientMessage::RequestSteal { document_id } => Self::RequestSteal { document_id },
            ClientMessage::DenySteal { document_id } => Self::DenySteal { document_id },
            ClientMessage::CancelSteal { document_id } => Self::CancelSteal { document_id },
            ClientMessage::EarlyRelease { document_id } => Self::EarlyRelease { document_id },
        }
    }
}

#[derive(Clone)]
pub struct LockService {
    coordinator: LockCoordinator,
    orchestrator: Arc<StealOrchestrator>,
    notifier: LockNotifier,
}

impl LockService {
    pub fn new(
        store: LockStore,
        bus: LockBus,
        timings: StealTimings,
        lock_stale_after: Option<Duration>,
    ) -> Self {
        let coordinator = LockCoordinator::new(store, timings);
        let notifier = LockNotifier::new(bus, timings);
        let orchestrator = Arc::new(StealOrchestrator::new(
            coordinator.clone(),
            notifier.clone(),
            lock_stale_after,
        ));
        Self { coordinator, orchestrator, notifier }
    }

    /// Single-process service over an in-memory store.
    pub fn in_memory(timings: StealTimings) -> Self {
        Self::new(
            LockStore::memory(),
            LockBus::Local(ConnectionRegistry::default()),
            timings,
            None,
        )
    }

    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    pub fn orchestrator(&self) -> &Arc<StealOrchestrator> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.notifier.bus().registry()
    }

    /// Runs `command` for `actor` and fans out the resulting events. Failures
    /// end as one `lock:denied` or `lock:error` on the caller's connection.
    pub async fn dispatch(&self, actor: &Actor, command: LockCommand) {
        let started_at = Instant::now();
        let kind = command.kind();
        let document_id = command.document_id();
        let is_acquire = matches!(command, LockCommand::Acquire { .. });
        let is_disconnect = matches!(command, LockCommand::Disconnect);

        let result = self.execute(actor, command).await;
        let is_error = result.is_err();
        if let Err(error) = result {
            if is_disconnect {
                warn!(
                    connection_id = %actor.connection_id,
                    error = %error,
                    "disconnect cleanup failed; stale locks fall to the sweep"
                );
            } else {
                self.report_error(actor, kind, document_id, is_acquire, error).await;
            }
        }

        metrics::record_lock_command(kind, is_error, started_at.elapsed().as_millis() as u64);
    }

    async fn execute(&self, actor: &Actor, command: LockCommand) -> LockResult<()> {
        match command {
            LockCommand::Join { document_id } => {
                self.registry().join_room(actor.connection_id, document_id).await;
                let status = self.coordinator.get_lock_status(document_id).await?;
                self.notifier
                    .to_connection(actor.connection_id, LockEvent::Status { status })
                    .await;
            }
            LockCommand::Acquire { document_id, display_name, workspace_id } => {
                self.registry().join_room(actor.connection_id, document_id).await;
                let holder = Actor {
                    display_name: display_name.unwrap_or_else(|| actor.display_name.clone()),
                    workspace_id: workspace_id.unwrap_or(actor.workspace_id),
                    ..actor.clone()
                };

                match self.coordinator.acquire_standard_lock(document_id, &holder).await? {
                    AcquireOutcome::Granted(lock) => {
                        self.notifier
                            .to_connection(actor.connection_id, LockEvent::Granted {
                                lock: lock.clone(),
                            })
                            .await;
                        self.notifier.status_changed(LockStatus::held(lock, None)).await;
                    }
                    AcquireOutcome::AlreadyHeld(lock) => {
                        self.notifier
                            .to_connection(actor.connection_id, LockEvent::Granted { lock })
                            .await;
                    }
                    AcquireOutcome::HandedOver { previous, lock } => {
                        self.notifier.handover(&previous, &lock).await;
                        let status = self.coordinator.get_lock_status(document_id).await?;
                        self.notifier.status_changed(status).await;
                    }
                }
            }
            LockCommand::Release { document_id } | LockCommand::EarlyRelease { document_id } => {
                let outcome =
                    self.coordinator.release_standard_lock(document_id, actor.account_id).await?;
                self.orchestrator.track_release(&outcome);
                self.notifier.release_outcome(&outcome, ReleaseCause::Voluntary).await;
            }
            LockCommand::Heartbeat { document_id } => {
                self.coordinator.update_heartbeat(document_id, actor.account_id).await?;
            }
            LockCommand::RequestSteal { document_id } => {
                self.registry().join_room(actor.connection_id, document_id).await;
                let registration =
                    self.coordinator.register_steal_request(document_id, actor).await?;

                match &registration.armed {
                    Some(process) => {
                        metrics::increment_steals_started();
                        self.orchestrator.arm(process.clone());
                        self.notifier
                            .steal_started(process, &registration.head.requester_display_name)
                            .await;
                        self.notifier
                            .status_changed(LockStatus::held(
                                registration.holder.clone(),
                                Some(registration.head.clone()),
                            ))
                            .await;
                    }
                    None => {
                        self.notifier
                            .to_connection(
                                actor.connection_id,
                                LockEvent::StealQueued {
                                    document_id,
                                    position: registration.position,
                                },
                            )
                            .await;
                    }
                }
            }
            LockCommand::DenySteal { document_id } => {
                let outcome =
                    self.coordinator.deny_steal_request(document_id, actor.account_id).await?;
                if outcome.cancelled.is_some() {
                    self.orchestrator.disarm(document_id);
                }
                self.notifier
                    .denied(outcome.holder.holder_connection_id, document_id, &outcome.flushed)
                    .await;
                if outcome.cancelled.is_some() || !outcome.flushed.is_empty() {
                    self.notifier.status_changed(LockStatus::held(outcome.holder, None)).await;
                }
            }
            LockCommand::CancelSteal { document_id } => {
                let outcome =
                    self.coordinator.remove_steal_request(document_id, actor.account_id).await?;
                self.orchestrator.track_cancel(&outcome);
                self.notifier.cancel_outcome(&outcome).await;
            }
            LockCommand::Disconnect => {
                let effects = self.coordinator.release_lock_by_socket(actor.connection_id).await?;
                for effect in effects {
                    match effect {
                        DisconnectEffect::Released(outcome) => {
                            self.orchestrator.track_release(&outcome);
                            self.notifier.release_outcome(&outcome, ReleaseCause::Disconnect).await;
                        }
                        DisconnectEffect::Withdrawn(outcome) => {
                            self.orchestrator.track_cancel(&outcome);
                            self.notifier.cancel_outcome(&outcome).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn report_error(
        &self,
        actor: &Actor,
        kind: &'static str,
        document_id: Option<Uuid>,
        is_acquire: bool,
        error: LockError,
    ) {
        match &error {
            LockError::StoreUnavailable(store_error) => warn!(
                command = kind,
                connection_id = %actor.connection_id,
                document_id = ?document_id,
                error = %store_error,
                "lock command failed: store unavailable"
            ),
            other => debug!(
                command = kind,
                connection_id = %actor.connection_id,
                document_id = ?document_id,
                error = %other,
                "lock command rejected"
            ),
        }

        let event = match (error, document_id) {
            (LockError::LockDenied { current_lock }, _) => LockEvent::Denied {
                document_id: current_lock.document_id,
                reason: DenialReason::Held,
                current_lock: Some(*current_lock),
            },
            (LockError::StoreUnavailable(_) | LockError::Contended { .. }, Some(document_id))
                if is_acquire =>
            {
                LockEvent::Denied {
                    document_id,
                    reason: DenialReason::Unavailable,
                    current_lock: None,
                }
            }
            (other, document_id) => LockEvent::error(document_id, other.client_message()),
        };
        self.notifier.to_connection(actor.connection_id, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_map_to_commands() {
        let document_id = Uuid::new_v4();
        let command = LockCommand::from(ClientMessage::RequestLock {
            document_id,
            display_name: Some("Ada".to_string()),
            workspace_id: None,
        });

        assert_eq!(command, LockCommand::Acquire {
            document_id,
            display_name: Some("Ada".to_string()),
            workspace_id: None,
        });
        assert_eq!(command.kind(), "acquire");
        assert_eq!(
            LockCommand::from(ClientMessage::EarlyRelease { document_id }).kind(),
            "early_release"
        );
        assert_eq!(LockCommand::Disconnect.document_id(), None);
    }
}
