// Turns coordinator outcomes into lock events for holders, requesters and
// document rooms.

use doclock_common::protocol::ws::LockEvent;
use doclock_common::types::{DocumentLock, LockStatus, StealProcess, StealRequest};
use uuid::Uuid;

use super::store::{AbortOutcome, CancelOutcome, ReleaseOutcome, Transfer};
use super::StealTimings;
use crate::bus::{BusTarget, LockBus};

/// Why a holder stopped holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCause {
    /// Release or early release by the holder.
    Voluntary,
    /// The holder's connection closed.
    Disconnect,
    /// The holder stopped heartbeating.
    Stale,
    /// The steal countdown and cleanup ran out.
    Forced,
}

const FLUSHED_BY_TRANSFER: &str = "lock was transferred to an earlier requester; request again";
const FLUSHED_BY_DENIAL: &str = "the lock holder denied the steal request";
const FLUSHED_BY_ABORT: &str = "the steal could not be completed; the holder keeps the lock";
const FLUSHED_BY_RELEASE: &str = "the lock is no longer held; request it directly";

#[derive(Clone)]
pub struct LockNotifier {
    bus: LockBus,
    timings: StealTimings,
}

impl LockNotifier {
    pub fn new(bus: LockBus, timings: StealTimings) -> Self {
        Self { bus, timings }
    }

    pub fn bus(&self) -> &LockBus {
        &self.bus
    }

    pub async fn to_connection(&self, connection_id: Uuid, event: LockEvent) {
        self.bus.publish(BusTarget::Connection { connection_id }, event).await;
    }

    pub async fn to_room(&self, document_id: Uuid, event: LockEvent) {
        self.bus.publish(BusTarget::Room { document_id }, event).await;
    }

    pub async fn status_changed(&self, status: LockStatus) {
        let document_id = status.document_id;
        self.to_room(document_id, LockEvent::StatusChanged { status }).await;
    }

    pub async fn flush(&self, requests: &[StealRequest], message: &str) {
        for request in requests {
            self.to_connection(
                request.requester_connection_id,
                LockEvent::StealFailed {
                    document_id: request.document_id,
                    message: message.to_string(),
                },
            )
            .await;
        }
    }

    /// Countdown started: the head hears how long it waits, the holder hears
    /// who is coming.
    pub async fn steal_started(&self, process: &StealProcess, requester_display_name: &str) {
        let seconds = self.timings.countdown_secs();
        self.to_connection(
            process.head_requester_connection_id,
            LockEvent::StealCountdown { document_id: process.document_id, seconds },
        )
        .await;
        self.to_connection(
            process.holder_connection_id,
            LockEvent::StealAttempt {
                document_id: process.document_id,
                seconds,
                requester_display_name: requester_display_name.to_string(),
            },
        )
        .await;
    }

    pub async fn steal_cleanup(&self, process: &StealProcess) {
        let event = LockEvent::StealCleanup {
            document_id: process.document_id,
            seconds: self.timings.cleanup_secs(),
        };
        self.to_connection(process.head_requester_connection_id, event.clone()).await;
        self.to_connection(process.holder_connection_id, event).await;
    }

    /// A timed step could not run; both parties get `lock:error`.
    pub async fn steal_aborted(&self, process: &StealProcess, message: &str) {
        let event = LockEvent::error(Some(process.document_id), message);
        self.to_connection(process.head_requester_connection_id, event.clone()).await;
        self.to_connection(process.holder_connection_id, event).await;
    }

    /// An aborted process is gone from the store: waiters re-request and the
    /// room sees the holder without a pending steal.
    pub async fn steal_torn_down(&self, outcome: &AbortOutcome) {
        self.flush(&outcome.flushed, FLUSHED_BY_ABORT).await;
        let status = match &outcome.holder {
            Some(holder) => LockStatus::held(holder.clone(), None),
            None => LockStatus::unlocked(outcome.process.document_id),
        };
        self.status_changed(status).await;
    }

    /// The holder's account re-acquired from another connection.
    pub async fn handover(&self, previous: &DocumentLock, lock: &DocumentLock) {
        self.to_connection(
            previous.holder_connection_id,
            LockEvent::Lost { document_id: lock.document_id, new_holder: Some(lock.clone()) },
        )
        .await;
        self.to_connection(lock.holder_connection_id, LockEvent::Granted { lock: lock.clone() })
            .await;
    }

    pub async fn transfer(&self, transfer: &Transfer, cause: ReleaseCause) {
        let document_id = transfer.new_holder.document_id;
        let previous = transfer.previous.holder_connection_id;
        match cause {
            ReleaseCause::Voluntary => {
                self.to_connection(previous, LockEvent::Released { document_id }).await;
            }
            ReleaseCause::Disconnect | ReleaseCause::Stale | ReleaseCause::Forced => {
                self.to_connection(
                    previous,
                    LockEvent::Lost { document_id, new_holder: Some(transfer.new_holder.clone()) },
                )
                .await;
            }
        }

        self.to_connection(
            transfer.new_holder.holder_connection_id,
            LockEvent::Granted { lock: transfer.new_holder.clone() },
        )
        .await;
        self.flush(&transfer.flushed, FLUSHED_BY_TRANSFER).await;
        self.status_changed(LockStatus::held(transfer.new_holder.clone(), None)).await;
    }

    pub async fn release_outcome(&self, outcome: &ReleaseOutcome, cause: ReleaseCause) {
        match outcome {
            ReleaseOutcome::Released { lock, .. } => {
                let document_id = lock.document_id;
                let event = match cause {
                    ReleaseCause::Voluntary => LockEvent::Released { document_id },
                    _ => LockEvent::Lost { document_id, new_holder: None },
                };
                self.to_connection(lock.holder_connection_id, event).await;
                self.status_changed(LockStatus::unlocked(document_id)).await;
            }
            ReleaseOutcome::Transferred(transfer) => self.transfer(transfer, cause).await,
        }
    }

    pub async fn denied(
        &self,
        holder_connection_id: Uuid,
        document_id: Uuid,
        flushed: &[StealRequest],
    ) {
        self.flush(flushed, FLUSHED_BY_DENIAL).await;
        self.to_connection(holder_connection_id, LockEvent::StealCancelled { document_id }).await;
    }

    /// A withdrawn request: tell the holder when its countdown stopped, and
    /// start the promoted requester's countdown.
    pub async fn cancel_outcome(&self, outcome: &CancelOutcome) {
        let document_id = outcome.removed.document_id;
        self.to_connection(
            outcome.removed.requester_connection_id,
            LockEvent::StealCancelled { document_id },
        )
        .await;

        if let Some(cancelled) = &outcome.cancelled {
            if outcome.promoted.is_none() {
                self.to_connection(
                    cancelled.holder_connection_id,
                    LockEvent::StealCancelled { document_id },
                )
                .await;
            }
        }

        if let (Some(promoted), Some(head)) = (&outcome.promoted, &outcome.head) {
            self.steal_started(promoted, &head.requester_display_name).await;
        }

        self.flush(&outcome.orphaned, FLUSHED_BY_RELEASE).await;

        if outcome.was_head || outcome.promoted.is_some() || !outcome.orphaned.is_empty() {
            self.status_changed(outcome.status()).await;
        }
    }
}
