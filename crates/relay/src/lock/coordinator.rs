// Lock state machine over the shared store.
//
// Per document: Unlocked -> Held on acquire; Held -> Held(countdown) when the
// first steal request arms a process; countdown -> cleanup when its deadline
// passes; any Held state -> Unlocked or Held(new holder) on release, deny,
// disconnect, stale reclaim, or forced transfer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use doclock_common::types::{Actor, DocumentLock, LockStatus, StealProcess, StealRequest};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::{
    deadline_after, AbortOutcome, CancelOutcome, DenyOutcome, LockStore, Reacquire,
    RegisterSteal, ReleaseOutcome, StealRegistration, Transfer,
};
use super::{LockError, LockResult, StealTimings};

const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted(DocumentLock),
    /// The caller's connection already held the lock; nothing changed.
    AlreadyHeld(DocumentLock),
    /// The caller's account held the lock from another connection, which
    /// has now lost it to this one.
    HandedOver { previous: DocumentLock, lock: DocumentLock },
}

impl AcquireOutcome {
    pub fn lock(&self) -> &DocumentLock {
        match self {
            Self::Granted(lock) | Self::AlreadyHeld(lock) | Self::HandedOver { lock, .. } => lock,
        }
    }
}

/// What a dropped connection left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectEffect {
    /// A lock the connection held was released or handed to the queue head.
    Released(ReleaseOutcome),
    /// A steal request the connection had queued was withdrawn.
    Withdrawn(CancelOutcome),
}

#[derive(Clone)]
pub struct LockCoordinator {
    store: LockStore,
    timings: StealTimings,
}

impl LockCoordinator {
    pub fn new(store: LockStore, timings: StealTimings) -> Self {
        Self { store, timings }
    }

    pub fn store(&self) -> &LockStore {
        &self.store
    }

    pub fn timings(&self) -> StealTimings {
        self.timings
    }

    pub async fn acquire_standard_lock(
        &self,
        document_id: Uuid,
        holder: &Actor,
    ) -> LockResult<AcquireOutcome> {
        for _ in 0..ACQUIRE_ATTEMPTS {
            let lock = DocumentLock::for_actor(document_id, holder, Utc::now());
            if self.store.try_set(&lock).await? {
                info!(
                    %document_id,
                    account_id = %holder.account_id,
                    connection_id = %holder.connection_id,
                    "lock granted"
                );
                return Ok(AcquireOutcome::Granted(lock));
            }

            match self.store.reacquire(&lock).await? {
                Reacquire::Unchanged(current) => return Ok(AcquireOutcome::AlreadyHeld(current)),
                Reacquire::HandedOver { previous, lock } => {
                    info!(
                        %document_id,
                        account_id = %holder.account_id,
                        previous_connection_id = %previous.holder_connection_id,
                        connection_id = %lock.holder_connection_id,
                        "lock handed to another connection of its holder"
                    );
                    return Ok(AcquireOutcome::HandedOver { previous, lock });
                }
                Reacquire::HeldByOther(current) => {
                    return Err(LockError::LockDenied { current_lock: Box::new(current) });
                }
                // Released between the insert and the read.
                Reacquire::Free => continue,
            }
        }

        Err(LockError::Contended { document_id })
    }

    pub async fn release_standard_lock(
        &self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> LockResult<ReleaseOutcome> {
        let outcome = self
            .store
            .release_holder(document_id, account_id, None, Utc::now())
            .await?
            .ok_or(LockError::NotHolder { document_id })?;
        log_release(&outcome, "released");
        Ok(outcome)
    }

    pub async fn update_heartbeat(&self, document_id: Uuid, account_id: Uuid) -> LockResult<()> {
        if self.store.touch_heartbeat(document_id, account_id, Utc::now()).await? {
            Ok(())
        } else {
            Err(LockError::NotHolder { document_id })
        }
    }

    pub async fn get_lock_status(&self, document_id: Uuid) -> LockResult<LockStatus> {
        Ok(self.store.status(document_id).await?)
    }

    pub async fn register_steal_request(
        &self,
        document_id: Uuid,
        requester: &Actor,
    ) -> LockResult<StealRegistration> {
        let request = StealRequest::for_actor(document_id, requester, Utc::now());
        match self.store.register_steal(request, self.timings.countdown).await? {
            RegisterSteal::Registered(registration) => {
                if let Some(process) = &registration.armed {
                    info!(
                        %document_id,
                        account_id = %requester.account_id,
                        process_id = %process.process_id,
                        "steal countdown armed"
                    );
                } else {
                    debug!(
                        %document_id,
                        account_id = %requester.account_id,
                        position = registration.position,
                        "steal request queued"
                    );
                }
                Ok(registration)
            }
            RegisterSteal::NotLocked => {
                Err(LockError::NotStealable { document_id, reason: "document is not locked" })
            }
            RegisterSteal::HeldByRequester => Err(LockError::NotStealable {
                document_id,
                reason: "caller already holds the lock",
            }),
        }
    }

    pub async fn get_steal_queue_position(
        &self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> LockResult<Option<usize>> {
        Ok(self.store.position_of(document_id, account_id).await?)
    }

    /// Pops the earliest pending request. A countdown armed for it is torn
    /// down and the next requester, if any, gets a fresh one.
    pub async fn consume_steal_request(&self, document_id: Uuid) -> LockResult<CancelOutcome> {
        self.store
            .consume_head(document_id, Utc::now(), self.timings.countdown)
            .await?
            .ok_or(LockError::NoPendingRequest { document_id })
    }

    pub async fn deny_steal_request(
        &self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> LockResult<DenyOutcome> {
        let outcome = self
            .store
            .deny_steal(document_id, account_id)
            .await?
            .ok_or(LockError::NotHolder { document_id })?;
        info!(%document_id, flushed = outcome.flushed.len(), "steal denied by holder");
        Ok(outcome)
    }

    /// Withdraws the caller's pending request. When it owned the armed
    /// process, the next requester gets a fresh countdown.
    pub async fn remove_steal_request(
        &self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> LockResult<CancelOutcome> {
        let outcome = self
            .store
            .cancel_steal(document_id, account_id, Utc::now(), self.timings.countdown)
            .await?
            .ok_or(LockError::NoPendingRequest { document_id })?;
        debug!(
            %document_id,
            %account_id,
            was_head = outcome.was_head,
            promoted = outcome.promoted.is_some(),
            "steal request withdrawn"
        );
        Ok(outcome)
    }

    /// Releases everything a dropped connection held and withdraws its queued
    /// requests. Per-document store failures are logged and skipped so one bad
    /// document does not strand the rest.
    pub async fn release_lock_by_socket(
        &self,
        connection_id: Uuid,
    ) -> LockResult<Vec<DisconnectEffect>> {
        let mut effects = Vec::new();
        let now = Utc::now();

        for request in self.store.requests_by_connection(connection_id).await? {
            match self
                .store
                .cancel_steal(
                    request.document_id,
                    request.requester_account_id,
                    now,
                    self.timings.countdown,
                )
                .await
            {
                Ok(Some(outcome)) => effects.push(DisconnectEffect::Withdrawn(outcome)),
                Ok(None) => {}
                Err(error) => warn!(
                    document_id = %request.document_id,
                    %connection_id,
                    ?error,
                    "failed to withdraw steal request of closed connection"
                ),
            }
        }

        for lock in self.store.find_by_connection(connection_id).await? {
            match self
                .store
                .release_holder(lock.document_id, lock.holder_account_id, Some(connection_id), now)
                .await
            {
                Ok(Some(outcome)) => {
                    log_release(&outcome, "released on disconnect");
                    effects.push(DisconnectEffect::Released(outcome));
                }
                Ok(None) => {}
                Err(error) => warn!(
                    document_id = %lock.document_id,
                    %connection_id,
                    ?error,
                    "failed to release lock of closed connection"
                ),
            }
        }

        Ok(effects)
    }

    pub async fn steal_process(&self, document_id: Uuid) -> LockResult<Option<StealProcess>> {
        Ok(self.store.get_process(document_id).await?)
    }

    /// Moves `process` from countdown into cleanup if it is still current.
    pub async fn advance_to_cleanup(
        &self,
        process: &StealProcess,
    ) -> LockResult<Option<StealProcess>> {
        let deadline = deadline_after(Utc::now(), self.timings.cleanup);
        Ok(self.store.advance_process(process.document_id, process.process_id, deadline).await?)
    }

    /// Hands the lock to the head of the queue once `process`'s cleanup ends.
    pub async fn force_transfer(&self, process: &StealProcess) -> LockResult<Option<Transfer>> {
        let transfer =
            self.store.force_transfer(process.document_id, process.process_id, Utc::now()).await?;
        if let Some(transfer) = &transfer {
            info!(
                document_id = %process.document_id,
                process_id = %process.process_id,
                previous_account_id = %transfer.previous.holder_account_id,
                account_id = %transfer.new_holder.holder_account_id,
                flushed = transfer.flushed.len(),
                "forced lock transfer"
            );
        }
        Ok(transfer)
    }

    /// Ends `process` without a transfer and flushes every waiter. `None`
    /// when the process already ended some other way.
    pub async fn abort_steal_process(
        &self,
        process: &StealProcess,
    ) -> LockResult<Option<AbortOutcome>> {
        let outcome = self.store.abort_steal(process.document_id, process.process_id).await?;
        if let Some(outcome) = &outcome {
            warn!(
                document_id = %process.document_id,
                process_id = %process.process_id,
                flushed = outcome.flushed.len(),
                "steal process aborted; holder keeps the lock"
            );
        }
        Ok(outcome)
    }

    pub async fn due_steal_processes(&self, now: DateTime<Utc>) -> LockResult<Vec<StealProcess>> {
        Ok(self.store.due_processes(now).await?)
    }

    /// Releases every lock whose holder stopped heartbeating `stale_after` ago.
    pub async fn reclaim_stale_locks(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> LockResult<Vec<ReleaseOutcome>> {
        let cutoff = now - chrono::Duration::milliseconds(stale_after.as_millis() as i64);
        let mut reclaimed = Vec::new();

        for lock in self.store.stale_locks(cutoff).await? {
            if let Some(outcome) = self.store.reclaim_stale(lock.document_id, cutoff, now).await? {
                warn!(
                    document_id = %lock.document_id,
                    account_id = %lock.holder_account_id,
                    last_heartbeat_at = %lock.last_heartbeat_at,
                    "reclaimed lock after heartbeat timeout"
                );
                reclaimed.push(outcome);
            }
        }

        Ok(reclaimed)
    }
}

fn log_release(outcome: &ReleaseOutcome, action: &'static str) {
    match outcome {
        ReleaseOutcome::Released { lock, .. } => info!(
            document_id = %lock.document_id,
            account_id = %lock.holder_account_id,
            "lock {action}"
        ),
        ReleaseOutcome::Transferred(transfer) => info!(
            document_id = %transfer.previous.document_id,
            previous_account_id = %transfer.previous.holder_account_id,
            account_id = %transfer.new_holder.holder_account_id,
            flushed = transfer.flushed.len(),
            "lock {action} and transferred to queue head"
        ),
    }
}
