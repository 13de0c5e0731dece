// Shared lock state: who holds each document, who is waiting, and which
// steal process is armed.
//
// Both backends expose the same primitives through `LockTxn`. Multi-step
// transitions are written once below and always run inside a single backend
// transaction (one mutex guard in memory, one `FOR UPDATE` transaction in
// Postgres), so concurrent callers and concurrent relays never double-grant
// or double-consume a queue head. Every composite takes the document's lock
// row first to keep a single lock order.

mod memory;
mod postgres;

pub use memory::MemoryLockStore;
pub use postgres::PostgresLockStore;

use std::time::Duration;

use chrono::{DateTime, Utc};
use doclock_common::types::{DocumentLock, LockStatus, StealPhase, StealProcess, StealRequest};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lock store is offline")]
    Offline,
    #[error("lock store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("lock store holds corrupt data: {detail}")]
    Corrupt { detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Backend primitives. Each call is executed against the caller's open
/// transaction; atomicity across calls comes from the enclosing transaction.
pub(crate) trait LockTxn {
    /// Read a lock, taking a row lock where the backend supports one.
    async fn lock_row(&mut self, document_id: Uuid) -> StoreResult<Option<DocumentLock>>;
    /// Insert only if the document is free.
    async fn try_set(&mut self, lock: &DocumentLock) -> StoreResult<bool>;
    async fn replace(&mut self, lock: &DocumentLock) -> StoreResult<()>;
    async fn clear(&mut self, document_id: Uuid) -> StoreResult<Option<DocumentLock>>;
    async fn touch_heartbeat(
        &mut self,
        document_id: Uuid,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn find_by_connection(&mut self, connection_id: Uuid) -> StoreResult<Vec<DocumentLock>>;
    async fn stale_locks(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DocumentLock>>;

    /// Append unless the account already waits; returns its 1-based position.
    async fn enqueue(&mut self, request: &StealRequest) -> StoreResult<usize>;
    async fn dequeue_head(&mut self, document_id: Uuid) -> StoreResult<Option<StealRequest>>;
    async fn peek_head(&mut self, document_id: Uuid) -> StoreResult<Option<StealRequest>>;
    async fn position_of(&mut self, document_id: Uuid, account_id: Uuid)
        -> StoreResult<Option<usize>>;
    async fn remove_by_account(
        &mut self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<StealRequest>>;
    /// Remove every queued request, earliest first.
    async fn drain(&mut self, document_id: Uuid) -> StoreResult<Vec<StealRequest>>;
    async fn requests_by_connection(
        &mut self,
        connection_id: Uuid,
    ) -> StoreResult<Vec<StealRequest>>;

    async fn fetch_process(&mut self, document_id: Uuid) -> StoreResult<Option<StealProcess>>;
    /// Insert only if no process is armed for the document.
    async fn arm_process(&mut self, process: &StealProcess) -> StoreResult<bool>;
    /// Compare-and-swap a countdown into its cleanup phase.
    async fn advance_process(
        &mut self,
        document_id: Uuid,
        process_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> StoreResult<Option<StealProcess>>;
    /// Remove the armed process, optionally only if it is `process_id`.
    async fn clear_process(
        &mut self,
        document_id: Uuid,
        process_id: Option<Uuid>,
    ) -> StoreResult<Option<StealProcess>>;
    async fn due_processes(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<StealProcess>>;
}

/// A lock handed from one holder to the head of its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub previous: DocumentLock,
    pub new_holder: DocumentLock,
    /// Requesters behind the winner; they must re-request.
    pub flushed: Vec<StealRequest>,
    pub cancelled: Option<StealProcess>,
}

/// Result of releasing a holder (voluntarily, on disconnect, or when stale).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released { lock: DocumentLock, cancelled: Option<StealProcess> },
    Transferred(Transfer),
}

impl ReleaseOutcome {
    pub fn document_id(&self) -> Uuid {
        match self {
            Self::Released { lock, .. } => lock.document_id,
            Self::Transferred(transfer) => transfer.previous.document_id,
        }
    }

    pub fn status(&self) -> LockStatus {
        match self {
            Self::Released { lock, .. } => LockStatus::unlocked(lock.document_id),
            Self::Transferred(transfer) => LockStatus::held(transfer.new_holder.clone(), None),
        }
    }
}

/// A registered steal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealRegistration {
    pub holder: DocumentLock,
    pub position: usize,
    /// Current head of the queue after registration.
    pub head: StealRequest,
    /// Set when this registration armed a new countdown.
    pub armed: Option<StealProcess>,
}

/// A second acquire by an account that already holds the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reacquire {
    /// The document was released in the meantime.
    Free,
    HeldByOther(DocumentLock),
    /// Same account and same connection; nothing changed.
    Unchanged(DocumentLock),
    /// Same account from a new connection, which now holds the lock.
    HandedOver { previous: DocumentLock, lock: DocumentLock },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterSteal {
    Registered(StealRegistration),
    NotLocked,
    HeldByRequester,
}

/// Holder refused the steal; the holder keeps the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyOutcome {
    pub holder: DocumentLock,
    pub flushed: Vec<StealRequest>,
    pub cancelled: Option<StealProcess>,
}

/// A requester withdrew its pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub removed: StealRequest,
    /// The removed request owned the armed process.
    pub was_head: bool,
    pub cancelled: Option<StealProcess>,
    /// Fresh countdown armed for the next queued requester.
    pub promoted: Option<StealProcess>,
    pub holder: Option<DocumentLock>,
    /// Head of the queue after removal.
    pub head: Option<StealRequest>,
    /// Waiters dropped because the document is no longer held.
    pub orphaned: Vec<StealRequest>,
}

impl CancelOutcome {
    pub fn status(&self) -> LockStatus {
        match &self.holder {
            Some(holder) => LockStatus::held(holder.clone(), self.head.clone()),
            None => LockStatus::unlocked(self.removed.document_id),
        }
    }
}

/// A steal process torn down after one of its timed steps failed. The holder
/// keeps the lock and every waiter must re-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortOutcome {
    pub process: StealProcess,
    pub holder: Option<DocumentLock>,
    pub flushed: Vec<StealRequest>,
}

pub(crate) fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
}

async fn status_in<T: LockTxn>(txn: &mut T, document_id: Uuid) -> StoreResult<LockStatus> {
    let Some(holder) = txn.lock_row(document_id).await? else {
        return Ok(LockStatus::unlocked(document_id));
    };
    let head = txn.peek_head(document_id).await?;
    Ok(LockStatus::held(holder, head))
}

/// Hand `lock` to the queue head, or clear it when nobody waits. The caller
/// must already hold the lock row.
async fn release_locked_in<T: LockTxn>(
    txn: &mut T,
    lock: DocumentLock,
    now: DateTime<Utc>,
) -> StoreResult<ReleaseOutcome> {
    let document_id = lock.document_id;
    let cancelled = txn.clear_process(document_id, None).await?;

    let Some(head) = txn.dequeue_head(document_id).await? else {
        txn.clear(document_id).await?;
        return Ok(ReleaseOutcome::Released { lock, cancelled });
    };

    let new_holder = DocumentLock::from_request(&head, now);
    txn.replace(&new_holder).await?;
    let flushed = txn.drain(document_id).await?;

    Ok(ReleaseOutcome::Transferred(Transfer { previous: lock, new_holder, flushed, cancelled }))
}

async fn release_holder_in<T: LockTxn>(
    txn: &mut T,
    document_id: Uuid,
    account_id: Uuid,
    connection_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> StoreResult<Option<ReleaseOutcome>> {
    let Some(lock) = txn.lock_row(document_id).await? else {
        return Ok(None);
    };
    if !lock.is_held_by(account_id)
        || connection_id.is_some_and(|connection| connection != lock.holder_connection_id)
    {
        return Ok(None);
    }

    release_locked_in(txn, lock, now).await.map(Some)
}

async fn reclaim_stale_in<T: LockTxn>(
    txn: &mut T,
    document_id: Uuid,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StoreResult<Option<ReleaseOutcome>> {
    match txn.lock_row(document_id).await? {
        Some(lock) if lock.is_stale_at(cutoff) => release_locked_in(txn, lock, now).await.map(Some),
        _ => Ok(None),
    }
}

async fn reacquire_in<T: LockTxn>(
    txn: &mut T,
    candidate: &DocumentLock,
) -> StoreResult<Reacquire> {
    let document_id = candidate.document_id;
    let Some(current) = txn.lock_row(document_id).await? else {
        return Ok(Reacquire::Free);
    };
    if !current.is_held_by(candidate.holder_account_id) {
        return Ok(Reacquire::HeldByOther(current));
    }
    if current.holder_connection_id == candidate.holder_connection_id {
        return Ok(Reacquire::Unchanged(current));
    }

    let lock = DocumentLock {
        holder_connection_id: candidate.holder_connection_id,
        holder_display_name: candidate.holder_display_name.clone(),
        last_heartbeat_at: candidate.last_heartbeat_at,
        ..current.clone()
    };
    txn.replace(&lock).await?;

    // Steal notifications for the holder follow the lock to its new connection.
    if let Some(process) = txn.fetch_process(document_id).await? {
        txn.clear_process(document_id, Some(process.process_id)).await?;
        let moved = StealProcess { holder_connection_id: lock.holder_connection_id, ..process };
        txn.arm_process(&moved).await?;
    }

    Ok(Reacquire::HandedOver { previous: current, lock })
}

async fn register_steal_in<T: LockTxn>(
    txn: &mut T,
    request: StealRequest,
    countdown: Duration,
) -> StoreResult<RegisterSteal> {
    let document_id = request.document_id;
    let Some(holder) = txn.lock_row(document_id).await? else {
        return Ok(RegisterSteal::NotLocked);
    };
    if holder.is_held_by(request.requester_account_id) {
        return Ok(RegisterSteal::HeldByRequester);
    }

    let position = txn.enqueue(&request).await?;
    let head = txn.peek_head(document_id).await?.ok_or_else(|| StoreError::Corrupt {
        detail: format!("queue for document {document_id} is empty right after enqueue"),
    })?;

    let mut armed = None;
    if txn.fetch_process(document_id).await?.is_none() {
        let deadline = deadline_after(request.registered_at, countdown);
        let process = StealProcess::countdown(&holder, &head, deadline);
        if txn.arm_process(&process).await? {
            armed = Some(process);
        }
    }

    Ok(RegisterSteal::Registered(StealRegistration { holder, position, head, armed }))
}

async fn deny_steal_in<T: LockTxn>(
    txn: &mut T,
    document_id: Uuid,
    account_id: Uuid,
) -> StoreResult<Option<DenyOutcome>> {
    let Some(holder) = txn.lock_row(document_id).await? else {
        return Ok(None);
    };
    if !holder.is_held_by(account_id) {
        return Ok(None);
    }

    let cancelled = txn.clear_process(document_id, None).await?;
    let flushed = txn.drain(document_id).await?;
    Ok(Some(DenyOutcome { holder, flushed, cancelled }))
}

async fn cancel_steal_in<T: LockTxn>(
    txn: &mut T,
    document_id: Uuid,
    account_id: Uuid,
    now: DateTime<Utc>,
    countdown: Duration,
) -> StoreResult<Option<CancelOutcome>> {
    let holder = txn.lock_row(document_id).await?;
    let Some(removed) = txn.remove_by_account(document_id, account_id).await? else {
        return Ok(None);
    };

    let process = txn.fetch_process(document_id).await?;
    let was_head =
        process.as_ref().is_some_and(|process| process.head_requester_account_id == account_id);
    let cancelled = match process {
        Some(process) if was_head => {
            txn.clear_process(document_id, Some(process.process_id)).await?
        }
        _ => None,
    };

    let mut head = txn.peek_head(document_id).await?;
    let mut promoted = None;
    let mut orphaned = Vec::new();
    match (&holder, &head) {
        (Some(holder), Some(next)) => {
            if txn.fetch_process(document_id).await?.is_none() {
                let process = StealProcess::countdown(holder, next, deadline_after(now, countdown));
                if txn.arm_process(&process).await? {
                    promoted = Some(process);
                }
            }
        }
        (None, Some(_)) => {
            // Waiters on a free document cannot be served.
            orphaned = txn.drain(document_id).await?;
            head = None;
        }
        _ => {}
    }

    Ok(Some(CancelOutcome { removed, was_head, cancelled, promoted, holder, head, orphaned }))
}

/// Pops the head of the queue as if it had withdrawn, so a process armed for
/// it never outlives its request.
async fn consume_head_in<T: LockTxn>(
    txn: &mut T,
    document_id: Uuid,
    now: DateTime<Utc>,
    countdown: Duration,
) -> StoreResult<Option<CancelOutcome>> {
    txn.lock_row(document_id).await?;
    let Some(head) = txn.peek_head(document_id).await? else {
        return Ok(None);
    };
    cancel_steal_in(txn, document_id, head.requester_account_id, now, countdown).await
}

async fn abort_steal_in<T: LockTxn>(
    txn: &mut T,
    document_id: Uuid,
    process_id: Uuid,
) -> StoreResult<Option<AbortOutcome>> {
    let holder = txn.lock_row(document_id).await?;
    let Some(process) = txn.clear_process(document_id, Some(process_id)).await? else {
        return Ok(None);
    };
    let flushed = txn.drain(document_id).await?;
    Ok(Some(AbortOutcome { process, holder, flushed }))
}

async fn advance_in<T: LockTxn>(
    txn: &mut T,
    document_id: Uuid,
    process_id: Uuid,
    deadline: DateTime<Utc>,
) -> StoreResult<Option<StealProcess>> {
    let holder = txn.lock_row(document_id).await?;
    let head = txn.peek_head(document_id).await?;
    if holder.is_none() || head.is_none() {
        txn.clear_process(document_id, Some(process_id)).await?;
        return Ok(None);
    }

    txn.advance_process(document_id, process_id, deadline).await
}

async fn force_transfer_in<T: LockTxn>(
    txn: &mut T,
    document_id: Uuid,
    process_id: Uuid,
    now: DateTime<Utc>,
) -> StoreResult<Option<Transfer>> {
    let previous = txn.lock_row(document_id).await?;
    let Some(process) = txn.fetch_process(document_id).await? else {
        return Ok(None);
    };
    if process.process_id != process_id || process.phase != StealPhase::Cleanup {
        return Ok(None);
    }

    txn.clear_process(document_id, Some(process_id)).await?;
    let Some(previous) = previous else {
        return Ok(None);
    };
    let Some(head) = txn.dequeue_head(document_id).await? else {
        return Ok(None);
    };

    let new_holder = DocumentLock::from_request(&head, now);
    txn.replace(&new_holder).await?;
    let flushed = txn.drain(document_id).await?;

    Ok(Some(Transfer { previous, new_holder, flushed, cancelled: Some(process) }))
}

/// Runs `$body` with `$txn` bound to an open backend transaction. The
/// Postgres transaction commits only when the body returns `Ok`.
macro_rules! with_txn {
    ($store:expr, |$txn:ident| $body:expr) => {
        match $store {
            LockStore::Memory(store) => {
                let mut guard = store.state().await?;
                let $txn = &mut *guard;
                $body
            }
            LockStore::Postgres(store) => {
                let mut tx = store.pool().begin().await?;
                let result = {
                    let $txn = &mut *tx;
                    $body
                };
                if result.is_ok() {
                    tx.commit().await?;
                }
                result
            }
        }
    };
}

/// The shared lock store, reachable from every relay process.
#[derive(Clone)]
pub enum LockStore {
    Memory(MemoryLockStore),
    Postgres(PostgresLockStore),
}

impl LockStore {
    pub fn memory() -> Self {
        Self::Memory(MemoryLockStore::default())
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self::Postgres(PostgresLockStore::new(pool))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Postgres(_) => "postgres",
        }
    }

    pub async fn get(&self, document_id: Uuid) -> StoreResult<Option<DocumentLock>> {
        with_txn!(self, |txn| txn.lock_row(document_id).await)
    }

    pub async fn try_set(&self, lock: &DocumentLock) -> StoreResult<bool> {
        with_txn!(self, |txn| txn.try_set(lock).await)
    }

    pub async fn replace(&self, lock: &DocumentLock) -> StoreResult<()> {
        with_txn!(self, |txn| txn.replace(lock).await)
    }

    pub async fn clear(&self, document_id: Uuid) -> StoreResult<Option<DocumentLock>> {
        with_txn!(self, |txn| txn.clear(document_id).await)
    }

    pub async fn touch_heartbeat(
        &self,
        document_id: Uuid,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        with_txn!(self, |txn| txn.touch_heartbeat(document_id, account_id, at).await)
    }

    pub async fn enqueue(&self, request: &StealRequest) -> StoreResult<usize> {
        with_txn!(self, |txn| txn.enqueue(request).await)
    }

    pub async fn dequeue_head(&self, document_id: Uuid) -> StoreResult<Option<StealRequest>> {
        with_txn!(self, |txn| txn.dequeue_head(document_id).await)
    }

    pub async fn peek_head(&self, document_id: Uuid) -> StoreResult<Option<StealRequest>> {
        with_txn!(self, |txn| txn.peek_head(document_id).await)
    }

    pub async fn position_of(
        &self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<usize>> {
        with_txn!(self, |txn| txn.position_of(document_id, account_id).await)
    }

    pub async fn remove_by_account(
        &self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<StealRequest>> {
        with_txn!(self, |txn| txn.remove_by_account(document_id, account_id).await)
    }

    pub async fn find_by_connection(&self, connection_id: Uuid) -> StoreResult<Vec<DocumentLock>> {
        with_txn!(self, |txn| txn.find_by_connection(connection_id).await)
    }

    pub async fn requests_by_connection(
        &self,
        connection_id: Uuid,
    ) -> StoreResult<Vec<StealRequest>> {
        with_txn!(self, |txn| txn.requests_by_connection(connection_id).await)
    }

    pub async fn get_process(&self, document_id: Uuid) -> StoreResult<Option<StealProcess>> {
        with_txn!(self, |txn| txn.fetch_process(document_id).await)
    }

    pub async fn due_processes(&self, now: DateTime<Utc>) -> StoreResult<Vec<StealProcess>> {
        with_txn!(self, |txn| txn.due_processes(now).await)
    }

    pub async fn stale_locks(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DocumentLock>> {
        with_txn!(self, |txn| txn.stale_locks(cutoff).await)
    }

    pub async fn status(&self, document_id: Uuid) -> StoreResult<LockStatus> {
        with_txn!(self, |txn| status_in(txn, document_id).await)
    }

    pub async fn release_holder(
        &self,
        document_id: Uuid,
        account_id: Uuid,
        connection_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ReleaseOutcome>> {
        with_txn!(self, |txn| {
            release_holder_in(txn, document_id, account_id, connection_id, now).await
        })
    }

    pub async fn reclaim_stale(
        &self,
        document_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ReleaseOutcome>> {
        with_txn!(self, |txn| reclaim_stale_in(txn, document_id, cutoff, now).await)
    }

    pub async fn reacquire(&self, candidate: &DocumentLock) -> StoreResult<Reacquire> {
        with_txn!(self, |txn| reacquire_in(txn, candidate).await)
    }

    pub async fn register_steal(
        &self,
        request: StealRequest,
        countdown: Duration,
    ) -> StoreResult<RegisterSteal> {
        with_txn!(self, |txn| register_steal_in(txn, request, countdown).await)
    }

    pub async fn deny_steal(
        &self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<DenyOutcome>> {
        with_txn!(self, |txn| deny_steal_in(txn, document_id, account_id).await)
    }

    pub async fn cancel_steal(
        &self,
        document_id: Uuid,
        account_id: Uuid,
        now: DateTime<Utc>,
        countdown: Duration,
    ) -> StoreResult<Option<CancelOutcome>> {
        with_txn!(self, |txn| cancel_steal_in(txn, document_id, account_id, now, countdown).await)
    }

    pub async fn consume_head(
        &self,
        document_id: Uuid,
        now: DateTime<Utc>,
        countdown: Duration,
    ) -> StoreResult<Option<CancelOutcome>> {
        with_txn!(self, |txn| consume_head_in(txn, document_id, now, countdown).await)
    }

    /// Clears `process_id` and flushes the queue, if that process is still
    /// the one armed on the document.
    pub async fn abort_steal(
        &self,
        document_id: Uuid,
        process_id: Uuid,
    ) -> StoreResult<Option<AbortOutcome>> {
        with_txn!(self, |txn| abort_steal_in(txn, document_id, process_id).await)
    }

    pub async fn advance_process(
        &self,
        document_id: Uuid,
        process_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> StoreResult<Option<StealProcess>> {
        with_txn!(self, |txn| advance_in(txn, document_id, process_id, deadline).await)
    }

    pub async fn force_transfer(
        &self,
        document_id: Uuid,
        process_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Transfer>> {
        with_txn!(self, |txn| force_transfer_in(txn, document_id, process_id, now).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doclock_common::types::Actor;

    fn actor(name: &str) -> Actor {
        Actor {
            account_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            display_name: name.to_string(),
            workspace_id: Uuid::nil(),
        }
    }

    async fn held(store: &LockStore, holder: &Actor) -> Uuid {
        let document_id = Uuid::new_v4();
        let lock = DocumentLock::for_actor(document_id, holder, Utc::now());
        assert!(store.try_set(&lock).await.expect("try_set should succeed"));
        document_id
    }

    async fn register(
        store: &LockStore,
        document_id: Uuid,
        requester: &Actor,
    ) -> StealRegistration {
        let request = StealRequest::for_actor(document_id, requester, Utc::now());
        match store
            .register_steal(request, Duration::from_secs(30))
            .await
            .expect("register should succeed")
        {
            RegisterSteal::Registered(registration) => registration,
            other => panic!("expected registration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn try_set_only_succeeds_on_free_document() {
        let store = LockStore::memory();
        let holder = actor("H");
        let document_id = held(&store, &holder).await;

        let rival = DocumentLock::for_actor(document_id, &actor("R"), Utc::now());
        assert!(!store.try_set(&rival).await.expect("try_set should not fail"));
        let current = store.get(document_id).await.expect("get should succeed").expect("held");
        assert!(current.is_held_by(holder.account_id));
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_account_and_fifo() {
        let store = LockStore::memory();
        let document_id = Uuid::new_v4();
        let first = actor("A");
        let second = actor("B");

        let a = StealRequest::for_actor(document_id, &first, Utc::now());
        let b = StealRequest::for_actor(document_id, &second, Utc::now());
        assert_eq!(store.enqueue(&a).await.expect("enqueue"), 1);
        assert_eq!(store.enqueue(&b).await.expect("enqueue"), 2);
        assert_eq!(store.enqueue(&a).await.expect("re-enqueue"), 1);

        let head = store.dequeue_head(document_id).await.expect("dequeue").expect("head");
        assert_eq!(head.requester_account_id, first.account_id);
        assert_eq!(store.position_of(document_id, second.account_id).await.expect("pos"), Some(1));
    }

    #[tokio::test]
    async fn first_registration_arms_exactly_one_process() {
        let store = LockStore::memory();
        let document_id = held(&store, &actor("H")).await;

        let first = register(&store, document_id, &actor("R1")).await;
        let second = register(&store, document_id, &actor("R2")).await;

        let armed = first.armed.expect("first registration should arm a countdown");
        assert_eq!(armed.phase, StealPhase::Countdown);
        assert_eq!(first.position, 1);
        assert!(second.armed.is_none());
        assert_eq!(second.position, 2);
        assert_eq!(second.head, first.head);
        assert_eq!(
            store.get_process(document_id).await.expect("process").map(|p| p.process_id),
            Some(armed.process_id)
        );
    }

    #[tokio::test]
    async fn registration_against_free_or_own_lock_is_rejected() {
        let store = LockStore::memory();
        let holder = actor("H");
        let request = StealRequest::for_actor(Uuid::new_v4(), &holder, Utc::now());
        assert_eq!(
            store.register_steal(request, Duration::from_secs(30)).await.expect("register"),
            RegisterSteal::NotLocked
        );

        let document_id = held(&store, &holder).await;
        let own = StealRequest::for_actor(document_id, &holder, Utc::now());
        assert_eq!(
            store.register_steal(own, Duration::from_secs(30)).await.expect("register"),
            RegisterSteal::HeldByRequester
        );
        assert_eq!(store.peek_head(document_id).await.expect("peek"), None);
    }

    #[tokio::test]
    async fn release_with_queue_transfers_to_head_and_drains_rest() {
        let store = LockStore::memory();
        let holder = actor("H");
        let document_id = held(&store, &holder).await;
        let r1 = actor("R1");
        let r2 = actor("R2");
        register(&store, document_id, &r1).await;
        register(&store, document_id, &r2).await;

        let outcome = store
            .release_holder(document_id, holder.account_id, None, Utc::now())
            .await
            .expect("release should succeed")
            .expect("holder should be able to release");

        let ReleaseOutcome::Transferred(transfer) = outcome else {
            panic!("expected transfer, got {outcome:?}");
        };
        assert!(transfer.new_holder.is_held_by(r1.account_id));
        assert_eq!(transfer.flushed.len(), 1);
        assert_eq!(transfer.flushed[0].requester_account_id, r2.account_id);
        assert!(transfer.cancelled.is_some());
        assert_eq!(store.peek_head(document_id).await.expect("peek"), None);
        assert_eq!(store.get_process(document_id).await.expect("process"), None);
    }

    #[tokio::test]
    async fn release_by_other_connection_of_holder_is_refused_on_disconnect_path() {
        let store = LockStore::memory();
        let holder = actor("H");
        let document_id = held(&store, &holder).await;

        let refused = store
            .release_holder(document_id, holder.account_id, Some(Uuid::new_v4()), Utc::now())
            .await
            .expect("release should not fail");
        assert!(refused.is_none());
        assert!(store.get(document_id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn cancel_of_head_promotes_next_with_fresh_process() {
        let store = LockStore::memory();
        let document_id = held(&store, &actor("H")).await;
        let r1 = actor("R1");
        let r2 = actor("R2");
        let first = register(&store, document_id, &r1).await;
        register(&store, document_id, &r2).await;
        let original = first.armed.expect("armed");

        let outcome = store
            .cancel_steal(document_id, r1.account_id, Utc::now(), Duration::from_secs(30))
            .await
            .expect("cancel should succeed")
            .expect("request should exist");

        assert!(outcome.was_head);
        assert_eq!(outcome.cancelled.map(|p| p.process_id), Some(original.process_id));
        let promoted = outcome.promoted.expect("next requester should be promoted");
        assert_ne!(promoted.process_id, original.process_id);
        assert_eq!(promoted.head_requester_account_id, r2.account_id);
        assert_eq!(promoted.phase, StealPhase::Countdown);
    }

    #[tokio::test]
    async fn cancel_of_non_head_leaves_process_untouched() {
        let store = LockStore::memory();
        let document_id = held(&store, &actor("H")).await;
        let r1 = actor("R1");
        let r2 = actor("R2");
        let first = register(&store, document_id, &r1).await;
        register(&store, document_id, &r2).await;

        let outcome = store
            .cancel_steal(document_id, r2.account_id, Utc::now(), Duration::from_secs(30))
            .await
            .expect("cancel should succeed")
            .expect("request should exist");

        assert!(!outcome.was_head);
        assert!(outcome.cancelled.is_none());
        assert!(outcome.promoted.is_none());
        assert_eq!(
            store.get_process(document_id).await.expect("process").map(|p| p.process_id),
            first.armed.map(|p| p.process_id)
        );
    }

    #[tokio::test]
    async fn cancel_on_released_document_reports_orphaned_waiters() {
        let store = LockStore::memory();
        let document_id = held(&store, &actor("H")).await;
        let r1 = actor("R1");
        let r2 = actor("R2");
        register(&store, document_id, &r1).await;
        register(&store, document_id, &r2).await;
        store.clear(document_id).await.expect("clear lock row");

        let outcome = store
            .cancel_steal(document_id, r1.account_id, Utc::now(), Duration::from_secs(30))
            .await
            .expect("cancel should succeed")
            .expect("request should exist");

        assert!(outcome.head.is_none());
        assert_eq!(
            outcome.orphaned.iter().map(|r| r.requester_account_id).collect::<Vec<_>>(),
            vec![r2.account_id]
        );
        assert!(store.peek_head(document_id).await.expect("peek").is_none());
    }

    #[tokio::test]
    async fn consume_head_retires_its_process_and_promotes_next() {
        let store = LockStore::memory();
        let document_id = held(&store, &actor("H")).await;
        let r1 = actor("R1");
        let r2 = actor("R2");
        let original = register(&store, document_id, &r1).await.armed.expect("armed");
        register(&store, document_id, &r2).await;

        let outcome = store
            .consume_head(document_id, Utc::now(), Duration::from_secs(30))
            .await
            .expect("consume should succeed")
            .expect("queue should have a head");

        assert_eq!(outcome.removed.requester_account_id, r1.account_id);
        assert_eq!(outcome.cancelled.map(|p| p.process_id), Some(original.process_id));
        let current = store.get_process(document_id).await.expect("process").expect("promoted");
        assert_ne!(current.process_id, original.process_id);
        assert_eq!(current.head_requester_account_id, r2.account_id);

        store
            .consume_head(document_id, Utc::now(), Duration::from_secs(30))
            .await
            .expect("consume should succeed")
            .expect("second head");
        assert!(store.get_process(document_id).await.expect("process").is_none());
        assert!(store
            .consume_head(document_id, Utc::now(), Duration::from_secs(30))
            .await
            .expect("consume should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn abort_steal_flushes_queue_only_for_current_process() {
        let store = LockStore::memory();
        let holder = actor("H");
        let document_id = held(&store, &holder).await;
        let process = register(&store, document_id, &actor("R1")).await.armed.expect("armed");
        register(&store, document_id, &actor("R2")).await;

        assert!(store.abort_steal(document_id, Uuid::new_v4()).await.expect("abort").is_none());
        let position = store.position_of(document_id, process.head_requester_account_id).await;
        assert_eq!(position.expect("position"), Some(1));

        let outcome = store
            .abort_steal(document_id, process.process_id)
            .await
            .expect("abort should succeed")
            .expect("process should be current");

        assert_eq!(outcome.process.process_id, process.process_id);
        assert_eq!(outcome.flushed.len(), 2);
        assert!(outcome.holder.expect("holder").is_held_by(holder.account_id));
        assert!(store.get_process(document_id).await.expect("process").is_none());
        assert!(store.peek_head(document_id).await.expect("peek").is_none());
        let current = store.get(document_id).await.expect("get").expect("still held");
        assert!(current.is_held_by(holder.account_id));
    }

    #[tokio::test]
    async fn reacquire_from_new_connection_moves_lock_and_process() {
        let store = LockStore::memory();
        let holder = actor("H");
        let document_id = held(&store, &holder).await;
        register(&store, document_id, &actor("R1")).await;
        let second = Actor { connection_id: Uuid::new_v4(), ..holder.clone() };

        let same = DocumentLock::for_actor(document_id, &holder, Utc::now());
        assert!(matches!(
            store.reacquire(&same).await.expect("reacquire"),
            Reacquire::Unchanged(_)
        ));

        let candidate = DocumentLock::for_actor(document_id, &second, Utc::now());
        let Reacquire::HandedOver { previous, lock } =
            store.reacquire(&candidate).await.expect("reacquire")
        else {
            panic!("expected handover");
        };

        assert_eq!(previous.holder_connection_id, holder.connection_id);
        assert_eq!(lock.holder_connection_id, second.connection_id);
        assert_eq!(lock.acquired_at, previous.acquired_at);
        assert!(store.find_by_connection(holder.connection_id).await.expect("find").is_empty());
        let process = store.get_process(document_id).await.expect("process").expect("armed");
        assert_eq!(process.holder_connection_id, second.connection_id);

        let other = DocumentLock::for_actor(document_id, &actor("X"), Utc::now());
        assert!(matches!(
            store.reacquire(&other).await.expect("reacquire"),
            Reacquire::HeldByOther(_)
        ));
    }

    #[tokio::test]
    async fn force_transfer_requires_matching_process_in_cleanup() {
        let store = LockStore::memory();
        let document_id = held(&store, &actor("H")).await;
        let r1 = actor("R1");
        let process = register(&store, document_id, &r1).await.armed.expect("armed");
        let now = Utc::now();

        assert!(store
            .force_transfer(document_id, process.process_id, now)
            .await
            .expect("force")
            .is_none());
        assert!(store
            .advance_process(document_id, Uuid::new_v4(), now)
            .await
            .expect("advance")
            .is_none());

        let cleanup = store
            .advance_process(document_id, process.process_id, now)
            .await
            .expect("advance")
            .expect("countdown should advance");
        assert_eq!(cleanup.phase, StealPhase::Cleanup);
        assert!(store
            .advance_process(document_id, process.process_id, now)
            .await
            .expect("advance")
            .is_none());

        let transfer = store
            .force_transfer(document_id, process.process_id, now)
            .await
            .expect("force")
            .expect("cleanup should transfer");
        assert!(transfer.new_holder.is_held_by(r1.account_id));
        assert!(store
            .force_transfer(document_id, process.process_id, now)
            .await
            .expect("force")
            .is_none());
    }

    #[tokio::test]
    async fn offline_memory_store_reports_unavailable() {
        let memory = MemoryLockStore::default();
        let store = LockStore::Memory(memory.clone());
        memory.set_offline(true);

        let error = store.get(Uuid::new_v4()).await.expect_err("offline store should fail");
        assert!(matches!(error, StoreError::Offline));

        memory.set_offline(false);
        assert!(store.get(Uuid::new_v4()).await.expect("store back online").is_none());
    }
}
