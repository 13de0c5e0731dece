// In-process lock store for single-relay deployments and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use doclock_common::types::{DocumentLock, StealPhase, StealProcess, StealRequest};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{LockTxn, StoreError, StoreResult};

#[derive(Debug, Default)]
pub(crate) struct MemoryState {
    locks: HashMap<Uuid, DocumentLock>,
    queues: HashMap<Uuid, VecDeque<StealRequest>>,
    processes: HashMap<Uuid, StealProcess>,
}

impl MemoryState {
    fn queue_mut(&mut self, document_id: Uuid) -> Option<&mut VecDeque<StealRequest>> {
        self.queues.get_mut(&document_id)
    }

    fn prune_queue(&mut self, document_id: Uuid) {
        if self.queues.get(&document_id).is_some_and(VecDeque::is_empty) {
            self.queues.remove(&document_id);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryLockStore {
    state: Arc<Mutex<MemoryState>>,
    offline: Arc<AtomicBool>,
}

impl MemoryLockStore {
    /// Simulates an unreachable store; every call fails with `Offline`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) async fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Offline);
        }
        Ok(self.state.lock().await)
    }
}

impl LockTxn for MemoryState {
    async fn lock_row(&mut self, document_id: Uuid) -> StoreResult<Option<DocumentLock>> {
        Ok(self.locks.get(&document_id).cloned())
    }

    async fn try_set(&mut self, lock: &DocumentLock) -> StoreResult<bool> {
        if self.locks.contains_key(&lock.document_id) {
            return Ok(false);
        }
        self.locks.insert(lock.document_id, lock.clone());
        Ok(true)
    }

    async fn replace(&mut self, lock: &DocumentLock) -> StoreResult<()> {
        self.locks.insert(lock.document_id, lock.clone());
        Ok(())
    }

    async fn clear(&mut self, document_id: Uuid) -> StoreResult<Option<DocumentLock>> {
        Ok(self.locks.remove(&document_id))
    }

    async fn touch_heartbeat(
        &mut self,
        document_id: Uuid,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match self.locks.get_mut(&document_id) {
            Some(lock) if lock.is_held_by(account_id) => {
                lock.last_heartbeat_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_connection(&mut self, connection_id: Uuid) -> StoreResult<Vec<DocumentLock>> {
        Ok(self
            .locks
            .values()
            .filter(|lock| lock.holder_connection_id == connection_id)
            .cloned()
            .collect())
    }

    async fn stale_locks(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DocumentLock>> {
        Ok(self.locks.values().filter(|lock| lock.is_stale_at(cutoff)).cloned().collect())
    }

    async fn enqueue(&mut self, request: &StealRequest) -> StoreResult<usize> {
        let queue = self.queues.entry(request.document_id).or_default();
        if let Some(index) = queue
            .iter()
            .position(|queued| queued.requester_account_id == request.requester_account_id)
        {
            return Ok(index + 1);
        }
        queue.push_back(request.clone());
        Ok(queue.len())
    }

    async fn dequeue_head(&mut self, document_id: Uuid) -> StoreResult<Option<StealRequest>> {
        let head = self.queue_mut(document_id).and_then(VecDeque::pop_front);
        self.prune_queue(document_id);
        Ok(head)
    }

    async fn peek_head(&mut self, document_id: Uuid) -> StoreResult<Option<StealRequest>> {
        Ok(self.queues.get(&document_id).and_then(|queue| queue.front().cloned()))
    }

    async fn position_of(
        &mut self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<usize>> {
        Ok(self.queues.get(&document_id).and_then(|queue| {
            queue
                .iter()
                .position(|queued| queued.requester_account_id == account_id)
                .map(|index| index + 1)
        }))
    }

    async fn remove_by_account(
        &mut self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<StealRequest>> {
        let removed = self.queue_mut(document_id).and_then(|queue| {
            let index =
                queue.iter().position(|queued| queued.requester_account_id == account_id)?;
            queue.remove(index)
        });
        self.prune_queue(document_id);
        Ok(removed)
    }

    async fn drain(&mut self, document_id: Uuid) -> StoreResult<Vec<StealRequest>> {
        Ok(self.queues.remove(&document_id).map(Vec::from).unwrap_or_default())
    }

    async fn requests_by_connection(
        &mut self,
        connection_id: Uuid,
    ) -> StoreResult<Vec<StealRequest>> {
        Ok(self
            .queues
            .values()
            .flatten()
            .filter(|request| request.requester_connection_id == connection_id)
            .cloned()
            .collect())
    }

    async fn fetch_process(&mut self, document_id: Uuid) -> StoreResult<Option<StealProcess>> {
        Ok(self.processes.get(&document_id).cloned())
    }

    async fn arm_process(&mut self, process: &StealProcess) -> StoreResult<bool> {
        if self.processes.contains_key(&process.document_id) {
            return Ok(false);
        }
        self.processes.insert(process.document_id, process.clone());
        Ok(true)
    }

    async fn advance_process(
        &mut self,
        document_id: Uuid,
        process_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> StoreResult<Option<StealProcess>> {
        match self.processes.get_mut(&document_id) {
            Some(process)
                if process.process_id == process_id && process.phase == StealPhase::Countdown =>
            {
                process.phase = StealPhase::Cleanup;
                process.deadline = deadline;
                Ok(Some(process.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn clear_process(
        &mut self,
        document_id: Uuid,
        process_id: Option<Uuid>,
    ) -> StoreResult<Option<StealProcess>> {
        let matches = self.processes.get(&document_id).is_some_and(|process| {
            process_id.map_or(true, |expected| process.process_id == expected)
        });
        if !matches {
            return Ok(None);
        }
        Ok(self.processes.remove(&document_id))
    }

    async fn due_processes(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<StealProcess>> {
        let mut due: Vec<StealProcess> =
            self.processes.values().filter(|process| process.is_due_at(now)).cloned().collect();
        due.sort_by_key(|process| process.deadline);
        Ok(due)
    }
}
