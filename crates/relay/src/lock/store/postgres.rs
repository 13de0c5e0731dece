// Postgres-backed lock store shared by every relay replica.

use chrono::{DateTime, Utc};
use doclock_common::types::{DocumentLock, StealPhase, StealProcess, StealRequest};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{LockTxn, StoreError, StoreResult};

#[derive(Clone)]
pub struct PostgresLockStore {
    pool: PgPool,
}

impl PostgresLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct LockRow {
    document_id: Uuid,
    holder_account_id: Uuid,
    holder_connection_id: Uuid,
    holder_display_name: String,
    workspace_id: Uuid,
    acquired_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
}

impl From<LockRow> for DocumentLock {
    fn from(row: LockRow) -> Self {
        Self {
            document_id: row.document_id,
            holder_account_id: row.holder_account_id,
            holder_connection_id: row.holder_connection_id,
            holder_display_name: row.holder_display_name,
            workspace_id: row.workspace_id,
            acquired_at: row.acquired_at,
            last_heartbeat_at: row.last_heartbeat_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    document_id: Uuid,
    requester_account_id: Uuid,
    requester_connection_id: Uuid,
    requester_display_name: String,
    workspace_id: Uuid,
    registered_at: DateTime<Utc>,
}

impl From<RequestRow> for StealRequest {
    fn from(row: RequestRow) -> Self {
        Self {
            document_id: row.document_id,
            requester_account_id: row.requester_account_id,
            requester_connection_id: row.requester_connection_id,
            requester_display_name: row.requester_display_name,
            workspace_id: row.workspace_id,
            registered_at: row.registered_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProcessRow {
    document_id: Uuid,
    process_id: Uuid,
    phase: String,
    head_requester_account_id: Uuid,
    head_requester_connection_id: Uuid,
    holder_connection_id: Uuid,
    deadline: DateTime<Utc>,
}

impl TryFrom<ProcessRow> for StealProcess {
    type Error = StoreError;

    fn try_from(row: ProcessRow) -> Result<Self, Self::Error> {
        let phase = StealPhase::parse(&row.phase).ok_or_else(|| StoreError::Corrupt {
            detail: format!(
                "steal process {} has unknown phase `{}`",
                row.process_id, row.phase
            ),
        })?;
        Ok(Self {
            document_id: row.document_id,
            process_id: row.process_id,
            phase,
            head_requester_account_id: row.head_requester_account_id,
            head_requester_connection_id: row.head_requester_connection_id,
            holder_connection_id: row.holder_connection_id,
            deadline: row.deadline,
        })
    }
}

fn processes(rows: Vec<ProcessRow>) -> StoreResult<Vec<StealProcess>> {
    rows.into_iter().map(StealProcess::try_from).collect()
}

const LOCK_COLUMNS: &str = "document_id, holder_account_id, holder_connection_id, \
     holder_display_name, workspace_id, acquired_at, last_heartbeat_at";
const REQUEST_COLUMNS: &str = "document_id, requester_account_id, requester_connection_id, \
     requester_display_name, workspace_id, registered_at";
const PROCESS_COLUMNS: &str = "document_id, process_id, phase, head_requester_account_id, \
     head_requester_connection_id, holder_connection_id, deadline";

impl LockTxn for PgConnection {
    async fn lock_row(&mut self, document_id: Uuid) -> StoreResult<Option<DocumentLock>> {
        let row = sqlx::query_as::<_, LockRow>(&format!(
            "SELECT {LOCK_COLUMNS} FROM document_locks WHERE document_id = $1 FOR UPDATE"
        ))
        .bind(document_id)
        .fetch_optional(&mut *self)
        .await?;
        Ok(row.map(DocumentLock::from))
    }

    async fn try_set(&mut self, lock: &DocumentLock) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO document_locks (
                document_id, holder_account_id, holder_connection_id,
                holder_display_name, workspace_id, acquired_at, last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (document_id) DO NOTHING
            "#,
        )
        .bind(lock.document_id)
        .bind(lock.holder_account_id)
        .bind(lock.holder_connection_id)
        .bind(&lock.holder_display_name)
        .bind(lock.workspace_id)
        .bind(lock.acquired_at)
        .bind(lock.last_heartbeat_at)
        .execute(&mut *self)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace(&mut self, lock: &DocumentLock) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO document_locks (
                document_id, holder_account_id, holder_connection_id,
                holder_display_name, workspace_id, acquired_at, last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (document_id) DO UPDATE
            SET holder_account_id = EXCLUDED.holder_account_id,
                holder_connection_id = EXCLUDED.holder_connection_id,
                holder_display_name = EXCLUDED.holder_display_name,
                workspace_id = EXCLUDED.workspace_id,
                acquired_at = EXCLUDED.acquired_at,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            "#,
        )
        .bind(lock.document_id)
        .bind(lock.holder_account_id)
        .bind(lock.holder_connection_id)
        .bind(&lock.holder_display_name)
        .bind(lock.workspace_id)
        .bind(lock.acquired_at)
        .bind(lock.last_heartbeat_at)
        .execute(&mut *self)
        .await?;
        Ok(())
    }

    async fn clear(&mut self, document_id: Uuid) -> StoreResult<Option<DocumentLock>> {
        let row = sqlx::query_as::<_, LockRow>(&format!(
            "DELETE FROM document_locks WHERE document_id = $1 RETURNING {LOCK_COLUMNS}"
        ))
        .bind(document_id)
        .fetch_optional(&mut *self)
        .await?;
        Ok(row.map(DocumentLock::from))
    }

    async fn touch_heartbeat(
        &mut self,
        document_id: Uuid,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE document_locks
            SET last_heartbeat_at = $3
            WHERE document_id = $1
              AND holder_account_id = $2
            "#,
        )
        .bind(document_id)
        .bind(account_id)
        .bind(at)
        .execute(&mut *self)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_by_connection(&mut self, connection_id: Uuid) -> StoreResult<Vec<DocumentLock>> {
        let rows = sqlx::query_as::<_, LockRow>(&format!(
            "SELECT {LOCK_COLUMNS} FROM document_locks WHERE holder_connection_id = $1"
        ))
        .bind(connection_id)
        .fetch_all(&mut *self)
        .await?;
        Ok(rows.into_iter().map(DocumentLock::from).collect())
    }

    async fn stale_locks(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DocumentLock>> {
        let rows = sqlx::query_as::<_, LockRow>(&format!(
            "SELECT {LOCK_COLUMNS} FROM document_locks WHERE last_heartbeat_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&mut *self)
        .await?;
        Ok(rows.into_iter().map(DocumentLock::from).collect())
    }

    async fn enqueue(&mut self, request: &StealRequest) -> StoreResult<usize> {
        sqlx::query(
            r#"
            INSERT INTO steal_requests (
                document_id, requester_account_id, requester_connection_id,
                requester_display_name, workspace_id, registered_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (document_id, requester_account_id) DO NOTHING
            "#,
        )
        .bind(request.document_id)
        .bind(request.requester_account_id)
        .bind(request.requester_connection_id)
        .bind(&request.requester_display_name)
        .bind(request.workspace_id)
        .bind(request.registered_at)
        .execute(&mut *self)
        .await?;

        self.position_of(request.document_id, request.requester_account_id).await?.ok_or_else(
            || StoreError::Corrupt {
                detail: format!(
                    "steal request for account {} vanished after enqueue",
                    request.requester_account_id
                ),
            },
        )
    }

    async fn dequeue_head(&mut self, document_id: Uuid) -> StoreResult<Option<StealRequest>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            DELETE FROM steal_requests
            WHERE seq = (
                SELECT seq FROM steal_requests
                WHERE document_id = $1
                ORDER BY seq
                LIMIT 1
                FOR UPDATE
            )
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(document_id)
        .fetch_optional(&mut *self)
        .await?;
        Ok(row.map(StealRequest::from))
    }

    async fn peek_head(&mut self, document_id: Uuid) -> StoreResult<Option<StealRequest>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM steal_requests \
             WHERE document_id = $1 ORDER BY seq LIMIT 1"
        ))
        .bind(document_id)
        .fetch_optional(&mut *self)
        .await?;
        Ok(row.map(StealRequest::from))
    }

    async fn position_of(
        &mut self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<usize>> {
        let position = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT position FROM (
                SELECT requester_account_id,
                       ROW_NUMBER() OVER (ORDER BY seq) AS position
                FROM steal_requests
                WHERE document_id = $1
            ) AS ranked
            WHERE requester_account_id = $2
            "#,
        )
        .bind(document_id)
        .bind(account_id)
        .fetch_optional(&mut *self)
        .await?;

        position
            .map(|value| {
                usize::try_from(value).map_err(|_| StoreError::Corrupt {
                    detail: format!("queue position {value} out of range"),
                })
            })
            .transpose()
    }

    async fn remove_by_account(
        &mut self,
        document_id: Uuid,
        account_id: Uuid,
    ) -> StoreResult<Option<StealRequest>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "DELETE FROM steal_requests \
             WHERE document_id = $1 AND requester_account_id = $2 \
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(document_id)
        .bind(account_id)
        .fetch_optional(&mut *self)
        .await?;
        Ok(row.map(StealRequest::from))
    }

    async fn drain(&mut self, document_id: Uuid) -> StoreResult<Vec<StealRequest>> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            WITH drained AS (
                DELETE FROM steal_requests
                WHERE document_id = $1
                RETURNING seq, {REQUEST_COLUMNS}
            )
            SELECT {REQUEST_COLUMNS} FROM drained ORDER BY seq
            "#
        ))
        .bind(document_id)
        .fetch_all(&mut *self)
        .await?;
        Ok(rows.into_iter().map(StealRequest::from).collect())
    }

    async fn requests_by_connection(
        &mut self,
        connection_id: Uuid,
    ) -> StoreResult<Vec<StealRequest>> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM steal_requests \
             WHERE requester_connection_id = $1 ORDER BY seq"
        ))
        .bind(connection_id)
        .fetch_all(&mut *self)
        .await?;
        Ok(rows.into_iter().map(StealRequest::from).collect())
    }

    async fn fetch_process(&mut self, document_id: Uuid) -> StoreResult<Option<StealProcess>> {
        let row = sqlx::query_as::<_, ProcessRow>(&format!(
            "SELECT {PROCESS_COLUMNS} FROM steal_processes WHERE document_id = $1"
        ))
        .bind(document_id)
        .fetch_optional(&mut *self)
        .await?;
        row.map(StealProcess::try_from).transpose()
    }

    async fn arm_process(&mut self, process: &StealProcess) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO steal_processes (
                document_id, process_id, phase, head_requester_account_id,
                head_requester_connection_id, holder_connection_id, deadline
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (document_id) DO NOTHING
            "#,
        )
        .bind(process.document_id)
        .bind(process.process_id)
        .bind(process.phase.as_str())
        .bind(process.head_requester_account_id)
        .bind(process.head_requester_connection_id)
        .bind(process.holder_connection_id)
        .bind(process.deadline)
        .execute(&mut *self)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn advance_process(
        &mut self,
        document_id: Uuid,
        process_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> StoreResult<Option<StealProcess>> {
        let row = sqlx::query_as::<_, ProcessRow>(&format!(
            r#"
            UPDATE steal_processes
            SET phase = $4, deadline = $5
            WHERE document_id = $1
              AND process_id = $2
              AND phase = $3
            RETURNING {PROCESS_COLUMNS}
            "#
        ))
        .bind(document_id)
        .bind(process_id)
        .bind(StealPhase::Countdown.as_str())
        .bind(StealPhase::Cleanup.as_str())
        .bind(deadline)
        .fetch_optional(&mut *self)
        .await?;
        row.map(StealProcess::try_from).transpose()
    }

    async fn clear_process(
        &mut self,
        document_id: Uuid,
        process_id: Option<Uuid>,
    ) -> StoreResult<Option<StealProcess>> {
        let row = sqlx::query_as::<_, ProcessRow>(&format!(
            r#"
            DELETE FROM steal_processes
            WHERE document_id = $1
              AND ($2::UUID IS NULL OR process_id = $2)
            RETURNING {PROCESS_COLUMNS}
            "#
        ))
        .bind(document_id)
        .bind(process_id)
        .fetch_optional(&mut *self)
        .await?;
        row.map(StealProcess::try_from).transpose()
    }

    async fn due_processes(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<StealProcess>> {
        let rows = sqlx::query_as::<_, ProcessRow>(&format!(
            "SELECT {PROCESS_COLUMNS} FROM steal_processes \
             WHERE deadline <= $1 ORDER BY deadline"
        ))
        .bind(now)
        .fetch_all(&mut *self)
        .await?;
        processes(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::migrations::run_migrations;
    use crate::db::pool::{create_pg_pool, PoolConfig};
    use crate::lock::store::{LockStore, RegisterSteal, ReleaseOutcome};
    use doclock_common::types::Actor;

    async fn test_store() -> Option<LockStore> {
        let Some(database_url) = std::env::var("DOCLOCK_RELAY_TEST_DATABASE_URL").ok() else {
            eprintln!(
                "skipping postgres lock store test: set DOCLOCK_RELAY_TEST_DATABASE_URL to run it"
            );
            return None;
        };
        let config = PoolConfig { min_connections: 1, max_connections: 4, ..PoolConfig::default() };
        let pool = create_pg_pool(&database_url, config)
            .await
            .expect("pool should connect to test database");
        run_migrations(&pool).await.expect("migrations should apply");
        Some(LockStore::postgres(pool))
    }

    fn actor(name: &str) -> Actor {
        Actor {
            account_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            display_name: name.to_string(),
            workspace_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn postgres_queue_positions_follow_insertion_order() {
        let Some(store) = test_store().await else {
            return;
        };
        let document_id = Uuid::new_v4();
        let holder = DocumentLock::for_actor(document_id, &actor("H"), Utc::now());
        assert!(store.try_set(&holder).await.expect("try_set"));

        let mut accounts = Vec::new();
        for name in ["R1", "R2", "R3"] {
            let requester = actor(name);
            accounts.push(requester.account_id);
            let request = StealRequest::for_actor(document_id, &requester, Utc::now());
            let RegisterSteal::Registered(registration) = store
                .register_steal(request, Duration::from_secs(30))
                .await
                .expect("register")
            else {
                panic!("holder exists, registration should succeed");
            };
            assert_eq!(registration.position, accounts.len());
        }

        assert_eq!(store.position_of(document_id, accounts[2]).await.expect("position"), Some(3));
        store.remove_by_account(document_id, accounts[0]).await.expect("remove");
        assert_eq!(store.position_of(document_id, accounts[2]).await.expect("position"), Some(2));
    }

    #[tokio::test]
    async fn postgres_release_transfers_and_flushes_atomically() {
        let Some(store) = test_store().await else {
            return;
        };
        let document_id = Uuid::new_v4();
        let owner = actor("H");
        let r1 = actor("R1");
        let r2 = actor("R2");
        store
            .try_set(&DocumentLock::for_actor(document_id, &owner, Utc::now()))
            .await
            .expect("try_set");
        for requester in [&r1, &r2] {
            store
                .register_steal(
                    StealRequest::for_actor(document_id, requester, Utc::now()),
                    Duration::from_secs(30),
                )
                .await
                .expect("register");
        }

        let outcome = store
            .release_holder(document_id, owner.account_id, None, Utc::now())
            .await
            .expect("release")
            .expect("holder should release");

        let ReleaseOutcome::Transferred(transfer) = outcome else {
            panic!("queued requester should receive the lock");
        };
        assert!(transfer.new_holder.is_held_by(r1.account_id));
        assert_eq!(transfer.flushed.len(), 1);
        assert!(store.get_process(document_id).await.expect("process").is_none());
        assert!(store.peek_head(document_id).await.expect("peek").is_none());
    }

    #[tokio::test]
    async fn postgres_concurrent_acquires_grant_exactly_one() {
        let Some(store) = test_store().await else {
            return;
        };
        let document_id = Uuid::new_v4();

        let attempts = (0..8).map(|index| {
            let store = store.clone();
            let contender = actor(&format!("A{index}"));
            let lock = DocumentLock::for_actor(document_id, &contender, Utc::now());
            tokio::spawn(async move { store.try_set(&lock).await })
        });

        let mut granted = 0;
        for attempt in attempts {
            if attempt.await.expect("task should join").expect("try_set") {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }
}
