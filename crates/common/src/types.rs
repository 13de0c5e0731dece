// Core lock domain types shared by the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authenticated identity of the connection issuing a lock command.
///
/// Supplied by the upstream gateway; the lock core trusts it as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub account_id: Uuid,
    pub connection_id: Uuid,
    pub display_name: String,
    pub workspace_id: Uuid,
}

/// The single-writer lock held on a document.
///
/// At most one exists per `document_id`; absence means the document is free.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentLock {
    pub document_id: Uuid,
    pub holder_account_id: Uuid,
    pub holder_connection_id: Uuid,
    pub holder_display_name: String,
    pub workspace_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl DocumentLock {
    /// A fresh lock for `holder`, acquired and heartbeated at `now`.
    pub fn for_actor(document_id: Uuid, holder: &Actor, now: DateTime<Utc>) -> Self {
        Self {
            document_id,
            holder_account_id: holder.account_id,
            holder_connection_id: holder.connection_id,
            holder_display_name: holder.display_name.clone(),
            workspace_id: holder.workspace_id,
            acquired_at: now,
            last_heartbeat_at: now,
        }
    }

    /// The lock a queued requester receives when it wins a transfer.
    pub fn from_request(request: &StealRequest, now: DateTime<Utc>) -> Self {
        Self {
            document_id: request.document_id,
            holder_account_id: request.requester_account_id,
            holder_connection_id: request.requester_connection_id,
            holder_display_name: request.requester_display_name.clone(),
            workspace_id: request.workspace_id,
            acquired_at: now,
            last_heartbeat_at: now,
        }
    }

    pub fn is_held_by(&self, account_id: Uuid) -> bool {
        self.holder_account_id == account_id
    }

    pub fn is_stale_at(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_heartbeat_at < cutoff
    }
}

/// A pending request to take over a held lock. Queued FIFO per document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StealRequest {
    pub document_id: Uuid,
    pub requester_account_id: Uuid,
    pub requester_connection_id: Uuid,
    pub requester_display_name: String,
    pub workspace_id: Uuid,
    pub registered_at: DateTime<Utc>,
}

impl StealRequest {
    pub fn for_actor(document_id: Uuid, requester: &Actor, now: DateTime<Utc>) -> Self {
        Self {
            document_id,
            requester_account_id: requester.account_id,
            requester_connection_id: requester.connection_id,
            requester_display_name: requester.display_name.clone(),
            workspace_id: requester.workspace_id,
            registered_at: now,
        }
    }
}

/// Phase of an armed steal process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StealPhase {
    /// The holder may still deny or release; the head may still cancel.
    Countdown,
    /// Forced switch is imminent.
    Cleanup,
}

impl StealPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Countdown => "countdown",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "countdown" => Some(Self::Countdown),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }
}

/// The timed takeover currently running against a document.
///
/// `process_id` identifies one arming; a timer only acts on the process it
/// was armed for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StealProcess {
    pub document_id: Uuid,
    pub process_id: Uuid,
    pub phase: StealPhase,
    pub head_requester_account_id: Uuid,
    pub head_requester_connection_id: Uuid,
    pub holder_connection_id: Uuid,
    pub deadline: DateTime<Utc>,
}

impl StealProcess {
    /// A new countdown for `head` against the current `holder`.
    pub fn countdown(
        holder: &DocumentLock,
        head: &StealRequest,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            document_id: holder.document_id,
            process_id: Uuid::new_v4(),
            phase: StealPhase::Countdown,
            head_requester_account_id: head.requester_account_id,
            head_requester_connection_id: head.requester_connection_id,
            holder_connection_id: holder.holder_connection_id,
            deadline,
        }
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }
}

/// Lock mode reported by status queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Standard,
    None,
}

/// Snapshot of a document's lock for status queries and `lock:status-changed`.
///
/// `steal_request` is the head of the queue only, never the full queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockStatus {
    pub document_id: Uuid,
    pub mode: LockMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<DocumentLock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steal_request: Option<StealRequest>,
}

impl LockStatus {
    pub fn unlocked(document_id: Uuid) -> Self {
        Self { document_id, mode: LockMode::None, holder: None, steal_request: None }
    }

    pub fn held(holder: DocumentLock, steal_request: Option<StealRequest>) -> Self {
        Self {
            document_id: holder.document_id,
            mode: LockMode::Standard,
            holder: Some(holder),
            steal_request,
        }
    }

    pub fn holder_account_id(&self) -> Option<Uuid> {
        self.holder.as_ref().map(|lock| lock.holder_account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(name: &str) -> Actor {
        Actor {
            account_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            display_name: name.to_string(),
            workspace_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn lock_from_request_copies_requester_identity() {
        let requester = actor("Ada");
        let document_id = Uuid::new_v4();
        let now = Utc::now();
        let request = StealRequest::for_actor(document_id, &requester, now);

        let lock = DocumentLock::from_request(&request, now);

        assert!(lock.is_held_by(requester.account_id));
        assert_eq!(lock.holder_connection_id, requester.connection_id);
        assert_eq!(lock.holder_display_name, "Ada");
        assert_eq!(lock.acquired_at, lock.last_heartbeat_at);
    }

    #[test]
    fn steal_phase_round_trips_through_storage_strings() {
        for phase in [StealPhase::Countdown, StealPhase::Cleanup] {
            assert_eq!(StealPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(StealPhase::parse("none"), None);
    }

    #[test]
    fn unlocked_status_omits_holder_fields_on_the_wire() {
        let status = LockStatus::unlocked(Uuid::nil());
        let json = serde_json::to_value(&status).expect("status should serialize");

        assert_eq!(json["mode"], "none");
        assert!(json.get("holder").is_none());
        assert!(json.get("steal_request").is_none());
    }

    #[test]
    fn staleness_compares_last_heartbeat_against_cutoff() {
        let now = Utc::now();
        let lock = DocumentLock::for_actor(Uuid::new_v4(), &actor("Grace"), now);

        assert!(lock.is_stale_at(now + chrono::Duration::seconds(1)));
        assert!(!lock.is_stale_at(now));
    }
}
