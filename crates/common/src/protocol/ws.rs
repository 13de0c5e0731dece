// WebSocket message types for the doclock-lock.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DocumentLock, LockStatus};

pub const CURRENT_PROTOCOL_VERSION: &str = "doclock-lock.v1";

/// Client -> Server frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join the document's room and receive its current `lock:status`.
    #[serde(rename = "join")]
    Join { document_id: Uuid },

    /// Request the standard lock. Optional fields override the gateway identity
    /// for the lock record only.
    #[serde(rename = "lock:request")]
    RequestLock {
        document_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_id: Option<Uuid>,
    },

    #[serde(rename = "lock:release")]
    ReleaseLock { document_id: Uuid },

    #[serde(rename = "lock:heartbeat")]
    Heartbeat { document_id: Uuid },

    #[serde(rename = "lock:steal-request")]
    RequestSteal { document_id: Uuid },

    #[serde(rename = "lock:steal-deny")]
    DenySteal { document_id: Uuid },

    #[serde(rename = "lock:steal-cancel")]
    CancelSteal { document_id: Uuid },

    #[serde(rename = "lock:early-release")]
    EarlyRelease { document_id: Uuid },
}

impl ClientMessage {
    pub fn document_id(&self) -> Uuid {
        match self {
            Self::Join { document_id }
            | Self::RequestLock { document_id, .. }
            | Self::ReleaseLock { document_id }
            | Self::Heartbeat { document_id }
            | Self::RequestSteal { document_id }
            | Self::DenySteal { document_id }
            | Self::CancelSteal { document_id }
            | Self::EarlyRelease { document_id } => *document_id,
        }
    }
}

/// Why an acquire was refused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Another account holds the lock.
    Held,
    /// The lock store could not confirm the document is free.
    Unavailable,
}

/// Server -> Client frames, sent to one connection or a document's room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum LockEvent {
    /// Reply to `join`.
    #[serde(rename = "lock:status")]
    Status { status: LockStatus },

    #[serde(rename = "lock:granted")]
    Granted { lock: DocumentLock },

    #[serde(rename = "lock:denied")]
    Denied {
        document_id: Uuid,
        reason: DenialReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_lock: Option<DocumentLock>,
    },

    #[serde(rename = "lock:released")]
    Released { document_id: Uuid },

    /// Room broadcast after every state-changing outcome.
    #[serde(rename = "lock:status-changed")]
    StatusChanged { status: LockStatus },

    /// 1-based position of a request behind the active head.
    #[serde(rename = "lock:steal-queued")]
    StealQueued { document_id: Uuid, position: usize },

    /// To the head requester when its countdown starts.
    #[serde(rename = "lock:steal-countdown")]
    StealCountdown { document_id: Uuid, seconds: u64 },

    /// To the holder when a countdown starts against it.
    #[serde(rename = "lock:steal-attempt")]
    StealAttempt { document_id: Uuid, seconds: u64, requester_display_name: String },

    /// To both parties when the forced switch is imminent.
    #[serde(rename = "lock:steal-cleanup")]
    StealCleanup { document_id: Uuid, seconds: u64 },

    #[serde(rename = "lock:steal-cancelled")]
    StealCancelled { document_id: Uuid },

    #[serde(rename = "lock:steal-failed")]
    StealFailed { document_id: Uuid, message: String },

    /// To a holder whose lock was taken over or reclaimed.
    #[serde(rename = "lock:lost")]
    Lost {
        document_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_holder: Option<DocumentLock>,
    },

    #[serde(rename = "lock:error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        document_id: Option<Uuid>,
        message: String,
    },
}

impl LockEvent {
    pub fn error(document_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self::Error { document_id, message: message.into() }
    }

    pub fn document_id(&self) -> Option<Uuid> {
        match self {
            Self::Status { status } | Self::StatusChanged { status } => Some(status.document_id),
            Self::Granted { lock } => Some(lock.document_id),
            Self::Denied { document_id, .. }
            | Self::Released { document_id }
            | Self::StealQueued { document_id, .. }
            | Self::StealCountdown { document_id, .. }
            | Self::StealAttempt { document_id, .. }
            | Self::StealCleanup { document_id, .. }
            | Self::StealCancelled { document_id }
            | Self::StealFailed { document_id, .. }
            | Self::Lost { document_id, .. } => Some(*document_id),
            Self::Error { document_id, .. } => *document_id,
        }
    }

    /// Wire name of the event, e.g. `lock:granted`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "lock:status",
            Self::Granted { .. } => "lock:granted",
            Self::Denied { .. } => "lock:denied",
            Self::Released { .. } => "lock:released",
            Self::StatusChanged { .. } => "lock:status-changed",
            Self::StealQueued { .. } => "lock:steal-queued",
            Self::StealCountdown { .. } => "lock:steal-countdown",
            Self::StealAttempt { .. } => "lock:steal-attempt",
            Self::StealCleanup { .. } => "lock:steal-cleanup",
            Self::StealCancelled { .. } => "lock:steal-cancelled",
            Self::StealFailed { .. } => "lock:steal-failed",
            Self::Lost { .. } => "lock:lost",
            Self::Error { .. } => "lock:error",
        }
    }
}
