// Document single-writer lock: store, coordinator, steal timers, fan-out.

pub mod coordinator;
pub mod notify;
pub mod service;
pub mod steal;
pub mod store;

use std::time::Duration;

use doclock_common::types::DocumentLock;
use uuid::Uuid;

pub use coordinator::LockCoordinator;
pub use notify::{LockNotifier, ReleaseCause};
pub use service::{LockCommand, LockService};
pub use steal::StealOrchestrator;
pub use store::{LockStore, StoreError};

pub const DEFAULT_STEAL_COUNTDOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_STEAL_CLEANUP: Duration = Duration::from_secs(10);

/// Durations of the two timed takeover phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealTimings {
    pub countdown: Duration,
    pub cleanup: Duration,
}

impl Default for StealTimings {
    fn default() -> Self {
        Self { countdown: DEFAULT_STEAL_COUNTDOWN, cleanup: DEFAULT_STEAL_CLEANUP }
    }
}

impl StealTimings {
    pub fn countdown_secs(&self) -> u64 {
        self.countdown.as_secs()
    }

    pub fn cleanup_secs(&self) -> u64 {
        self.cleanup.as_secs()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(
        "document {} is locked by {}",
        current_lock.document_id,
        current_lock.holder_display_name
    )]
    LockDenied { current_lock: Box<DocumentLock> },
    #[error("caller does not hold the lock on document {document_id}")]
    NotHolder { document_id: Uuid },
    #[error("document {document_id} cannot be stolen: {reason}")]
    NotStealable { document_id: Uuid, reason: &'static str },
    #[error("no pending steal request on document {document_id}")]
    NoPendingRequest { document_id: Uuid },
    #[error("lock on document {document_id} changed concurrently; retry")]
    Contended { document_id: Uuid },
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

pub type LockResult<T> = Result<T, LockError>;

impl LockError {
    /// Message sent to clients; store internals are not exposed.
    pub fn client_message(&self) -> String {
        match self {
            Self::StoreUnavailable(_) => "lock store unavailable".to_string(),
            other => other.to_string(),
        }
    }
}
