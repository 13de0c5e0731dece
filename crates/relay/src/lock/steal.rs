// Timed takeover: countdown, then cleanup, then forced transfer.
//
// The persisted `StealProcess` is the source of truth. Local tokio timers are
// a cache of the processes this relay armed; the sweep executes any due
// process nobody here is timing, which covers relays that restarted or died
// mid-countdown. Every timer re-reads the process and acts only if its
// `process_id` and phase still match.
//
// A step that fails aborts its process: the holder keeps the lock and the
// queue is flushed. When the store is down at that point the abort is kept
// here and retried by the sweep, and the process is never stepped again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use doclock_common::types::{StealPhase, StealProcess};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::notify::{LockNotifier, ReleaseCause};
use super::store::{CancelOutcome, ReleaseOutcome};
use super::{LockCoordinator, LockError};
use crate::metrics;

const STEP_FAILED_MESSAGE: &str = "steal could not be completed; the lock store is unavailable";

struct ArmedTimer {
    process: StealProcess,
    handle: AbortHandle,
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub fired: usize,
    pub reclaimed: usize,
    pub aborted: usize,
}

pub struct StealOrchestrator {
    coordinator: LockCoordinator,
    notifier: LockNotifier,
    lock_stale_after: Option<Duration>,
    timers: Mutex<HashMap<Uuid, ArmedTimer>>,
    /// Aborted processes still persisted, by document.
    pending_aborts: Mutex<HashMap<Uuid, StealProcess>>,
}

impl StealOrchestrator {
    pub fn new(
        coordinator: LockCoordinator,
        notifier: LockNotifier,
        lock_stale_after: Option<Duration>,
    ) -> Self {
        Self {
            coordinator,
            notifier,
            lock_stale_after,
            timers: Mutex::new(HashMap::new()),
            pending_aborts: Mutex::new(HashMap::new()),
        }
    }

    fn phase_duration(&self, phase: StealPhase) -> Duration {
        let timings = self.coordinator.timings();
        match phase {
            StealPhase::Countdown => timings.countdown,
            StealPhase::Cleanup => timings.cleanup,
        }
    }

    /// Starts the local timer for `process`, replacing any timer this relay
    /// holds for an older process on the same document.
    pub fn arm(self: &Arc<Self>, process: StealProcess) {
        let delay = self.phase_duration(process.phase);
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = timers.get(&process.document_id) {
            if same_step(&existing.process, &process) {
                return;
            }
            existing.handle.abort();
        }

        let orchestrator = Arc::clone(self);
        let armed = process.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            orchestrator.fire(armed).await;
        })
        .abort_handle();

        debug!(
            document_id = %process.document_id,
            process_id = %process.process_id,
            phase = process.phase.as_str(),
            delay_ms = delay.as_millis() as u64,
            "steal timer armed"
        );
        timers.insert(process.document_id, ArmedTimer { process, handle });
    }

    pub fn disarm(&self, document_id: Uuid) {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&document_id);
        if let Some(timer) = removed {
            timer.handle.abort();
            debug!(
                %document_id,
                process_id = %timer.process.process_id,
                "steal timer disarmed"
            );
        }
    }

    /// The process this relay is currently timing for `document_id`.
    pub fn armed_process(&self, document_id: Uuid) -> Option<StealProcess> {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&document_id)
            .map(|timer| timer.process.clone())
    }

    fn is_timing(&self, process: &StealProcess) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&process.document_id)
            .is_some_and(|timer| same_step(&timer.process, process))
    }

    fn is_aborting(&self, process: &StealProcess) -> bool {
        self.pending_aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&process.document_id)
            .is_some_and(|pending| pending.process_id == process.process_id)
    }

    // Called from inside the timer task, so the entry is dropped without
    // aborting it.
    fn forget(&self, process: &StealProcess) {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if timers.get(&process.document_id).is_some_and(|timer| same_step(&timer.process, process))
        {
            timers.remove(&process.document_id);
        }
    }

    /// Keeps local timers in step with a release: a torn-down process stops.
    pub fn track_release(&self, outcome: &ReleaseOutcome) {
        let cancelled = match outcome {
            ReleaseOutcome::Released { cancelled, .. } => cancelled,
            ReleaseOutcome::Transferred(transfer) => &transfer.cancelled,
        };
        if cancelled.is_some() {
            self.disarm(outcome.document_id());
        }
    }

    pub fn track_cancel(self: &Arc<Self>, outcome: &CancelOutcome) {
        if outcome.cancelled.is_some() {
            self.disarm(outcome.removed.document_id);
        }
        if let Some(promoted) = &outcome.promoted {
            metrics::increment_steals_started();
            self.arm(promoted.clone());
        }
    }

    /// Runs the step `process` was armed for, if it is still current.
    pub async fn fire(self: &Arc<Self>, process: StealProcess) {
        self.forget(&process);
        let document_id = process.document_id;
        if self.is_aborting(&process) {
            debug!(%document_id, process_id = %process.process_id, "steal process awaits teardown");
            return;
        }

        let current = match self.coordinator.steal_process(document_id).await {
            Ok(current) => current,
            Err(error) => {
                self.abort(&process, error).await;
                return;
            }
        };
        let Some(current) = current.filter(|current| same_step(current, &process)) else {
            debug!(
                %document_id,
                process_id = %process.process_id,
                "steal timer outdated, skipping"
            );
            return;
        };

        match current.phase {
            StealPhase::Countdown => match self.coordinator.advance_to_cleanup(&current).await {
                Ok(Some(cleanup)) => {
                    info!(
                        %document_id,
                        process_id = %cleanup.process_id,
                        account_id = %cleanup.head_requester_account_id,
                        "steal cleanup started"
                    );
                    self.notifier.steal_cleanup(&cleanup).await;
                    self.arm(cleanup);
                }
                Ok(None) => debug!(%document_id, "steal process ended before cleanup"),
                Err(error) => self.abort(&current, error).await,
            },
            StealPhase::Cleanup => match self.coordinator.force_transfer(&current).await {
                Ok(Some(transfer)) => {
                    metrics::increment_forced_transfers();
                    self.notifier.transfer(&transfer, ReleaseCause::Forced).await;
                }
                Ok(None) => debug!(%document_id, "steal process ended before forced transfer"),
                Err(error) => self.abort(&current, error).await,
            },
        }
    }

    async fn abort(&self, process: &StealProcess, cause: LockError) {
        metrics::increment_steal_aborts();
        error!(
            document_id = %process.document_id,
            process_id = %process.process_id,
            phase = process.phase.as_str(),
            error = %cause,
            "steal timer step failed"
        );
        self.notifier.steal_aborted(process, STEP_FAILED_MESSAGE).await;
        self.tear_down(process).await;
    }

    /// Removes an aborted process and its queue from the store. On failure
    /// the abort stays pending for the next sweep.
    async fn tear_down(&self, process: &StealProcess) -> bool {
        match self.coordinator.abort_steal_process(process).await {
            Ok(outcome) => {
                self.pending_aborts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&process.document_id);
                if let Some(outcome) = outcome {
                    self.notifier.steal_torn_down(&outcome).await;
                }
                true
            }
            Err(error) => {
                warn!(
                    document_id = %process.document_id,
                    process_id = %process.process_id,
                    error = %error,
                    "failed to tear down steal process; will retry"
                );
                self.pending_aborts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(process.document_id, process.clone());
                false
            }
        }
    }

    async fn retry_aborts(&self) -> usize {
        let pending: Vec<StealProcess> = self
            .pending_aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut torn_down = 0;
        for process in pending {
            if self.tear_down(&process).await {
                torn_down += 1;
            }
        }
        torn_down
    }

    /// One pass: finish pending aborts, run due processes nobody here is
    /// timing, then reclaim locks whose holders stopped heartbeating.
    pub async fn sweep_once(self: &Arc<Self>, now: DateTime<Utc>) -> SweepReport {
        let mut report =
            SweepReport { aborted: self.retry_aborts().await, ..SweepReport::default() };

        match self.coordinator.due_steal_processes(now).await {
            Ok(due) => {
                for process in due {
                    if self.is_timing(&process) || self.is_aborting(&process) {
                        continue;
                    }
                    info!(
                        document_id = %process.document_id,
                        process_id = %process.process_id,
                        phase = process.phase.as_str(),
                        "resuming due steal process"
                    );
                    self.fire(process).await;
                    report.fired += 1;
                }
            }
            Err(error) => warn!(error = %error, "steal sweep could not list due processes"),
        }

        if let Some(stale_after) = self.lock_stale_after {
            match self.coordinator.reclaim_stale_locks(stale_after, now).await {
                Ok(outcomes) => {
                    metrics::increment_stale_reclaims(outcomes.len() as u64);
                    for outcome in &outcomes {
                        self.track_release(outcome);
                        self.notifier.release_outcome(outcome, ReleaseCause::Stale).await;
                    }
                    report.reclaimed = outcomes.len();
                }
                Err(error) => warn!(error = %error, "stale lock sweep failed"),
            }
        }

        report
    }

    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_ms = interval.as_millis() as u64, "steal sweeper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("steal sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once(Utc::now()).await;
                }
            }
        }
    }
}

fn same_step(left: &StealProcess, right: &StealProcess) -> bool {
    left.process_id == right.process_id && left.phase == right.phase
}
