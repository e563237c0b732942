//! Real-time trace replay.
//!
//! The first profile is applied synchronously by [`NetworkConditionScheduler::apply_initial`],
//! which fixes wall-clock zero for the run. The rest of the trace is replayed
//! on a dedicated thread, pacing each update by the timestamp delta to the
//! previous profile.

use crate::session::{lock_session, NetworkConditions, SessionError, SharedSession};
use crate::trace::{NetworkProfile, Trace};
use serde::Serialize;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A profile plus the run-relative time it actually took effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedProfileRecord {
    pub wall_ms: u64,
    #[serde(flatten)]
    pub profile: NetworkProfile,
}

/// Whether the replay may outlive the observation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// The run waits for the whole trace, so it lasts
    /// `max(duration, trace span)`.
    #[default]
    RunToCompletion,
    /// The replay is cancelled when the observation window closes.
    StopAtWindow,
}

impl ReplayPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayPolicy::RunToCompletion => "run_to_completion",
            ReplayPolicy::StopAtWindow => "stop_at_window",
        }
    }
}

/// How the replay ended. Apply failures land here instead of failing the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutcome {
    #[serde(skip)]
    pub applied: Vec<AppliedProfileRecord>,
    pub completed: bool,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub profiles_applied: usize,
    pub profiles_total: usize,
}

impl ReplayOutcome {
    fn finish(
        applied: Vec<AppliedProfileRecord>,
        total: usize,
        cancelled: bool,
        error: Option<String>,
    ) -> Self {
        let profiles_applied = applied.len();
        Self {
            completed: !cancelled && error.is_none() && profiles_applied == total,
            cancelled,
            error,
            profiles_applied,
            profiles_total: total,
            applied,
        }
    }
}

/// Receiving half of a cancellation signal, checked at every suspension
/// point of the replay.
pub struct CancelToken {
    rx: mpsc::Receiver<()>,
}

/// Sending half; `cancel` wakes a sleeping replay immediately. Dropping it
/// without cancelling leaves the replay running to the end.
pub struct Canceller {
    tx: mpsc::Sender<()>,
}

pub fn cancel_pair() -> (Canceller, CancelToken) {
    let (tx, rx) = mpsc::channel();
    (Canceller { tx }, CancelToken { rx })
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.tx.send(());
    }
}

impl CancelToken {
    /// Sleeps for `dur`; returns `true` if cancelled before or during it.
    pub fn sleep(&self, dur: Duration) -> bool {
        let start = Instant::now();
        match self.rx.recv_timeout(dur) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                let remaining = dur.saturating_sub(start.elapsed());
                thread::sleep(remaining);
                false
            }
        }
    }
}

pub struct NetworkConditionScheduler {
    trace: Trace,
    session: SharedSession,
    started: Instant,
}

impl NetworkConditionScheduler {
    pub fn new(trace: Trace, session: SharedSession) -> Self {
        Self {
            trace,
            session,
            started: Instant::now(),
        }
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Resets wall-clock zero and applies `trace[0]`.
    pub fn apply_initial(&mut self) -> Result<AppliedProfileRecord, SessionError> {
        self.started = Instant::now();
        let first = *self.trace.first();
        self.apply(&first)
    }

    fn apply(&self, profile: &NetworkProfile) -> Result<AppliedProfileRecord, SessionError> {
        let conditions = NetworkConditions::from_profile(profile);
        lock_session(&self.session)?.apply_network(&conditions)?;
        Ok(AppliedProfileRecord {
            wall_ms: self.started.elapsed().as_millis() as u64,
            profile: *profile,
        })
    }

    /// Replays `trace[1..]` on the calling thread.
    pub fn replay(
        &self,
        mut applied: Vec<AppliedProfileRecord>,
        cancel: &CancelToken,
    ) -> ReplayOutcome {
        let profiles = self.trace.profiles();
        let total = profiles.len();
        for pair in profiles.windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            let wait_s = (cur.timestamp_s - prev.timestamp_s).max(0.0);
            let wait = Duration::try_from_secs_f64(wait_s).unwrap_or(Duration::MAX);
            if cancel.sleep(wait) {
                info!(
                    applied = applied.len(),
                    total, "trace replay cancelled at observation window boundary"
                );
                return ReplayOutcome::finish(applied, total, true, None);
            }
            match self.apply(cur) {
                Ok(record) => {
                    info!(
                        t = cur.timestamp_s,
                        down_kbps = cur.download_kbps,
                        up_kbps = cur.upload_kbps,
                        rtt_ms = cur.latency_ms,
                        wall_ms = record.wall_ms,
                        "applied network profile"
                    );
                    applied.push(record);
                }
                Err(err) => {
                    warn!(t = cur.timestamp_s, error = %err, "network profile apply failed; replay stopped");
                    return ReplayOutcome::finish(applied, total, false, Some(err.to_string()));
                }
            }
        }
        ReplayOutcome::finish(applied, total, false, None)
    }

    pub fn spawn(
        self,
        applied: Vec<AppliedProfileRecord>,
        cancel: CancelToken,
    ) -> std::io::Result<ReplayTask> {
        let fallback = applied.clone();
        let total = self.trace.len();
        let handle = thread::Builder::new()
            .name("netem-replay".to_string())
            .spawn(move || self.replay(applied, &cancel))?;
        Ok(ReplayTask {
            handle,
            fallback,
            total,
        })
    }
}

pub struct ReplayTask {
    handle: JoinHandle<ReplayOutcome>,
    fallback: Vec<AppliedProfileRecord>,
    total: usize,
}

impl ReplayTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the replay to end. A panicked replay thread is reported as an
    /// incomplete outcome holding only the records known before the spawn.
    pub fn join(self) -> ReplayOutcome {
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(_) => ReplayOutcome::finish(
                self.fallback,
                self.total,
                false,
                Some("replay thread panicked".to_string()),
            ),
        }
    }
}
