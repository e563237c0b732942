//! One end-to-end experiment run.
//!
//! ```text
//! INIT -> TRACE_LOADED -> SESSION_READY -> FIRST_PROFILE_APPLIED -> NAVIGATED
//!      -> MEDIA_READY -> (OBSERVING || REPLAYING) -> COLLECTING -> DONE
//! ```
//!
//! Everything before OBSERVING is fatal on failure. From COLLECTING on, read
//! failures degrade to null fields and the result is still written.

use crate::fsutil::sha256_file;
use crate::metrics;
use crate::probe::ProbeHandle;
use crate::result::{write_result, ExperimentResult, TelemetryMode};
use crate::scheduler::{cancel_pair, NetworkConditionScheduler, ReplayPolicy};
use crate::session::{
    lock_session, share, PageQuery, SessionError, SessionFactory, SessionGuard, SharedSession,
};
use crate::trace::{self, TraceError};
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ceiling for page navigation, independent of the observation window.
pub const NAV_TIMEOUT: Duration = Duration::from_secs(120);
pub const MEDIA_TIMEOUT: Duration = Duration::from_secs(120);
pub const MEDIA_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_DURATION_S: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Init,
    TraceLoaded,
    SessionReady,
    FirstProfileApplied,
    Navigated,
    MediaReady,
    Observing,
    Collecting,
    Done,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Init => "init",
            RunStage::TraceLoaded => "trace_loaded",
            RunStage::SessionReady => "session_ready",
            RunStage::FirstProfileApplied => "first_profile_applied",
            RunStage::Navigated => "navigated",
            RunStage::MediaReady => "media_ready",
            RunStage::Observing => "observing",
            RunStage::Collecting => "collecting",
            RunStage::Done => "done",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("control session failed while reaching {stage}: {source}")]
    Session {
        stage: RunStage,
        #[source]
        source: SessionError,
    },
    #[error("timed out after {}s while reaching {stage}", after.as_secs_f64())]
    Timeout { stage: RunStage, after: Duration },
    #[error("failed to start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write result {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn at(stage: RunStage) -> impl FnOnce(SessionError) -> RunError {
    move |err| match err {
        SessionError::Timeout { after, .. } => RunError::Timeout { stage, after },
        source => RunError::Session { stage, source },
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub url: String,
    pub trace_path: PathBuf,
    pub out_path: PathBuf,
    /// Length of the observation window.
    pub duration: Duration,
    pub telemetry: TelemetryMode,
    pub replay_policy: ReplayPolicy,
    pub nav_timeout: Duration,
    pub media_timeout: Duration,
}

impl ExperimentConfig {
    pub fn new(
        url: impl Into<String>,
        trace_path: impl Into<PathBuf>,
        out_path: impl Into<PathBuf>,
        duration: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            trace_path: trace_path.into(),
            out_path: out_path.into(),
            duration,
            telemetry: TelemetryMode::default(),
            replay_policy: ReplayPolicy::default(),
            nav_timeout: NAV_TIMEOUT,
            media_timeout: MEDIA_TIMEOUT,
        }
    }
}

struct StageLog {
    stage: RunStage,
    run_started: Instant,
}

impl StageLog {
    fn advance(&mut self, next: RunStage) {
        debug!(
            from = %self.stage,
            to = %next,
            elapsed_ms = self.run_started.elapsed().as_millis() as u64,
            "experiment stage"
        );
        self.stage = next;
    }
}

pub struct ExperimentOrchestrator {
    config: ExperimentConfig,
}

impl ExperimentOrchestrator {
    pub fn new(config: ExperimentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn run(&self, factory: &mut dyn SessionFactory) -> Result<ExperimentResult, RunError> {
        run_experiment(&self.config, factory)
    }
}

/// Runs one experiment and persists its result to `config.out_path`.
pub fn run_experiment(
    config: &ExperimentConfig,
    factory: &mut dyn SessionFactory,
) -> Result<ExperimentResult, RunError> {
    let mut stages = StageLog {
        stage: RunStage::Init,
        run_started: Instant::now(),
    };

    let trace = trace::load(&config.trace_path)?;
    let trace_sha256 = match sha256_file(&config.trace_path) {
        Ok(digest) => Some(digest),
        Err(err) => {
            warn!(error = %err, "could not digest trace file");
            None
        }
    };
    info!(
        path = %config.trace_path.display(),
        profiles = trace.len(),
        span_s = trace.span_s(),
        "trace loaded"
    );
    stages.advance(RunStage::TraceLoaded);

    let session = share(factory.open().map_err(at(RunStage::SessionReady))?);
    let guard = SessionGuard::new(session.clone());
    stages.advance(RunStage::SessionReady);

    let started_at = Utc::now().timestamp_millis();
    let mut scheduler = NetworkConditionScheduler::new(trace, session.clone());
    let first = scheduler
        .apply_initial()
        .map_err(at(RunStage::FirstProfileApplied))?;
    stages.advance(RunStage::FirstProfileApplied);

    let probe = match config.telemetry {
        TelemetryMode::DomEventProbe => Some(install_probe(&session)?),
        TelemetryMode::PlayerStatsOnly => None,
    };
    {
        let mut s = lock_session(&session).map_err(at(RunStage::Navigated))?;
        s.set_cache_enabled(false).map_err(at(RunStage::Navigated))?;
        s.navigate(&config.url, config.nav_timeout)
            .map_err(at(RunStage::Navigated))?;
    }
    info!(url = %config.url, "navigated");
    stages.advance(RunStage::Navigated);

    wait_for_media(&session, config.media_timeout)?;
    if let Err(err) = lock_session(&session).and_then(|mut s| s.request_autoplay()) {
        warn!(error = %err, "autoplay request rejected");
    }
    stages.advance(RunStage::MediaReady);

    let (canceller, token) = cancel_pair();
    let replay = scheduler
        .spawn(vec![first], token)
        .map_err(|source| RunError::Spawn {
            what: "trace replay",
            source,
        })?;
    stages.advance(RunStage::Observing);
    thread::sleep(config.duration);
    if config.replay_policy == ReplayPolicy::StopAtWindow {
        canceller.cancel();
    } else if !replay.is_finished() {
        info!("observation window elapsed; waiting for trace replay to finish");
    }
    stages.advance(RunStage::Collecting);

    let qoe_probe = probe.as_ref().map(|p| {
        let snapshot = p.snapshot();
        if snapshot.is_none() {
            warn!("probe snapshot unavailable");
        }
        snapshot
    });
    drop(probe);
    let stats = read_query(&session, PageQuery::PlayerStats);
    let track_info = match config.telemetry {
        TelemetryMode::PlayerStatsOnly => Some(read_query(&session, PageQuery::VariantTracks)),
        TelemetryMode::DomEventProbe => None,
    };

    let mut outcome = replay.join();
    if let Some(err) = &outcome.error {
        warn!(error = %err, applied = outcome.profiles_applied, "trace replay ended early");
    }
    let applied = std::mem::take(&mut outcome.applied);
    let derived = metrics::derive(Some(&stats));

    let result = ExperimentResult {
        url: config.url.clone(),
        trace_path: config.trace_path.display().to_string(),
        trace_sha256,
        telemetry: config.telemetry,
        replay_policy: config.replay_policy,
        started_at,
        finished_at: Utc::now().timestamp_millis(),
        duration_requested_s: config.duration.as_secs_f64(),
        applied_network_profile: applied,
        replay: outcome,
        qoe_probe,
        shaka_track_info: track_info,
        shaka_stats_snapshot: stats,
        derived_from_shaka: derived,
    };
    write_result(&config.out_path, &result).map_err(|source| RunError::Write {
        path: config.out_path.clone(),
        source,
    })?;
    stages.advance(RunStage::Done);
    drop(guard);
    info!(out = %config.out_path.display(), "wrote result");
    Ok(result)
}

fn install_probe(session: &SharedSession) -> Result<ProbeHandle, RunError> {
    lock_session(session)
        .and_then(|mut s| s.install_probe())
        .map_err(at(RunStage::Navigated))
}

fn wait_for_media(session: &SharedSession, timeout: Duration) -> Result<(), RunError> {
    let deadline = Instant::now() + timeout;
    loop {
        let present = lock_session(session)
            .and_then(|mut s| s.media_present())
            .map_err(at(RunStage::MediaReady))?;
        if present {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(RunError::Timeout {
                stage: RunStage::MediaReady,
                after: timeout,
            });
        }
        thread::sleep(MEDIA_POLL_INTERVAL.min(deadline - now));
    }
}

fn read_query(session: &SharedSession, query: PageQuery) -> Value {
    match lock_session(session).and_then(|mut s| s.evaluate(query)) {
        Ok(value) => value,
        Err(err) => {
            warn!(?query, error = %err, "page query failed; recording null");
            Value::Null
        }
    }
}
