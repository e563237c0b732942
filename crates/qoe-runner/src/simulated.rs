//! In-process stand-in for a browser session.
//!
//! Models a player with a fixed bitrate ladder fed by whatever network
//! conditions were last applied: the buffer fills at
//! `throughput / variant bitrate` media-seconds per second, drains at 1x while
//! playing, and the player rebuffers when it runs dry. It keeps a stats object
//! shaped like the real player's (`stateHistory`, `switchHistory`, ...) and
//! forwards `playing` / `waiting` events to an installed probe.

use crate::probe::{MediaEvent, MediaEventSink, MediaReadout, MediaView, ProbeHandle};
use crate::session::{
    ControlSession, NetworkConditions, PageQuery, SessionError, SessionFactory,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const END_EPSILON_S: f64 = 1e-6;

const RENDITION_HEIGHTS: [(u32, u32); 4] = [(640, 360), (854, 480), (1280, 720), (1920, 1080)];

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub ladder_kbps: Vec<f64>,
    /// Delay between navigation and the media element appearing.
    pub media_delay: Duration,
    pub navigation_delay: Duration,
    pub has_media: bool,
    pub autoplay_allowed: bool,
    pub tick: Duration,
    pub rebuffer_goal_s: f64,
    pub max_buffer_s: f64,
    pub media_duration_s: Option<f64>,
    /// Fail every `apply_network` call from this (zero-based) call onwards.
    pub fail_apply_after: Option<usize>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ladder_kbps: vec![400.0, 800.0, 2000.0, 4000.0],
            media_delay: Duration::from_millis(300),
            navigation_delay: Duration::from_millis(50),
            has_media: true,
            autoplay_allowed: true,
            tick: Duration::from_millis(100),
            rebuffer_goal_s: 2.0,
            max_buffer_s: 30.0,
            media_duration_s: None,
            fail_apply_after: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Buffering,
    Playing,
    Ended,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Buffering => "buffering",
            Phase::Playing => "playing",
            Phase::Ended => "ended",
        }
    }
}

struct PlayerState {
    conditions: Option<NetworkConditions>,
    navigated_at: Option<Instant>,
    phase: Phase,
    phase_started_epoch_s: f64,
    phase_elapsed_s: f64,
    position_s: f64,
    buffer_ahead_s: f64,
    variant: Option<usize>,
    state_history: Vec<Value>,
    switch_history: Vec<Value>,
    play_time_s: f64,
    buffering_time_s: f64,
    sink: Option<MediaEventSink>,
    closed: bool,
}

fn epoch_s() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl PlayerState {
    fn new() -> Self {
        Self {
            conditions: None,
            navigated_at: None,
            phase: Phase::Idle,
            phase_started_epoch_s: epoch_s(),
            phase_elapsed_s: 0.0,
            position_s: 0.0,
            buffer_ahead_s: 0.0,
            variant: None,
            state_history: Vec::new(),
            switch_history: Vec::new(),
            play_time_s: 0.0,
            buffering_time_s: 0.0,
            sink: None,
            closed: false,
        }
    }

    fn dispatch(&self, event: MediaEvent) {
        if let Some(sink) = &self.sink {
            sink.dispatch(event);
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != Phase::Idle {
            self.state_history.push(json!({
                "timestamp": self.phase_started_epoch_s,
                "state": self.phase.label(),
                "duration": self.phase_elapsed_s,
            }));
        }
        debug!(from = self.phase.label(), to = phase.label(), "simulated player state change");
        self.phase = phase;
        self.phase_started_epoch_s = epoch_s();
        self.phase_elapsed_s = 0.0;
        match phase {
            Phase::Buffering => self.dispatch(MediaEvent::Waiting),
            Phase::Playing => self.dispatch(MediaEvent::Playing),
            Phase::Idle | Phase::Ended => {}
        }
    }

    /// Goodput in kbps after a crude RTT penalty.
    fn effective_kbps(&self) -> f64 {
        match self.conditions {
            Some(c) => {
                let kbps = c.download_throughput * 8.0 / 1000.0;
                let rtt_penalty = (c.latency / 2000.0).clamp(0.0, 0.5);
                kbps * (1.0 - rtt_penalty)
            }
            None => 0.0,
        }
    }

    fn select_variant(&mut self, config: &SimulationConfig) {
        if config.ladder_kbps.is_empty() {
            return;
        }
        let budget = self.effective_kbps() * 0.8;
        let pick = config
            .ladder_kbps
            .iter()
            .rposition(|&kbps| kbps <= budget)
            .unwrap_or(0);
        if self.variant != Some(pick) {
            self.variant = Some(pick);
            self.switch_history.push(json!({
                "timestamp": epoch_s(),
                "id": pick,
                "type": "variant",
                "fromAdaptation": true,
                "bandwidth": (config.ladder_kbps[pick] * 1000.0).round() as u64,
            }));
        }
    }

    fn advance(&mut self, dt: f64, config: &SimulationConfig) {
        if matches!(self.phase, Phase::Idle | Phase::Ended) {
            return;
        }
        self.select_variant(config);
        if let Some(idx) = self.variant {
            let variant_kbps = config.ladder_kbps[idx].max(1.0);
            let fill = dt * self.effective_kbps() / variant_kbps;
            let mut cap = config.max_buffer_s;
            if let Some(total) = config.media_duration_s {
                cap = cap.min((total - self.position_s).max(0.0));
            }
            self.buffer_ahead_s = (self.buffer_ahead_s + fill).min(cap);
        }
        self.phase_elapsed_s += dt;

        let remaining = config
            .media_duration_s
            .map(|total| (total - self.position_s).max(0.0));
        match self.phase {
            Phase::Buffering => {
                self.buffering_time_s += dt;
                if remaining.is_some_and(|r| r <= END_EPSILON_S) {
                    self.enter(Phase::Ended);
                    return;
                }
                let goal = remaining
                    .map(|r| r.min(config.rebuffer_goal_s))
                    .unwrap_or(config.rebuffer_goal_s);
                if self.buffer_ahead_s >= goal {
                    self.enter(Phase::Playing);
                }
            }
            Phase::Playing => {
                let played = dt.min(self.buffer_ahead_s);
                self.position_s += played;
                self.buffer_ahead_s -= played;
                self.play_time_s += played;
                if remaining.is_some_and(|r| r - played <= END_EPSILON_S) {
                    self.enter(Phase::Ended);
                } else if played < dt {
                    self.enter(Phase::Buffering);
                }
            }
            Phase::Idle | Phase::Ended => {}
        }
    }

    fn media_visible(&self, config: &SimulationConfig) -> bool {
        config.has_media
            && self
                .navigated_at
                .is_some_and(|at| at.elapsed() >= config.media_delay)
    }

    fn readout(&self, config: &SimulationConfig) -> Option<MediaReadout> {
        if !self.media_visible(config) {
            return None;
        }
        let buffered_end = if self.position_s + self.buffer_ahead_s > 0.0 {
            Some(self.position_s + self.buffer_ahead_s)
        } else {
            None
        };
        Some(MediaReadout {
            current_time: self.position_s,
            ready_state: match self.phase {
                Phase::Playing | Phase::Ended => 4,
                Phase::Buffering if self.buffer_ahead_s > 0.0 => 2,
                _ => 1,
            },
            paused: !matches!(self.phase, Phase::Playing | Phase::Buffering),
            playback_rate: 1.0,
            buffered_end,
            dropped_frames: Some(0),
        })
    }

    fn stats(&self, config: &SimulationConfig) -> Value {
        let mut history = self.state_history.clone();
        if self.phase != Phase::Idle {
            history.push(json!({
                "timestamp": self.phase_started_epoch_s,
                "state": self.phase.label(),
                "duration": self.phase_elapsed_s,
            }));
        }
        let (width, height) = self
            .variant
            .map(|i| RENDITION_HEIGHTS[i.min(RENDITION_HEIGHTS.len() - 1)])
            .unwrap_or((0, 0));
        json!({
            "width": width,
            "height": height,
            "streamBandwidth": self.variant.map(|i| config.ladder_kbps[i] * 1000.0),
            "estimatedBandwidth": self.effective_kbps() * 1000.0,
            "playTime": self.play_time_s,
            "bufferingTime": self.buffering_time_s,
            "droppedFrames": 0,
            "stateHistory": history,
            "switchHistory": self.switch_history,
        })
    }

    fn tracks(&self, config: &SimulationConfig) -> Value {
        let tracks: Vec<Value> = config
            .ladder_kbps
            .iter()
            .enumerate()
            .map(|(i, kbps)| {
                let (width, height) = RENDITION_HEIGHTS[i.min(RENDITION_HEIGHTS.len() - 1)];
                json!({
                    "id": i,
                    "bandwidth": (kbps * 1000.0).round() as u64,
                    "width": width,
                    "height": height,
                    "frameRate": 30,
                    "codecs": "vp9,opus",
                    "active": self.variant == Some(i),
                })
            })
            .collect();
        json!({ "tracks": tracks })
    }
}

struct SimView {
    state: Arc<Mutex<PlayerState>>,
    config: SimulationConfig,
}

impl MediaView for SimView {
    fn readout(&self) -> Option<MediaReadout> {
        self.state.lock().ok()?.readout(&self.config)
    }
}

pub struct SimulatedSession {
    config: SimulationConfig,
    state: Arc<Mutex<PlayerState>>,
    player: Option<JoinHandle<()>>,
    applies: usize,
    cache_enabled: bool,
}

impl SimulatedSession {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(PlayerState::new())),
            player: None,
            applies: 0,
            cache_enabled: true,
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    fn state(&self) -> Result<MutexGuard<'_, PlayerState>, SessionError> {
        let guard = self.state.lock().map_err(|_| SessionError::LockPoisoned)?;
        if guard.closed {
            return Err(SessionError::Closed);
        }
        Ok(guard)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        self.state().map(drop)
    }

    fn start_player(&mut self) -> Result<(), SessionError> {
        if self.player.is_some() {
            return Ok(());
        }
        let state = self.state.clone();
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("sim-player".to_string())
            .spawn(move || run_player(state, config))
            .map_err(|e| SessionError::Query(format!("failed to start player: {}", e)))?;
        self.player = Some(handle);
        Ok(())
    }

    fn shutdown(&mut self) {
        match self.state.lock() {
            Ok(mut g) => g.closed = true,
            Err(poisoned) => poisoned.into_inner().closed = true,
        }
        if let Some(handle) = self.player.take() {
            let _ = handle.join();
        }
    }
}

fn run_player(state: Arc<Mutex<PlayerState>>, config: SimulationConfig) {
    let mut last = Instant::now();
    loop {
        thread::sleep(config.tick);
        let now = Instant::now();
        let dt = (now - last).as_secs_f64();
        last = now;
        let Ok(mut st) = state.lock() else {
            break;
        };
        if st.closed {
            break;
        }
        st.advance(dt, &config);
    }
}

impl ControlSession for SimulatedSession {
    fn apply_network(&mut self, conditions: &NetworkConditions) -> Result<(), SessionError> {
        let call = self.applies;
        self.applies += 1;
        if self.config.fail_apply_after.is_some_and(|n| call >= n) {
            return Err(SessionError::Apply(format!(
                "emulation command {} rejected",
                call
            )));
        }
        self.state()?.conditions = Some(*conditions);
        Ok(())
    }

    fn set_cache_enabled(&mut self, enabled: bool) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.cache_enabled = enabled;
        Ok(())
    }

    fn install_probe(&mut self) -> Result<ProbeHandle, SessionError> {
        let view = SimView {
            state: self.state.clone(),
            config: self.config.clone(),
        };
        let (handle, sink) = ProbeHandle::install(Box::new(view))
            .map_err(|e| SessionError::Query(format!("failed to install probe: {}", e)))?;
        self.state()?.sink = Some(sink);
        Ok(handle)
    }

    fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SessionError::Navigation(format!("unsupported url: {}", url)));
        }
        if self.config.navigation_delay > timeout {
            thread::sleep(timeout);
            return Err(SessionError::Timeout {
                what: format!("navigation to {}", url),
                after: timeout,
            });
        }
        thread::sleep(self.config.navigation_delay);
        self.state()?.navigated_at = Some(Instant::now());
        Ok(())
    }

    fn media_present(&mut self) -> Result<bool, SessionError> {
        Ok(self.state()?.media_visible(&self.config))
    }

    fn request_autoplay(&mut self) -> Result<(), SessionError> {
        if !self.config.autoplay_allowed {
            return Err(SessionError::Query(
                "play() rejected: NotAllowedError".to_string(),
            ));
        }
        {
            let mut st = self.state()?;
            if st.phase == Phase::Idle {
                st.enter(Phase::Buffering);
            }
        }
        self.start_player()
    }

    fn evaluate(&mut self, query: PageQuery) -> Result<Value, SessionError> {
        let st = self.state()?;
        if st.navigated_at.is_none() {
            return Ok(Value::Null);
        }
        Ok(match query {
            PageQuery::PlayerStats => st.stats(&self.config),
            PageQuery::VariantTracks => st.tracks(&self.config),
        })
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedFactory {
    pub config: SimulationConfig,
}

impl SessionFactory for SimulatedFactory {
    fn open(&mut self) -> Result<Box<dyn ControlSession>, SessionError> {
        Ok(Box::new(SimulatedSession::new(self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(kbps: f64, latency: f64) -> NetworkConditions {
        NetworkConditions {
            offline: false,
            download_throughput: kbps * 125.0,
            upload_throughput: kbps * 125.0,
            latency,
        }
    }

    fn playing_state(kbps: f64) -> PlayerState {
        let mut st = PlayerState::new();
        st.conditions = Some(conditions(kbps, 0.0));
        st.enter(Phase::Buffering);
        st
    }

    #[test]
    fn fast_link_starts_and_keeps_playing_on_top_rendition() {
        let config = SimulationConfig::default();
        let mut st = playing_state(10_000.0);
        for _ in 0..50 {
            st.advance(0.1, &config);
        }
        assert_eq!(st.phase, Phase::Playing);
        assert_eq!(st.variant, Some(3));
        let stats = st.stats(&config);
        let history = stats["stateHistory"].as_array().expect("history");
        let buffering = history
            .iter()
            .filter(|e| e["state"] == "buffering")
            .count();
        assert_eq!(buffering, 1, "only startup buffering expected");
        assert_eq!(stats["switchHistory"].as_array().expect("switches").len(), 1);
    }

    #[test]
    fn link_collapse_causes_rebuffering_and_downswitch() {
        let config = SimulationConfig::default();
        let mut st = playing_state(10_000.0);
        for _ in 0..30 {
            st.advance(0.1, &config);
        }
        st.conditions = Some(conditions(50.0, 0.0));
        for _ in 0..200 {
            st.advance(0.1, &config);
        }
        let metrics = crate::metrics::derive(Some(&st.stats(&config)));
        assert!(metrics.stall_count.unwrap_or(0) >= 1, "{metrics:?}");
        assert!(metrics.switch_count.unwrap_or(0) >= 1, "{metrics:?}");
        assert_eq!(st.variant, Some(0));
    }

    #[test]
    fn finite_media_ends() {
        let config = SimulationConfig {
            media_duration_s: Some(3.0),
            ..SimulationConfig::default()
        };
        let mut st = playing_state(10_000.0);
        for _ in 0..100 {
            st.advance(0.1, &config);
        }
        assert_eq!(st.phase, Phase::Ended);
        assert!((st.position_s - 3.0).abs() < 1e-6);
    }

    #[test]
    fn latency_reduces_goodput() {
        let mut st = PlayerState::new();
        st.conditions = Some(conditions(1000.0, 0.0));
        let clean = st.effective_kbps();
        st.conditions = Some(conditions(1000.0, 400.0));
        assert!(st.effective_kbps() < clean);
        assert!((clean - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn session_rejects_bad_urls_and_reports_nav_timeouts() {
        let mut session = SimulatedSession::new(SimulationConfig {
            navigation_delay: Duration::from_millis(200),
            ..SimulationConfig::default()
        });
        assert!(matches!(
            session.navigate("ftp://x", Duration::from_secs(1)),
            Err(SessionError::Navigation(_))
        ));
        assert!(matches!(
            session.navigate("http://x", Duration::from_millis(10)),
            Err(SessionError::Timeout { .. })
        ));
        session.navigate("http://x", Duration::from_secs(1)).expect("navigate");
        session.close().expect("close");
        assert!(matches!(session.media_present(), Err(SessionError::Closed)));
        assert!(matches!(
            session.set_cache_enabled(false),
            Err(SessionError::Closed)
        ));
        assert!(matches!(
            session.navigate("http://x", Duration::from_secs(1)),
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn stats_are_null_before_navigation() {
        let mut session = SimulatedSession::new(SimulationConfig::default());
        assert_eq!(
            session.evaluate(PageQuery::PlayerStats).expect("stats"),
            Value::Null
        );
        session.navigate("http://x", Duration::from_secs(1)).expect("navigate");
        let tracks = session.evaluate(PageQuery::VariantTracks).expect("tracks");
        assert_eq!(tracks["tracks"].as_array().expect("tracks").len(), 4);
        assert_eq!(tracks["tracks"][2]["height"], 720);
    }

    #[test]
    fn apply_fault_injection_starts_at_configured_call() {
        let mut session = SimulatedSession::new(SimulationConfig {
            fail_apply_after: Some(1),
            ..SimulationConfig::default()
        });
        let c = conditions(100.0, 10.0);
        session.apply_network(&c).expect("first apply succeeds");
        assert!(matches!(
            session.apply_network(&c),
            Err(SessionError::Apply(_))
        ));
    }
}
