//! DOM-level playback probe.
//!
//! The probe lives on its own thread, owns every event and sample it
//! records, and is reached only through [`ProbeHandle::snapshot`] and the
//! [`MediaEventSink`] the session uses to forward media element events.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

pub const ATTACH_INTERVAL: Duration = Duration::from_millis(250);
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Media element events the probe listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    Playing,
    Waiting,
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventKind {
    StartupPlaying,
    Playing,
    Waiting,
    Stalled,
    StallStart,
    StallEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub t: f64,
    #[serde(rename = "type")]
    pub kind: TelemetryEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub t: f64,
    pub current_time: f64,
    pub ready_state: u8,
    pub paused: bool,
    pub playback_rate: f64,
    pub buffer_end: Option<f64>,
    pub buffer_level: Option<f64>,
    pub dropped_frames: Option<u64>,
}

/// What the page can read off the media element at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaReadout {
    pub current_time: f64,
    pub ready_state: u8,
    pub paused: bool,
    pub playback_rate: f64,
    /// End of the last buffered range, if anything is buffered.
    pub buffered_end: Option<f64>,
    /// `None` when the element does not report playback quality.
    pub dropped_frames: Option<u64>,
}

/// The probe's view of the page: `None` until a media element exists.
pub trait MediaView: Send {
    fn readout(&self) -> Option<MediaReadout>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSnapshot {
    pub events: Vec<TelemetryEvent>,
    pub samples: Vec<TelemetrySample>,
    pub startup_at: Option<f64>,
    pub started_playing: bool,
}

/// Stall accounting over the media event stream.
///
/// A `waiting` event only opens a stall once playback has started; waiting
/// before the first `playing` is startup buffering.
#[derive(Debug, Default)]
pub struct ProbeRecorder {
    events: Vec<TelemetryEvent>,
    samples: Vec<TelemetrySample>,
    startup_at: Option<f64>,
    last_waiting_at: Option<f64>,
    started_playing: bool,
}

impl ProbeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_media_event(&mut self, t: f64, event: MediaEvent) {
        match event {
            MediaEvent::Playing => {
                if !self.started_playing {
                    self.started_playing = true;
                    self.startup_at = Some(t);
                    self.push(t, TelemetryEventKind::StartupPlaying, None);
                }
                self.push(t, TelemetryEventKind::Playing, None);
                if let Some(waiting_at) = self.last_waiting_at.take() {
                    let mut extra = Map::new();
                    extra.insert("stallDur".to_string(), Value::from(t - waiting_at));
                    self.push(t, TelemetryEventKind::StallEnd, Some(extra));
                }
            }
            MediaEvent::Waiting => {
                self.push(t, TelemetryEventKind::Waiting, None);
                if self.started_playing && self.last_waiting_at.is_none() {
                    self.last_waiting_at = Some(t);
                    self.push(t, TelemetryEventKind::StallStart, None);
                }
            }
            MediaEvent::Stalled => self.push(t, TelemetryEventKind::Stalled, None),
        }
    }

    pub fn record_sample(&mut self, t: f64, readout: &MediaReadout) {
        let buffer_level = readout
            .buffered_end
            .map(|end| (end - readout.current_time).max(0.0));
        self.samples.push(TelemetrySample {
            t,
            current_time: readout.current_time,
            ready_state: readout.ready_state,
            paused: readout.paused,
            playback_rate: readout.playback_rate,
            buffer_end: readout.buffered_end,
            buffer_level,
            dropped_frames: readout.dropped_frames,
        });
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        ProbeSnapshot {
            events: self.events.clone(),
            samples: self.samples.clone(),
            startup_at: self.startup_at,
            started_playing: self.started_playing,
        }
    }

    fn push(&mut self, t: f64, kind: TelemetryEventKind, extra: Option<Map<String, Value>>) {
        self.events.push(TelemetryEvent { t, kind, extra });
    }
}

enum ProbeMessage {
    Media(MediaEvent),
    Snapshot(mpsc::Sender<ProbeSnapshot>),
    Shutdown,
}

/// Forwards media element events into the probe. Events sent before the
/// probe has found the element are dropped, as a listener would miss them.
#[derive(Clone)]
pub struct MediaEventSink {
    tx: mpsc::Sender<ProbeMessage>,
}

impl MediaEventSink {
    pub fn dispatch(&self, event: MediaEvent) {
        let _ = self.tx.send(ProbeMessage::Media(event));
    }
}

pub struct ProbeHandle {
    tx: mpsc::Sender<ProbeMessage>,
    thread: Option<JoinHandle<()>>,
}

impl ProbeHandle {
    /// Starts the probe clock (`t = 0`) and its polling thread.
    pub fn install(view: Box<dyn MediaView>) -> std::io::Result<(ProbeHandle, MediaEventSink)> {
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        let thread = thread::Builder::new()
            .name("qoe-probe".to_string())
            .spawn(move || run_probe(rx, view, started))?;
        let sink = MediaEventSink { tx: tx.clone() };
        Ok((
            ProbeHandle {
                tx,
                thread: Some(thread),
            },
            sink,
        ))
    }

    /// Point-in-time copy of everything recorded so far; `None` once the
    /// probe thread is gone.
    pub fn snapshot(&self) -> Option<ProbeSnapshot> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx.send(ProbeMessage::Snapshot(reply_tx)).ok()?;
        reply_rx.recv().ok()
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(ProbeMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_probe(rx: mpsc::Receiver<ProbeMessage>, view: Box<dyn MediaView>, started: Instant) {
    let mut recorder = ProbeRecorder::new();
    let mut attached = false;
    let mut next_attach = started;
    let mut next_sample = started + SAMPLE_INTERVAL;

    loop {
        let now = Instant::now();
        if !attached && now >= next_attach {
            if view.readout().is_some() {
                attached = true;
                debug!(t = (now - started).as_secs_f64(), "probe attached to media element");
            } else {
                next_attach = now + ATTACH_INTERVAL;
            }
        }
        if now >= next_sample {
            if let Some(readout) = view.readout() {
                recorder.record_sample((now - started).as_secs_f64(), &readout);
            }
            next_sample += SAMPLE_INTERVAL;
            if next_sample <= now {
                next_sample = now + SAMPLE_INTERVAL;
            }
        }

        let deadline = if attached {
            next_sample
        } else {
            next_attach.min(next_sample)
        };
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(ProbeMessage::Media(event)) => {
                if attached {
                    recorder.on_media_event(started.elapsed().as_secs_f64(), event);
                }
            }
            Ok(ProbeMessage::Snapshot(reply)) => {
                let _ = reply.send(recorder.snapshot());
            }
            Ok(ProbeMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
