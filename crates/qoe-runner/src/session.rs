//! The control-session seam.
//!
//! A [`ControlSession`] is the live page the experiment drives: it accepts
//! network-condition updates and answers a small set of typed page queries.
//! The browser transport behind it is not part of this crate; the
//! [`crate::simulated`] module provides an in-process implementation.

use crate::probe::ProbeHandle;
use crate::trace::NetworkProfile;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Conditions pushed to the session for one trace profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConditions {
    pub offline: bool,
    /// Bytes per second.
    pub download_throughput: f64,
    /// Bytes per second.
    pub upload_throughput: f64,
    /// Milliseconds.
    pub latency: f64,
}

impl NetworkConditions {
    /// Degraded, never disconnected: `offline` is always false.
    pub fn from_profile(profile: &NetworkProfile) -> Self {
        Self {
            offline: false,
            download_throughput: kbps_to_bytes_per_sec(profile.download_kbps),
            upload_throughput: kbps_to_bytes_per_sec(profile.upload_kbps),
            latency: profile.latency_ms,
        }
    }
}

pub fn kbps_to_bytes_per_sec(kbps: f64) -> f64 {
    kbps * 1000.0 / 8.0
}

/// Page-evaluated reads the core needs from the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageQuery {
    /// The player's stats object (`stateHistory`, `switchHistory`, ...), or
    /// null when no player is exposed.
    PlayerStats,
    /// `{"tracks": [...]}` with one entry per variant track.
    VariantTracks,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("timed out after {}s waiting for {what}", after.as_secs_f64())]
    Timeout { what: String, after: Duration },
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("failed to apply network conditions: {0}")]
    Apply(String),
    #[error("page query failed: {0}")]
    Query(String),
    #[error("control session is closed")]
    Closed,
    #[error("control session lock poisoned")]
    LockPoisoned,
}

pub trait ControlSession: Send {
    fn apply_network(&mut self, conditions: &NetworkConditions) -> Result<(), SessionError>;

    fn set_cache_enabled(&mut self, enabled: bool) -> Result<(), SessionError>;

    /// Installs the DOM event probe. Must be called before [`navigate`] so
    /// the earliest playback events are observed.
    ///
    /// [`navigate`]: ControlSession::navigate
    fn install_probe(&mut self) -> Result<ProbeHandle, SessionError>;

    fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), SessionError>;

    fn media_present(&mut self) -> Result<bool, SessionError>;

    /// Mutes the media element and asks it to play. Browsers may reject this.
    fn request_autoplay(&mut self) -> Result<(), SessionError>;

    fn evaluate(&mut self, query: PageQuery) -> Result<Value, SessionError>;

    fn close(&mut self) -> Result<(), SessionError>;
}

/// A session shared between the orchestrator and the replay thread. The
/// mutex keeps at most one command in flight on the control channel.
pub type SharedSession = Arc<Mutex<Box<dyn ControlSession>>>;

pub fn share(session: Box<dyn ControlSession>) -> SharedSession {
    Arc::new(Mutex::new(session))
}

pub fn lock_session(
    session: &SharedSession,
) -> Result<MutexGuard<'_, Box<dyn ControlSession>>, SessionError> {
    session.lock().map_err(|_| SessionError::LockPoisoned)
}

/// Opens a fresh session for one experiment run.
pub trait SessionFactory {
    fn open(&mut self) -> Result<Box<dyn ControlSession>, SessionError>;
}

/// Closes the session when dropped, whichever way the run ends.
pub struct SessionGuard {
    session: SharedSession,
}

impl SessionGuard {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // A poisoned lock still holds a usable session; close it anyway.
        let mut guard = match self.session.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = guard.close() {
            tracing::warn!(error = %err, "failed to close control session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_convert_kbps_to_bytes_per_second() {
        let profile = NetworkProfile {
            timestamp_s: 0.0,
            download_kbps: 1600.0,
            upload_kbps: 8.0,
            latency_ms: 70.0,
        };
        let c = NetworkConditions::from_profile(&profile);
        assert!(!c.offline);
        assert_eq!(c.download_throughput, 1600.0 * 125.0);
        assert_eq!(c.upload_throughput, 1000.0);
        assert_eq!(c.latency, 70.0);
    }

    #[test]
    fn download_throughput_is_exactly_kbps_times_125() {
        for kbps in [0.0, 1.0, 333.3, 750.0, 12_345.678, 1.0e6] {
            let profile = NetworkProfile {
                timestamp_s: 0.0,
                download_kbps: kbps,
                upload_kbps: kbps,
                latency_ms: 0.0,
            };
            let c = NetworkConditions::from_profile(&profile);
            assert_eq!(c.download_throughput, kbps * 125.0, "kbps={kbps}");
        }
    }

    #[test]
    fn conditions_serialize_as_control_command() {
        let c = NetworkConditions {
            offline: false,
            download_throughput: 125.0,
            upload_throughput: 250.0,
            latency: 20.0,
        };
        let v = serde_json::to_value(c).expect("serialize");
        assert_eq!(
            v,
            serde_json::json!({
                "offline": false,
                "downloadThroughput": 125.0,
                "uploadThroughput": 250.0,
                "latency": 20.0
            })
        );
    }

    #[test]
    fn timeout_error_names_stage() {
        let err = SessionError::Timeout {
            what: "media element".to_string(),
            after: Duration::from_secs(120),
        };
        assert_eq!(err.to_string(), "timed out after 120s waiting for media element");
    }
}
