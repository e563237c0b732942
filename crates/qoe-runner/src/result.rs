use crate::fsutil::atomic_write_json_pretty;
use crate::metrics::{self, DerivedMetrics, QoeSummary};
use crate::probe::ProbeSnapshot;
use crate::scheduler::{AppliedProfileRecord, ReplayOutcome, ReplayPolicy};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Which telemetry the run captures besides the player's own stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryMode {
    /// Player stats plus the variant track list.
    #[default]
    PlayerStatsOnly,
    /// Player stats plus the DOM event probe.
    DomEventProbe,
}

impl TelemetryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryMode::PlayerStatsOnly => "player_stats_only",
            TelemetryMode::DomEventProbe => "dom_event_probe",
        }
    }
}

/// Everything one run produced. Written once, at the end of the run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResult {
    pub url: String,
    pub trace_path: String,
    pub trace_sha256: Option<String>,
    pub telemetry: TelemetryMode,
    pub replay_policy: ReplayPolicy,
    /// Unix epoch milliseconds.
    pub started_at: i64,
    /// Unix epoch milliseconds.
    pub finished_at: i64,
    pub duration_requested_s: f64,
    pub applied_network_profile: Vec<AppliedProfileRecord>,
    pub replay: ReplayOutcome,
    /// Present in probe mode; null inside when the snapshot could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qoe_probe: Option<Option<ProbeSnapshot>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shaka_track_info: Option<Value>,
    pub shaka_stats_snapshot: Value,
    pub derived_from_shaka: DerivedMetrics,
}

/// Overwrites `path`, creating parent directories as needed.
pub fn write_result(path: &Path, result: &ExperimentResult) -> std::io::Result<()> {
    atomic_write_json_pretty(path, result)
}

/// `{dir}/summaries/{stem}_summary.json` next to a result file.
pub fn summary_path(result_path: &Path) -> PathBuf {
    let stem = result_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "result".to_string());
    result_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join("summaries")
        .join(format!("{}_summary.json", stem))
}

/// Reads a persisted result, summarizes it and writes the summary beside it.
pub fn summarize_result_file(result_path: &Path) -> anyhow::Result<(QoeSummary, PathBuf)> {
    let bytes = std::fs::read(result_path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", result_path.display(), e))?;
    let doc: Value = serde_json::from_slice(&bytes)
        .map_err(|e| anyhow::anyhow!("{} is not valid JSON: {}", result_path.display(), e))?;
    let summary = metrics::summarize(&doc);
    let out = summary_path(result_path);
    atomic_write_json_pretty(&out, &summary)?;
    Ok((summary, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::NetworkProfile;
    use chrono::Utc;

    fn sample(telemetry: TelemetryMode) -> ExperimentResult {
        let applied = vec![AppliedProfileRecord {
            wall_ms: 0,
            profile: NetworkProfile {
                timestamp_s: 0.0,
                download_kbps: 1000.0,
                upload_kbps: 100.0,
                latency_ms: 20.0,
            },
        }];
        ExperimentResult {
            url: "http://web:8000/detailed_view/1/?autoplay=1".to_string(),
            trace_path: "traces/lte.csv".to_string(),
            trace_sha256: None,
            telemetry,
            replay_policy: ReplayPolicy::RunToCompletion,
            started_at: 1_700_000_000_000,
            finished_at: 1_700_000_060_000,
            duration_requested_s: 60.0,
            replay: ReplayOutcome {
                applied: applied.clone(),
                completed: true,
                cancelled: false,
                error: None,
                profiles_applied: 1,
                profiles_total: 1,
            },
            applied_network_profile: applied,
            qoe_probe: match telemetry {
                TelemetryMode::DomEventProbe => Some(None),
                TelemetryMode::PlayerStatsOnly => None,
            },
            shaka_track_info: match telemetry {
                TelemetryMode::PlayerStatsOnly => Some(Value::Null),
                TelemetryMode::DomEventProbe => None,
            },
            shaka_stats_snapshot: Value::Null,
            derived_from_shaka: DerivedMetrics::default(),
        }
    }

    #[test]
    fn telemetry_specific_fields_are_exclusive() {
        let stats_only = serde_json::to_value(sample(TelemetryMode::PlayerStatsOnly)).expect("json");
        assert!(stats_only.get("qoeProbe").is_none());
        assert_eq!(stats_only["shakaTrackInfo"], Value::Null);
        assert_eq!(stats_only["telemetry"], "player_stats_only");

        let probe = serde_json::to_value(sample(TelemetryMode::DomEventProbe)).expect("json");
        assert!(probe.get("shakaTrackInfo").is_none());
        assert!(probe.get("qoeProbe").is_some(), "unreadable snapshot is kept as null");
        assert_eq!(probe["qoeProbe"], Value::Null);
    }

    #[test]
    fn result_uses_wire_field_names() {
        let v = serde_json::to_value(sample(TelemetryMode::PlayerStatsOnly)).expect("json");
        for key in [
            "url",
            "tracePath",
            "startedAt",
            "finishedAt",
            "durationRequestedS",
            "appliedNetworkProfile",
            "shakaStatsSnapshot",
            "derivedFromShaka",
            "replay",
        ] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_eq!(v["appliedNetworkProfile"][0]["wall_ms"], 0);
        assert_eq!(v["replay"]["completed"], true);
        assert!(v["replay"].get("applied").is_none());
    }

    #[test]
    fn write_result_overwrites_previous_file() {
        let root = std::env::temp_dir().join(format!(
            "qoe_result_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("results").join("video_1_lte.json");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, b"stale").expect("seed");
        write_result(&path, &sample(TelemetryMode::PlayerStatsOnly)).expect("write");
        let v: Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("valid json");
        assert_eq!(v["durationRequestedS"], 60.0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn summary_lands_in_sibling_directory() {
        let root = std::env::temp_dir().join(format!(
            "qoe_summary_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("video_3_lte.json");
        write_result(&path, &sample(TelemetryMode::PlayerStatsOnly)).expect("write");
        let (summary, out) = summarize_result_file(&path).expect("summarize");
        assert_eq!(out, root.join("summaries").join("video_3_lte_summary.json"));
        assert_eq!(summary.trace_path.as_deref(), Some("traces/lte.csv"));
        let v: Value = serde_json::from_slice(&std::fs::read(&out).expect("read")).expect("json");
        assert_eq!(v["qoeMOS_proxy_0to5"], 5.0);
        assert!(summarize_result_file(&root.join("missing.json")).is_err());
        let _ = std::fs::remove_dir_all(root);
    }
}
