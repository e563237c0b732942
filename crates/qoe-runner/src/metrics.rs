//! QoE statistics computed from the player's own stats snapshot.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetrics {
    pub startup_buffering_s: Option<f64>,
    pub stall_count: Option<u64>,
    pub stall_time_s: Option<f64>,
    pub total_buffering_s: Option<f64>,
    pub switch_count: Option<u64>,
}

/// Derives stall and switch statistics from a player stats snapshot.
///
/// The first `buffering` episode in `stateHistory` is startup buffering;
/// every later one is a stall. The first `switchHistory` entry is the
/// initial track selection, not a switch.
pub fn derive(stats: Option<&Value>) -> DerivedMetrics {
    let switch_count = stats
        .and_then(|s| s.get("switchHistory"))
        .and_then(Value::as_array)
        .map(|h| h.len().saturating_sub(1) as u64);

    let Some(history) = stats
        .and_then(|s| s.get("stateHistory"))
        .and_then(Value::as_array)
    else {
        return DerivedMetrics {
            switch_count,
            ..DerivedMetrics::default()
        };
    };

    let buffering: Vec<&Value> = history
        .iter()
        .filter(|e| e.get("state").and_then(Value::as_str) == Some("buffering"))
        .collect();
    let duration = |e: &&Value| e.get("duration").and_then(Value::as_f64).unwrap_or(0.0);

    DerivedMetrics {
        startup_buffering_s: buffering
            .first()
            .and_then(|e| e.get("duration"))
            .and_then(Value::as_f64),
        stall_count: Some(buffering.len().saturating_sub(1) as u64),
        stall_time_s: Some(buffering.iter().skip(1).map(duration).sum()),
        total_buffering_s: Some(buffering.iter().map(duration).sum()),
        switch_count,
    }
}

/// Time-weighted mean of the selected variant bandwidth, in kbps.
///
/// Uses `timestamp` and `bandwidth` (bits/s) of each `switchHistory` entry;
/// the last selection is held until `first + span`, where `span` falls back to
/// the play time when all switches share one timestamp.
pub fn time_weighted_bitrate_kbps(switch_history: &[Value], fallback_play_time_s: f64) -> Option<f64> {
    let mut pts: Vec<(f64, f64)> = switch_history
        .iter()
        .filter_map(|s| {
            let ts = s.get("timestamp").and_then(Value::as_f64)?;
            let bw = s.get("bandwidth").and_then(Value::as_f64)?;
            Some((ts, bw))
        })
        .collect();
    if pts.is_empty() {
        return None;
    }
    pts.sort_by(|a, b| a.0.total_cmp(&b.0));
    if pts.len() == 1 {
        return Some(pts[0].1 / 1000.0);
    }

    let mut span = pts[pts.len() - 1].0 - pts[0].0;
    if span <= 0.0 && fallback_play_time_s > 0.0 {
        span = fallback_play_time_s;
    }
    if span > 0.0 {
        let end = pts[0].0 + span;
        let acc: f64 = pts
            .iter()
            .enumerate()
            .map(|(i, (t, bw))| {
                let next = pts.get(i + 1).map(|p| p.0).unwrap_or(end);
                (next - t).max(0.0) * bw
            })
            .sum();
        return Some(acc / span / 1000.0);
    }
    Some(pts.iter().map(|p| p.1).sum::<f64>() / pts.len() as f64 / 1000.0)
}

/// Heuristic 0..=5 opinion score.
pub fn mos_proxy(
    startup_s: Option<f64>,
    stall_time_s: f64,
    stall_count: u64,
    switch_count: u64,
    avg_bitrate_kbps: Option<f64>,
    dropped_frames: u64,
) -> f64 {
    let bitrate_term = avg_bitrate_kbps
        .map(|kbps| 0.6 * (1.0 + kbps / 300.0).log10())
        .unwrap_or(0.0);
    let startup_pen = 0.35 * startup_s.unwrap_or(0.0);
    let stall_pen = 2.2 * stall_time_s + 0.8 * stall_count as f64;
    let switch_pen = 0.06 * switch_count as f64;
    let drop_pen = 0.02 * dropped_frames as f64;
    (5.0 + bitrate_term - startup_pen - stall_pen - switch_pen - drop_pen).clamp(0.0, 5.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QoeSummary {
    pub trace_path: Option<String>,
    pub duration_requested_s: Option<f64>,
    pub play_time_s: f64,
    #[serde(flatten)]
    pub metrics: DerivedMetrics,
    pub dropped_frames: u64,
    #[serde(rename = "avgSelectedBitrateKbps_timeWeighted")]
    pub avg_bitrate_kbps: Option<f64>,
    #[serde(rename = "qoeMOS_proxy_0to5")]
    pub mos: f64,
}

/// Summarizes a persisted experiment result document.
pub fn summarize(result: &Value) -> QoeSummary {
    let stats = result.get("shakaStatsSnapshot").filter(|v| !v.is_null());
    let play_time_s = stats
        .and_then(|s| s.get("playTime"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let dropped_frames = stats
        .and_then(|s| s.get("droppedFrames"))
        .and_then(Value::as_f64)
        .map(|v| v.max(0.0) as u64)
        .unwrap_or(0);
    let switches: &[Value] = stats
        .and_then(|s| s.get("switchHistory"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let metrics = derive(stats);
    let avg_bitrate_kbps = time_weighted_bitrate_kbps(switches, play_time_s);
    let mos = mos_proxy(
        metrics.startup_buffering_s,
        metrics.stall_time_s.unwrap_or(0.0),
        metrics.stall_count.unwrap_or(0),
        metrics.switch_count.unwrap_or(0),
        avg_bitrate_kbps,
        dropped_frames,
    );

    QoeSummary {
        trace_path: result
            .get("tracePath")
            .and_then(Value::as_str)
            .map(str::to_string),
        duration_requested_s: result.get("durationRequestedS").and_then(Value::as_f64),
        play_time_s,
        metrics,
        dropped_frames,
        avg_bitrate_kbps,
        mos,
    }
}
