//! Network trace loading.
//!
//! A trace is a CSV file whose header names at least the four columns in
//! [`REQUIRED_COLUMNS`], in any order. Every data row becomes one
//! [`NetworkProfile`]; the resulting [`Trace`] is ordered by `timestamp_s`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_TRACE_PATH: &str = "traces/lte.csv";

pub const REQUIRED_COLUMNS: [&str; 4] = ["timestamp_s", "download_kbps", "upload_kbps", "latency_ms"];

/// One point of a trace: the link conditions in effect from `timestamp_s`
/// onwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub timestamp_s: f64,
    pub download_kbps: f64,
    pub upload_kbps: f64,
    pub latency_ms: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace format error: {0}")]
    Format(String),
    #[error("failed to read trace {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Non-empty sequence of profiles, sorted ascending by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    profiles: Vec<NetworkProfile>,
}

impl Trace {
    /// Sorts with a stable sort, so rows sharing a timestamp keep file order.
    pub fn from_profiles(mut profiles: Vec<NetworkProfile>) -> Result<Self, TraceError> {
        if profiles.is_empty() {
            return Err(TraceError::Format(
                "trace must contain at least one profile".to_string(),
            ));
        }
        profiles.sort_by(|a, b| a.timestamp_s.total_cmp(&b.timestamp_s));
        Ok(Self { profiles })
    }

    pub fn profiles(&self) -> &[NetworkProfile] {
        &self.profiles
    }

    pub fn first(&self) -> &NetworkProfile {
        &self.profiles[0]
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Seconds between the first and the last profile.
    pub fn span_s(&self) -> f64 {
        let first = self.profiles[0].timestamp_s;
        let last = self.profiles[self.profiles.len() - 1].timestamp_s;
        (last - first).max(0.0)
    }
}

pub fn load(path: &Path) -> Result<Trace, TraceError> {
    let text = fs::read_to_string(path).map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Trace, TraceError> {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| (idx + 1, line))
        .collect();
    if lines.len() < 2 {
        return Err(TraceError::Format(
            "trace CSV must have a header and at least 1 row".to_string(),
        ));
    }

    let header: Vec<&str> = lines[0].1.split(',').map(str::trim).collect();
    let column = |name: &str| header.iter().position(|h| *h == name);
    let indices = match REQUIRED_COLUMNS.map(column) {
        [Some(ts), Some(down), Some(up), Some(lat)] => [ts, down, up, lat],
        _ => {
            return Err(TraceError::Format(format!(
                "CSV header must include: {}",
                REQUIRED_COLUMNS.join(",")
            )))
        }
    };

    let mut profiles = Vec::with_capacity(lines.len() - 1);
    for (line_no, line) in &lines[1..] {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        let mut values = [0.0f64; 4];
        for (slot, (&idx, name)) in indices.iter().zip(REQUIRED_COLUMNS).enumerate() {
            values[slot] = parse_cell(&cells, idx, name, *line_no)?;
        }
        let [timestamp_s, download_kbps, upload_kbps, latency_ms] = values;
        profiles.push(NetworkProfile {
            timestamp_s,
            download_kbps,
            upload_kbps,
            latency_ms,
        });
    }
    Trace::from_profiles(profiles)
}

fn parse_cell(cells: &[&str], idx: usize, column: &str, line_no: usize) -> Result<f64, TraceError> {
    let raw = cells.get(idx).copied().unwrap_or("");
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(TraceError::Format(format!(
            "line {}: column '{}' is not a number: '{}'",
            line_no, column, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_message(err: TraceError) -> String {
        match err {
            TraceError::Format(msg) => msg,
            other => panic!("expected format error, got {other}"),
        }
    }

    #[test]
    fn parses_columns_by_name_in_any_order() {
        let csv = "latency_ms,extra,upload_kbps,timestamp_s,download_kbps\n\
                   40,x,500,0,3000\n\
                   80,y,250,5,1200\n";
        let trace = parse(csv).expect("valid trace");
        assert_eq!(trace.len(), 2);
        assert_eq!(
            trace.first(),
            &NetworkProfile {
                timestamp_s: 0.0,
                download_kbps: 3000.0,
                upload_kbps: 500.0,
                latency_ms: 40.0
            }
        );
        assert_eq!(trace.profiles()[1].download_kbps, 1200.0);
    }

    #[test]
    fn output_is_sorted_and_keeps_row_count() {
        let csv = "timestamp_s,download_kbps,upload_kbps,latency_ms\r\n\
                   10,100,10,10\r\n\
                   0,300,30,30\r\n\
                   \r\n\
                   5,200,20,20\r\n";
        let trace = parse(csv).expect("valid trace");
        let ts: Vec<f64> = trace.profiles().iter().map(|p| p.timestamp_s).collect();
        assert_eq!(ts, vec![0.0, 5.0, 10.0]);
        assert_eq!(trace.span_s(), 10.0);
    }

    #[test]
    fn equal_timestamps_keep_file_order() {
        let csv = "timestamp_s,download_kbps,upload_kbps,latency_ms\n\
                   5,1,0,0\n\
                   0,9,0,0\n\
                   5,2,0,0\n\
                   5,3,0,0\n";
        let trace = parse(csv).expect("valid trace");
        let downs: Vec<f64> = trace.profiles().iter().map(|p| p.download_kbps).collect();
        assert_eq!(downs, vec![9.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn single_row_trace_has_zero_span() {
        let trace = parse("timestamp_s,download_kbps,upload_kbps,latency_ms\n3,100,10,20\n")
            .expect("valid trace");
        assert_eq!(trace.len(), 1);
        assert_eq!(trace.span_s(), 0.0);
    }

    #[test]
    fn rejects_empty_and_header_only_files() {
        assert!(matches!(parse(""), Err(TraceError::Format(_))));
        assert!(matches!(parse("\n\n"), Err(TraceError::Format(_))));
        assert!(matches!(
            parse("timestamp_s,download_kbps,upload_kbps,latency_ms\n"),
            Err(TraceError::Format(_))
        ));
    }

    #[test]
    fn rejects_header_missing_any_required_column() {
        for missing in REQUIRED_COLUMNS {
            let header: Vec<&str> = REQUIRED_COLUMNS
                .iter()
                .copied()
                .filter(|c| *c != missing)
                .collect();
            let csv = format!("{}\n1,2,3\n", header.join(","));
            let msg = format_message(parse(&csv).expect_err("missing column must fail"));
            assert!(msg.contains("timestamp_s,download_kbps,upload_kbps,latency_ms"), "{msg}");
        }
    }

    #[test]
    fn rejects_non_numeric_cells_with_line_number() {
        let csv = "timestamp_s,download_kbps,upload_kbps,latency_ms\n\
                   0,100,10,10\n\
                   5,fast,10,10\n";
        let msg = format_message(parse(csv).expect_err("bad cell must fail"));
        assert!(msg.contains("line 3"), "{msg}");
        assert!(msg.contains("download_kbps"), "{msg}");

        let short_row = "timestamp_s,download_kbps,upload_kbps,latency_ms\n0,100\n";
        let msg = format_message(parse(short_row).expect_err("missing cell must fail"));
        assert!(msg.contains("upload_kbps"), "{msg}");

        let nan = "timestamp_s,download_kbps,upload_kbps,latency_ms\nNaN,1,1,1\n";
        assert!(matches!(parse(nan), Err(TraceError::Format(_))));
    }

    #[test]
    fn load_reports_missing_file_as_io_error() {
        let path = std::env::temp_dir().join(format!(
            "qoe_trace_missing_{}_{}.csv",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        assert!(matches!(load(&path), Err(TraceError::Io { .. })));
    }
}
