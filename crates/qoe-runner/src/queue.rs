//! Job descriptors and the shared work list they travel on.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_QUEUE_KEY: &str = "emulation_jobs";
pub const DEFAULT_REDIS_URL: &str = "redis://redis:6379/0";
/// Longest observation window a queued job may ask for, in seconds.
pub const MAX_JOB_DURATION_S: f64 = 600.0;

/// Job and video ids arrive as JSON numbers or strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{}", n),
            Id::Text(s) => f.write_str(s),
        }
    }
}

/// Digits become a number, anything else stays text.
impl FromStr for Id {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<u64>() {
            Ok(n) => Id::Number(n.into()),
            Err(_) => Id::Text(s.to_string()),
        })
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Text(value.to_string())
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id::Number(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Id,
    pub video_id: Id,
    /// Trace file name, relative to the traces directory.
    pub trace: String,
    /// Observation window in seconds.
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("duration must be a finite number of seconds, got {0}")]
    Duration(f64),
    #[error("trace must be a plain file name inside the traces directory, got {0:?}")]
    TraceName(String),
}

impl Job {
    /// A fresh job with a time-based id and a clamped duration.
    pub fn new(video_id: Id, trace: impl Into<String>, requested_s: f64) -> Result<Self, JobError> {
        if !requested_s.is_finite() {
            return Err(JobError::Duration(requested_s));
        }
        let trace = trace.into();
        check_trace_name(&trace)?;
        Ok(Self {
            job_id: Id::Text(format!("job_{}", Utc::now().timestamp_micros())),
            video_id,
            trace,
            duration: clamp_job_duration(requested_s),
        })
    }

    pub fn parse(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// Accepts only a bare file name: no directories, no `..`, not absolute.
pub fn check_trace_name(trace: &str) -> Result<(), JobError> {
    if Path::new(trace).file_name() == Some(OsStr::new(trace)) {
        Ok(())
    } else {
        Err(JobError::TraceName(trace.to_string()))
    }
}

/// Rounds a requested window up to whole seconds and caps it.
pub fn clamp_job_duration(requested_s: f64) -> f64 {
    requested_s.ceil().clamp(0.0, MAX_JOB_DURATION_S)
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("queue returned no message")]
    Empty,
}

/// An order-preserving work list: the oldest pushed payload pops first.
pub trait JobQueue {
    /// Waits until a payload is available. `Ok(None)` means the queue is
    /// closed and no further payloads will arrive.
    fn pop_blocking(&mut self) -> Result<Option<String>, QueueError>;

    fn push(&mut self, payload: &str) -> Result<(), QueueError>;
}

/// Redis list queue: producers `LPUSH`, the dispatcher `BRPOP`s with no timeout.
pub struct RedisQueue {
    client: redis::Client,
    con: Option<redis::Connection>,
    key: String,
}

impl RedisQueue {
    pub fn open(url: &str, key: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            con: None,
            key: key.into(),
        })
    }

    /// Connects to `REDIS_URL`, or the compose default when unset.
    pub fn from_env(key: impl Into<String>) -> Result<Self, QueueError> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        Self::open(&url, key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn connection(&mut self) -> Result<&mut redis::Connection, QueueError> {
        let con = match self.con.take() {
            Some(con) => con,
            None => self.client.get_connection()?,
        };
        Ok(self.con.insert(con))
    }
}

impl JobQueue for RedisQueue {
    fn pop_blocking(&mut self) -> Result<Option<String>, QueueError> {
        let key = self.key.clone();
        let con = self.connection()?;
        let reply: Option<(String, String)> = redis::cmd("BRPOP").arg(&key).arg(0).query(con)?;
        match reply {
            Some((_, payload)) => Ok(Some(payload)),
            None => Err(QueueError::Empty),
        }
    }

    fn push(&mut self, payload: &str) -> Result<(), QueueError> {
        let key = self.key.clone();
        let con = self.connection()?;
        redis::cmd("LPUSH").arg(&key).arg(payload).query::<i64>(con)?;
        Ok(())
    }
}

/// In-process queue. Closed once drained, so a dispatcher over it terminates.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: VecDeque<String>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl JobQueue for MemoryQueue {
    fn pop_blocking(&mut self) -> Result<Option<String>, QueueError> {
        Ok(self.items.pop_back())
    }

    fn push(&mut self, payload: &str) -> Result<(), QueueError> {
        self.items.push_front(payload.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_accept_numbers_and_strings() {
        let job = Job::parse(r#"{"job_id":"job_1","video_id":42,"trace":"lte.csv","duration":60}"#)
            .expect("parse");
        assert_eq!(job.job_id.to_string(), "job_1");
        assert_eq!(job.video_id.to_string(), "42");
        assert_eq!(job.trace, "lte.csv");
        assert_eq!(job.duration, 60.0);

        let round = serde_json::to_value(&job).expect("serialize");
        assert_eq!(round["video_id"], 42);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(Job::parse("not json").is_err());
        assert!(Job::parse(r#"{"job_id":1,"video_id":2}"#).is_err());
    }

    #[test]
    fn new_jobs_get_ids_and_clamped_durations() {
        let job = Job::new("17".parse().expect("id"), "lte.csv", 1234.5).expect("job");
        assert!(job.job_id.to_string().starts_with("job_"));
        assert_eq!(job.video_id, Id::from(17u64));
        assert_eq!(job.duration, 600.0);
        let v = serde_json::to_value(&job).expect("serialize");
        assert_eq!(v["video_id"], 17);
        assert_eq!(v["trace"], "lte.csv");

        let named: Id = "intro-clip".parse().expect("id");
        assert_eq!(named, Id::from("intro-clip"));
    }

    #[test]
    fn non_finite_durations_are_refused_before_queueing() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                Job::new(Id::from(1u64), "lte.csv", bad),
                Err(JobError::Duration(_))
            ));
        }
    }

    #[test]
    fn trace_names_must_stay_inside_traces_dir() {
        for bad in ["/etc/passwd", "../../secret.csv", "sub/lte.csv", "..", ""] {
            assert_eq!(
                check_trace_name(bad),
                Err(JobError::TraceName(bad.to_string())),
                "{bad}"
            );
            assert!(Job::new(Id::from(1u64), bad, 60.0).is_err());
        }
        check_trace_name("lte.csv").expect("plain name");
        check_trace_name("3g.v2.csv").expect("dotted name");
    }

    #[test]
    fn durations_round_up_and_cap() {
        assert_eq!(clamp_job_duration(59.2), 60.0);
        assert_eq!(clamp_job_duration(60.0), 60.0);
        assert_eq!(clamp_job_duration(900.0), 600.0);
        assert_eq!(clamp_job_duration(-3.0), 0.0);
    }

    #[test]
    fn memory_queue_is_fifo_and_closes_when_drained() {
        let mut q = MemoryQueue::new();
        q.push("a").expect("push");
        q.push("b").expect("push");
        assert_eq!(q.remaining(), 2);
        assert_eq!(q.pop_blocking().expect("pop").as_deref(), Some("a"));
        assert_eq!(q.pop_blocking().expect("pop").as_deref(), Some("b"));
        assert_eq!(q.pop_blocking().expect("pop"), None);
    }
}
