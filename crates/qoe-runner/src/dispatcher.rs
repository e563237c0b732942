//! Queue-driven job dispatch.
//!
//! Each job becomes one runner subprocess. A failed job stops the dispatcher:
//! there is no retry, and a supervising process manager is expected to
//! restart it.

use crate::queue::{check_trace_name, Job, JobError, JobQueue, QueueError, DEFAULT_QUEUE_KEY};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub base_url: String,
    pub traces_dir: PathBuf,
    pub results_dir: PathBuf,
    pub queue_key: String,
    /// Program and leading arguments of the runner. Empty means this
    /// executable's `run` subcommand.
    pub runner_command: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_url: "http://web:8000".to_string(),
            traces_dir: PathBuf::from("traces"),
            results_dir: PathBuf::from("results"),
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            runner_command: Vec::new(),
        }
    }
}

impl DispatchConfig {
    /// Missing file means defaults; a present but malformed file is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let cfg: DispatchConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid dispatcher config {}", path.display()))?;
        Ok(cfg)
    }

    fn runner_command(&self) -> std::io::Result<Vec<String>> {
        if !self.runner_command.is_empty() {
            return Ok(self.runner_command.clone());
        }
        let exe = std::env::current_exe()?;
        Ok(vec![exe.to_string_lossy().to_string(), "run".to_string()])
    }
}

/// Where a job's run points and writes.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    pub url: String,
    pub trace_path: PathBuf,
    pub out_path: PathBuf,
    pub duration: String,
}

impl JobPlan {
    /// Refuses trace names that would leave `traces_dir`.
    pub fn derive(job: &Job, config: &DispatchConfig) -> Result<Self, JobError> {
        check_trace_name(&job.trace)?;
        if !job.duration.is_finite() {
            return Err(JobError::Duration(job.duration));
        }
        let trace_name = job.trace.replacen(".csv", "", 1);
        Ok(Self {
            url: format!(
                "{}/detailed_view/{}/?autoplay=1",
                config.base_url.trim_end_matches('/'),
                job.video_id
            ),
            trace_path: config.traces_dir.join(&job.trace),
            out_path: config
                .results_dir
                .join(format!("video_{}_{}.json", job.video_id, trace_name)),
            duration: job.duration.to_string(),
        })
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "--url".to_string(),
            self.url.clone(),
            "--trace".to_string(),
            self.trace_path.display().to_string(),
            "--out".to_string(),
            self.out_path.display().to_string(),
            "--duration".to_string(),
            self.duration.clone(),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("malformed job payload {payload:?}: {source}")]
    Parse {
        payload: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("rejected job {job_id}: {source}")]
    InvalidJob {
        job_id: String,
        #[source]
        source: JobError,
    },
    #[error("failed to spawn runner for job {job_id}: {source}")]
    Spawn {
        job_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("runner failed for job {job_id} with code {code}")]
    ChildProcess { job_id: String, code: String },
}

pub struct Dispatcher<Q: JobQueue> {
    queue: Q,
    config: DispatchConfig,
}

impl<Q: JobQueue> Dispatcher<Q> {
    pub fn new(queue: Q, config: DispatchConfig) -> Self {
        Self { queue, config }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Runs jobs until the queue closes or a job fails. Returns the number of
    /// jobs completed. Over a Redis queue this only returns on error.
    pub fn run(&mut self) -> Result<u64, DispatchError> {
        info!(queue = %self.config.queue_key, "dispatcher waiting for jobs");
        let mut done = 0u64;
        while let Some(job) = self.next_job()? {
            self.run_job(&job)?;
            done += 1;
        }
        Ok(done)
    }

    /// Pops and runs one job. `Ok(false)` means the queue is closed.
    pub fn run_one(&mut self) -> Result<bool, DispatchError> {
        match self.next_job()? {
            Some(job) => {
                self.run_job(&job)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_job(&mut self) -> Result<Option<Job>, DispatchError> {
        let Some(payload) = self.queue.pop_blocking()? else {
            return Ok(None);
        };
        Job::parse(&payload)
            .map(Some)
            .map_err(|source| DispatchError::Parse { payload, source })
    }

    fn run_job(&self, job: &Job) -> Result<(), DispatchError> {
        let job_id = job.job_id.to_string();
        let plan = JobPlan::derive(job, &self.config).map_err(|source| {
            error!(job_id = %job_id, error = %source, "rejected job");
            DispatchError::InvalidJob {
                job_id: job_id.clone(),
                source,
            }
        })?;
        let command = self
            .config
            .runner_command()
            .map_err(|source| DispatchError::Spawn {
                job_id: job_id.clone(),
                source,
            })?;
        info!(job_id = %job_id, url = %plan.url, out = %plan.out_path.display(), "running emulation job");

        let started = Instant::now();
        let status = spawn_runner(&command, &plan).map_err(|source| DispatchError::Spawn {
            job_id: job_id.clone(),
            source,
        })?;
        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            error!(job_id = %job_id, code = %code, "runner failed");
            return Err(DispatchError::ChildProcess { job_id, code });
        }
        info!(
            job_id = %job_id,
            elapsed_s = started.elapsed().as_secs_f64(),
            "finished job"
        );
        Ok(())
    }
}

fn spawn_runner(command: &[String], plan: &JobPlan) -> std::io::Result<std::process::ExitStatus> {
    let program = command.first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "runner_command is empty")
    })?;
    let mut cmd = Command::new(program);
    cmd.args(&command[1..]);
    cmd.args(plan.args());
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    cmd.status()
}
