mod logging;

use anyhow::{anyhow, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand, ValueEnum};
use qoe_runner::orchestrator::DEFAULT_DURATION_S;
use qoe_runner::queue::{Id, DEFAULT_QUEUE_KEY};
use qoe_runner::trace::DEFAULT_TRACE_PATH;
use qoe_runner::{
    DispatchConfig, Dispatcher, ExperimentConfig, ExperimentOrchestrator, ExperimentResult, Job,
    JobQueue, QoeSummary, RedisQueue, ReplayPolicy, SimulatedFactory, TelemetryMode,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "qoe",
    version = "0.3.0",
    about = "Trace-driven network emulation for streaming QoE experiments"
)]
struct Cli {
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TelemetryArg {
    #[value(name = "player-stats")]
    PlayerStats,
    #[value(name = "dom-probe")]
    DomProbe,
}

impl From<TelemetryArg> for TelemetryMode {
    fn from(value: TelemetryArg) -> Self {
        match value {
            TelemetryArg::PlayerStats => TelemetryMode::PlayerStatsOnly,
            TelemetryArg::DomProbe => TelemetryMode::DomEventProbe,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReplayPolicyArg {
    #[value(name = "run-to-completion")]
    RunToCompletion,
    #[value(name = "stop-at-window")]
    StopAtWindow,
}

impl From<ReplayPolicyArg> for ReplayPolicy {
    fn from(value: ReplayPolicyArg) -> Self {
        match value {
            ReplayPolicyArg::RunToCompletion => ReplayPolicy::RunToCompletion,
            ReplayPolicyArg::StopAtWindow => ReplayPolicy::StopAtWindow,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    #[value(name = "simulated")]
    Simulated,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment against a live session.
    Run {
        #[arg(long)]
        url: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = DEFAULT_TRACE_PATH)]
        trace: PathBuf,
        /// Observation window in seconds.
        #[arg(long, default_value_t = DEFAULT_DURATION_S)]
        duration: f64,
        #[arg(long, value_enum, default_value = "player-stats")]
        telemetry: TelemetryArg,
        #[arg(long, value_enum, default_value = "run-to-completion")]
        replay_policy: ReplayPolicyArg,
        #[arg(long, value_enum, default_value = "simulated")]
        backend: BackendArg,
        #[arg(long)]
        json: bool,
    },
    /// Drain the job queue, one runner subprocess per job.
    Dispatch {
        #[arg(long, default_value = "dispatcher.yaml")]
        config: PathBuf,
    },
    /// Queue one experiment job.
    Enqueue {
        #[arg(long)]
        video_id: Id,
        #[arg(long)]
        trace: String,
        #[arg(long)]
        duration: f64,
        #[arg(long, default_value = DEFAULT_QUEUE_KEY)]
        queue_key: String,
        #[arg(long)]
        json: bool,
    },
    /// Print QoE summaries of result files.
    Summarize {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    logging::init(&cli.log_level);

    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => emit_json(&payload),
        Ok(None) => {}
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
            }
            eprintln!("qoe: {:#}", err);
            std::process::exit(1);
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            url,
            out,
            trace,
            duration,
            telemetry,
            replay_policy,
            backend,
            json,
        } => {
            let window = Duration::try_from_secs_f64(duration)
                .map_err(|_| anyhow!("--duration must be a non-negative number of seconds"))?;
            let mut config = ExperimentConfig::new(url, trace, out, window);
            config.telemetry = telemetry.into();
            config.replay_policy = replay_policy.into();
            let orchestrator = ExperimentOrchestrator::new(config);
            let result = match backend {
                BackendArg::Simulated => orchestrator.run(&mut SimulatedFactory::default())?,
            };
            let out = &orchestrator.config().out_path;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "out": out.display().to_string(),
                    "result": result_to_json(&result),
                })));
            }
            print_result(&result);
            println!("out: {}", out.display());
        }
        Commands::Dispatch { config } => {
            let cfg = DispatchConfig::load(&config)?;
            let queue = RedisQueue::from_env(cfg.queue_key.clone())?;
            let mut dispatcher = Dispatcher::new(queue, cfg);
            let done = dispatcher.run()?;
            println!("jobs_completed: {}", done);
        }
        Commands::Enqueue {
            video_id,
            trace,
            duration,
            queue_key,
            json,
        } => {
            let job = Job::new(video_id, trace, duration)?;
            let payload = serde_json::to_string(&job)?;
            let mut queue = RedisQueue::from_env(queue_key)?;
            queue.push(&payload)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "enqueue",
                    "queue": queue.key(),
                    "job": job,
                })));
            }
            println!("job_id: {}", job.job_id);
            println!("queue: {}", queue.key());
            println!("duration_s: {}", job.duration);
        }
        Commands::Summarize { files, json } => {
            let mut summaries = Vec::new();
            for file in &files {
                let (summary, written) = qoe_runner::result::summarize_result_file(file)?;
                if json {
                    summaries.push(json!({
                        "file": file.display().to_string(),
                        "summary_path": written.display().to_string(),
                        "summary": summary,
                    }));
                } else {
                    print_summary(&file.display().to_string(), &summary);
                    println!("  summary: {}", written.display());
                }
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summarize",
                    "files": summaries,
                })));
            }
        }
    }
    Ok(None)
}

fn result_to_json(result: &ExperimentResult) -> Value {
    json!({
        "url": result.url,
        "trace_path": result.trace_path,
        "telemetry": result.telemetry.as_str(),
        "replay_policy": result.replay_policy.as_str(),
        "profiles_applied": result.replay.profiles_applied,
        "profiles_total": result.replay.profiles_total,
        "replay_completed": result.replay.completed,
        "derived": result.derived_from_shaka,
    })
}

fn print_result(result: &ExperimentResult) {
    let d = &result.derived_from_shaka;
    println!("url: {}", result.url);
    println!("trace: {}", result.trace_path);
    println!("telemetry: {}", result.telemetry.as_str());
    println!(
        "replay: {}/{} profiles applied ({})",
        result.replay.profiles_applied,
        result.replay.profiles_total,
        replay_state(result)
    );
    println!("startup_buffering_s: {}", fmt_opt(d.startup_buffering_s));
    println!("stall_count: {}", fmt_opt(d.stall_count));
    println!("stall_time_s: {}", fmt_opt(d.stall_time_s));
    println!("total_buffering_s: {}", fmt_opt(d.total_buffering_s));
    println!("switch_count: {}", fmt_opt(d.switch_count));
}

fn replay_state(result: &ExperimentResult) -> String {
    if let Some(err) = &result.replay.error {
        return format!("failed: {}", err);
    }
    if result.replay.cancelled {
        return "cancelled".to_string();
    }
    "completed".to_string()
}

fn print_summary(file: &str, s: &QoeSummary) {
    println!("{}", file);
    println!(
        "  play_time_s: {:.2}  dropped_frames: {}",
        s.play_time_s, s.dropped_frames
    );
    println!(
        "  startup_s: {}  stalls: {}  stall_time_s: {}  switches: {}",
        fmt_opt(s.metrics.startup_buffering_s),
        fmt_opt(s.metrics.stall_count),
        fmt_opt(s.metrics.stall_time_s),
        fmt_opt(s.metrics.switch_count)
    );
    println!(
        "  avg_bitrate_kbps: {}  mos_proxy: {:.2}",
        s.avg_bitrate_kbps
            .map(|v| format!("{:.1}", v))
            .unwrap_or_else(|| "null".to_string()),
        s.mos
    );
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "null".to_string())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Enqueue { json, .. }
        | Commands::Summarize { json, .. } => *json,
        Commands::Dispatch { .. } => false,
    }
}
