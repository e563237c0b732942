use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn scratch(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "qoe_cli_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn qoe(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_qoe"))
        .args(args)
        .current_dir(dir)
        .env("REDIS_URL", "redis://127.0.0.1:1/0")
        .output()
        .expect("spawn qoe")
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

#[test]
fn missing_url_exits_one_without_writing() {
    let dir = scratch("missing_url");
    let out = qoe(&dir, &["run", "--out", "x.json"]);
    assert_eq!(out.status.code(), Some(1), "{}", stderr(&out));
    assert!(stderr(&out).contains("--url"), "{}", stderr(&out));
    assert!(!dir.join("x.json").exists());
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn missing_out_exits_one() {
    let dir = scratch("missing_out");
    let out = qoe(&dir, &["run", "--url", "http://web:8000/detailed_view/1/"]);
    assert_eq!(out.status.code(), Some(1), "{}", stderr(&out));
    assert!(stderr(&out).contains("--out"), "{}", stderr(&out));
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn help_exits_zero() {
    let dir = scratch("help");
    let out = qoe(&dir, &["run", "--help"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("--replay-policy"));
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn malformed_trace_is_reported_and_exits_one() {
    let dir = scratch("bad_trace");
    std::fs::write(
        dir.join("bad.csv"),
        "timestamp_s,download_kbps,upload_kbps,latency_ms\n0,fast,100,20\n",
    )
    .expect("write trace");
    let out = qoe(
        &dir,
        &[
            "run",
            "--url",
            "http://web:8000/detailed_view/1/?autoplay=1",
            "--out",
            "out.json",
            "--trace",
            "bad.csv",
            "--duration",
            "0",
        ],
    );
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("qoe: trace format error"), "{err}");
    assert!(err.contains("line 2"), "{err}");
    assert!(!dir.join("out.json").exists());
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn enqueue_refuses_bad_jobs_before_connecting() {
    let dir = scratch("enqueue");
    let nan = qoe(
        &dir,
        &["enqueue", "--video-id", "1", "--trace", "lte.csv", "--duration", "nan"],
    );
    assert_eq!(nan.status.code(), Some(1));
    assert!(stderr(&nan).contains("finite"), "{}", stderr(&nan));

    let escape = qoe(
        &dir,
        &["enqueue", "--video-id", "1", "--trace", "../secret.csv", "--duration", "60"],
    );
    assert_eq!(escape.status.code(), Some(1));
    assert!(stderr(&escape).contains("plain file name"), "{}", stderr(&escape));
    let _ = std::fs::remove_dir_all(dir);
}
