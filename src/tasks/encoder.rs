//! External encoder invocation.
//!
//! The encoder is an ffmpeg-style subprocess: conversion parameters become
//! command-line arguments, machine-readable progress arrives as `key=value`
//! blocks on stdout (`-progress pipe:1`), and the media duration is scraped
//! from the stderr banner. Parsing is pure and separated from process
//! plumbing so it is testable without any I/O.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vidforge_api::models::ConversionParams;

/// How many trailing stderr lines are kept for failure reasons
const STDERR_TAIL_LINES: usize = 12;

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Encoder binary name or path
    pub binary: String,
    /// Grace period between the polite quit request and a forced kill
    pub kill_grace: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            kill_grace: Duration::from_secs(10),
        }
    }
}

/// One conversion job handed to the encoder
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub params: ConversionParams,
}

/// Parsed progress state from one `-progress` block
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSnapshot {
    /// Current encode position in seconds
    pub out_time_seconds: Option<f64>,
    /// Encoding speed as a realtime multiple
    pub speed: Option<f64>,
    /// Frames produced so far
    pub frame: Option<u64>,
    /// True on the final block (`progress=end`)
    pub finished: bool,
}

/// Outcome of one encoder run
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    Completed,
    Cancelled,
    Failed { reason: String },
}

/// Build the encoder argument list from a request.
///
/// Free-form extra parameters are passed through as `-key value` pairs in
/// sorted order so the command line is deterministic.
pub fn build_args(request: &EncodeRequest) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        request.input.display().to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-nostats".to_string(),
    ];

    if let Some(codec) = &request.params.video_codec {
        args.push("-c:v".to_string());
        args.push(codec.clone());
    }
    if let Some(codec) = &request.params.audio_codec {
        args.push("-c:a".to_string());
        args.push(codec.clone());
    }
    if let Some(filter) = request
        .params
        .resolution
        .as_deref()
        .and_then(scale_filter)
    {
        args.push("-vf".to_string());
        args.push(filter);
    }

    let mut extra: Vec<_> = request.params.extra.iter().collect();
    extra.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in extra {
        args.push(format!("-{key}"));
        match value {
            serde_json::Value::String(s) => args.push(s.clone()),
            other => args.push(other.to_string()),
        }
    }

    args.push(request.output.display().to_string());
    args
}

/// Map a resolution label to a scale filter keeping the aspect ratio
fn scale_filter(resolution: &str) -> Option<String> {
    let height = match resolution.to_lowercase().as_str() {
        "480p" => 480,
        "720p" => 720,
        "1080p" => 1080,
        "1440p" | "2k" => 1440,
        "2160p" | "4k" => 2160,
        _ => return None,
    };
    Some(format!("scale=-2:{height}"))
}

/// Parse a `HH:MM:SS.frac` clock value into seconds
pub fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.trim().splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Extract the media duration from the encoder's stderr banner
/// (`  Duration: 00:01:30.55, start: 0.000000, ...`)
pub fn parse_duration_line(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?;
    let clock = rest.split(',').next()?.trim();
    if clock == "N/A" {
        return None;
    }
    parse_clock(clock)
}

/// Accumulates `key=value` progress lines into snapshots.
///
/// The encoder terminates each block with a `progress=continue|end` line;
/// `feed` returns a snapshot exactly at block boundaries.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressSnapshot,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> Option<ProgressSnapshot> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            "frame" => {
                self.current.frame = value.trim().parse().ok();
                None
            }
            // out_time_ms is microseconds despite its name; prefer the
            // clock form and fall back to the integer fields
            "out_time" => {
                if let Some(seconds) = parse_clock(value) {
                    self.current.out_time_seconds = Some(seconds);
                }
                None
            }
            "out_time_us" | "out_time_ms" => {
                if self.current.out_time_seconds.is_none() {
                    if let Ok(micros) = value.trim().parse::<i64>() {
                        self.current.out_time_seconds = Some(micros as f64 / 1_000_000.0);
                    }
                }
                None
            }
            "speed" => {
                let trimmed = value.trim().trim_end_matches('x');
                self.current.speed = trimmed.parse().ok();
                None
            }
            "progress" => {
                let mut snapshot = self.current;
                snapshot.finished = value.trim() == "end";
                self.current = ProgressSnapshot::default();
                Some(snapshot)
            }
            _ => None,
        }
    }
}

/// Updates surfaced while the encoder runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncoderUpdate {
    Progress(ProgressSnapshot),
    /// Media duration scraped from the stderr banner, in seconds
    Duration(f64),
}

/// Encoder process driver
#[derive(Debug, Clone)]
pub struct Encoder {
    config: EncoderConfig,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    /// Run one conversion to completion, cancellation, or failure.
    ///
    /// `on_update` fires once per progress block and once when the media
    /// duration becomes known. Cancellation is cooperative: a quit request
    /// on stdin first, a forced kill after the grace period.
    pub async fn run(
        &self,
        request: &EncodeRequest,
        cancel: &CancellationToken,
        mut on_update: impl FnMut(EncoderUpdate),
    ) -> Result<EncodeOutcome> {
        let args = build_args(request);
        debug!(
            target: "tasks::encoder",
            binary = %self.config.binary,
            input = %request.input.display(),
            output = %request.output.display(),
            "Spawning encoder"
        );

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn encoder {}", self.config.binary))?;

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take().context("Encoder stdout not captured")?;
        let stderr = child.stderr.take().context("Encoder stderr not captured")?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let stdout_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut parser = ProgressParser::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(snapshot) = parser.feed(&line) {
                    if stdout_tx.send(EncoderUpdate::Progress(snapshot)).is_err() {
                        break;
                    }
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            let mut duration_sent = false;
            while let Ok(Some(line)) = lines.next_line().await {
                if !duration_sent {
                    if let Some(duration) = parse_duration_line(&line) {
                        duration_sent = true;
                        let _ = event_tx.send(EncoderUpdate::Duration(duration));
                    }
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let mut cancelled = false;
        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(update) => on_update(update),
                        // Both pipes closed: the process is exiting
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    cancelled = true;
                    self.stop_child(&mut child, stdin.take()).await;
                    break;
                }
            }
        }

        // Deliver progress that raced with shutdown
        while let Ok(update) = event_rx.try_recv() {
            on_update(update);
        }

        let status = child.wait().await.context("Failed to wait for encoder")?;
        let tail = stderr_task.await.unwrap_or_default();

        if cancelled {
            info!(target: "tasks::encoder", "Encoder stopped on cancellation");
            return Ok(EncodeOutcome::Cancelled);
        }

        if status.success() {
            if tokio::fs::metadata(&request.output).await.is_ok() {
                Ok(EncodeOutcome::Completed)
            } else {
                Ok(EncodeOutcome::Failed {
                    reason: "Encoder exited successfully but produced no output".to_string(),
                })
            }
        } else {
            let reason = tail
                .iter()
                .rev()
                .find(|line| !line.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| format!("Encoder exited with {status}"));
            warn!(target: "tasks::encoder", %status, reason = %reason, "Encoder failed");
            Ok(EncodeOutcome::Failed { reason })
        }
    }

    /// Polite quit on stdin, forced kill after the grace period
    async fn stop_child(&self, child: &mut Child, stdin: Option<ChildStdin>) {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.shutdown().await;
        }

        match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
            Ok(_) => {
                debug!(target: "tasks::encoder", "Encoder exited within grace period");
            }
            Err(_) => {
                warn!(target: "tasks::encoder", "Encoder ignored quit request, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}
