//! Supervised single-call process runner.
//!
//! [`run_command`] spawns the child, writes the prompt to stdin, and then
//! multiplexes four things until the process exits:
//!
//! - stdout chunks, which reset the idle timer, are appended to a capped
//!   output buffer, and are framed into event lines;
//! - the absolute timer, fixed at call start;
//! - the idle timer, re-armed on every chunk;
//! - the cancellation token.
//!
//! Either timer or cancellation kills the whole process group and
//! resolves with a distinct [`ProcessErrorKind`]. No retry happens here.

use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::EventLineCodec;
use super::events::{parse_event_line, StreamEvent, StreamSummary};
use super::spawner::{self, CommandSpec};
use super::{ProcessError, ProcessErrorKind};
use crate::config::{OverflowPolicy, ProcessConfig};
use crate::models::Usage;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const STDERR_TAIL_BYTES: usize = 8 * 1024;
const ERROR_DETAIL_CHARS: usize = 512;
const REAP_GRACE: Duration = Duration::from_millis(500);
const STDERR_GRACE: Duration = Duration::from_millis(200);

/// Callback invoked for every decoded stdout event.
pub type ProgressCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Callback invoked periodically with the elapsed call time.
pub type HeartbeatCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Per-call supervision settings.
#[derive(Clone)]
pub struct RunOptions {
    /// Absolute wall-clock ceiling from spawn.
    pub timeout: Duration,
    /// Silence ceiling; `None` disables the idle timer.
    pub idle_timeout: Option<Duration>,
    /// Maximum stdout bytes retained.
    pub max_output_bytes: usize,
    /// Behaviour once `max_output_bytes` is reached.
    pub overflow: OverflowPolicy,
    /// Interval for `on_heartbeat`; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Invoked for every decoded event.
    pub on_progress: Option<ProgressCallback>,
    /// Invoked every `heartbeat_interval` while the call is in flight.
    pub on_heartbeat: Option<HeartbeatCallback>,
    /// Cooperative cancellation.
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    /// Options with the given absolute timeout and no idle timer,
    /// heartbeat, callbacks, or cancellation.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            idle_timeout: None,
            max_output_bytes: 2 * 1024 * 1024,
            overflow: OverflowPolicy::Truncate,
            heartbeat_interval: None,
            on_progress: None,
            on_heartbeat: None,
            cancel: None,
        }
    }

    /// Options derived from the process configuration.
    #[must_use]
    pub fn from_config(config: &ProcessConfig) -> Self {
        Self {
            timeout: config.timeout(),
            idle_timeout: config.idle_timeout(),
            max_output_bytes: config.max_output_bytes,
            overflow: config.overflow,
            heartbeat_interval: (config.heartbeat_seconds > 0)
                .then(|| Duration::from_secs(config.heartbeat_seconds)),
            on_progress: None,
            on_heartbeat: None,
            cancel: None,
        }
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    /// Set the output ceiling and overflow policy.
    #[must_use]
    pub fn with_output_limit(mut self, max_output_bytes: usize, overflow: OverflowPolicy) -> Self {
        self.max_output_bytes = max_output_bytes;
        self.overflow = overflow;
        self
    }

    /// Set the progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Set the heartbeat callback and interval.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, callback: HeartbeatCallback) -> Self {
        self.heartbeat_interval = Some(interval);
        self.on_heartbeat = Some(callback);
        self
    }

    /// Set the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("timeout", &self.timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_output_bytes", &self.max_output_bytes)
            .field("overflow", &self.overflow)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("on_progress", &self.on_progress.is_some())
            .field("on_heartbeat", &self.on_heartbeat.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// Successful result of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Final result text, or captured stdout when no result event arrived.
    pub text: String,
    /// Session id reported by the process.
    pub continuation_token: Option<String>,
    /// Tokens consumed.
    pub usage: Usage,
    /// Wall-clock duration of the call.
    pub duration_ms: u64,
    /// Whether `text` was cut at the output ceiling.
    pub truncated: bool,
    /// Exit code of the process.
    pub exit_code: Option<i32>,
}

/// Runs the configured external command.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: ProcessConfig,
}

impl ProcessRunner {
    /// Create a runner for the configured command.
    #[must_use]
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    /// Process configuration in use.
    #[must_use]
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Default supervision settings from configuration.
    #[must_use]
    pub fn default_options(&self) -> RunOptions {
        RunOptions::from_config(&self.config)
    }

    /// Command spec for one call, tagged to resume `resume_token` if given.
    #[must_use]
    pub fn command_spec(&self, resume_token: Option<&str>) -> CommandSpec {
        let mut args = self.config.args.clone();
        if let Some(token) = resume_token {
            args.extend(
                self.config
                    .resume_args
                    .iter()
                    .map(|arg| arg.replace("{token}", token)),
            );
        }

        CommandSpec {
            program: self.config.command.clone(),
            args,
            env_allowlist: self.config.env_allowlist.clone(),
            env: Vec::new(),
            working_dir: self.config.working_dir.clone(),
        }
    }

    /// Run one call with `input` on stdin.
    ///
    /// # Errors
    ///
    /// Returns a [`ProcessError`] for spawn failure, non-zero exit, either
    /// timeout, output overflow under the `fail` policy, or cancellation.
    pub async fn run(
        &self,
        input: &str,
        resume_token: Option<&str>,
        opts: &RunOptions,
    ) -> std::result::Result<RunOutput, ProcessError> {
        run_command(&self.command_spec(resume_token), input, opts).await
    }
}

/// Spawn `spec`, deliver `input` on stdin, and supervise until exit.
///
/// # Errors
///
/// Returns a [`ProcessError`] for spawn failure, non-zero exit, either
/// timeout, output overflow under the `fail` policy, pipe failure, or
/// cancellation. Every error path kills the process group first, and so
/// does dropping the returned future before the child is reaped.
pub async fn run_command(
    spec: &CommandSpec,
    input: &str,
    opts: &RunOptions,
) -> std::result::Result<RunOutput, ProcessError> {
    let started = Instant::now();
    let mut child = spawner::spawn(spec)?;

    let stdin_task = write_stdin(&mut child, input);
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES)));

    let Some(mut stdout) = child.stdout.take() else {
        spawner::kill_tree(&mut child);
        return Err(ProcessError::new(
            ProcessErrorKind::Io,
            "failed to capture process stdout",
            started.elapsed(),
        ));
    };

    let wall = tokio::time::sleep(opts.timeout);
    tokio::pin!(wall);
    let idle = tokio::time::sleep(opts.idle_timeout.unwrap_or(opts.timeout));
    tokio::pin!(idle);
    let mut heartbeat = opts
        .heartbeat_interval
        .filter(|_| opts.on_heartbeat.is_some())
        .map(|every| tokio::time::interval_at(started + every, every));

    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut pending_lines = BytesMut::new();
    let mut codec = EventLineCodec::new();
    let mut summary = StreamSummary::default();
    let mut output = OutputCollector::new(opts.max_output_bytes);

    // ── Stream until EOF or a supervision failure ───────────
    let failure = loop {
        tokio::select! {
            biased;

            () = wait_cancelled(opts.cancel.as_ref()) => {
                break Some(ProcessError::new(
                    ProcessErrorKind::Cancelled,
                    format!("cancelled after {}ms", millis(started.elapsed())),
                    started.elapsed(),
                ));
            }

            () = &mut wall => break Some(timeout_error(started.elapsed(), opts.timeout)),

            () = &mut idle, if opts.idle_timeout.is_some() => {
                let window = opts.idle_timeout.unwrap_or(opts.timeout);
                break Some(ProcessError::new(
                    ProcessErrorKind::IdleTimeout,
                    format!(
                        "no output for {}ms (idle limit {}ms) after {}ms elapsed",
                        millis(window),
                        millis(window),
                        millis(started.elapsed())
                    ),
                    started.elapsed(),
                ));
            }

            () = tick(heartbeat.as_mut()) => {
                if let Some(callback) = &opts.on_heartbeat {
                    callback(started.elapsed());
                }
            }

            read = stdout.read(&mut chunk) => match read {
                Ok(0) => break None,
                Ok(n) => {
                    if let Some(window) = opts.idle_timeout {
                        idle.as_mut().reset(Instant::now() + window);
                    }
                    let overflowed = output.push(&chunk[..n]);
                    if overflowed && opts.overflow == OverflowPolicy::Fail {
                        break Some(ProcessError::new(
                            ProcessErrorKind::OutputTooLarge,
                            format!("output exceeded {} bytes", opts.max_output_bytes),
                            started.elapsed(),
                        ));
                    }
                    pending_lines.extend_from_slice(&chunk[..n]);
                    drain_lines(&mut codec, &mut pending_lines, false, &mut summary, opts);
                }
                Err(err) => {
                    break Some(ProcessError::new(
                        ProcessErrorKind::Io,
                        format!("failed to read stdout: {err}"),
                        started.elapsed(),
                    ));
                }
            }
        }
    };

    if let Some(mut err) = failure {
        warn!(
            program = spec.program,
            kind = %err.kind,
            elapsed_ms = millis(err.elapsed),
            "killing process tree"
        );
        spawner::kill_tree(&mut child);
        reap(&mut child).await;
        child.disarm();
        stdin_task.abort();
        err.stderr_tail = collect_tail(stderr_task).await;
        return Err(err);
    }

    drain_lines(&mut codec, &mut pending_lines, true, &mut summary, opts);

    // ── Stdout closed; wait for exit under the same ceilings ─
    let status = tokio::select! {
        biased;

        () = wait_cancelled(opts.cancel.as_ref()) => Err(ProcessError::new(
            ProcessErrorKind::Cancelled,
            format!("cancelled after {}ms", millis(started.elapsed())),
            started.elapsed(),
        )),

        () = &mut wall => Err(timeout_error(started.elapsed(), opts.timeout)),

        status = child.wait() => status.map_err(|err| ProcessError::new(
            ProcessErrorKind::Io,
            format!("failed to wait for process: {err}"),
            started.elapsed(),
        )),
    };

    let elapsed = started.elapsed();
    stdin_task.abort();

    let status = match status {
        Ok(status) => {
            child.disarm();
            status
        }
        Err(mut err) => {
            spawner::kill_tree(&mut child);
            reap(&mut child).await;
            child.disarm();
            err.stderr_tail = collect_tail(stderr_task).await;
            return Err(err);
        }
    };
    let stderr_tail = collect_tail(stderr_task).await;

    if !status.success() || summary.is_error {
        let exit_desc = status.code().map_or_else(
            || "terminated by signal".to_owned(),
            |code| format!("exit code {code}"),
        );
        let detail = error_detail(&summary, &output);
        let message = if status.success() {
            format!("turn reported an error ({exit_desc}) after {}ms{detail}", millis(elapsed))
        } else {
            format!("process failed with {exit_desc} after {}ms{detail}", millis(elapsed))
        };

        info!(
            program = spec.program,
            exit_code = status.code(),
            status_signal = summary.status,
            "process call failed"
        );

        return Err(ProcessError {
            kind: ProcessErrorKind::NonZeroExit,
            message,
            elapsed,
            exit_code: status.code(),
            status: summary.status,
            retry_after: summary.retry_after,
            stderr_tail,
        });
    }

    if !stderr_tail.is_empty() {
        debug!(program = spec.program, stderr = %stderr_tail, "process stderr");
    }

    let continuation_token = summary.continuation_token();
    let (text, truncated) = match summary.final_result.take() {
        Some(result) => cap_text(result, opts.max_output_bytes),
        None => output.finish(),
    };

    info!(
        program = spec.program,
        duration_ms = millis(elapsed),
        output_bytes = text.len(),
        truncated,
        "process call finished"
    );

    Ok(RunOutput {
        text,
        continuation_token,
        usage: summary.usage,
        duration_ms: millis(elapsed),
        truncated,
        exit_code: status.code(),
    })
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Stdout bytes retained up to a ceiling; the excess is only counted.
struct OutputCollector {
    buf: Vec<u8>,
    limit: usize,
    discarded: u64,
}

impl OutputCollector {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            discarded: 0,
        }
    }

    /// Append a chunk; returns `true` if any of it was discarded.
    fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.limit.saturating_sub(self.buf.len());
        let keep = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..keep]);
        let dropped = chunk.len() - keep;
        self.discarded += dropped as u64;
        dropped > 0
    }

    fn tail(&self, max_chars: usize) -> String {
        let text = String::from_utf8_lossy(&self.buf);
        let trimmed = text.trim();
        let skip = trimmed.chars().count().saturating_sub(max_chars);
        trimmed.chars().skip(skip).collect()
    }

    fn finish(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.discarded == 0 {
            return (text, false);
        }
        text.push_str(&truncation_marker(self.discarded));
        (text, true)
    }
}

fn truncation_marker(discarded: u64) -> String {
    format!("\n[output truncated: {discarded} bytes discarded]")
}

/// Cut `text` to at most `limit` bytes on a char boundary, adding the marker.
fn cap_text(mut text: String, limit: usize) -> (String, bool) {
    if text.len() <= limit {
        return (text, false);
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let discarded = (text.len() - cut) as u64;
    text.truncate(cut);
    text.push_str(&truncation_marker(discarded));
    (text, true)
}

/// Decode every complete line in `buf`, folding events into `summary`.
fn drain_lines(
    codec: &mut EventLineCodec,
    buf: &mut BytesMut,
    at_eof: bool,
    summary: &mut StreamSummary,
    opts: &RunOptions,
) {
    loop {
        let decoded = if at_eof {
            codec.decode_eof(buf)
        } else {
            codec.decode(buf)
        };

        match decoded {
            Ok(Some(line)) => {
                if let Some(event) = parse_event_line(&line) {
                    summary.observe(&event);
                    if let Some(callback) = &opts.on_progress {
                        callback(&event);
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                // Over-long or non-UTF-8 line: the codec has already
                // skipped it, keep going with the rest of the buffer.
                debug!(%err, "dropping undecodable stdout line");
            }
        }
    }
}

fn error_detail(summary: &StreamSummary, output: &OutputCollector) -> String {
    let detail = summary
        .final_result
        .as_deref()
        .map(|r| r.chars().take(ERROR_DETAIL_CHARS).collect::<String>())
        .unwrap_or_else(|| output.tail(ERROR_DETAIL_CHARS));
    if detail.trim().is_empty() {
        String::new()
    } else {
        format!(": {}", detail.trim())
    }
}

fn timeout_error(elapsed: Duration, limit: Duration) -> ProcessError {
    ProcessError::new(
        ProcessErrorKind::Timeout,
        format!(
            "process timed out after {}ms (limit {}ms)",
            millis(elapsed),
            millis(limit)
        ),
        elapsed,
    )
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Write the prompt and close stdin so the child sees EOF.
fn write_stdin(child: &mut Child, input: &str) -> JoinHandle<()> {
    let stdin = child.stdin.take();
    let bytes = input.as_bytes().to_vec();
    tokio::spawn(async move {
        let Some(mut stdin) = stdin else {
            return;
        };
        if let Err(err) = stdin.write_all(&bytes).await {
            // The child may exit without reading its input.
            debug!(%err, "failed to write prompt to stdin");
            return;
        }
        if let Err(err) = stdin.shutdown().await {
            debug!(%err, "failed to close stdin");
        }
    })
}

/// Keep the last `limit` bytes of a stream.
async fn read_tail<R>(mut reader: R, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_owned()
}

async fn collect_tail(task: Option<JoinHandle<String>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(STDERR_GRACE, &mut task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(err)) => {
            debug!(%err, "stderr reader task failed");
            String::new()
        }
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

async fn reap(child: &mut Child) {
    if tokio::time::timeout(REAP_GRACE, child.wait()).await.is_err() {
        warn!("process did not exit after kill within grace period");
    }
}

async fn wait_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => pending().await,
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
