use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Bounds applied to a single run of an external command.
#[derive(Debug, Clone)]
pub struct InvocationLimits {
    /// `None` waits for the child indefinitely.
    pub timeout: Option<Duration>,
    /// Per-stream cap; bytes past it are drained and dropped.
    pub max_output_bytes: usize,
}

impl Default for InvocationLimits {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            max_output_bytes: 4 * 1024 * 1024,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The child exited on its own. `code` is `None` when it died from a signal.
    Exited { code: Option<i32> },
    /// The child never started.
    SpawnFailed(String),
    /// The deadline passed and the child was killed.
    TimedOut(Duration),
    /// The caller gave up and the child was killed.
    Cancelled,
}

/// Everything captured from one run. Owned by the call that started it.
#[derive(Debug, Clone)]
pub struct ProcessInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub outcome: ProcessOutcome,
    pub elapsed: Duration,
}

impl ProcessInvocation {
    fn new(command: &str, args: &[String], outcome: ProcessOutcome) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            outcome,
            elapsed: Duration::ZERO,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ProcessOutcome::Exited { code } => code,
            _ => None,
        }
    }

    pub fn spawn_error(&self) -> Option<&str> {
        match &self.outcome {
            ProcessOutcome::SpawnFailed(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == Some(0)
    }
}

#[derive(Debug, Default)]
struct CapturedStream {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CapturedStream {
    fn into_text(mut self) -> (String, bool) {
        if self.truncated {
            let keep = complete_prefix_len(&self.bytes);
            self.bytes.truncate(keep);
        }
        let text = match String::from_utf8(self.bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        (text, self.truncated)
    }
}

/// Length of `bytes` without a multi-byte UTF-8 sequence cut off at the end.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let lead = bytes[len - back];
        if lead & 0xC0 == 0x80 {
            continue;
        }
        let width = match lead {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    limit: usize,
    label: &str,
) -> CapturedStream {
    let mut captured = CapturedStream::default();
    let Some(mut reader) = reader else {
        return captured;
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("reading child {}: {}", label, e);
                break;
            }
        };
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.bytes.extend_from_slice(&chunk[..room]);
            captured.truncated = true;
        } else {
            captured.bytes.extend_from_slice(&chunk[..n]);
        }
    }
    captured
}

/// Run `command` with `args` to completion and capture both output streams.
///
/// Arguments are passed as a vector, never through a shell. A non-zero exit is
/// still a completed run; only a failure to start yields `SpawnFailed`. If the
/// deadline in `limits` passes or `cancel` fires first, the child is killed.
pub async fn invoke(
    command: &str,
    args: &[String],
    limits: &InvocationLimits,
    cancel: &CancellationToken,
) -> ProcessInvocation {
    let started = Instant::now();
    debug!("spawning {} {:?}", command, args);

    let mut child = match Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!("failed to start {}: {}", command, e);
            let mut invocation =
                ProcessInvocation::new(command, args, ProcessOutcome::SpawnFailed(e.to_string()));
            invocation.elapsed = started.elapsed();
            return invocation;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let cap = limits.max_output_bytes;

    let mut run = Box::pin(async {
        let (out, err) = tokio::join!(
            read_capped(stdout, cap, "stdout"),
            read_capped(stderr, cap, "stderr")
        );
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("waiting on {}: {}", command, e);
                None
            }
        };
        (out, err, code)
    });

    let deadline = async {
        match limits.timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    let finished = tokio::select! {
        done = &mut run => Ok(done),
        _ = deadline => Err(ProcessOutcome::TimedOut(limits.timeout.unwrap_or_default())),
        _ = cancel.cancelled() => Err(ProcessOutcome::Cancelled),
    };
    drop(run);

    let mut invocation = match finished {
        Ok((out, err, code)) => {
            let mut invocation =
                ProcessInvocation::new(command, args, ProcessOutcome::Exited { code });
            (invocation.stdout, invocation.stdout_truncated) = out.into_text();
            (invocation.stderr, invocation.stderr_truncated) = err.into_text();
            invocation
        }
        Err(outcome) => {
            warn!("stopping {} early: {:?}", command, outcome);
            if let Err(e) = child.start_kill() {
                debug!("kill {}: {}", command, e);
            }
            let _ = child.wait().await;
            ProcessInvocation::new(command, args, outcome)
        }
    };
    invocation.elapsed = started.elapsed();

    info!(
        command,
        outcome = ?invocation.outcome,
        stdout_bytes = invocation.stdout.len(),
        stderr_bytes = invocation.stderr.len(),
        elapsed_ms = invocation.elapsed.as_millis() as u64,
        "invocation finished"
    );
    invocation
}
