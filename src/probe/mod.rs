//! # External Probe Gateway
//!
//! Every interaction with a radio goes through the `meshtastic` CLI, treated as a fallible
//! black box: a name, a timeout and a parseable result. This module wraps those
//! invocations behind [`ProbeGateway`] so discovery, validation and telemetry share one
//! timeout/retry policy.
//!
//! ## Retry policy
//!
//! - A clean exit (zero or not) is final: a non-zero exit is a negative answer, not a fault.
//! - Timeouts and transient I/O errors are retried up to `max_retries` times, each attempt
//!   with the same timeout.
//! - A command that cannot be started (not found, permission denied) fails immediately
//!   with [`ProbeError::LaunchFailure`].
//!
//! Timed-out children are killed and reaped before the next attempt starts.

mod extract;

pub use extract::extract_json;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::config::ProbeConfig;
use crate::logutil::{escape_log, last_line};

/// Normalized outcome of one completed invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeResult {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// JSON found in stdout, see [`extract_json`].
    pub json: Option<Value>,
    /// True when an earlier attempt of this invocation timed out before this one finished.
    pub timed_out: bool,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

impl ProbeResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn from_output(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        let json = extract_json(&stdout);
        Self {
            exit_code: status.code(),
            stdout,
            stderr,
            json,
            timed_out: false,
            attempts: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    /// Every attempt overran its timeout.
    #[error("probe timed out after {attempts} attempt(s) of {timeout:?}")]
    Timeout { attempts: u32, timeout: Duration },

    /// The command (and its fallback) could not be started at all.
    #[error("failed to launch `{command}`: {source}")]
    LaunchFailure {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Transient I/O failures persisted through every attempt.
    #[error("probe I/O failed after {attempts} attempt(s): {source}")]
    Io {
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Timeout and retry budget for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl ProbePolicy {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
        }
    }
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), 2)
    }
}

impl From<&ProbeConfig> for ProbePolicy {
    fn from(cfg: &ProbeConfig) -> Self {
        Self::new(cfg.timeout(), cfg.max_retries)
    }
}

#[async_trait]
pub trait ProbeGateway: Send + Sync {
    /// Run the external command with `args`, retrying per `policy`.
    async fn invoke(&self, args: &[String], policy: ProbePolicy) -> Result<ProbeResult, ProbeError>;
}

enum Attempt {
    Finished {
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    TimedOut,
}

enum AttemptError {
    Launch { command: String, source: io::Error },
    Transient(io::Error),
}

/// Subprocess-backed gateway around the `meshtastic` executable.
#[derive(Debug, Clone)]
pub struct CommandGateway {
    command: String,
    fallback: Vec<String>,
    retry_delay: Duration,
}

impl CommandGateway {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            fallback: Vec::new(),
            retry_delay: Duration::from_millis(1000),
        }
    }

    pub fn from_config(cfg: &ProbeConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            fallback: cfg.fallback_command.clone(),
            retry_delay: cfg.retry_delay(),
        }
    }

    /// Invocation tried when the primary command is not found (program followed by its leading args).
    pub fn with_fallback(mut self, fallback: Vec<String>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn spawn(program: &str, prefix: &[String], args: &[String]) -> io::Result<Child> {
        Command::new(program)
            .args(prefix)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    fn spawn_with_fallback(&self, args: &[String]) -> Result<Child, AttemptError> {
        match Self::spawn(&self.command, &[], args) {
            Ok(child) => Ok(child),
            Err(e) if e.kind() == io::ErrorKind::NotFound => match self.fallback.split_first() {
                Some((program, prefix)) => {
                    debug!(
                        "probe: `{}` not found, trying fallback `{}`",
                        self.command,
                        self.fallback.join(" ")
                    );
                    Self::spawn(program, prefix, args).map_err(|e| classify_spawn_error(program, e))
                }
                None => Err(AttemptError::Launch {
                    command: self.command.clone(),
                    source: e,
                }),
            },
            Err(e) => Err(classify_spawn_error(&self.command, e)),
        }
    }

    async fn run_attempt(&self, args: &[String], timeout: Duration) -> Result<Attempt, AttemptError> {
        let mut child = self.spawn_with_fallback(args)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = tokio::time::timeout(timeout, async {
            let (out, err, status) = tokio::join!(drain(stdout), drain(stderr), child.wait());
            Ok::<_, io::Error>((status?, out?, err?))
        })
        .await;

        match outcome {
            Ok(Ok((status, stdout, stderr))) => Ok(Attempt::Finished {
                status,
                stdout,
                stderr,
            }),
            Ok(Err(e)) => {
                reap(&mut child).await;
                Err(AttemptError::Transient(e))
            }
            Err(_) => {
                reap(&mut child).await;
                Ok(Attempt::TimedOut)
            }
        }
    }
}

#[async_trait]
impl ProbeGateway for CommandGateway {
    async fn invoke(&self, args: &[String], policy: ProbePolicy) -> Result<ProbeResult, ProbeError> {
        let total = policy.max_retries.saturating_add(1);
        let mut timeouts = 0u32;
        let mut last_io: Option<io::Error> = None;

        for attempt in 1..=total {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }
            debug!(
                "probe: attempt {}/{}: {} {}",
                attempt,
                total,
                self.command,
                escape_log(&args.join(" "))
            );
            match self.run_attempt(args, policy.timeout).await {
                Ok(Attempt::Finished {
                    status,
                    stdout,
                    stderr,
                }) => {
                    let mut result = ProbeResult::from_output(status, stdout, stderr);
                    result.attempts = attempt;
                    result.timed_out = timeouts > 0;
                    if !result.success() {
                        debug!(
                            "probe: exit {:?}: {}",
                            result.exit_code,
                            last_line(&result.stderr)
                        );
                    }
                    return Ok(result);
                }
                Ok(Attempt::TimedOut) => {
                    timeouts += 1;
                    last_io = None;
                    warn!(
                        "probe: attempt {}/{} timed out after {:?}",
                        attempt, total, policy.timeout
                    );
                }
                Err(AttemptError::Launch { command, source }) => {
                    warn!("probe: cannot launch `{}`: {}", command, source);
                    return Err(ProbeError::LaunchFailure { command, source });
                }
                Err(AttemptError::Transient(e)) => {
                    warn!("probe: attempt {}/{} I/O error: {}", attempt, total, e);
                    last_io = Some(e);
                }
            }
        }

        match last_io {
            Some(source) => Err(ProbeError::Io {
                attempts: total,
                source,
            }),
            None => Err(ProbeError::Timeout {
                attempts: total,
                timeout: policy.timeout,
            }),
        }
    }
}

fn classify_spawn_error(program: &str, e: io::Error) -> AttemptError {
    if is_transient(&e) {
        AttemptError::Transient(e)
    } else {
        AttemptError::Launch {
            command: program.to_string(),
            source: e,
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Kill (if still running) and wait on the child so it never lingers as a zombie.
async fn reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("probe: kill after abandon failed: {}", e);
    }
}
