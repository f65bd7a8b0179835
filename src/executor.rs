//! Program execution capability.
//!
//! The agent treats the executor as opaque: it consumes a program reference
//! plus arguments and environment, and yields a readable stdout stream, a
//! writable stdin sink, and eventually a termination status. The
//! process-backed implementation spawns the program with piped stdio.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What to run: a program reference, its arguments, and `K=v` environment
/// entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub file: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
}

/// Termination status of a finished program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
}

/// Handles to a running program. The stdout handle is owned by exactly one
/// pipeline for the program's lifetime; the status channel fires once when
/// the program terminates.
pub struct RunningProgram {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub status: oneshot::Receiver<ExitStatus>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Start the program described by `spec`. A spawn failure is an
    /// executor start error; the caller maps it to a failed worker.
    async fn spawn(&self, spec: &ProgramSpec) -> Result<RunningProgram>;
}

/// Executor backed by local OS processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn spawn(&self, spec: &ProgramSpec) -> Result<RunningProgram> {
        anyhow::ensure!(!spec.file.is_empty(), "program reference is empty");

        debug!(file = %spec.file, args = spec.args.len(), "Spawning program");

        let mut cmd = tokio::process::Command::new(&spec.file);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for entry in &spec.env {
            match entry.split_once('=') {
                Some((key, value)) => {
                    cmd.env(key, value);
                }
                None => warn!(entry = %entry, "Skipping malformed environment entry"),
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn program: {}", spec.file))?;

        let stdin = child.stdin.take().context("Failed to take program stdin")?;
        let stdout = child.stdout.take().context("Failed to take program stdout")?;

        let (status_tx, status_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus {
                    code: i64::from(status.code().unwrap_or(-1)),
                },
                Err(e) => {
                    warn!(error = %e, "Failed to wait for program");
                    ExitStatus { code: -1 }
                }
            };
            // Receiver gone means the worker was already torn down.
            let _ = status_tx.send(status);
        });

        Ok(RunningProgram {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            status: status_rx,
        })
    }
}
