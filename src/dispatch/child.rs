//! Parent-side handle to one worker subprocess.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

use super::error::DispatchError;
use crate::ipc::{decode_frame, encode_frame, WorkerMessage, WorkerOptions};
use crate::models::{ModelError, ModelSpec};

/// Program and leading arguments used to start a worker.
///
/// The worker options (`--mode ...`) are appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `<program> worker`, the layout of the `flowserve` binary.
    pub fn flowserve(program: impl Into<PathBuf>) -> Self {
        Self::new(program).arg("worker")
    }

    /// The running executable with the `worker` subcommand.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::flowserve(std::env::current_exe()?))
    }
}

/// A live worker process with piped stdin/stdout.
pub(crate) struct WorkerChild {
    model: String,
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pid: u32,
    next_id: u64,
    frame_limit: usize,
    line: Vec<u8>,
}

impl WorkerChild {
    /// Spawn a worker and wait for its `ready` frame.
    ///
    /// `model` only labels errors; pool workers are labelled with the model
    /// whose call caused the spawn.
    pub async fn spawn(
        command: &WorkerCommand,
        options: &WorkerOptions,
        model: &str,
        startup_timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let spawn_error = |reason: String| DispatchError::WorkerSpawn { model: model.to_string(), reason };

        let extra = options.to_args().map_err(|e| spawn_error(e.to_string()))?;
        let mut process = Command::new(&command.program)
            .args(&command.args)
            .args(&extra)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(format!("{}: {e}", command.program.display())))?;

        let pid = process.id().unwrap_or_default();
        let stdin = process.stdin.take().ok_or_else(|| spawn_error("stdin not captured".into()))?;
        let stdout = process.stdout.take().ok_or_else(|| spawn_error("stdout not captured".into()))?;

        let mut child = Self {
            model: model.to_string(),
            process,
            stdin,
            stdout: BufReader::new(stdout),
            pid,
            next_id: 1,
            frame_limit: options.frame_limit,
            line: Vec::new(),
        };

        let first = match timeout(startup_timeout, child.read_frame()).await {
            Ok(frame) => frame?,
            Err(_) => {
                return Err(spawn_error(format!("no ready frame within {startup_timeout:?}")));
            }
        };
        match first {
            WorkerMessage::Ready { pid: reported, resource } => {
                tracing::debug!(model, pid = reported, resource = ?resource, "worker ready");
                Ok(child)
            }
            WorkerMessage::LoadFailed { error } => Err(DispatchError::LoadFailed {
                model: model.to_string(),
                reason: error,
            }),
            other => Err(DispatchError::Protocol {
                model: model.to_string(),
                reason: format!("expected ready, got {}", other.kind()),
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process has not exited yet.
    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Send one predict frame and wait for its reply.
    pub async fn call(&mut self, spec: &ModelSpec, body: Value) -> Result<Value, DispatchError> {
        let id = self.next_id;
        self.next_id += 1;
        self.model.clone_from(&spec.name);

        let frame = encode_frame(&WorkerMessage::Predict { id, model: spec.clone(), body }, self.frame_limit)
            .map_err(|e| DispatchError::ModelFailed {
                model: spec.name.clone(),
                source: ModelError::InvalidInput(e.to_string()),
            })?;
        if self.write_all(&frame).await.is_err() {
            return Err(self.exited().await);
        }

        match self.read_frame().await? {
            WorkerMessage::Result { id: reply, body } if reply == id => Ok(body),
            WorkerMessage::Error { id: reply, message } if reply == id => Err(DispatchError::ModelFailed {
                model: spec.name.clone(),
                source: ModelError::Predict(message),
            }),
            other => Err(DispatchError::Protocol {
                model: spec.name.clone(),
                reason: format!("unexpected {} frame for call {id}", other.kind()),
            }),
        }
    }

    /// Ask the worker to exit, killing it after `grace`.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Ok(frame) = encode_frame(&WorkerMessage::Shutdown, self.frame_limit) {
            let _ = self.write_all(&frame).await;
        }
        match timeout(grace, self.process.wait()).await {
            Ok(_) => tracing::debug!(model = %self.model, pid = self.pid, "worker exited"),
            Err(_) => {
                tracing::warn!(model = %self.model, pid = self.pid, "worker ignored shutdown, killing");
                let _ = self.process.start_kill();
            }
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(bytes).await?;
        self.stdin.flush().await
    }

    async fn read_frame(&mut self) -> Result<WorkerMessage, DispatchError> {
        self.line.clear();
        match self.stdout.read_until(b'\n', &mut self.line).await {
            Ok(0) | Err(_) => Err(self.exited().await),
            Ok(_) => decode_frame(&self.line, self.frame_limit).map_err(|e| DispatchError::Protocol {
                model: self.model.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Build the error for a worker whose pipes closed.
    async fn exited(&mut self) -> DispatchError {
        let status = match timeout(Duration::from_secs(1), self.process.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("wait failed: {e}"),
            Err(_) => "stdout closed".to_string(),
        };
        tracing::warn!(model = %self.model, pid = self.pid, %status, "worker process exited");
        DispatchError::WorkerExited { model: self.model.clone(), status }
    }
}
