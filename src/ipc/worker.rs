//! Worker-side loop hosted by `flowserve worker`.
//!
//! A worker reads `predict` frames from stdin and writes replies to stdout.
//! Stdout carries protocol frames only; diagnostics go through `tracing`,
//! which writes to stderr.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::protocol::{decode_frame, encode_frame, ProtocolError, WorkerMessage, DEFAULT_FRAME_LIMIT};
use crate::models::{Model, ModelCatalog, ModelSpec};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid worker arguments: {0}")]
    Args(String),

    #[error("Worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// How a worker process is used by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMode {
    /// Shared pool member; builds models on demand from each frame's spec.
    Pool,
    /// Owns one model for its lifetime, optionally pinned to a resource.
    Dedicated { spec: ModelSpec, resource: Option<String> },
}

/// Worker process options, passed on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub mode: WorkerMode,
    pub frame_limit: usize,
}

impl WorkerOptions {
    pub fn pool(frame_limit: usize) -> Self {
        Self { mode: WorkerMode::Pool, frame_limit }
    }

    pub fn dedicated(spec: ModelSpec, resource: Option<String>, frame_limit: usize) -> Self {
        Self { mode: WorkerMode::Dedicated { spec, resource }, frame_limit }
    }

    /// Arguments following the `worker` subcommand.
    pub fn to_args(&self) -> Result<Vec<String>, WorkerError> {
        let mut args = vec!["--frame-limit".to_string(), self.frame_limit.to_string()];
        match &self.mode {
            WorkerMode::Pool => args.extend(["--mode".to_string(), "pool".to_string()]),
            WorkerMode::Dedicated { spec, resource } => {
                let spec = serde_json::to_string(spec).map_err(ProtocolError::from)?;
                args.extend(["--mode".to_string(), "dedicated".to_string()]);
                args.extend(["--model".to_string(), spec]);
                if let Some(resource) = resource {
                    args.extend(["--resource".to_string(), resource.clone()]);
                }
            }
        }
        Ok(args)
    }

    /// Parse the arguments produced by [`WorkerOptions::to_args`].
    pub fn from_args(args: &[String]) -> Result<Self, WorkerError> {
        let mut mode = None;
        let mut model = None;
        let mut resource = None;
        let mut frame_limit = DEFAULT_FRAME_LIMIT;

        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            let mut value = || {
                iter.next()
                    .cloned()
                    .ok_or_else(|| WorkerError::Args(format!("{flag} requires a value")))
            };
            match flag.as_str() {
                "--mode" => mode = Some(value()?),
                "--model" => model = Some(value()?),
                "--resource" => resource = Some(value()?),
                "--frame-limit" => {
                    let raw = value()?;
                    frame_limit = raw
                        .parse()
                        .map_err(|_| WorkerError::Args(format!("invalid frame limit: {raw}")))?;
                }
                other => return Err(WorkerError::Args(format!("unknown flag: {other}"))),
            }
        }

        let mode = match mode.as_deref() {
            Some("pool") | None => WorkerMode::Pool,
            Some("dedicated") => {
                let raw = model.ok_or_else(|| WorkerError::Args("dedicated mode requires --model".into()))?;
                let spec: ModelSpec = serde_json::from_str(&raw).map_err(ProtocolError::from)?;
                WorkerMode::Dedicated { spec, resource }
            }
            Some(other) => return Err(WorkerError::Args(format!("unknown mode: {other}"))),
        };
        Ok(Self { mode, frame_limit })
    }
}

/// Run a worker on the process's stdin/stdout.
pub async fn run_worker(catalog: &ModelCatalog, options: WorkerOptions) -> Result<(), WorkerError> {
    let reader = BufReader::new(tokio::io::stdin());
    serve(catalog, &options, reader, tokio::io::stdout()).await
}

/// Models resolved by a worker, keyed by spec.
enum Resolved {
    Ready(Arc<dyn Model>),
    Failed(String),
}

/// Serve worker frames until EOF or `shutdown`.
pub async fn serve<R, W>(
    catalog: &ModelCatalog,
    options: &WorkerOptions,
    mut reader: R,
    mut writer: W,
) -> Result<(), WorkerError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let limit = options.frame_limit;
    let pid = std::process::id();

    let dedicated = match &options.mode {
        WorkerMode::Pool => {
            send(&mut writer, &WorkerMessage::Ready { pid, resource: None }, limit).await?;
            None
        }
        WorkerMode::Dedicated { spec, resource } => match build_and_load(catalog, spec, resource.as_deref()) {
            Ok(model) => {
                tracing::info!(model = %spec.name, resource = ?resource, pid, "dedicated worker ready");
                let ready = WorkerMessage::Ready { pid, resource: resource.clone() };
                send(&mut writer, &ready, limit).await?;
                Some(model)
            }
            Err(error) => {
                tracing::error!(model = %spec.name, %error, "dedicated worker failed to load model");
                send(&mut writer, &WorkerMessage::LoadFailed { error }, limit).await?;
                return Ok(());
            }
        },
    };

    let mut cache: HashMap<String, Resolved> = HashMap::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            tracing::debug!(pid, "worker stdin closed");
            return Ok(());
        }

        match decode_frame(&line, limit)? {
            WorkerMessage::Predict { id, model, body } => {
                let target = match &dedicated {
                    Some(owned) => Ok(owned.clone()),
                    None => resolve(catalog, &mut cache, &model),
                };
                let reply = match target {
                    Ok(target) => match predict_guarded(target.as_ref(), body) {
                        Ok(body) => WorkerMessage::Result { id, body },
                        Err(message) => WorkerMessage::Error { id, message },
                    },
                    Err(message) => WorkerMessage::Error { id, message },
                };
                match encode_frame(&reply, limit) {
                    Ok(bytes) => write_frame(&mut writer, &bytes).await?,
                    Err(e) => send(&mut writer, &WorkerMessage::Error { id, message: e.to_string() }, limit).await?,
                }
            }
            WorkerMessage::Shutdown => return Ok(()),
            other => tracing::warn!(kind = other.kind(), "worker ignoring unexpected message"),
        }
    }
}

fn build_and_load(catalog: &ModelCatalog, spec: &ModelSpec, resource: Option<&str>) -> Result<Arc<dyn Model>, String> {
    let model = catalog.build(spec, resource).map_err(|e| e.to_string())?;
    model.load().map_err(|e| e.to_string())?;
    Ok(model)
}

fn resolve(
    catalog: &ModelCatalog,
    cache: &mut HashMap<String, Resolved>,
    spec: &ModelSpec,
) -> Result<Arc<dyn Model>, String> {
    let key = format!("{}|{}|{}", spec.name, spec.kind, spec.params);
    let entry = cache.entry(key).or_insert_with(|| match build_and_load(catalog, spec, None) {
        Ok(model) => Resolved::Ready(model),
        Err(error) => Resolved::Failed(error),
    });
    match entry {
        Resolved::Ready(model) => Ok(model.clone()),
        Resolved::Failed(error) => Err(format!("model {} failed to load: {error}", spec.name)),
    }
}

fn predict_guarded(model: &dyn Model, body: serde_json::Value) -> Result<serde_json::Value, String> {
    match catch_unwind(AssertUnwindSafe(|| model.predict(body))) {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("model {} panicked during predict", model.name())),
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, message: &WorkerMessage, limit: usize) -> Result<(), WorkerError> {
    let bytes = encode_frame(message, limit)?;
    write_frame(writer, &bytes).await
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), WorkerError> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
