//! Wire format between the dispatcher and worker subprocesses.
//!
//! One JSON document per line over the child's stdin/stdout. The worker
//! announces itself with `ready` (or `load_failed`), then answers every
//! `predict` frame with exactly one `result` or `error` frame carrying the
//! same id.
//!
//! # Limits
//! Frames above the configured size are rejected before parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::ModelSpec;

/// Default frame limit (16 MiB).
pub const DEFAULT_FRAME_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unexpected message: expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: &'static str },
}

/// Messages exchanged with a worker subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker is up; dedicated workers send this after the model loaded.
    Ready {
        pid: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
    },
    /// Dedicated worker could not build or load its model. The process exits.
    LoadFailed { error: String },
    Predict { id: u64, model: ModelSpec, body: Value },
    Result { id: u64, body: Value },
    Error { id: u64, message: String },
    Shutdown,
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::LoadFailed { .. } => "load_failed",
            Self::Predict { .. } => "predict",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Encode a message as one newline-terminated frame.
pub fn encode_frame(message: &WorkerMessage, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(message)?;
    if bytes.len() > max {
        return Err(ProtocolError::FrameTooLarge { size: bytes.len(), max });
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one frame (trailing newline optional).
///
/// Size is checked before parsing.
pub fn decode_frame(line: &[u8], max: usize) -> Result<WorkerMessage, ProtocolError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.len() > max {
        return Err(ProtocolError::FrameTooLarge { size: line.len(), max });
    }
    if line.is_empty() {
        return Err(ProtocolError::InvalidFormat("empty frame".into()));
    }
    Ok(serde_json::from_slice(line)?)
}
