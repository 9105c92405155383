use std::time::Duration;

use thiserror::Error;

use crate::models::{ExecutionMechanism, ModelError};

/// A failed dispatch, always attributed to the model it was issued for.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("Model {model} failed: {source}")]
    ModelFailed {
        model: String,
        #[source]
        source: ModelError,
    },

    #[error("Model {model} did not answer within {timeout:?}")]
    Timeout { model: String, timeout: Duration },

    #[error("Thread pool saturated, rejected call to model {model}")]
    PoolSaturated { model: String },

    #[error("Pool is shut down, rejected call to model {model}")]
    PoolShutdown { model: String },

    #[error("Model {model} panicked during predict")]
    WorkerPanicked { model: String },

    #[error("Worker for model {model} exited: {status}")]
    WorkerExited { model: String, status: String },

    #[error("Failed to spawn worker for model {model}: {reason}")]
    WorkerSpawn { model: String, reason: String },

    #[error("Protocol error talking to worker for model {model}: {reason}")]
    Protocol { model: String, reason: String },

    #[error("Model {model} uses {mechanism} but provides no spec")]
    MissingSpec {
        model: String,
        mechanism: ExecutionMechanism,
    },

    #[error("Model {model} failed to load: {reason}")]
    LoadFailed { model: String, reason: String },
}

impl DispatchError {
    /// Name of the model the failure is attributed to.
    pub fn model(&self) -> &str {
        match self {
            Self::ModelFailed { model, .. }
            | Self::Timeout { model, .. }
            | Self::PoolSaturated { model }
            | Self::PoolShutdown { model }
            | Self::WorkerPanicked { model }
            | Self::WorkerExited { model, .. }
            | Self::WorkerSpawn { model, .. }
            | Self::Protocol { model, .. }
            | Self::MissingSpec { model, .. }
            | Self::LoadFailed { model, .. } => model,
        }
    }

    /// Transport-level failures leave a worker process in an unknown state.
    pub(crate) fn poisons_worker(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::WorkerExited { .. } | Self::Protocol { .. }
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelFailed { .. } => "model_failed",
            Self::Timeout { .. } => "timeout",
            Self::PoolSaturated { .. } => "pool_saturated",
            Self::PoolShutdown { .. } => "pool_shutdown",
            Self::WorkerPanicked { .. } => "worker_panicked",
            Self::WorkerExited { .. } => "worker_exited",
            Self::WorkerSpawn { .. } => "worker_spawn",
            Self::Protocol { .. } => "protocol",
            Self::MissingSpec { .. } => "missing_spec",
            Self::LoadFailed { .. } => "load_failed",
        }
    }
}
