use thiserror::Error;

use crate::models::ModelError;

/// Failures of a model-serving step.
#[derive(Error, Debug)]
pub enum ServingError {
    #[error("failed to load model {model}: {reason}")]
    LoadFailed { model: String, reason: String },

    #[error("model {model} is not ready yet")]
    NotReady { model: String },

    #[error("model {model} is not ready after {attempts} attempts {reason}")]
    ReadinessTimeout {
        model: String,
        attempts: u32,
        reason: String,
    },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("illegal model operation {op}, method={method}")]
    IllegalOperation { op: String, method: String },

    #[error("model {model} failed in {op}: {source}")]
    Model {
        model: String,
        op: String,
        #[source]
        source: ModelError,
    },

    #[error("artifact {path} unavailable: {reason}")]
    Artifact { path: String, reason: String },

    #[error("endpoint lookup failed for {model}: {reason}")]
    Endpoint { model: String, reason: String },
}

impl ServingError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
