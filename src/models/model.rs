//! The model capability consumed by the runner and the dispatcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::mechanism::ExecutionMechanism;

/// Errors raised by model code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Load failed: {0}")]
    Load(String),

    #[error("Prediction failed: {0}")]
    Predict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown model kind: {0}")]
    UnknownKind(String),
}

/// Serializable recipe that lets a worker subprocess rebuild a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Catalog key of the model implementation.
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, params: Value) -> Self {
        Self { name: name.into(), kind: kind.into(), params }
    }
}

/// A named predict-capable unit.
///
/// `load` runs once before the first predict. Models dispatched out of
/// process must return a [`ModelSpec`] so the worker can build its own copy.
#[async_trait]
pub trait Model: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Mechanism used when the registration does not override it.
    fn execution_mechanism(&self) -> ExecutionMechanism {
        ExecutionMechanism::Naive
    }

    /// Resource (e.g. accelerator index) the model is pinned to.
    fn pinned_resource(&self) -> Option<&str> {
        None
    }

    fn spec(&self) -> Option<ModelSpec> {
        None
    }

    fn load(&self) -> Result<(), ModelError> {
        Ok(())
    }

    fn predict(&self, body: Value) -> Result<Value, ModelError>;

    async fn predict_async(&self, body: Value) -> Result<Value, ModelError> {
        self.predict(body)
    }
}

/// Per-registration overrides of a model's declared settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOptions {
    pub mechanism: Option<ExecutionMechanism>,
    pub pinned_resource: Option<String>,
}

impl ModelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mechanism(mut self, mechanism: ExecutionMechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }

    pub fn pinned_resource(mut self, resource: impl Into<String>) -> Self {
        self.pinned_resource = Some(resource.into());
        self
    }
}
