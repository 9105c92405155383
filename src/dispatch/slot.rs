use std::sync::{Arc, OnceLock};

use tokio::sync::OnceCell;

use super::dedicated::DedicatedWorker;
use super::error::DispatchError;
use crate::models::{ExecutionMechanism, Model, ModelError, ModelOptions, ModelSpec};

/// A registered model together with its resolved dispatch settings.
///
/// The load outcome is recorded once; a failed load is terminal and every
/// later dispatch returns the recorded error.
pub struct ModelSlot {
    model: Arc<dyn Model>,
    mechanism: ExecutionMechanism,
    resource: Option<String>,
    spec: Option<ModelSpec>,
    pub(super) loaded: OnceCell<Result<(), DispatchError>>,
    /// Outcome of the in-process `Model::load`, shared with the blocking
    /// task so an abandoned waiter never triggers a second load.
    pub(super) model_load: Arc<OnceLock<Result<(), ModelError>>>,
    pub(super) dedicated: OnceLock<Arc<DedicatedWorker>>,
}

impl ModelSlot {
    /// Resolve mechanism and resource, letting `options` override the model.
    ///
    /// Out-of-process mechanisms need a [`ModelSpec`] to rebuild the model in
    /// the worker.
    pub fn new(model: Arc<dyn Model>, options: ModelOptions) -> Result<Self, DispatchError> {
        let mechanism = options.mechanism.unwrap_or_else(|| model.execution_mechanism());
        let resource = options
            .pinned_resource
            .or_else(|| model.pinned_resource().map(str::to_string));
        let spec = model.spec();
        if mechanism.is_out_of_process() && spec.is_none() {
            return Err(DispatchError::MissingSpec {
                model: model.name().to_string(),
                mechanism,
            });
        }
        Ok(Self {
            model,
            mechanism,
            resource,
            spec,
            loaded: OnceCell::new(),
            model_load: Arc::new(OnceLock::new()),
            dedicated: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub fn mechanism(&self) -> ExecutionMechanism {
        self.mechanism
    }

    pub fn pinned_resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn spec(&self) -> Option<&ModelSpec> {
        self.spec.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.loaded.get(), Some(Ok(())))
    }

    pub fn load_error(&self) -> Option<&DispatchError> {
        self.loaded.get().and_then(|outcome| outcome.as_ref().err())
    }

    pub fn dedicated_worker(&self) -> Option<&Arc<DedicatedWorker>> {
        self.dedicated.get()
    }
}

impl std::fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSlot")
            .field("name", &self.name())
            .field("mechanism", &self.mechanism)
            .field("resource", &self.resource)
            .field("ready", &self.is_ready())
            .finish()
    }
}
