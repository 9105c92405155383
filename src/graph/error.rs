use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::runner::RunnerError;
use crate::serving::ServingError;

/// Failure raised by a step handler.
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Serving(#[from] ServingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("{0}")]
    Failed(String),
}

impl StepError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Topology and traversal errors.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Graph has no steps")]
    EmptyGraph,

    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' follows unknown step '{after}'")]
    UnknownStep { step: String, after: String },

    #[error("step '{step}' must specify a function, because it follows a queue step")]
    MissingFunction { step: String },

    #[error("Queue step '{0}' cannot be the responder")]
    QueueResponder(String),

    #[error("Error handler '{0}' cannot follow another step")]
    HandlerWithPredecessor(String),

    #[error("Only one responder allowed, found '{first}' and '{second}'")]
    MultipleResponders { first: String, second: String },

    #[error("Step '{step}' names unknown error handler '{handler}'")]
    UnknownErrorHandler { step: String, handler: String },

    #[error("Step '{step}' failed to initialize: {source}")]
    Init {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("Graph server is shutting down")]
    ShuttingDown,

    #[error("Traversal finished without producing a response")]
    NoResponse,
}
