//! Step definitions and the handler capability.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::StepError;
use crate::event::Event;

/// Role of a step in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Single operation on the event.
    Task,
    /// Boundary after which the downstream runs as a separate background task.
    Queue,
    /// Fans the event out to models (see `runner::ModelRunnerStep`).
    Router,
    /// Entered only when a step that names it fails.
    ErrorHandler,
    /// Pass-through that marks the response point.
    Respond,
}

/// Work performed by a step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Called once by `GraphServer::init`.
    async fn init(&self) -> Result<(), StepError> {
        Ok(())
    }

    async fn run(&self, event: Event) -> Result<Event, StepError>;

    /// Called once by `GraphServer::shutdown`.
    async fn shutdown(&self) {}
}

/// Returns the event unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl StepHandler for Passthrough {
    async fn run(&self, event: Event) -> Result<Event, StepError> {
        Ok(event)
    }
}

/// Adapts a synchronous closure into a step.
pub struct FnStep<F>(pub F);

#[async_trait]
impl<F> StepHandler for FnStep<F>
where
    F: Fn(Event) -> Result<Event, StepError> + Send + Sync,
{
    async fn run(&self, event: Event) -> Result<Event, StepError> {
        (self.0)(event)
    }
}

/// A step before it is added to a [`GraphBuilder`](super::GraphBuilder).
pub struct StepDef {
    pub(super) name: String,
    pub(super) kind: StepKind,
    pub(super) handler: Arc<dyn StepHandler>,
    pub(super) after: Vec<String>,
    pub(super) function: Option<String>,
    pub(super) responder: bool,
    pub(super) on_error: Option<String>,
    pub(super) full_event: bool,
}

impl StepDef {
    fn with_kind(name: impl Into<String>, kind: StepKind, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            kind,
            handler,
            after: Vec::new(),
            function: None,
            responder: false,
            on_error: None,
            full_event: false,
        }
    }

    pub fn task(name: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        Self::with_kind(name, StepKind::Task, Arc::new(handler))
    }

    /// Task built from a closure over the event.
    pub fn map<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Event) -> Result<Event, StepError> + Send + Sync + 'static,
    {
        Self::task(name, FnStep(f))
    }

    pub fn router(name: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        Self::with_kind(name, StepKind::Router, Arc::new(handler))
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::Queue, Arc::new(Passthrough))
    }

    pub fn error_handler(name: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        Self::with_kind(name, StepKind::ErrorHandler, Arc::new(handler))
    }

    /// Pass-through responder.
    pub fn respond(name: impl Into<String>) -> Self {
        let mut step = Self::with_kind(name, StepKind::Respond, Arc::new(Passthrough));
        step.responder = true;
        step
    }

    /// Use a shared handler.
    pub fn shared(name: impl Into<String>, kind: StepKind, handler: Arc<dyn StepHandler>) -> Self {
        Self::with_kind(name, kind, handler)
    }

    /// Run after `step`. Repeat to add predecessors: a step with several
    /// runs once for each predecessor output that reaches it.
    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.after.push(step.into());
        self
    }

    /// External function hosting this step. Required after a queue.
    pub fn function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    /// Make this step's output the response.
    pub fn responder(mut self) -> Self {
        self.responder = true;
        self
    }

    /// Route failures of this step to the named error handler.
    pub fn on_error(mut self, handler: impl Into<String>) -> Self {
        self.on_error = Some(handler.into());
        self
    }

    /// Error handlers only: attach `error` and `origin_state` to the event.
    pub fn full_event(mut self, full_event: bool) -> Self {
        self.full_event = full_event;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }
}

impl std::fmt::Debug for StepDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("after", &self.after)
            .field("function", &self.function)
            .field("responder", &self.responder)
            .field("on_error", &self.on_error)
            .finish()
    }
}
