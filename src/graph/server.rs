//! Event traversal.
//!
//! `GraphServer::run` admits an event, spawns its traversal and waits for the
//! response. The response comes from the responder step when the graph has
//! one. Otherwise it is the output of the last step on the primary path,
//! which follows each step's first child. Steps after a queue run as
//! separate tracked tasks, so the traversal may still be running when the
//! caller gets its answer.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::Instrument;

use super::builder::Graph;
use super::error::{GraphError, StepError};
use super::step::StepKind;
use crate::dispatch::Dispatcher;
use crate::event::Event;
use crate::monitoring::OutputStream;
use crate::shutdown::{Load, ShutdownCoordinator, ShutdownResult};
use crate::telemetry::{self, EventSpan, SpanExt};

type Response = Result<Event, GraphError>;

/// First answer wins; the sender drops with the last branch of the traversal.
struct ResponseSlot(Mutex<Option<oneshot::Sender<Response>>>);

impl ResponseSlot {
    fn send(&self, response: Response) {
        if let Some(tx) = self.0.lock().take() {
            let _ = tx.send(response);
        }
    }
}

struct Traversal {
    graph: Arc<Graph>,
    shutdown: Arc<ShutdownCoordinator>,
    error_stream: Option<Arc<dyn OutputStream>>,
    response: ResponseSlot,
}

/// Runs events through a [`Graph`].
pub struct GraphServer {
    graph: Arc<Graph>,
    shutdown: Arc<ShutdownCoordinator>,
    error_stream: Option<Arc<dyn OutputStream>>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl GraphServer {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            error_stream: None,
            dispatcher: None,
        }
    }

    /// Stream receiving a record for every unhandled step failure.
    pub fn with_error_stream(mut self, stream: Arc<dyn OutputStream>) -> Self {
        self.error_stream = Some(stream);
        self
    }

    /// Dispatcher whose workers are stopped by [`GraphServer::shutdown`].
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Initialize every step in insertion order.
    pub async fn init(&self) -> Result<(), GraphError> {
        for (name, handler) in self.graph.handlers() {
            handler.init().await.map_err(|source| GraphError::Init {
                step: name.to_string(),
                source,
            })?;
            tracing::debug!(step = name, "step initialized");
        }
        Ok(())
    }

    /// Run one event and return the response event.
    pub async fn run(&self, event: Event) -> Result<Event, GraphError> {
        let guard = self.shutdown.admit().ok_or(GraphError::ShuttingDown)?;
        let span = EventSpan::new(&event.id, &event.path);

        let (tx, rx) = oneshot::channel();
        let traversal = Arc::new(Traversal {
            graph: self.graph.clone(),
            shutdown: self.shutdown.clone(),
            error_stream: self.error_stream.clone(),
            response: ResponseSlot(Mutex::new(Some(tx))),
        });

        let roots = self.graph.roots.clone();
        tokio::spawn(
            async move {
                let _guard = guard;
                let branches = roots
                    .iter()
                    .enumerate()
                    .map(|(i, &root)| {
                        let relevant = traversal.child_is_relevant(&roots, i, root);
                        run_step(traversal.clone(), root, event.clone(), relevant)
                    })
                    .collect::<Vec<_>>();
                join_all(branches).await;
            }
            .instrument(span.clone()),
        );

        let result = rx.await.unwrap_or(Err(GraphError::NoResponse));
        span.record_result(&result);
        telemetry::record_event(result.is_ok());
        result
    }

    /// Convenience wrapper: run `body` at `path` and return the response body.
    pub async fn test(&self, path: &str, body: Value) -> Result<Value, GraphError> {
        let event = Event::new(body).path(path);
        self.run(event).await.map(|event| event.body)
    }

    /// Wait for admitted events and their background branches to finish.
    pub async fn wait_for_completion(&self, timeout: Duration) -> ShutdownResult {
        self.shutdown.wait_idle(timeout).await
    }

    /// Stop admission, drain, then stop steps and worker processes.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownResult {
        let result = self.shutdown.drain(timeout).await;
        if let ShutdownResult::Timeout(load) = result {
            tracing::warn!(events = load.events, branches = load.branches, "graph drain timed out");
        }
        for (_, handler) in self.graph.handlers() {
            handler.shutdown().await;
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown().await;
        }
        result
    }

    pub fn in_flight(&self) -> Load {
        self.shutdown.in_flight()
    }
}

impl std::fmt::Debug for GraphServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphServer")
            .field("graph", &self.graph)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Traversal {
    /// Whether the `i`-th of `siblings` carries the response onward.
    fn child_is_relevant(&self, siblings: &[usize], i: usize, child: usize) -> bool {
        let steps = &self.graph.steps;
        if siblings.iter().any(|&s| steps[s].leads_to_responder) {
            steps[child].leads_to_responder
        } else {
            i == 0
        }
    }

    async fn push_error_record(&self, event: &Event, step: &str, error: &str) {
        let Some(stream) = &self.error_stream else { return };
        let record = json!({
            "event_id": event.id,
            "step": step,
            "error": error,
            "body": event.body,
            "when": crate::monitoring::format_timestamp(chrono::Utc::now()),
        });
        if let Err(e) = stream.push(vec![record], Some(event.id.as_str())).await {
            tracing::warn!(event_id = %event.id, step, error = %e, "failed to push error record");
        }
    }
}

fn run_step(traversal: Arc<Traversal>, idx: usize, event: Event, relevant: bool) -> BoxFuture<'static, ()> {
    async move {
        let node = &traversal.graph.steps[idx];
        let span = EventSpan::step(&event.id, &node.name);
        let input = event.clone();
        let result = node.handler.run(event).instrument(span.clone()).await;
        span.record_result(&result);

        match result {
            Ok(output) => continue_from(traversal, idx, output, relevant).await,
            Err(error) => handle_failure(traversal, idx, input, error, relevant).await,
        }
    }
    .boxed()
}

async fn continue_from(traversal: Arc<Traversal>, idx: usize, output: Event, relevant: bool) {
    let node = &traversal.graph.steps[idx];

    let answered = relevant && (node.responder || output.terminated || node.children.is_empty());
    if answered {
        traversal.response.send(Ok(output.clone()));
    }
    if output.terminated {
        return;
    }

    let mut inline = Vec::new();
    for (i, &child) in node.children.iter().enumerate() {
        let child_relevant = relevant && !answered && traversal.child_is_relevant(&node.children, i, child);
        let branch = run_step(traversal.clone(), child, output.clone(), child_relevant);
        if traversal.graph.steps[child].kind == StepKind::Queue {
            let guard = traversal.shutdown.track_branch();
            tokio::spawn(
                async move {
                    let _guard = guard;
                    branch.await;
                }
                .in_current_span(),
            );
        } else {
            inline.push(branch);
        }
    }
    join_all(inline).await;
}

async fn handle_failure(traversal: Arc<Traversal>, idx: usize, input: Event, error: StepError, relevant: bool) {
    let node = &traversal.graph.steps[idx];
    let message = error.to_string();
    tracing::error!(event_id = %input.id, step = %node.name, error = %message, "step failed");

    if let Some(handler) = node.on_error {
        let handler_node = &traversal.graph.steps[handler];
        let mut event = input;
        if handler_node.full_event {
            event.error = Some(message);
            event.origin_state = Some(node.name.clone());
        }
        tracing::debug!(step = %node.name, handler = %handler_node.name, "routing failure to error handler");
        run_step(traversal.clone(), handler, event, relevant).await;
        return;
    }

    telemetry::record_step_failure(&node.name);
    traversal.push_error_record(&input, &node.name, &message).await;
    if relevant {
        traversal.response.send(Err(GraphError::StepFailed {
            step: node.name.clone(),
            source: error,
        }));
    }
}
