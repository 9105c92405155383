//! Graph construction and build-time validation.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::GraphError;
use super::step::{StepDef, StepHandler, StepKind};

/// A validated step inside a [`Graph`].
pub(super) struct StepNode {
    pub name: String,
    pub kind: StepKind,
    pub handler: Arc<dyn StepHandler>,
    pub function: Option<String>,
    pub responder: bool,
    pub on_error: Option<usize>,
    pub full_event: bool,
    pub children: Vec<usize>,
    /// The responder is this step or one of its descendants.
    pub leads_to_responder: bool,
}

/// Collects steps, validating each edge as it is added.
#[derive(Default)]
pub struct GraphBuilder {
    steps: Vec<StepDef>,
    index: HashMap<String, usize>,
    default_error_handler: Option<String>,
}

impl std::fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("steps", &self.steps.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("default_error_handler", &self.default_error_handler)
            .finish_non_exhaustive()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step. Its predecessors must already exist, and a step following
    /// a queue must name its function.
    pub fn add_step(&mut self, step: StepDef) -> Result<&mut Self, GraphError> {
        if self.index.contains_key(&step.name) {
            return Err(GraphError::DuplicateStep(step.name));
        }
        if step.kind == StepKind::Queue && step.responder {
            return Err(GraphError::QueueResponder(step.name));
        }
        if step.kind == StepKind::ErrorHandler && !step.after.is_empty() {
            return Err(GraphError::HandlerWithPredecessor(step.name));
        }
        for after in &step.after {
            let previous = self.index.get(after).map(|&i| &self.steps[i]).ok_or_else(|| {
                GraphError::UnknownStep {
                    step: step.name.clone(),
                    after: after.clone(),
                }
            })?;
            if previous.kind == StepKind::Queue && step.function.is_none() {
                return Err(GraphError::MissingFunction { step: step.name.clone() });
            }
        }

        self.index.insert(step.name.clone(), self.steps.len());
        self.steps.push(step);
        Ok(self)
    }

    /// Error handler for steps that do not name their own.
    pub fn on_error(&mut self, handler: impl Into<String>) -> &mut Self {
        self.default_error_handler = Some(handler.into());
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        if self.steps.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut responder: Option<usize> = None;
        for (i, step) in self.steps.iter().enumerate() {
            if step.responder {
                if let Some(first) = responder {
                    return Err(GraphError::MultipleResponders {
                        first: self.steps[first].name.clone(),
                        second: step.name.clone(),
                    });
                }
                responder = Some(i);
            }
        }

        let resolve_handler = |step: &str, handler: &str| -> Result<usize, GraphError> {
            match self.index.get(handler) {
                Some(&i) if self.steps[i].kind == StepKind::ErrorHandler => Ok(i),
                _ => Err(GraphError::UnknownErrorHandler {
                    step: step.to_string(),
                    handler: handler.to_string(),
                }),
            }
        };
        let default_error_handler = self
            .default_error_handler
            .as_deref()
            .map(|h| resolve_handler("<graph>", h))
            .transpose()?;
        let mut handlers = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let handler = match &step.on_error {
                Some(h) => Some(resolve_handler(&step.name, h)?),
                // Handlers are never routed to themselves.
                None if step.kind != StepKind::ErrorHandler => default_error_handler,
                None => None,
            };
            handlers.push(handler);
        }

        let mut parents: Vec<Vec<usize>> = Vec::with_capacity(self.steps.len());
        let mut roots = Vec::new();
        let mut children = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            let own: Vec<usize> = step.after.iter().filter_map(|a| self.index.get(a).copied()).collect();
            for &p in &own {
                if !children[p].contains(&i) {
                    children[p].push(i);
                }
            }
            if own.is_empty() && step.kind != StepKind::ErrorHandler {
                roots.push(i);
            }
            parents.push(own);
        }

        // Every ancestor of the responder, over all paths.
        let mut leads = vec![false; self.steps.len()];
        let mut pending: Vec<usize> = responder.into_iter().collect();
        while let Some(i) = pending.pop() {
            if !std::mem::replace(&mut leads[i], true) {
                pending.extend(parents[i].iter().copied());
            }
        }

        let steps = self
            .steps
            .into_iter()
            .zip(children)
            .zip(handlers)
            .zip(leads)
            .map(|(((def, children), on_error), leads_to_responder)| StepNode {
                name: def.name,
                kind: def.kind,
                handler: def.handler,
                function: def.function,
                responder: def.responder,
                on_error,
                full_event: def.full_event,
                children,
                leads_to_responder,
            })
            .collect();

        Ok(Graph {
            steps,
            index: self.index,
            roots,
            responder,
        })
    }
}

/// An immutable, validated step DAG.
pub struct Graph {
    pub(super) steps: Vec<StepNode>,
    index: HashMap<String, usize>,
    pub(super) roots: Vec<usize>,
    pub(super) responder: Option<usize>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn step_kind(&self, name: &str) -> Option<StepKind> {
        self.index.get(name).map(|&i| self.steps[i].kind)
    }

    /// Function hosting the step, if declared.
    pub fn step_function(&self, name: &str) -> Option<&str> {
        self.index.get(name).and_then(|&i| self.steps[i].function.as_deref())
    }

    pub fn responder(&self) -> Option<&str> {
        self.responder.map(|i| self.steps[i].name.as_str())
    }

    pub(super) fn handlers(&self) -> impl Iterator<Item = (&str, &Arc<dyn StepHandler>)> {
        self.steps.iter().map(|s| (s.name.as_str(), &s.handler))
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("steps", &self.step_names())
            .field("responder", &self.responder())
            .finish()
    }
}
