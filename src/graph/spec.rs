//! Declarative graph topologies read from TOML.
//!
//! ```toml
//! [[models]]
//! name = "m1"
//! kind = "increment"
//! mechanism = "thread_pool"
//! params = { inc = 1 }
//!
//! [[steps]]
//! name = "router"
//! kind = "runner"
//! models = ["m1"]
//! selector = "models"
//!
//! [[steps]]
//! name = "done"
//! kind = "respond"
//! after = "router"
//! ```
//!
//! `after` also takes a list, e.g. `after = ["a", "b"]`, for a step fed by
//! several branches.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::builder::{Graph, GraphBuilder};
use super::error::GraphError;
use super::step::{Passthrough, StepDef};
use crate::dispatch::Dispatcher;
use crate::models::{ExecutionMechanism, FieldSelector, ModelCatalog, ModelError, ModelOptions, ModelSpec};
use crate::runner::{ModelRunnerStep, RunnerError};

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid graph spec: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Step '{step}' references undeclared model '{model}'")]
    UndeclaredModel { step: String, model: String },

    #[error("Model '{0}' is declared twice")]
    DuplicateModel(String),

    #[error("Cannot build model '{model}': {source}")]
    Model {
        model: String,
        #[source]
        source: ModelError,
    },

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Step roles available from a spec file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEntryKind {
    Passthrough,
    Queue,
    Runner,
    Respond,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub mechanism: Option<ExecutionMechanism>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

/// Predecessors of a step: one name or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum After {
    One(String),
    Many(Vec<String>),
}

impl After {
    pub fn names(&self) -> &[String] {
        match self {
            After::One(name) => std::slice::from_ref(name),
            After::Many(names) => names,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEntry {
    pub name: String,
    pub kind: StepEntryKind,
    #[serde(default)]
    pub after: Option<After>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub responder: bool,
    /// Runner steps: models in registration order. Empty means all.
    #[serde(default)]
    pub models: Vec<String>,
    /// Runner steps: body field naming the models to invoke.
    #[serde(default)]
    pub selector: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub steps: Vec<StepEntry>,
}

impl GraphSpec {
    pub fn from_toml(content: &str) -> Result<Self, SpecError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Build the graph, constructing models from `catalog`.
    pub fn build(&self, catalog: &ModelCatalog, dispatcher: Arc<Dispatcher>) -> Result<Graph, SpecError> {
        let mut declared: HashMap<&str, &ModelEntry> = HashMap::new();
        for entry in &self.models {
            if declared.insert(entry.name.as_str(), entry).is_some() {
                return Err(SpecError::DuplicateModel(entry.name.clone()));
            }
        }

        let mut builder = GraphBuilder::new();
        for step in &self.steps {
            let mut def = match step.kind {
                StepEntryKind::Passthrough => StepDef::task(&step.name, Passthrough),
                StepEntryKind::Queue => StepDef::queue(&step.name),
                StepEntryKind::Respond => StepDef::respond(&step.name),
                StepEntryKind::Runner => {
                    let runner = self.runner(step, &declared, catalog, dispatcher.clone())?;
                    StepDef::router(&step.name, runner)
                }
            };
            for after in step.after.iter().flat_map(After::names) {
                def = def.after(after);
            }
            if let Some(function) = &step.function {
                def = def.function(function);
            }
            if step.responder {
                def = def.responder();
            }
            builder.add_step(def)?;
        }
        Ok(builder.build()?)
    }

    fn runner(
        &self,
        step: &StepEntry,
        declared: &HashMap<&str, &ModelEntry>,
        catalog: &ModelCatalog,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<ModelRunnerStep, SpecError> {
        let mut runner = ModelRunnerStep::new(&step.name, dispatcher);
        if let Some(field) = &step.selector {
            runner = runner.with_selector(FieldSelector::new(field));
        }

        let names: Vec<&str> = if step.models.is_empty() {
            self.models.iter().map(|m| m.name.as_str()).collect()
        } else {
            step.models.iter().map(String::as_str).collect()
        };
        for name in names {
            let entry = declared.get(name).ok_or_else(|| SpecError::UndeclaredModel {
                step: step.name.clone(),
                model: name.to_string(),
            })?;
            let spec = ModelSpec::new(&entry.name, &entry.kind, entry.params.clone());
            let model = catalog
                .build(&spec, entry.resource.as_deref())
                .map_err(|source| SpecError::Model {
                    model: entry.name.clone(),
                    source,
                })?;
            let mut options = ModelOptions::new();
            if let Some(mechanism) = entry.mechanism {
                options = options.mechanism(mechanism);
            }
            if let Some(resource) = &entry.resource {
                options = options.pinned_resource(resource);
            }
            runner.add_model_with(model, options)?;
        }
        Ok(runner)
    }
}
