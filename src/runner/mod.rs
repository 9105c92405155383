//! Model runner: fans an event out to a selected subset of models.
//!
//! Models live in an insertion-ordered arena built by one writer before the
//! first event. During traffic the slots are shared read-only with the
//! dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::dispatch::{DispatchError, Dispatcher, ModelSlot};
use crate::event::Event;
use crate::graph::{StepError, StepHandler};
use crate::models::{Model, ModelOptions, ModelSelector};
use crate::monitoring::{LogEntry, LogPusher};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Model {0} is already registered")]
    DuplicateModel(String),

    #[error("Cannot register model: {0}")]
    Registration(#[source] DispatchError),

    #[error("No models matched event {event_id} in step {step}")]
    NoModelsMatched { step: String, event_id: String },

    #[error("Selector chose unknown model {model} in step {step}")]
    UnknownModel { step: String, model: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub struct ModelRunnerStep {
    name: String,
    order: Vec<String>,
    slots: HashMap<String, Arc<ModelSlot>>,
    selector: Option<Arc<dyn ModelSelector>>,
    dispatcher: Arc<Dispatcher>,
    pusher: Option<LogPusher>,
}

impl ModelRunnerStep {
    pub fn new(name: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            name: name.into(),
            order: Vec::new(),
            slots: HashMap::new(),
            selector: None,
            dispatcher,
            pusher: None,
        }
    }

    pub fn with_selector(mut self, selector: impl ModelSelector + 'static) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    /// Record every model call, successful or not, to a monitoring stream.
    pub fn with_log_pusher(mut self, pusher: LogPusher) -> Self {
        self.pusher = Some(pusher);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a model with its own mechanism and resource.
    pub fn add_model(&mut self, model: impl Model) -> Result<&mut Self, RunnerError> {
        self.add_model_with(Arc::new(model), ModelOptions::default())
    }

    /// Register a model, overriding its mechanism or pinned resource.
    pub fn add_model_with(&mut self, model: Arc<dyn Model>, options: ModelOptions) -> Result<&mut Self, RunnerError> {
        let name = model.name().to_string();
        if self.slots.contains_key(&name) {
            return Err(RunnerError::DuplicateModel(name));
        }
        let slot = ModelSlot::new(model, options).map_err(RunnerError::Registration)?;
        tracing::debug!(step = %self.name, model = %name, mechanism = %slot.mechanism(), "model registered");
        self.order.push(name.clone());
        self.slots.insert(name, Arc::new(slot));
        Ok(self)
    }

    /// Registered names in insertion order.
    pub fn model_names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn slot(&self, name: &str) -> Option<&Arc<ModelSlot>> {
        self.slots.get(name)
    }

    /// Load every model concurrently and start dedicated workers.
    ///
    /// All models are attempted. A model that fails stays in its terminal
    /// error state and the first failure is returned.
    pub async fn init(&self) -> Result<(), RunnerError> {
        let outcomes = join_all(self.ordered_slots().map(|slot| self.dispatcher.prepare(slot))).await;
        match outcomes.into_iter().find_map(Result::err) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Run `event` through the selected models.
    ///
    /// A runner holding a single model returns that model's output as is.
    /// Otherwise the result maps each selected model name to its output.
    pub async fn run(&self, event: &Event) -> Result<Value, RunnerError> {
        let selected = self.select(event)?;
        let start = Utc::now();

        let calls = selected
            .iter()
            .map(|slot| self.dispatcher.dispatch(slot, event.body.clone()));
        let results = join_all(calls).await;

        let mut outputs = Map::new();
        let mut first_error = None;
        for (slot, result) in selected.iter().zip(results) {
            match result {
                Ok(output) => {
                    if let Some(pusher) = &self.pusher {
                        pusher.push(
                            LogEntry::new(start, "predict", event.body.clone())
                                .model(slot.name())
                                .response(output.clone()),
                        );
                    }
                    outputs.insert(slot.name().to_string(), output);
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event.id,
                        step = %self.name,
                        model = %slot.name(),
                        mechanism = %slot.mechanism(),
                        error = %e,
                        "model dispatch failed"
                    );
                    if let Some(pusher) = &self.pusher {
                        pusher.push(
                            LogEntry::new(start, "predict", event.body.clone())
                                .model(slot.name())
                                .error(&e),
                        );
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e.into());
        }

        if self.order.len() == 1 {
            if let Some((_, output)) = outputs.into_iter().next() {
                return Ok(output);
            }
            return Ok(Value::Null);
        }
        Ok(Value::Object(outputs))
    }

    fn ordered_slots(&self) -> impl Iterator<Item = &ModelSlot> {
        self.order.iter().filter_map(|name| self.slots.get(name).map(Arc::as_ref))
    }

    fn select(&self, event: &Event) -> Result<Vec<&ModelSlot>, RunnerError> {
        let Some(selector) = &self.selector else {
            return Ok(self.ordered_slots().collect());
        };
        let available = self.model_names();
        let Some(names) = selector.select(event, &available) else {
            return Ok(self.ordered_slots().collect());
        };
        if names.is_empty() {
            return Err(RunnerError::NoModelsMatched {
                step: self.name.clone(),
                event_id: event.id.clone(),
            });
        }

        let mut selected = Vec::with_capacity(names.len());
        for name in &names {
            let slot = self.slots.get(name).ok_or_else(|| RunnerError::UnknownModel {
                step: self.name.clone(),
                model: name.clone(),
            })?;
            // Keep registration order and ignore repeated names.
            if !selected.iter().any(|s: &&ModelSlot| s.name() == name) {
                selected.push(slot.as_ref());
            }
        }
        let position = |slot: &&ModelSlot| self.order.iter().position(|n| n == slot.name());
        selected.sort_by_key(position);
        Ok(selected)
    }
}

#[async_trait]
impl StepHandler for ModelRunnerStep {
    async fn init(&self) -> Result<(), StepError> {
        ModelRunnerStep::init(self).await.map_err(StepError::from)
    }

    async fn run(&self, event: Event) -> Result<Event, StepError> {
        let body = ModelRunnerStep::run(self, &event).await?;
        Ok(event.with_body(body))
    }
}

impl std::fmt::Debug for ModelRunnerStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRunnerStep")
            .field("name", &self.name)
            .field("models", &self.order)
            .field("selector", &self.selector.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldSelector, IncrementModel, ModelError};
    use crate::monitoring::{LogPusherConfig, MemoryStream, RecordContext};
    use serde_json::json;

    struct Failing;

    impl Model for Failing {
        fn name(&self) -> &str {
            "broken"
        }

        fn predict(&self, _body: Value) -> Result<Value, ModelError> {
            Err(ModelError::Predict("bad weights".into()))
        }
    }

    fn runner() -> ModelRunnerStep {
        let mut runner = ModelRunnerStep::new("router", Arc::new(Dispatcher::default())).with_selector(FieldSelector::default());
        runner.add_model(IncrementModel::new("m1", 1)).unwrap();
        runner.add_model(IncrementModel::new("m2", 2)).unwrap();
        runner
    }

    #[tokio::test]
    async fn all_models_without_selection() {
        let out = runner().run(&Event::new(json!({"n": 1}))).await.unwrap();
        assert_eq!(out, json!({"m1": {"n": 2}, "m2": {"n": 3}}));
    }

    #[tokio::test]
    async fn selector_scopes_results() {
        let out = runner().run(&Event::new(json!({"n": 1, "models": ["m2"]}))).await.unwrap();
        assert_eq!(out, json!({"m2": {"n": 3}}));
    }

    #[tokio::test]
    async fn single_model_runner_is_flat() {
        let mut runner = ModelRunnerStep::new("solo", Arc::new(Dispatcher::default()));
        runner.add_model(IncrementModel::new("only", 1)).unwrap();
        assert_eq!(runner.run(&Event::new(json!({"n": 1}))).await.unwrap(), json!({"n": 2}));
    }

    #[tokio::test]
    async fn empty_selection_fails() {
        let err = runner().run(&Event::new(json!({"n": 1, "models": []}))).await.unwrap_err();
        assert!(matches!(err, RunnerError::NoModelsMatched { .. }));
    }

    #[tokio::test]
    async fn unknown_model_fails() {
        let err = runner().run(&Event::new(json!({"n": 1, "models": ["m9"]}))).await.unwrap_err();
        assert!(matches!(err, RunnerError::UnknownModel { ref model, .. } if model == "m9"));
    }

    #[tokio::test]
    async fn one_failure_discards_sibling_results() {
        let mut runner = runner();
        runner.add_model(Failing).unwrap();
        let err = runner.run(&Event::new(json!({"n": 1}))).await.unwrap_err();
        match err {
            RunnerError::Dispatch(e) => assert_eq!(e.model(), "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut runner = runner();
        let err = runner.add_model(IncrementModel::new("m1", 5)).unwrap_err();
        assert!(matches!(err, RunnerError::DuplicateModel(ref n) if n == "m1"));
        assert_eq!(runner.model_names(), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn every_model_call_is_recorded() {
        let stream = Arc::new(MemoryStream::new());
        let pusher = LogPusher::spawn(
            stream.clone(),
            RecordContext::new("ModelRunnerStep", "router"),
            LogPusherConfig::default(),
        );
        let mut runner = runner().with_log_pusher(pusher.clone());
        runner.add_model(Failing).unwrap();

        runner.run(&Event::new(json!({"n": 1, "models": ["m1", "m2"]}))).await.unwrap();
        runner.run(&Event::new(json!({"n": 1, "models": ["broken"]}))).await.unwrap_err();
        pusher.flush().await;

        let records = stream.bodies();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["model"], "m1");
        assert_eq!(records[0]["resp"], json!({"n": 2}));
        assert_eq!(records[1]["model"], "m2");
        assert_eq!(records[1]["op"], "predict");
        assert_eq!(records[2]["model"], "broken");
        assert!(records[2]["error"].as_str().unwrap().contains("bad weights"));
    }
}
