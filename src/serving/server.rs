//! Model-serving step.
//!
//! A `ModelServer` wraps one [`ServingModel`] behind the v2 request
//! protocol: `infer`/`predict` (and their `_dict` forms), `explain`, GET
//! `ready`, GET metadata and custom operations. Loading can run in the
//! background; every event first passes the readiness gate of the
//! server's [`ModelLifecycle`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;

use super::artifacts::{ArtifactResolver, EndpointRegistry, LocalArtifactResolver, ModelArtifact};
use super::error::ServingError;
use super::inputs::{extract_input, inputs_to_list, update_result, validate_v2};
use super::lifecycle::{LoadMode, LoadState, ModelLifecycle, ReadinessConfig};
use crate::event::{Event, Method};
use crate::graph::{StepError, StepHandler};
use crate::models::ModelError;
use crate::monitoring::{format_timestamp, LogEntry, LogPusher, LogPusherConfig, OutputStream, RecordContext};
use crate::telemetry;

/// Model code hosted by a [`ModelServer`].
///
/// Only `predict` is required. Methods run on blocking threads, so
/// implementations keep loaded state behind interior mutability.
pub trait ServingModel: Send + Sync + 'static {
    /// Called once. `artifact` is set when the server has a model path.
    fn load(&self, _artifact: Option<&ModelArtifact>) -> Result<(), ModelError> {
        Ok(())
    }

    fn preprocess(&self, request: Value, _op: &str) -> Result<Value, ModelError> {
        Ok(request)
    }

    fn validate(&self, request: &Value, _op: &str) -> Result<(), ServingError> {
        validate_v2(request)
    }

    fn predict(&self, request: &Value) -> Result<Value, ModelError>;

    fn explain(&self, _request: &Value) -> Result<Value, ModelError> {
        Err(ModelError::Predict("explain is not implemented".into()))
    }

    fn postprocess(&self, response: Value) -> Value {
        response
    }

    /// Replace the `(inputs, outputs)` recorded by monitoring.
    fn logged_results(&self, _request: &Value, _response: &Value, _op: &str) -> Option<(Value, Value)> {
        None
    }

    /// Custom metrics attached to the monitoring record of a successful call.
    fn metrics(&self, _request: &Value, _response: &Value) -> Map<String, Value> {
        Map::new()
    }
}

/// Handler of a custom operation. Receives the raw event.
pub type OperationFn = Arc<dyn Fn(&Event) -> Result<Value, ServingError> + Send + Sync>;

/// Where monitoring records go once an endpoint is known.
#[derive(Clone)]
pub struct ServingMonitoring {
    pub registry: Arc<dyn EndpointRegistry>,
    pub stream: Arc<dyn OutputStream>,
    pub config: LogPusherConfig,
    pub function_uri: String,
}

#[derive(Default)]
struct Monitor {
    endpoint_uid: Option<String>,
    output_schema: Vec<String>,
    pusher: Option<LogPusher>,
}

struct Shared {
    model: Box<dyn ServingModel>,
    lifecycle: ModelLifecycle,
    artifact: OnceLock<ModelArtifact>,
    load_started: AtomicBool,
}

impl Shared {
    fn load(&self, name: &str, path: Option<&str>, suffix: &str, resolver: &dyn ArtifactResolver) -> Result<(), ServingError> {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.try_load(path, suffix, resolver)))
            .unwrap_or_else(|_| Err("load panicked".to_string()));

        match outcome {
            Ok(()) => {
                self.lifecycle.mark_ready();
                tracing::info!(model = name, elapsed_ms = started.elapsed().as_millis() as u64, "model was loaded");
                Ok(())
            }
            Err(reason) => {
                tracing::error!(model = name, error = %reason, "model load failed");
                self.lifecycle.mark_failed(reason.clone());
                Err(ServingError::LoadFailed {
                    model: name.to_string(),
                    reason,
                })
            }
        }
    }

    fn try_load(&self, path: Option<&str>, suffix: &str, resolver: &dyn ArtifactResolver) -> Result<(), String> {
        if let Some(path) = path {
            let artifact = resolver.resolve(path, suffix).map_err(|e| e.to_string())?;
            let _ = self.artifact.set(artifact);
        }
        self.model.load(self.artifact.get()).map_err(|e| e.to_string())
    }
}

pub struct ModelServer {
    name: String,
    class: String,
    shared: Arc<Shared>,
    model_path: Option<String>,
    model_suffix: String,
    resolver: Arc<dyn ArtifactResolver>,
    params: Map<String, Value>,
    input_path: Option<String>,
    result_path: Option<String>,
    readiness: ReadinessConfig,
    load_mode: LoadMode,
    operations: HashMap<String, OperationFn>,
    monitoring: Option<ServingMonitoring>,
    shard_by_endpoint: bool,
    worker: Option<u32>,
    labels: Map<String, Value>,
    monitor: OnceCell<Monitor>,
    unmonitored: Monitor,
}

impl ModelServer {
    pub fn new<M: ServingModel>(name: impl Into<String>, model: M) -> Self {
        let name = name.into();
        let class = std::any::type_name::<M>().rsplit("::").next().unwrap_or("ModelServer").to_string();
        Self {
            shared: Arc::new(Shared {
                model: Box::new(model),
                lifecycle: ModelLifecycle::new(name.clone()),
                artifact: OnceLock::new(),
                load_started: AtomicBool::new(false),
            }),
            name,
            class,
            model_path: None,
            model_suffix: String::new(),
            resolver: Arc::new(LocalArtifactResolver),
            params: Map::new(),
            input_path: None,
            result_path: None,
            readiness: ReadinessConfig::default(),
            load_mode: LoadMode::Sync,
            operations: HashMap::new(),
            monitoring: None,
            shard_by_endpoint: true,
            worker: None,
            labels: Map::new(),
            monitor: OnceCell::new(),
            unmonitored: Monitor::default(),
        }
    }

    /// Model file or directory resolved before `load`.
    pub fn model_path(mut self, path: impl Into<String>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    /// Suffix picking the model file inside a directory artifact.
    pub fn model_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.model_suffix = suffix.into();
        self
    }

    pub fn artifact_resolver(mut self, resolver: Arc<dyn ArtifactResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Dotted path selecting the request inside the event body.
    pub fn input_path(mut self, path: impl Into<String>) -> Self {
        self.input_path = Some(path.into());
        self
    }

    /// Dotted path receiving the response inside the original body.
    pub fn result_path(mut self, path: impl Into<String>) -> Self {
        self.result_path = Some(path.into());
        self
    }

    pub fn readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    /// Mode used when the graph initializes this step.
    pub fn load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }

    /// The model object is usable as given; skip `load`.
    pub fn preloaded(self) -> Self {
        self.shared.load_started.store(true, Ordering::SeqCst);
        self.shared.lifecycle.mark_ready();
        self
    }

    pub fn operation<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Event) -> Result<Value, ServingError> + Send + Sync + 'static,
    {
        self.operations.insert(name.into(), Arc::new(f));
        self
    }

    pub fn monitoring(mut self, monitoring: ServingMonitoring) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    /// Partition monitoring records by endpoint uid (default on).
    pub fn shard_by_endpoint(mut self, shard: bool) -> Self {
        self.shard_by_endpoint = shard;
        self
    }

    /// Id of the worker hosting this server, stamped on monitoring records.
    pub fn worker(mut self, id: u32) -> Self {
        self.worker = Some(id);
        self
    }

    /// Label copied into every monitoring record.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> &ModelLifecycle {
        &self.shared.lifecycle
    }

    pub fn artifact(&self) -> Option<&ModelArtifact> {
        self.shared.artifact.get()
    }

    /// Parameter lookup. Artifact parameters override the server's own.
    pub fn get_param(&self, key: &str) -> Option<&Value> {
        self.artifact()
            .and_then(|a| a.metadata.parameters.get(key))
            .or_else(|| self.params.get(key))
    }

    /// Monitoring pusher, once the first event found an endpoint.
    pub fn log_pusher(&self) -> Option<&LogPusher> {
        self.monitor.get().and_then(|m| m.pusher.as_ref())
    }

    pub fn endpoint_uid(&self) -> Option<&str> {
        self.monitor.get().and_then(|m| m.endpoint_uid.as_deref())
    }

    /// Output column names recorded for the monitoring endpoint.
    pub fn output_schema(&self) -> &[String] {
        self.monitor.get().map(|m| m.output_schema.as_slice()).unwrap_or(&[])
    }

    /// Load the model, waiting for it (`Sync`) or in the background (`Async`).
    ///
    /// The load runs at most once per server.
    pub async fn post_init(&self, mode: LoadMode) -> Result<(), ServingError> {
        if self.shared.load_started.swap(true, Ordering::SeqCst) {
            return match self.shared.lifecycle.state() {
                LoadState::Failed(reason) => Err(ServingError::LoadFailed {
                    model: self.name.clone(),
                    reason,
                }),
                _ => Ok(()),
            };
        }

        let shared = self.shared.clone();
        let name = self.name.clone();
        let path = self.model_path.clone();
        let suffix = self.model_suffix.clone();
        let resolver = self.resolver.clone();
        let job = move || shared.load(&name, path.as_deref(), &suffix, resolver.as_ref());

        match mode {
            LoadMode::Sync => tokio::task::spawn_blocking(job).await.map_err(|e| {
                self.shared.lifecycle.mark_failed(e.to_string());
                ServingError::LoadFailed {
                    model: self.name.clone(),
                    reason: e.to_string(),
                }
            })?,
            LoadMode::Async => {
                tokio::task::spawn_blocking(job);
                tracing::info!(model = %self.name, "started async model loading");
                Ok(())
            }
        }
    }

    /// Serve one event.
    pub async fn handle(&self, mut event: Event) -> Result<Event, ServingError> {
        let monitor = self.monitor(&event.id).await;
        let start = Utc::now();
        let original = event.body.clone();
        let body = extract_input(self.input_path.as_deref(), &event.body)?;

        let mut event_id = event.id.clone();
        let mut op = event.operation().to_string();
        if let Value::Object(map) = &body {
            if op.is_empty() {
                if let Some(requested) = map.get("operation").and_then(Value::as_str) {
                    op = requested.to_string();
                }
            }
            if let Some(id) = map.get("id").and_then(Value::as_str) {
                event_id = id.to_string();
            }
        }
        if op.is_empty() && event.method != Method::Get {
            op = "infer".into();
        }

        match op.as_str() {
            "infer" | "predict" | "infer_dict" | "predict_dict" | "explain" => {
                let response = self.invoke(&event, body, &op, &event_id, start, monitor).await?;
                event.body = update_result(self.result_path.as_deref(), original, response)?;
                Ok(event)
            }
            "ready" if event.method == Method::Get => Ok(self.ready_response(event, &event_id)),
            "" if event.method == Method::Get => {
                let metadata = self.metadata(monitor);
                let body = update_result(self.result_path.as_deref(), original, metadata)?;
                event.terminated = true;
                event.status_code = Some(200);
                event.body = body;
                Ok(event)
            }
            custom => match self.operations.get(custom) {
                Some(operation) => {
                    let response = operation(&event).map_err(|e| {
                        tracing::error!(event_id = %event_id, model = %self.name, op = custom, error = %e, "operation failed");
                        e
                    })?;
                    event.body = update_result(self.result_path.as_deref(), original, response)?;
                    Ok(event)
                }
                None => Err(ServingError::IllegalOperation {
                    op: custom.to_string(),
                    method: method_name(event.method).to_string(),
                }),
            },
        }
    }

    async fn invoke(
        &self,
        event: &Event,
        body: Value,
        op: &str,
        event_id: &str,
        start: DateTime<Utc>,
        monitor: &Monitor,
    ) -> Result<Value, ServingError> {
        self.shared.lifecycle.check(event.trigger.kind, &self.readiness).await?;

        let request = if op.ends_with("_dict") {
            inputs_to_list(body, &self.input_order()?)?
        } else {
            body
        };
        let request = self
            .shared
            .model
            .preprocess(request, op)
            .map_err(|source| self.model_error(op, source))?;
        self.shared.model.validate(&request, op)?;

        let timer = Instant::now();
        let shared = self.shared.clone();
        let explain = op == "explain";
        let (request, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if explain {
                    shared.model.explain(&request)
                } else {
                    shared.model.predict(&request)
                }
            }))
            .unwrap_or_else(|_| Err(ModelError::Predict("model code panicked".into())));
            (request, outcome)
        })
        .await
        .map_err(|e| self.model_error(op, ModelError::Predict(e.to_string())))?;
        telemetry::record_serving(&self.name, op, outcome.is_ok(), timer.elapsed());

        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(source) => {
                tracing::error!(event_id, model = %self.name, op, error = %source, "model operation failed");
                if let Some(pusher) = &monitor.pusher {
                    let mut logged = request;
                    if let Value::Object(map) = &mut logged {
                        map.insert("id".into(), json!(event_id));
                    }
                    pusher.push(self.keyed(LogEntry::new(start, op, logged).error(&source), monitor));
                }
                return Err(self.model_error(op, source));
            }
        };

        let mut response = Map::new();
        response.insert("id".into(), json!(event_id));
        if explain {
            response.insert("model_name".into(), json!(self.name));
            response.insert("outputs".into(), outputs);
        } else {
            response.insert("model_name".into(), json!(self.base_name()));
            response.insert("outputs".into(), outputs);
            response.insert("timestamp".into(), json!(format_timestamp(start)));
        }
        if let Some(uid) = &monitor.endpoint_uid {
            response.insert("model_endpoint_uid".into(), json!(uid));
        }
        let response = self.shared.model.postprocess(Value::Object(response));

        if let Some(pusher) = &monitor.pusher {
            let metrics = self.shared.model.metrics(&request, &response);
            let entry = match self.shared.model.logged_results(&request, &response, op) {
                Some((inputs, outputs)) => LogEntry::new(start, op, json!({"id": event_id, "inputs": inputs}))
                    .response(json!({"outputs": outputs})),
                None => LogEntry::new(start, op, request).response(response.clone()),
            };
            if let Some(width) = schema_mismatch(&monitor.output_schema, entry.response.as_ref()) {
                tracing::info!(
                    model = %self.name,
                    endpoint = monitor.endpoint_uid.as_deref().unwrap_or_default(),
                    output_len = width,
                    schema_len = monitor.output_schema.len(),
                    "model outputs do not match the endpoint output schema"
                );
            }
            pusher.push(self.keyed(entry.metrics(metrics), monitor));
        }
        Ok(response)
    }

    fn ready_response(&self, event: Event, event_id: &str) -> Event {
        if self.shared.lifecycle.is_ready() {
            let message = format!("Model {} is ready (event_id = {event_id})", self.name);
            event.terminate(200, Value::String(message))
        } else {
            event.terminate(408, Value::String("model not ready".into()))
        }
    }

    fn metadata(&self, monitor: &Monitor) -> Value {
        let (inputs, outputs) = match self.artifact() {
            Some(artifact) => (json!(artifact.metadata.inputs), json!(artifact.metadata.outputs)),
            None => (json!([]), json!([])),
        };
        json!({
            "name": self.base_name(),
            "model_endpoint_uid": monitor.endpoint_uid.clone().unwrap_or_default(),
            "inputs": inputs,
            "outputs": outputs,
        })
    }

    fn input_order(&self) -> Result<Vec<String>, ServingError> {
        match self.artifact().map(|a| &a.metadata.inputs) {
            Some(inputs) if !inputs.is_empty() => Ok(inputs.iter().map(|f| f.name.clone()).collect()),
            _ => Err(ServingError::invalid_argument(
                "In order to use predict_dict or infer_dict operation you have to provide `model_path` \
                 to the model server and to load it by `load()` function",
            )),
        }
    }

    /// Name without a `:version` tag.
    fn base_name(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }

    fn model_error(&self, op: &str, source: ModelError) -> ServingError {
        ServingError::Model {
            model: self.name.clone(),
            op: op.to_string(),
            source,
        }
    }

    fn keyed(&self, entry: LogEntry, monitor: &Monitor) -> LogEntry {
        match (&monitor.endpoint_uid, self.shard_by_endpoint) {
            (Some(uid), true) => entry.partition_key(uid.clone()),
            _ => entry,
        }
    }

    /// Resolve monitoring on the first event. A failed lookup is retried on
    /// the next event; until then events are not monitored.
    async fn monitor(&self, event_id: &str) -> &Monitor {
        let init = self.monitor.get_or_try_init(|| self.init_monitoring()).await;
        match init {
            Ok(monitor) => monitor,
            Err(e) => {
                tracing::warn!(event_id, model = %self.name, error = %e, "event will not be monitored");
                &self.unmonitored
            }
        }
    }

    async fn init_monitoring(&self) -> Result<Monitor, ServingError> {
        let Some(setup) = &self.monitoring else {
            return Ok(Monitor::default());
        };
        let Some(endpoint) = setup.registry.lookup(&self.name, &setup.function_uri).await? else {
            tracing::info!(
                model = %self.name,
                function = %setup.function_uri,
                "model endpoint not found; monitoring for this model will not be performed"
            );
            return Ok(Monitor::default());
        };

        let mut context = RecordContext::new(self.class.clone(), self.name.clone());
        context.function_uri = setup.function_uri.clone();
        context.endpoint_id = Some(endpoint.uid.clone());
        context.worker = self.worker;
        context.labels = self.labels.clone();
        let pusher = LogPusher::spawn(setup.stream.clone(), context, setup.config.clone());
        tracing::debug!(model = %self.name, endpoint = %endpoint.uid, "monitoring enabled");
        Ok(Monitor {
            endpoint_uid: Some(endpoint.uid),
            output_schema: endpoint.output_schema,
            pusher: Some(pusher),
        })
    }
}

/// Width of the first output row when it differs from a non-empty schema.
fn schema_mismatch(schema: &[String], response: Option<&Value>) -> Option<usize> {
    if schema.is_empty() {
        return None;
    }
    let width = match response?.get("outputs")?.get(0)? {
        Value::Array(row) => row.len(),
        _ => 1,
    };
    (width != schema.len()).then_some(width)
}

fn method_name(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
    }
}

#[async_trait]
impl StepHandler for ModelServer {
    async fn init(&self) -> Result<(), StepError> {
        self.post_init(self.load_mode).await.map_err(StepError::from)
    }

    async fn run(&self, event: Event) -> Result<Event, StepError> {
        self.handle(event).await.map_err(StepError::from)
    }

    async fn shutdown(&self) {
        if let Some(pusher) = self.log_pusher() {
            pusher.flush().await;
        }
    }
}

impl std::fmt::Debug for ModelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelServer")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("state", &self.shared.lifecycle.state())
            .field("model_path", &self.model_path)
            .finish()
    }
}
