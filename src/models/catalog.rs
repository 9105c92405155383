//! Model catalog: builds models from serializable specs.
//!
//! Worker subprocesses only receive a [`ModelSpec`], so every model that runs
//! out of process must be constructible from its catalog kind. The built-in
//! kinds are small reference models used by the CLI and the test suite.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::mechanism::ExecutionMechanism;
use super::model::{Model, ModelError, ModelSpec};

/// Constructor for a catalog kind. Receives the [`ModelSpec`] and the pinned resource.
pub type ModelFactory =
    Arc<dyn Fn(&ModelSpec, Option<&str>) -> Result<Arc<dyn Model>, ModelError> + Send + Sync>;

/// Registry of model kinds keyed by name.
#[derive(Clone, Default)]
pub struct ModelCatalog {
    factories: HashMap<String, ModelFactory>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in `increment`, `echo` and `sleep` kinds.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(IncrementModel::KIND, |spec, resource| {
            Ok(Arc::new(IncrementModel::from_spec(spec, resource)?) as Arc<dyn Model>)
        });
        catalog.register(EchoModel::KIND, |spec, _| {
            Ok(Arc::new(EchoModel::new(&spec.name)) as Arc<dyn Model>)
        });
        catalog.register(SleepModel::KIND, |spec, _| {
            Ok(Arc::new(SleepModel::from_spec(spec)?) as Arc<dyn Model>)
        });
        catalog
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&ModelSpec, Option<&str>) -> Result<Arc<dyn Model>, ModelError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn build(&self, spec: &ModelSpec, resource: Option<&str>) -> Result<Arc<dyn Model>, ModelError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| ModelError::UnknownKind(spec.kind.clone()))?;
        factory(spec, resource)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for ModelCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCatalog").field("kinds", &self.kinds()).finish()
    }
}

fn object_body(body: Value, model: &str) -> Result<serde_json::Map<String, Value>, ModelError> {
    match body {
        Value::Object(map) => Ok(map),
        other => Err(ModelError::InvalidInput(format!(
            "model {model} expects an object body, got {other}"
        ))),
    }
}

/// Adds a constant to a numeric body field.
///
/// The `models` routing key is stripped from the output and the pinned
/// resource, when present, is reported under `resource`.
#[derive(Debug, Clone)]
pub struct IncrementModel {
    name: String,
    inc: i64,
    field: String,
    mechanism: ExecutionMechanism,
    resource: Option<String>,
}

impl IncrementModel {
    pub const KIND: &'static str = "increment";

    pub fn new(name: impl Into<String>, inc: i64) -> Self {
        Self {
            name: name.into(),
            inc,
            field: "n".to_string(),
            mechanism: ExecutionMechanism::Naive,
            resource: None,
        }
    }

    pub fn with_mechanism(mut self, mechanism: ExecutionMechanism) -> Self {
        self.mechanism = mechanism;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn from_spec(spec: &ModelSpec, resource: Option<&str>) -> Result<Self, ModelError> {
        let inc = spec.params.get("inc").map_or(Ok(1), |v| {
            v.as_i64()
                .ok_or_else(|| ModelError::InvalidInput(format!("inc must be an integer, got {v}")))
        })?;
        let mut model = Self::new(&spec.name, inc);
        if let Some(field) = spec.params.get("field").and_then(Value::as_str) {
            model.field = field.to_string();
        }
        model.resource = resource.map(str::to_string);
        Ok(model)
    }
}

impl Model for IncrementModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn execution_mechanism(&self) -> ExecutionMechanism {
        self.mechanism
    }

    fn pinned_resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    fn spec(&self) -> Option<ModelSpec> {
        Some(ModelSpec::new(
            &self.name,
            Self::KIND,
            json!({"inc": self.inc, "field": self.field}),
        ))
    }

    fn predict(&self, body: Value) -> Result<Value, ModelError> {
        let mut map = object_body(body, &self.name)?;
        let updated = match map.get(&self.field) {
            Some(Value::Number(n)) if n.is_i64() => json!(n.as_i64().unwrap_or_default() + self.inc),
            Some(Value::Number(n)) => json!(n.as_f64().unwrap_or_default() + self.inc as f64),
            Some(other) => {
                return Err(ModelError::InvalidInput(format!(
                    "field {} must be numeric, got {other}",
                    self.field
                )))
            }
            None => return Err(ModelError::InvalidInput(format!("missing field {}", self.field))),
        };
        map.insert(self.field.clone(), updated);
        map.remove("models");
        if let Some(resource) = &self.resource {
            map.insert("resource".to_string(), Value::String(resource.clone()));
        }
        Ok(Value::Object(map))
    }
}

/// Returns the body unchanged.
#[derive(Debug, Clone)]
pub struct EchoModel {
    name: String,
}

impl EchoModel {
    pub const KIND: &'static str = "echo";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Model for EchoModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> Option<ModelSpec> {
        Some(ModelSpec::new(&self.name, Self::KIND, Value::Null))
    }

    fn predict(&self, body: Value) -> Result<Value, ModelError> {
        Ok(body)
    }
}

/// Echoes the body after a fixed delay. Used to exercise call timeouts.
#[derive(Debug, Clone)]
pub struct SleepModel {
    name: String,
    delay: Duration,
}

impl SleepModel {
    pub const KIND: &'static str = "sleep";

    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self { name: name.into(), delay }
    }

    pub fn from_spec(spec: &ModelSpec) -> Result<Self, ModelError> {
        let millis = spec
            .params
            .get("millis")
            .and_then(Value::as_u64)
            .ok_or_else(|| ModelError::InvalidInput("sleep requires integer param millis".into()))?;
        Ok(Self::new(&spec.name, Duration::from_millis(millis)))
    }
}

#[async_trait]
impl Model for SleepModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> Option<ModelSpec> {
        Some(ModelSpec::new(
            &self.name,
            Self::KIND,
            json!({"millis": self.delay.as_millis() as u64}),
        ))
    }

    fn predict(&self, body: Value) -> Result<Value, ModelError> {
        std::thread::sleep(self.delay);
        Ok(body)
    }

    async fn predict_async(&self, body: Value) -> Result<Value, ModelError> {
        tokio::time::sleep(self.delay).await;
        Ok(body)
    }
}
