//! Collaborators a serving step relies on: the artifact store that supplies
//! model files and metadata, and the registry of monitoring endpoints.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ServingError;

/// One named input or output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: None,
        }
    }
}

/// Metadata stored alongside a model file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default)]
    pub inputs: Vec<Feature>,
    #[serde(default)]
    pub outputs: Vec<Feature>,
    /// Merged into the server's params, overriding them.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Everything `load()` gets from the artifact store.
#[derive(Debug, Clone, Default)]
pub struct ModelArtifact {
    pub model_file: Option<PathBuf>,
    pub extra_data: HashMap<String, PathBuf>,
    pub metadata: ModelMetadata,
}

/// Resolves a model path to a local file, extra data and metadata.
pub trait ArtifactResolver: Send + Sync {
    /// Called from a blocking context during load.
    fn resolve(&self, model_path: &str, suffix: &str) -> Result<ModelArtifact, ServingError>;
}

/// Reads artifacts from the local filesystem.
///
/// A directory path holds `model_spec.json`, the model file (first entry
/// with the requested suffix) and any other files as extra data. A file
/// path is the model itself, with metadata read from `<file>.json` if present.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalArtifactResolver;

pub const METADATA_FILE: &str = "model_spec.json";

impl ArtifactResolver for LocalArtifactResolver {
    fn resolve(&self, model_path: &str, suffix: &str) -> Result<ModelArtifact, ServingError> {
        let path = Path::new(model_path);
        let fail = |reason: String| ServingError::Artifact {
            path: model_path.to_string(),
            reason,
        };

        if path.is_file() {
            let sidecar = PathBuf::from(format!("{model_path}.json"));
            let metadata = if sidecar.is_file() { read_metadata(&sidecar).map_err(fail)? } else { ModelMetadata::default() };
            return Ok(ModelArtifact {
                model_file: Some(path.to_path_buf()),
                extra_data: HashMap::new(),
                metadata,
            });
        }
        if !path.is_dir() {
            return Err(fail("no such file or directory".into()));
        }

        let mut entries = std::fs::read_dir(path)
            .map_err(|e| fail(e.to_string()))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect::<Vec<_>>();
        entries.sort();

        let metadata_path = path.join(METADATA_FILE);
        let metadata = if metadata_path.is_file() {
            read_metadata(&metadata_path).map_err(fail)?
        } else {
            ModelMetadata::default()
        };

        let model_file = entries
            .iter()
            .find(|p| *p != &metadata_path && p.to_string_lossy().ends_with(suffix))
            .cloned();
        let extra_data = entries
            .into_iter()
            .filter(|p| *p != metadata_path && Some(p) != model_file.as_ref())
            .filter_map(|p| {
                let key = p.file_stem()?.to_string_lossy().into_owned();
                Some((key, p))
            })
            .collect();

        Ok(ModelArtifact {
            model_file,
            extra_data,
            metadata,
        })
    }
}

fn read_metadata(path: &Path) -> Result<ModelMetadata, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("{}: {e}", path.display()))
}

/// A monitoring endpoint known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub uid: String,
    /// Output column names recorded for the endpoint.
    #[serde(default)]
    pub output_schema: Vec<String>,
}

/// Looks up the monitoring endpoint of a serving step.
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    /// `Ok(None)` means no endpoint exists and the model is not monitored.
    async fn lookup(&self, model: &str, function: &str) -> Result<Option<EndpointInfo>, ServingError>;
}

/// In-memory registry keyed by model name.
#[derive(Debug, Default)]
pub struct StaticEndpoints {
    endpoints: RwLock<HashMap<String, EndpointInfo>>,
}

impl StaticEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, model: impl Into<String>, info: EndpointInfo) {
        self.endpoints.write().insert(model.into(), info);
    }

    pub fn with_endpoint(self, model: impl Into<String>, uid: impl Into<String>) -> Self {
        self.insert(
            model,
            EndpointInfo {
                uid: uid.into(),
                output_schema: Vec::new(),
            },
        );
        self
    }
}

#[async_trait]
impl EndpointRegistry for StaticEndpoints {
    async fn lookup(&self, model: &str, _function: &str) -> Result<Option<EndpointInfo>, ServingError> {
        Ok(self.endpoints.read().get(model).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn directory_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.pkl"), b"weights").unwrap();
        std::fs::write(dir.path().join("categories.csv"), b"a,b").unwrap();
        let metadata = json!({
            "inputs": [{"name": "f0"}, {"name": "f1"}],
            "outputs": [{"name": "label", "value_type": "int"}],
            "parameters": {"threshold": 0.5}
        });
        std::fs::write(dir.path().join(METADATA_FILE), metadata.to_string()).unwrap();

        let artifact = LocalArtifactResolver
            .resolve(dir.path().to_str().unwrap(), ".pkl")
            .unwrap();
        assert_eq!(artifact.model_file, Some(dir.path().join("model.pkl")));
        assert!(artifact.extra_data.contains_key("categories"));
        let names: Vec<_> = artifact.metadata.inputs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["f0", "f1"]);
        assert_eq!(artifact.metadata.parameters["threshold"], json!(0.5));
    }

    #[test]
    fn missing_path_fails() {
        let err = LocalArtifactResolver.resolve("/nonexistent/model", "").unwrap_err();
        assert!(matches!(err, ServingError::Artifact { .. }));
    }

    #[tokio::test]
    async fn static_endpoints_lookup() {
        let registry = StaticEndpoints::new().with_endpoint("m1", "uid-1");
        assert_eq!(registry.lookup("m1", "fn").await.unwrap().unwrap().uid, "uid-1");
        assert!(registry.lookup("m2", "fn").await.unwrap().is_none());
    }
}
