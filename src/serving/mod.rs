//! Model-serving units: load lifecycle, the v2 request pipeline and the
//! path router that fronts several servers.

mod artifacts;
mod error;
mod inputs;
mod lifecycle;
mod router;
mod server;

pub use artifacts::{
    ArtifactResolver, EndpointInfo, EndpointRegistry, Feature, LocalArtifactResolver, ModelArtifact, ModelMetadata,
    StaticEndpoints, METADATA_FILE,
};
pub use error::ServingError;
pub use inputs::{extract_input, inputs_to_list, update_result, validate_v2};
pub use lifecycle::{LoadMode, LoadState, ModelLifecycle, ReadinessConfig};
pub use router::{ModelRouter, RouterError, URL_PREFIX};
pub use server::{ModelServer, OperationFn, ServingModel, ServingMonitoring};
