//! Step graphs: build-time validated DAGs of steps and the server that runs
//! events through them.

mod builder;
mod error;
mod server;
pub mod spec;
mod step;

pub use builder::{Graph, GraphBuilder};
pub use error::{GraphError, StepError};
pub use server::GraphServer;
pub use spec::{After, GraphSpec, ModelEntry, SpecError, StepEntry, StepEntryKind};
pub use step::{FnStep, Passthrough, StepDef, StepHandler, StepKind};
