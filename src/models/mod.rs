//! Model abstractions: the predict capability, execution mechanisms,
//! selectors and the catalog used to rebuild models inside worker processes.

mod catalog;
mod mechanism;
mod model;
mod selector;

pub use catalog::{EchoModel, IncrementModel, ModelCatalog, ModelFactory, SleepModel};
pub use mechanism::{ExecutionMechanism, UnknownMechanism};
pub use model::{Model, ModelError, ModelOptions, ModelSpec};
pub use selector::{FieldSelector, ModelSelector};
