//! flowserve
//!
//! An inference-serving graph engine. Events flow through a graph of steps;
//! a model-runner step fans each event out to a selected subset of models,
//! each executed under its own mechanism (inline, async, thread pool,
//! process pool or a dedicated worker process), and merges the results.
//!
//! # Layout
//!
//! - [`event`]: the unit of work traversing a graph
//! - [`models`]: the predict capability, mechanisms, selectors and catalog
//! - [`dispatch`]: runs predict calls under each mechanism
//! - [`ipc`]: framing and the worker loop behind `flowserve worker`
//! - [`runner`]: the fan-out/join model-runner step
//! - [`serving`]: single-model v2 serving units and the path router
//! - [`graph`]: topology, traversal and TOML graph specs
//! - [`monitoring`]: sampled model-monitoring records
//!
//! Worker processes speak newline-delimited JSON frames over stdio. Logs go
//! to stderr so stdout stays clean for frames.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod graph;
pub mod ipc;
pub mod models;
pub mod monitoring;
pub mod runner;
pub mod serving;
pub mod shutdown;
pub mod telemetry;

pub use dispatch::{DispatchConfig, DispatchError, Dispatcher};
pub use event::{Event, Method, Trigger, TriggerKind};
pub use graph::{Graph, GraphBuilder, GraphError, GraphServer, GraphSpec, StepDef, StepError, StepHandler};
pub use models::{ExecutionMechanism, Model, ModelCatalog, ModelError, ModelOptions, ModelSelector};
pub use runner::{ModelRunnerStep, RunnerError};
pub use serving::{ModelRouter, ModelServer, ServingError, ServingModel};
