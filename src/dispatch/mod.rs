//! Execution-mechanism dispatch.
//!
//! [`Dispatcher::dispatch`] runs a model's predict under the mechanism
//! recorded in its [`ModelSlot`]:
//!
//! - `naive`: inline on the calling task
//! - `asyncio`: `predict_async` awaited on the runtime
//! - `thread_pool`: shared bounded [`ThreadPool`]
//! - `process_pool`: shared [`ProcessPool`] of worker subprocesses
//! - `dedicated_process`: one [`DedicatedWorker`] per model
//!
//! Every failure is a [`DispatchError`] naming the model.

mod child;
mod dedicated;
mod dispatcher;
mod error;
mod process_pool;
mod slot;
mod thread_pool;

pub use child::WorkerCommand;
pub use dedicated::DedicatedWorker;
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use error::DispatchError;
pub use process_pool::ProcessPool;
pub use slot::ModelSlot;
pub use thread_pool::{Task, ThreadPool, ThreadPoolConfig, ThreadPoolError, ThreadPoolStats};
