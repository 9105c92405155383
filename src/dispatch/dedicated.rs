//! One persistent worker subprocess owned by a single model.
//!
//! Calls are serialized by an async mutex. The child is taken out of its slot
//! for the duration of a call, so a call abandoned by a timeout leaves the
//! slot empty and the abandoned process is killed on drop. The next call
//! starts a replacement with the same pinned resource.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use super::child::{WorkerChild, WorkerCommand};
use super::error::DispatchError;
use crate::ipc::WorkerOptions;
use crate::models::ModelSpec;

pub struct DedicatedWorker {
    spec: ModelSpec,
    resource: Option<String>,
    command: WorkerCommand,
    options: WorkerOptions,
    spawn_timeout: Duration,
    child: Mutex<Option<WorkerChild>>,
    restarts: AtomicU32,
    closed: AtomicBool,
}

impl DedicatedWorker {
    /// Spawn the worker and wait until its model has loaded.
    pub async fn start(
        spec: ModelSpec,
        resource: Option<String>,
        command: WorkerCommand,
        frame_limit: usize,
        spawn_timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let options = WorkerOptions::dedicated(spec.clone(), resource.clone(), frame_limit);
        let child = WorkerChild::spawn(&command, &options, &spec.name, spawn_timeout).await?;
        tracing::info!(model = %spec.name, pid = child.pid(), resource = ?resource, "dedicated worker started");
        Ok(Self {
            spec,
            resource,
            command,
            options,
            spawn_timeout,
            child: Mutex::new(Some(child)),
            restarts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn model(&self) -> &str {
        &self.spec.name
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Times the worker was replaced after a failure.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Pid of the current worker, if one is running.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().map(WorkerChild::pid)
    }

    pub async fn call(&self, body: Value) -> Result<Value, DispatchError> {
        let mut slot = self.child.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::PoolShutdown { model: self.spec.name.clone() });
        }

        let alive = slot.as_mut().map_or(false, WorkerChild::is_running);
        if !alive {
            if let Some(dead) = slot.take() {
                tracing::warn!(model = %self.spec.name, pid = dead.pid(), "dedicated worker died between calls");
            }
        }
        let mut child = match slot.take() {
            Some(child) => child,
            None => {
                let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    model = %self.spec.name,
                    resource = ?self.resource,
                    restarts,
                    "restarting dedicated worker"
                );
                WorkerChild::spawn(&self.command, &self.options, &self.spec.name, self.spawn_timeout).await?
            }
        };

        let result = child.call(&self.spec, body).await;
        match &result {
            Err(e) if e.poisons_worker() => {
                tracing::warn!(model = %self.spec.name, pid = child.pid(), error = %e, "dedicated worker failed");
            }
            _ => *slot = Some(child),
        }
        result
    }

    /// Stop the worker and reject later calls.
    pub async fn shutdown(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(child) = self.child.lock().await.take() {
            child.shutdown(grace).await;
        }
    }
}

impl std::fmt::Debug for DedicatedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedWorker")
            .field("model", &self.spec.name)
            .field("resource", &self.resource)
            .field("restarts", &self.restarts())
            .finish()
    }
}
