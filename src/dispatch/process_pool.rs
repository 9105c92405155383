//! Shared pool of worker subprocesses for `process_pool` models.
//!
//! At most `size` workers exist. Workers are spawned on demand and returned
//! to the idle list after a call that ended with a reply (result or model
//! error). A worker that crashed, timed out or broke the protocol is dropped,
//! which kills it, and the next call spawns a replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;

use super::child::{WorkerChild, WorkerCommand};
use super::error::DispatchError;
use crate::ipc::WorkerOptions;
use crate::models::ModelSpec;

pub struct ProcessPool {
    command: WorkerCommand,
    options: WorkerOptions,
    spawn_timeout: Duration,
    size: usize,
    permits: Semaphore,
    idle: Mutex<Vec<WorkerChild>>,
    spawned: AtomicU64,
    discarded: AtomicU64,
}

impl ProcessPool {
    pub fn new(command: WorkerCommand, size: usize, frame_limit: usize, spawn_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            command,
            options: WorkerOptions::pool(frame_limit),
            spawn_timeout,
            size,
            permits: Semaphore::new(size),
            idle: Mutex::new(Vec::with_capacity(size)),
            spawned: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_workers(&self) -> usize {
        self.idle.lock().len()
    }

    /// Total workers started over the pool's lifetime.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Workers dropped after a transport failure.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Run one predict on a pooled worker. Waits while all workers are busy.
    pub async fn call(&self, spec: &ModelSpec, body: Value) -> Result<Value, DispatchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DispatchError::PoolShutdown { model: spec.name.clone() })?;

        let mut worker = match self.take_idle() {
            Some(worker) => worker,
            None => {
                let worker = WorkerChild::spawn(&self.command, &self.options, &spec.name, self.spawn_timeout).await?;
                self.spawned.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(model = %spec.name, pid = worker.pid(), "process pool spawned worker");
                worker
            }
        };

        let result = worker.call(spec, body).await;
        match &result {
            Err(e) if e.poisons_worker() => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(model = %spec.name, pid = worker.pid(), error = %e, "discarding pool worker");
            }
            _ if self.permits.is_closed() => drop(worker),
            _ => self.idle.lock().push(worker),
        }
        result
    }

    fn take_idle(&self) -> Option<WorkerChild> {
        let mut idle = self.idle.lock();
        while let Some(mut worker) = idle.pop() {
            if worker.is_running() {
                return Some(worker);
            }
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(pid = worker.pid(), "idle pool worker died, discarding");
        }
        None
    }

    /// Reject new calls and stop idle workers.
    pub async fn shutdown(&self, grace: Duration) {
        self.permits.close();
        let workers: Vec<_> = self.idle.lock().drain(..).collect();
        for worker in workers {
            worker.shutdown(grace).await;
        }
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("command", &self.command)
            .field("size", &self.size)
            .field("idle", &self.idle_workers())
            .finish()
    }
}
