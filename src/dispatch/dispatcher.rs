use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;

use super::child::WorkerCommand;
use super::dedicated::DedicatedWorker;
use super::error::DispatchError;
use super::process_pool::ProcessPool;
use super::slot::ModelSlot;
use super::thread_pool::{ThreadPool, ThreadPoolConfig, ThreadPoolError};
use crate::ipc::DEFAULT_FRAME_LIMIT;
use crate::models::{ExecutionMechanism, ModelError};
use crate::telemetry;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub thread_pool: ThreadPoolConfig,
    /// Worker subprocesses in the shared pool (0 = CPU count).
    pub process_pool_size: usize,
    /// Per-call deadline for every mechanism except `naive`.
    pub call_timeout: Option<Duration>,
    /// Worker program; `None` runs the current executable's `worker` subcommand.
    pub worker: Option<WorkerCommand>,
    pub frame_limit: usize,
    /// How long a new worker may take to report `ready`.
    pub spawn_timeout: Duration,
    /// Grace period for workers to exit on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            thread_pool: ThreadPoolConfig::default(),
            process_pool_size: 0,
            call_timeout: None,
            worker: None,
            frame_limit: DEFAULT_FRAME_LIMIT,
            spawn_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl DispatchConfig {
    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = Some(call_timeout);
        self
    }
}

/// Invokes models under their execution mechanism.
///
/// The thread pool and the process pool are created on first use and shared
/// by every slot dispatched through this instance.
pub struct Dispatcher {
    config: DispatchConfig,
    thread_pool: Mutex<Option<Arc<ThreadPool>>>,
    process_pool: Mutex<Option<Arc<ProcessPool>>>,
    dedicated: Mutex<Vec<Arc<DedicatedWorker>>>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            thread_pool: Mutex::new(None),
            process_pool: Mutex::new(None),
            dedicated: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Load the slot's model once. Dedicated-process models get their worker
    /// here, so the pinned resource is fixed before the first request.
    pub async fn prepare(&self, slot: &ModelSlot) -> Result<(), DispatchError> {
        slot.loaded
            .get_or_init(|| self.load(slot))
            .await
            .clone()
    }

    async fn load(&self, slot: &ModelSlot) -> Result<(), DispatchError> {
        let name = slot.name().to_string();
        let outcome = match slot.mechanism() {
            ExecutionMechanism::Naive | ExecutionMechanism::ThreadPool | ExecutionMechanism::Asyncio => {
                let model = slot.model().clone();
                let once = slot.model_load.clone();
                match tokio::task::spawn_blocking(move || once.get_or_init(|| model.load()).clone()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(DispatchError::LoadFailed { model: name.clone(), reason: e.to_string() }),
                    Err(_) => Err(DispatchError::LoadFailed { model: name.clone(), reason: "load panicked".into() }),
                }
            }
            // Pool workers build and load models on their first call.
            ExecutionMechanism::ProcessPool => self.process_pool(&name).map(|_| ()),
            ExecutionMechanism::DedicatedProcess => self.start_dedicated(slot).await,
        };

        match &outcome {
            Ok(()) => tracing::info!(model = %name, mechanism = %slot.mechanism(), "model ready"),
            Err(e) => tracing::error!(model = %name, mechanism = %slot.mechanism(), error = %e, "model failed to load"),
        }
        outcome
    }

    async fn start_dedicated(&self, slot: &ModelSlot) -> Result<(), DispatchError> {
        let spec = slot.spec().cloned().ok_or_else(|| DispatchError::MissingSpec {
            model: slot.name().to_string(),
            mechanism: slot.mechanism(),
        })?;
        let worker = DedicatedWorker::start(
            spec,
            slot.pinned_resource().map(str::to_string),
            self.worker_command(slot.name())?,
            self.config.frame_limit,
            self.config.spawn_timeout,
        )
        .await?;
        let worker = Arc::new(worker);
        self.dedicated.lock().push(worker.clone());
        let _ = slot.dedicated.set(worker);
        Ok(())
    }

    /// Run one predict call for `slot`.
    ///
    /// Loads the model first if [`Dispatcher::prepare`] has not run. The
    /// configured call timeout covers queueing and execution, not the load.
    pub async fn dispatch(&self, slot: &ModelSlot, body: Value) -> Result<Value, DispatchError> {
        let start = Instant::now();
        let deadline = self
            .config
            .call_timeout
            .filter(|_| slot.mechanism() != ExecutionMechanism::Naive);

        let result = match (self.prepare(slot).await, deadline) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(limit)) => match timeout(limit, self.dispatch_inner(slot, body)).await {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Timeout { model: slot.name().to_string(), timeout: limit }),
            },
            (Ok(()), None) => self.dispatch_inner(slot, body).await,
        };

        telemetry::record_dispatch(slot.name(), slot.mechanism(), &result, start.elapsed());
        if let Err(e) = &result {
            tracing::debug!(model = %slot.name(), mechanism = %slot.mechanism(), error = %e, "dispatch failed");
        }
        result
    }

    async fn dispatch_inner(&self, slot: &ModelSlot, body: Value) -> Result<Value, DispatchError> {
        let name = slot.name();
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::PoolShutdown { model: name.to_string() });
        }

        let model_failed = |source: ModelError| DispatchError::ModelFailed { model: name.to_string(), source };

        match slot.mechanism() {
            ExecutionMechanism::Naive => slot.model().predict(body).map_err(model_failed),
            ExecutionMechanism::Asyncio => slot.model().predict_async(body).await.map_err(model_failed),
            ExecutionMechanism::ThreadPool => {
                let pool = self.thread_pool(name)?;
                let model = slot.model().clone();
                let (tx, rx) = oneshot::channel();
                pool.submit(Box::new(move || {
                    let _ = tx.send(model.predict(body));
                }))
                .map_err(|e| match e {
                    ThreadPoolError::QueueFull => DispatchError::PoolSaturated { model: name.to_string() },
                    ThreadPoolError::PoolShutdown => DispatchError::PoolShutdown { model: name.to_string() },
                    ThreadPoolError::ThreadSpawnFailed(reason) => {
                        DispatchError::WorkerSpawn { model: name.to_string(), reason }
                    }
                })?;
                // The sender is dropped without a value only when predict unwinds.
                match rx.await {
                    Ok(result) => result.map_err(model_failed),
                    Err(_) => Err(DispatchError::WorkerPanicked { model: name.to_string() }),
                }
            }
            ExecutionMechanism::ProcessPool => {
                let spec = slot.spec().ok_or_else(|| DispatchError::MissingSpec {
                    model: name.to_string(),
                    mechanism: slot.mechanism(),
                })?;
                self.process_pool(name)?.call(spec, body).await
            }
            ExecutionMechanism::DedicatedProcess => {
                let worker = slot.dedicated_worker().ok_or_else(|| DispatchError::LoadFailed {
                    model: name.to_string(),
                    reason: "dedicated worker not started".into(),
                })?;
                worker.call(body).await
            }
        }
    }

    fn thread_pool(&self, model: &str) -> Result<Arc<ThreadPool>, DispatchError> {
        let mut guard = self.thread_pool.lock();
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let pool = ThreadPool::new(self.config.thread_pool.clone())
            .map(Arc::new)
            .map_err(|e| DispatchError::WorkerSpawn { model: model.to_string(), reason: e.to_string() })?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    fn process_pool(&self, model: &str) -> Result<Arc<ProcessPool>, DispatchError> {
        let mut guard = self.process_pool.lock();
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let size = match self.config.process_pool_size {
            0 => num_cpus::get().max(1),
            n => n,
        };
        let pool = Arc::new(ProcessPool::new(
            self.worker_command(model)?,
            size,
            self.config.frame_limit,
            self.config.spawn_timeout,
        ));
        *guard = Some(pool.clone());
        Ok(pool)
    }

    fn worker_command(&self, model: &str) -> Result<WorkerCommand, DispatchError> {
        match &self.config.worker {
            Some(command) => Ok(command.clone()),
            None => WorkerCommand::current_exe().map_err(|e| DispatchError::WorkerSpawn {
                model: model.to_string(),
                reason: format!("cannot resolve current executable: {e}"),
            }),
        }
    }

    /// Statistics of the shared thread pool, if it was started.
    pub fn thread_pool_stats(&self) -> Option<super::ThreadPoolStats> {
        self.thread_pool.lock().as_ref().map(|pool| pool.stats())
    }

    /// The shared process pool, if it was started.
    pub fn process_pool_handle(&self) -> Option<Arc<ProcessPool>> {
        self.process_pool.lock().clone()
    }

    /// Reject new calls and stop every pool and dedicated worker.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let grace = self.config.shutdown_grace;

        let thread_pool = self.thread_pool.lock().take();
        if let Some(pool) = thread_pool {
            let _ = tokio::task::spawn_blocking(move || pool.shutdown()).await;
        }

        let process_pool = self.process_pool.lock().clone();
        if let Some(pool) = process_pool {
            pool.shutdown(grace).await;
        }

        let dedicated: Vec<_> = self.dedicated.lock().drain(..).collect();
        for worker in dedicated {
            worker.shutdown(grace).await;
        }
        tracing::info!("dispatcher shut down");
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
