//! Bounded OS-thread pool shared by every `thread_pool` model.
//!
//! One FIFO queue feeds all workers. Submission never blocks: a full queue
//! rejects the task. Workers drain the queue before exiting on shutdown.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

/// Configuration for the thread pool.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads (0 = auto-detect).
    pub num_threads: usize,
    /// Maximum queued tasks before submissions are rejected.
    pub queue_size: usize,
    /// Thread stack size in bytes (0 = default).
    pub stack_size: usize,
    pub thread_name_prefix: String,
    /// How long an idle worker sleeps before rechecking shutdown.
    pub idle_timeout_ms: u64,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            queue_size: 256,
            stack_size: 0,
            thread_name_prefix: "flowserve-predict".to_string(),
            idle_timeout_ms: 50,
        }
    }
}

/// A task to be executed by the thread pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Statistics for thread pool performance.
#[derive(Debug, Default, Clone)]
pub struct ThreadPoolStats {
    pub total_tasks_executed: u64,
    pub tasks_panicked: u64,
    pub queue_overflows: u64,
    pub avg_exec_time_us: u64,
    pub threads_active: usize,
    pub threads_idle: usize,
    pub queued: usize,
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    shutdown: AtomicBool,
    active: AtomicUsize,
    stats: RwLock<ThreadPoolStats>,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    config: ThreadPoolConfig,
    num_threads: usize,
}

impl ThreadPool {
    /// Spawn the worker threads.
    pub fn new(config: ThreadPoolConfig) -> Result<Self, ThreadPoolError> {
        let num_threads = if config.num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            config.num_threads
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_size)),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            stats: RwLock::new(ThreadPoolStats::default()),
        });

        let pool = Self {
            shared,
            handles: Mutex::new(Vec::with_capacity(num_threads)),
            config,
            num_threads,
        };

        for id in 0..num_threads {
            let shared = pool.shared.clone();
            let idle_timeout = Duration::from_millis(pool.config.idle_timeout_ms);
            let mut builder = thread::Builder::new().name(format!("{}-{}", pool.config.thread_name_prefix, id));
            if pool.config.stack_size > 0 {
                builder = builder.stack_size(pool.config.stack_size);
            }
            match builder.spawn(move || worker_loop(&shared, idle_timeout)) {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(e) => {
                    // Dropping the pool joins the threads already started.
                    return Err(ThreadPoolError::ThreadSpawnFailed(e.to_string()));
                }
            }
        }

        tracing::debug!(threads = num_threads, queue_size = pool.config.queue_size, "thread pool started");
        Ok(pool)
    }

    /// Queue a task. Fails fast when the queue is full or the pool is closed.
    pub fn submit(&self, task: Task) -> Result<(), ThreadPoolError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(ThreadPoolError::PoolShutdown);
        }

        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.config.queue_size {
                drop(queue);
                self.shared.stats.write().queue_overflows += 1;
                return Err(ThreadPoolError::QueueFull);
            }
            queue.push_back(task);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> ThreadPoolStats {
        let mut stats = self.shared.stats.read().clone();
        stats.threads_active = self.shared.active.load(Ordering::SeqCst);
        stats.threads_idle = self.num_threads.saturating_sub(stats.threads_active);
        stats.queued = self.shared.queue.lock().len();
        stats
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks and wait for queued ones to finish.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared, idle_timeout: Duration) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                shared.available.wait_for(&mut queue, idle_timeout);
            }
        };
        let Some(task) = task else { return };

        shared.active.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(task));
        let exec_us = start.elapsed().as_micros() as u64;
        shared.active.fetch_sub(1, Ordering::SeqCst);

        let mut stats = shared.stats.write();
        stats.total_tasks_executed += 1;
        if outcome.is_err() {
            stats.tasks_panicked += 1;
        }
        // Rolling average of execution time
        stats.avg_exec_time_us = if stats.avg_exec_time_us == 0 {
            exec_us
        } else {
            (stats.avg_exec_time_us * 9 + exec_us) / 10
        };
    }
}

/// Errors for thread pool operations.
#[derive(Debug, thiserror::Error)]
pub enum ThreadPoolError {
    #[error("Thread pool is shut down")]
    PoolShutdown,

    #[error("Task queue is full")]
    QueueFull,

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawnFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pool(threads: usize, queue_size: usize) -> ThreadPool {
        ThreadPool::new(ThreadPoolConfig {
            num_threads: threads,
            queue_size,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_runs_submitted_tasks() {
        let pool = pool(2, 16);
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            pool.submit(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let mut seen: Vec<i32> = (0..5).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_full_queue_rejects() {
        let pool = pool(1, 1);
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv();
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The single worker is busy, so one task fits in the queue.
        pool.submit(Box::new(|| {})).unwrap();
        assert!(matches!(pool.submit(Box::new(|| {})), Err(ThreadPoolError::QueueFull)));
        assert_eq!(pool.stats().queue_overflows, 1);

        block_tx.send(()).unwrap();
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let pool = pool(1, 8);
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(42).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert_eq!(pool.stats().tasks_panicked, 1);
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let pool = pool(1, 8);
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(10));
                tx.send(i).unwrap();
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(rx.try_iter().count(), 3);
        assert!(matches!(pool.submit(Box::new(|| {})), Err(ThreadPoolError::PoolShutdown)));
        assert_eq!(pool.stats().total_tasks_executed, 3);
    }
}
