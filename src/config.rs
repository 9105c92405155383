//! Runtime configuration loading from environment variables.
//!
//! All values come from `FLOWSERVE_*` environment variables with defaults.
//! Invalid values fall back to defaults without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `FLOWSERVE_THREAD_POOL_SIZE` | 0 | Predict threads (0 = CPU count) |
//! | `FLOWSERVE_THREAD_QUEUE_SIZE` | 256 | Queued thread-pool calls before rejection |
//! | `FLOWSERVE_PROCESS_POOL_SIZE` | 0 | Pool worker processes (0 = CPU count) |
//! | `FLOWSERVE_DISPATCH_TIMEOUT_MS` | 0 | Per-call dispatch timeout (0 = none) |
//! | `FLOWSERVE_WORKER_PROGRAM` | current executable | Worker subprocess binary |
//! | `FLOWSERVE_IPC_FRAME_LIMIT` | 16777216 | Max worker frame size (bytes) |
//! | `FLOWSERVE_READINESS_POLL_MS` | 5000 | Readiness poll interval |
//! | `FLOWSERVE_READINESS_ATTEMPTS` | 50 | Readiness polls before timeout |
//! | `FLOWSERVE_SAMPLING_PERCENTAGE` | 100 | Monitoring sampling (0-100) |
//! | `FLOWSERVE_MONITORING_BUFFER` | 1024 | Buffered monitoring records |
//! | `FLOWSERVE_VERBOSE` | false | Log every monitoring record |
//! | `FLOWSERVE_SHUTDOWN_TIMEOUT` | 30 | Graceful shutdown timeout (secs) |
//! | `FLOWSERVE_LOG_FORMAT` | json | `json` or `pretty` |
//! | `FLOWSERVE_LOG_LEVEL` | info | Default filter directive |

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::dispatch::{DispatchConfig, ThreadPoolConfig, WorkerCommand};
use crate::ipc::DEFAULT_FRAME_LIMIT;
use crate::monitoring::LogPusherConfig;
use crate::serving::ReadinessConfig;
use crate::telemetry::{LogConfig, LogFormat};

/// Effective runtime configuration summary.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub thread_pool_size: usize,
    pub thread_queue_size: usize,
    pub process_pool_size: usize,
    pub dispatch_timeout_ms: u64,
    pub worker_program: String,
    pub ipc_frame_limit: usize,
    pub readiness_poll_ms: u64,
    pub readiness_attempts: u32,
    pub sampling_percentage: f64,
    pub monitoring_buffer: usize,
    pub verbose: bool,
    pub shutdown_timeout_secs: u64,
    pub log_format: String,
    pub log_level: String,
}

/// All runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub thread_pool: ThreadPoolConfig,
    pub process_pool_size: usize,
    pub dispatch_timeout: Option<Duration>,
    /// `None` runs workers from the current executable.
    pub worker_program: Option<PathBuf>,
    pub ipc_frame_limit: usize,
    pub readiness: ReadinessConfig,
    pub monitoring: LogPusherConfig,
    pub shutdown_timeout: Duration,
    pub log: LogConfig,
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn load_thread_pool_config() -> ThreadPoolConfig {
    let num_threads = parse_usize("FLOWSERVE_THREAD_POOL_SIZE", 0);
    let queue_size = parse_usize("FLOWSERVE_THREAD_QUEUE_SIZE", 256).max(1);
    ThreadPoolConfig {
        num_threads,
        queue_size,
        ..ThreadPoolConfig::default()
    }
}

fn load_readiness_config() -> ReadinessConfig {
    let poll_ms = parse_u64("FLOWSERVE_READINESS_POLL_MS", 5000).max(10);
    let attempts = parse_u32("FLOWSERVE_READINESS_ATTEMPTS", 50).max(1);
    ReadinessConfig {
        poll_interval: Duration::from_millis(poll_ms),
        max_attempts: attempts,
    }
}

fn load_monitoring_config() -> LogPusherConfig {
    let sampling = parse_f64("FLOWSERVE_SAMPLING_PERCENTAGE", 100.0).clamp(0.0, 100.0);
    let buffer = parse_usize("FLOWSERVE_MONITORING_BUFFER", 1024).max(1);
    LogPusherConfig {
        sampling_percentage: sampling,
        buffer,
        verbose: parse_bool("FLOWSERVE_VERBOSE", false),
    }
}

fn load_log_config() -> LogConfig {
    let format = std::env::var("FLOWSERVE_LOG_FORMAT")
        .ok()
        .and_then(|f| f.parse::<LogFormat>().ok())
        .unwrap_or(LogFormat::Json);
    let level = std::env::var("FLOWSERVE_LOG_LEVEL")
        .ok()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    LogConfig {
        format,
        level,
        output_path: None,
    }
}

/// Load all configuration from environment variables.
pub fn load() -> EnvConfig {
    const MIN_FRAME: usize = 4096;
    let timeout_ms = parse_u64("FLOWSERVE_DISPATCH_TIMEOUT_MS", 0);
    let shutdown_secs = parse_u64("FLOWSERVE_SHUTDOWN_TIMEOUT", 30).max(1);
    let worker_program = std::env::var("FLOWSERVE_WORKER_PROGRAM")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from);

    EnvConfig {
        thread_pool: load_thread_pool_config(),
        process_pool_size: parse_usize("FLOWSERVE_PROCESS_POOL_SIZE", 0),
        dispatch_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        worker_program,
        ipc_frame_limit: parse_usize("FLOWSERVE_IPC_FRAME_LIMIT", DEFAULT_FRAME_LIMIT).max(MIN_FRAME),
        readiness: load_readiness_config(),
        monitoring: load_monitoring_config(),
        shutdown_timeout: Duration::from_secs(shutdown_secs),
        log: load_log_config(),
    }
}

impl EnvConfig {
    /// Dispatcher settings. Workers run `flowserve worker` from the
    /// configured program or the current executable.
    pub fn dispatch_config(&self) -> DispatchConfig {
        let worker = match &self.worker_program {
            Some(program) => Some(WorkerCommand::flowserve(program)),
            None => WorkerCommand::current_exe().ok(),
        };
        DispatchConfig {
            thread_pool: self.thread_pool.clone(),
            process_pool_size: self.process_pool_size,
            call_timeout: self.dispatch_timeout,
            worker,
            frame_limit: self.ipc_frame_limit,
            ..DispatchConfig::default()
        }
    }

    /// Return a summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            thread_pool_size: self.thread_pool.num_threads,
            thread_queue_size: self.thread_pool.queue_size,
            process_pool_size: self.process_pool_size,
            dispatch_timeout_ms: self.dispatch_timeout.map_or(0, |t| t.as_millis() as u64),
            worker_program: self
                .worker_program
                .as_ref()
                .map_or_else(|| "<current executable>".to_string(), |p| p.display().to_string()),
            ipc_frame_limit: self.ipc_frame_limit,
            readiness_poll_ms: self.readiness.poll_interval.as_millis() as u64,
            readiness_attempts: self.readiness.max_attempts,
            sampling_percentage: self.monitoring.sampling_percentage,
            monitoring_buffer: self.monitoring.buffer,
            verbose: self.monitoring.verbose,
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            log_format: self.log.format.to_string(),
            log_level: self.log.level.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) const ENV_KEYS: &[&str] = &[
        "FLOWSERVE_THREAD_POOL_SIZE",
        "FLOWSERVE_THREAD_QUEUE_SIZE",
        "FLOWSERVE_PROCESS_POOL_SIZE",
        "FLOWSERVE_DISPATCH_TIMEOUT_MS",
        "FLOWSERVE_WORKER_PROGRAM",
        "FLOWSERVE_IPC_FRAME_LIMIT",
        "FLOWSERVE_READINESS_POLL_MS",
        "FLOWSERVE_READINESS_ATTEMPTS",
        "FLOWSERVE_SAMPLING_PERCENTAGE",
        "FLOWSERVE_MONITORING_BUFFER",
        "FLOWSERVE_VERBOSE",
        "FLOWSERVE_SHUTDOWN_TIMEOUT",
        "FLOWSERVE_LOG_FORMAT",
        "FLOWSERVE_LOG_LEVEL",
    ];

    pub(crate) fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.thread_pool.num_threads, 0);
        assert_eq!(cfg.thread_pool.queue_size, 256);
        assert_eq!(cfg.process_pool_size, 0);
        assert_eq!(cfg.dispatch_timeout, None);
        assert_eq!(cfg.worker_program, None);
        assert_eq!(cfg.ipc_frame_limit, 16 * 1024 * 1024);
        assert_eq!(cfg.readiness.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.readiness.max_attempts, 50);
        assert_eq!(cfg.monitoring.sampling_percentage, 100.0);
        assert_eq!(cfg.monitoring.buffer, 1024);
        assert!(!cfg.monitoring.verbose);
        assert_eq!(cfg.shutdown_timeout.as_secs(), 30);
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FLOWSERVE_THREAD_POOL_SIZE", "3");
        std::env::set_var("FLOWSERVE_DISPATCH_TIMEOUT_MS", "1500");
        std::env::set_var("FLOWSERVE_WORKER_PROGRAM", "/opt/flowserve/bin/flowserve");
        std::env::set_var("FLOWSERVE_SAMPLING_PERCENTAGE", "12.5");
        std::env::set_var("FLOWSERVE_VERBOSE", "true");
        std::env::set_var("FLOWSERVE_LOG_FORMAT", "pretty");
        let cfg = load();
        assert_eq!(cfg.thread_pool.num_threads, 3);
        assert_eq!(cfg.dispatch_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(cfg.monitoring.sampling_percentage, 12.5);
        assert!(cfg.monitoring.verbose);
        assert_eq!(cfg.log.format, LogFormat::Pretty);

        let dispatch = cfg.dispatch_config();
        assert_eq!(dispatch.thread_pool.num_threads, 3);
        assert_eq!(dispatch.call_timeout, Some(Duration::from_millis(1500)));
        let worker = dispatch.worker.unwrap();
        assert_eq!(worker.program, PathBuf::from("/opt/flowserve/bin/flowserve"));
        assert_eq!(worker.args, vec!["worker".to_string()]);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FLOWSERVE_THREAD_QUEUE_SIZE", "lots");
        std::env::set_var("FLOWSERVE_SAMPLING_PERCENTAGE", "NaN");
        std::env::set_var("FLOWSERVE_VERBOSE", "perhaps");
        std::env::set_var("FLOWSERVE_LOG_FORMAT", "xml");
        let cfg = load();
        assert_eq!(cfg.thread_pool.queue_size, 256);
        assert_eq!(cfg.monitoring.sampling_percentage, 100.0);
        assert!(!cfg.monitoring.verbose);
        assert_eq!(cfg.log.format, LogFormat::Json);
        clear_env_vars();
    }

    #[test]
    fn test_floors_and_clamps() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FLOWSERVE_IPC_FRAME_LIMIT", "0");
        std::env::set_var("FLOWSERVE_SAMPLING_PERCENTAGE", "250");
        std::env::set_var("FLOWSERVE_READINESS_ATTEMPTS", "0");
        std::env::set_var("FLOWSERVE_SHUTDOWN_TIMEOUT", "0");
        let cfg = load();
        assert!(cfg.ipc_frame_limit >= 4096, "frame limit must have floor");
        assert_eq!(cfg.monitoring.sampling_percentage, 100.0);
        assert_eq!(cfg.readiness.max_attempts, 1);
        assert_eq!(cfg.shutdown_timeout.as_secs(), 1);
        clear_env_vars();
    }

    #[test]
    fn test_effective_config_reflects_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FLOWSERVE_DISPATCH_TIMEOUT_MS", "250");
        let eff = load().effective_config();
        assert_eq!(eff.dispatch_timeout_ms, 250);
        assert_eq!(eff.worker_program, "<current executable>");
        assert_eq!(eff.log_format, "json");
        assert!(eff.readiness_attempts > 0);
        clear_env_vars();
    }
}
