//! Config CLI subcommands: show, defaults, validate.
//!
//! These read configuration straight from environment variables.

use crate::config::{self, EffectiveConfig};

/// Numeric variables and whether they accept a fractional value.
const NUMERIC_VARS: &[(&str, bool)] = &[
    ("FLOWSERVE_THREAD_POOL_SIZE", false),
    ("FLOWSERVE_THREAD_QUEUE_SIZE", false),
    ("FLOWSERVE_PROCESS_POOL_SIZE", false),
    ("FLOWSERVE_DISPATCH_TIMEOUT_MS", false),
    ("FLOWSERVE_IPC_FRAME_LIMIT", false),
    ("FLOWSERVE_READINESS_POLL_MS", false),
    ("FLOWSERVE_READINESS_ATTEMPTS", false),
    ("FLOWSERVE_SAMPLING_PERCENTAGE", true),
    ("FLOWSERVE_MONITORING_BUFFER", false),
    ("FLOWSERVE_SHUTDOWN_TIMEOUT", false),
];

/// Print effective config to stdout, as `KEY=value` lines or JSON.
pub fn run_show(json: bool) -> i32 {
    let cfg = config::load().effective_config();
    if json {
        match serde_json::to_string_pretty(&cfg) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("Failed to serialize config: {e}");
                return 1;
            }
        }
    } else {
        print_config(&cfg);
    }
    0
}

/// Print default config values (no env overrides) to stdout.
pub fn run_defaults() {
    println!("FLOWSERVE_THREAD_POOL_SIZE=0");
    println!("FLOWSERVE_THREAD_QUEUE_SIZE=256");
    println!("FLOWSERVE_PROCESS_POOL_SIZE=0");
    println!("FLOWSERVE_DISPATCH_TIMEOUT_MS=0");
    println!("FLOWSERVE_WORKER_PROGRAM=<current executable>");
    println!("FLOWSERVE_IPC_FRAME_LIMIT=16777216");
    println!("FLOWSERVE_READINESS_POLL_MS=5000");
    println!("FLOWSERVE_READINESS_ATTEMPTS=50");
    println!("FLOWSERVE_SAMPLING_PERCENTAGE=100");
    println!("FLOWSERVE_MONITORING_BUFFER=1024");
    println!("FLOWSERVE_VERBOSE=false");
    println!("FLOWSERVE_SHUTDOWN_TIMEOUT=30");
    println!("FLOWSERVE_LOG_FORMAT=json");
    println!("FLOWSERVE_LOG_LEVEL=info");
}

/// Validate configuration for obvious misconfigurations.
///
/// Returns 0 if valid, 1 if any warnings are found.
pub fn run_validate() -> i32 {
    let warnings = collect_warnings();
    for warning in &warnings {
        eprintln!("WARNING: {warning}");
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn collect_warnings() -> Vec<String> {
    let mut warnings = Vec::new();

    // `load` silently falls back on unparseable values.
    for (key, fractional) in NUMERIC_VARS {
        if let Ok(raw) = std::env::var(key) {
            let parses = if *fractional {
                raw.parse::<f64>().map_or(false, f64::is_finite)
            } else {
                raw.parse::<u64>().is_ok()
            };
            if !parses {
                warnings.push(format!("{key}={raw:?} is not a valid number; using the default"));
            }
        }
    }
    if let Ok(raw) = std::env::var("FLOWSERVE_LOG_FORMAT") {
        if raw.parse::<crate::telemetry::LogFormat>().is_err() {
            warnings.push(format!("FLOWSERVE_LOG_FORMAT={raw:?} is not json or pretty"));
        }
    }

    let env = config::load();
    if tracing_subscriber::EnvFilter::try_new(&env.log.level).is_err() {
        warnings.push(format!("FLOWSERVE_LOG_LEVEL={:?} is not a valid filter", env.log.level));
    }
    if let Some(program) = &env.worker_program {
        if !program.is_file() {
            warnings.push(format!(
                "FLOWSERVE_WORKER_PROGRAM ({}) does not exist; process mechanisms will fail to spawn",
                program.display()
            ));
        }
    }
    if env.monitoring.sampling_percentage == 0.0 {
        warnings.push("FLOWSERVE_SAMPLING_PERCENTAGE is 0; only error records will be emitted".to_string());
    }
    warnings
}

fn print_config(cfg: &EffectiveConfig) {
    println!("FLOWSERVE_THREAD_POOL_SIZE={}", cfg.thread_pool_size);
    println!("FLOWSERVE_THREAD_QUEUE_SIZE={}", cfg.thread_queue_size);
    println!("FLOWSERVE_PROCESS_POOL_SIZE={}", cfg.process_pool_size);
    println!("FLOWSERVE_DISPATCH_TIMEOUT_MS={}", cfg.dispatch_timeout_ms);
    println!("FLOWSERVE_WORKER_PROGRAM={}", cfg.worker_program);
    println!("FLOWSERVE_IPC_FRAME_LIMIT={}", cfg.ipc_frame_limit);
    println!("FLOWSERVE_READINESS_POLL_MS={}", cfg.readiness_poll_ms);
    println!("FLOWSERVE_READINESS_ATTEMPTS={}", cfg.readiness_attempts);
    println!("FLOWSERVE_SAMPLING_PERCENTAGE={}", cfg.sampling_percentage);
    println!("FLOWSERVE_MONITORING_BUFFER={}", cfg.monitoring_buffer);
    println!("FLOWSERVE_VERBOSE={}", cfg.verbose);
    println!("FLOWSERVE_SHUTDOWN_TIMEOUT={}", cfg.shutdown_timeout_secs);
    println!("FLOWSERVE_LOG_FORMAT={}", cfg.log_format);
    println!("FLOWSERVE_LOG_LEVEL={}", cfg.log_level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{clear_env_vars, ENV_LOCK};

    #[test]
    fn test_validate_passes_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        assert_eq!(run_validate(), 0, "default config should pass validation");
    }

    #[test]
    fn test_validate_flags_unparseable_numbers() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FLOWSERVE_THREAD_QUEUE_SIZE", "many");
        let warnings = collect_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("FLOWSERVE_THREAD_QUEUE_SIZE"));
        assert_eq!(run_validate(), 1);
        clear_env_vars();
    }

    #[test]
    fn test_validate_flags_missing_worker_program() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FLOWSERVE_WORKER_PROGRAM", "/nonexistent/flowserve");
        let warnings = collect_warnings();
        assert!(warnings.iter().any(|w| w.contains("does not exist")));
        clear_env_vars();
    }

    #[test]
    fn test_validate_flags_zero_sampling() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("FLOWSERVE_SAMPLING_PERCENTAGE", "0");
        let warnings = collect_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("only error records"));
        clear_env_vars();
    }

    #[test]
    fn test_show_json_succeeds() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        assert_eq!(run_show(true), 0);
        assert_eq!(run_show(false), 0);
    }
}
