//! Tests for the `flowserve` binary.

use std::process::Command;

use serde_json::{json, Value};

fn flowserve() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_flowserve"));
    for (key, _) in std::env::vars() {
        if key.starts_with("FLOWSERVE_") {
            command.env_remove(key);
        }
    }
    command
}

const GRAPH: &str = r#"
[[models]]
name = "m1"
kind = "increment"
mechanism = "process_pool"
params = { inc = 1 }

[[models]]
name = "m2"
kind = "increment"
mechanism = "dedicated_process"
resource = "0"
params = { inc = 2 }

[[steps]]
name = "router"
kind = "runner"
selector = "models"
"#;

#[test]
fn test_version() {
    let out = flowserve().arg("version").output().unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.starts_with("flowserve "));
}

#[test]
fn test_unknown_command_fails() {
    let out = flowserve().arg("serve-forever").output().unwrap();
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_run_graph_with_process_workers() {
    let dir = tempfile::tempdir().unwrap();
    let graph = dir.path().join("graph.toml");
    std::fs::write(&graph, GRAPH).unwrap();

    let out = flowserve()
        .args(["run", "--graph", graph.to_str().unwrap(), "--body", r#"{"n": 1}"#])
        .env("FLOWSERVE_PROCESS_POOL_SIZE", "1")
        .env("FLOWSERVE_LOG_LEVEL", "warn")
        .output()
        .unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let body: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(body, json!({"m1": {"n": 2}, "m2": {"n": 3, "resource": "0"}}));
}

#[test]
fn test_run_with_selection() {
    let dir = tempfile::tempdir().unwrap();
    let graph = dir.path().join("graph.toml");
    std::fs::write(&graph, GRAPH).unwrap();

    let out = flowserve()
        .args(["run", "--graph", graph.to_str().unwrap(), "--body", r#"{"n": 3, "models": ["m2"]}"#])
        .env("FLOWSERVE_LOG_LEVEL", "warn")
        .output()
        .unwrap();
    assert!(out.status.success());
    let body: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(body, json!({"m2": {"n": 5, "resource": "0"}}));
}

#[test]
fn test_run_usage_errors() {
    let out = flowserve().args(["run", "--body", "{}"]).output().unwrap();
    assert_eq!(out.status.code(), Some(2));

    let out = flowserve()
        .args(["run", "--graph", "/nonexistent/graph.toml"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_config_show_json() {
    let out = flowserve()
        .args(["config", "show", "--json"])
        .env("FLOWSERVE_PROCESS_POOL_SIZE", "3")
        .output()
        .unwrap();
    assert!(out.status.success());
    let config: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(config["process_pool_size"], json!(3));
    assert_eq!(config["log_format"], json!("json"));
}

#[test]
fn test_config_validate_flags_bad_values() {
    let out = flowserve().args(["config", "validate"]).output().unwrap();
    assert!(out.status.success());

    let out = flowserve()
        .args(["config", "validate"])
        .env("FLOWSERVE_DISPATCH_TIMEOUT_MS", "soon")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("FLOWSERVE_DISPATCH_TIMEOUT_MS"));
}

#[test]
fn test_worker_rejects_bad_arguments() {
    let out = flowserve().args(["worker", "--mode", "cluster"]).output().unwrap();
    assert_eq!(out.status.code(), Some(2));
}
