//! `flowserve run`: push one event through a graph loaded from TOML.
//!
//! The response body is printed to stdout as JSON. Events that fan out to a
//! queue keep running after the response; the command waits for them
//! before shutting the graph down.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::dispatch::Dispatcher;
use crate::event::{Event, Method};
use crate::graph::{GraphServer, GraphSpec};
use crate::models::ModelCatalog;
use crate::monitoring::FileStream;
use crate::shutdown::ShutdownResult;

/// Parsed `run` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct RunArgs {
    pub graph: PathBuf,
    pub body: Value,
    pub path: String,
    pub id: Option<String>,
    pub method: Method,
    /// JSON-lines file receiving unhandled step failures.
    pub error_log: Option<PathBuf>,
}

/// Parse the arguments following `run`.
pub fn parse_run_args(args: &[String]) -> Result<RunArgs, String> {
    let mut graph = None;
    let mut body = Value::Object(Default::default());
    let mut path = String::new();
    let mut id = None;
    let mut method = Method::Post;
    let mut error_log = None;

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args
            .get(i + 1)
            .ok_or_else(|| format!("Missing value for {flag}"))
            .map(String::as_str);
        match flag {
            "--graph" => graph = Some(PathBuf::from(value?)),
            "--body" => {
                body = serde_json::from_str(value?).map_err(|e| format!("Invalid --body JSON: {e}"))?;
            }
            "--body-file" => {
                let file = value?;
                let content =
                    std::fs::read_to_string(file).map_err(|e| format!("Failed to read {file}: {e}"))?;
                body = serde_json::from_str(&content).map_err(|e| format!("Invalid JSON in {file}: {e}"))?;
            }
            "--path" => path = value?.to_string(),
            "--id" => id = Some(value?.to_string()),
            "--method" => {
                method = match value?.to_ascii_uppercase().as_str() {
                    "GET" => Method::Get,
                    "POST" => Method::Post,
                    other => return Err(format!("Unsupported method: {other}")),
                };
            }
            "--error-log" => error_log = Some(PathBuf::from(value?)),
            other => return Err(format!("Unknown option: {other}")),
        }
        i += 2;
    }

    let graph = graph.ok_or_else(|| "--graph is required".to_string())?;
    Ok(RunArgs { graph, body, path, id, method, error_log })
}

/// Run one event and print the response. Returns the process exit code.
pub async fn run_graph(args: RunArgs) -> i32 {
    let env = config::load();
    let spec = match GraphSpec::load(&args.graph) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("Error: {e}");
            return super::EXIT_USAGE;
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(env.dispatch_config()));
    let graph = match spec.build(&ModelCatalog::builtin(), dispatcher.clone()) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("Error: {e}");
            dispatcher.shutdown().await;
            return super::EXIT_USAGE;
        }
    };

    let mut server = GraphServer::new(graph).with_dispatcher(dispatcher);
    if let Some(path) = &args.error_log {
        match FileStream::open(path).await {
            Ok(stream) => server = server.with_error_stream(Arc::new(stream)),
            Err(e) => {
                eprintln!("Error: cannot open error log {}: {e}", path.display());
                return super::EXIT_USAGE;
            }
        }
    }

    let code = run_event(&server, args).await;

    if let ShutdownResult::Timeout(load) = server.wait_for_completion(env.shutdown_timeout).await {
        eprintln!("Timed out waiting for {} background branch(es)", load.branches);
    }
    server.shutdown(env.shutdown_timeout).await;
    code
}

async fn run_event(server: &GraphServer, args: RunArgs) -> i32 {
    if let Err(e) = server.init().await {
        eprintln!("Error: {e}");
        return 1;
    }

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    let event = Event::from_request(args.id, args.body)
        .path(args.path)
        .method(args.method);
    let code = tokio::select! {
        result = server.run(event) => match result {
            Ok(response) => match serde_json::to_string_pretty(&response.body) {
                Ok(out) => {
                    println!("{out}");
                    0
                }
                Err(e) => {
                    eprintln!("Error: cannot serialize response: {e}");
                    1
                }
            },
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        },
        _ = cancel.cancelled() => {
            eprintln!("Interrupted, shutting down...");
            130
        }
    };
    watcher.abort();
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_all_flags() {
        let parsed = parse_run_args(&args(&[
            "--graph", "g.toml", "--body", r#"{"n": 1}"#, "--path", "/v2/models/m/infer", "--id", "e1",
            "--method", "get", "--error-log", "errors.jsonl",
        ]))
        .unwrap();
        assert_eq!(parsed.graph, PathBuf::from("g.toml"));
        assert_eq!(parsed.body, json!({"n": 1}));
        assert_eq!(parsed.path, "/v2/models/m/infer");
        assert_eq!(parsed.id.as_deref(), Some("e1"));
        assert_eq!(parsed.method, Method::Get);
        assert_eq!(parsed.error_log, Some(PathBuf::from("errors.jsonl")));
    }

    #[test]
    fn defaults_to_empty_post() {
        let parsed = parse_run_args(&args(&["--graph", "g.toml"])).unwrap();
        assert_eq!(parsed.body, json!({}));
        assert_eq!(parsed.method, Method::Post);
        assert!(parsed.id.is_none());
        assert!(parsed.path.is_empty());
    }

    #[test]
    fn reads_body_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("body.json");
        std::fs::write(&file, r#"{"models": ["m2"], "n": 3}"#).unwrap();
        let parsed =
            parse_run_args(&args(&["--graph", "g.toml", "--body-file", file.to_str().unwrap()])).unwrap();
        assert_eq!(parsed.body["models"], json!(["m2"]));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse_run_args(&args(&[])).unwrap_err(), "--graph is required");
        assert!(parse_run_args(&args(&["--graph"])).unwrap_err().contains("Missing value"));
        assert!(parse_run_args(&args(&["--graph", "g", "--body", "{"])).unwrap_err().contains("Invalid --body"));
        assert!(parse_run_args(&args(&["--graph", "g", "--method", "PUT"])).is_err());
        assert!(parse_run_args(&args(&["--graph", "g", "--verbose", "x"])).unwrap_err().contains("Unknown option"));
    }

    #[tokio::test]
    async fn runs_graph_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("graph.toml");
        std::fs::write(
            &file,
            r#"
            [[models]]
            name = "m1"
            kind = "increment"
            mechanism = "naive"
            params = { inc = 1 }

            [[steps]]
            name = "router"
            kind = "runner"
            "#,
        )
        .unwrap();
        let parsed = parse_run_args(&args(&["--graph", file.to_str().unwrap(), "--body", r#"{"n": 1}"#])).unwrap();
        assert_eq!(run_graph(parsed).await, 0);
    }

    #[tokio::test]
    async fn missing_graph_file_is_usage_error() {
        let parsed = parse_run_args(&args(&["--graph", "/nonexistent/graph.toml"])).unwrap();
        assert_eq!(run_graph(parsed).await, crate::cli::EXIT_USAGE);
    }
}
