//! Tests for model servers behind a graph: routing, readiness, dict inputs
//! and monitoring records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowserve::event::{Event, Method, TriggerKind};
use flowserve::graph::{GraphBuilder, GraphError, GraphServer, StepDef, StepError};
use flowserve::models::ModelError;
use flowserve::monitoring::{LogPusherConfig, MemoryStream};
use flowserve::serving::{
    LoadMode, ModelArtifact, ModelRouter, ModelServer, ReadinessConfig, ServingError, ServingModel,
    ServingMonitoring, StaticEndpoints, METADATA_FILE,
};
use serde_json::{json, Value};

/// Sums each input row.
struct RowSum;

impl ServingModel for RowSum {
    fn predict(&self, request: &Value) -> Result<Value, ModelError> {
        let rows = request["inputs"]
            .as_array()
            .ok_or_else(|| ModelError::InvalidInput("inputs must be a list".into()))?;
        rows.iter()
            .map(|row| {
                row.as_array()
                    .map(|cells| json!(cells.iter().filter_map(Value::as_i64).sum::<i64>()))
                    .ok_or_else(|| ModelError::InvalidInput("rows must be lists".into()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }
}

/// Returns the first input row, so reordering is visible.
struct FirstRow {
    loaded: AtomicBool,
}

impl ServingModel for FirstRow {
    fn load(&self, artifact: Option<&ModelArtifact>) -> Result<(), ModelError> {
        if artifact.is_none() {
            return Err(ModelError::Load("no artifact".into()));
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn predict(&self, request: &Value) -> Result<Value, ModelError> {
        Ok(request["inputs"][0].clone())
    }
}

/// Blocks in `load` until released.
struct Gated {
    release: Arc<AtomicBool>,
}

impl ServingModel for Gated {
    fn load(&self, _artifact: Option<&ModelArtifact>) -> Result<(), ModelError> {
        while !self.release.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn predict(&self, _request: &Value) -> Result<Value, ModelError> {
        Ok(json!(["ok"]))
    }
}

async fn served(router: ModelRouter) -> GraphServer {
    let mut builder = GraphBuilder::new();
    builder.add_step(StepDef::router("models", router)).unwrap();
    let server = GraphServer::new(builder.build().unwrap());
    server.init().await.unwrap();
    server
}

#[tokio::test]
async fn test_router_step_serves_v2_paths() {
    let router = ModelRouter::new();
    router.add_route(ModelServer::new("sum", RowSum)).await.unwrap();
    router.add_route(ModelServer::new("sum:v2", RowSum)).await.unwrap();
    let server = served(router).await;

    let event = Event::with_id("e-1", json!({"inputs": [[1, 2], [3, 4]]})).path("/v2/models/sum/infer");
    let out = server.run(event).await.unwrap();
    assert_eq!(out.body["outputs"], json!([3, 7]));
    assert_eq!(out.body["id"], json!("e-1"));
    assert_eq!(out.body["model_name"], json!("sum"));
    assert!(out.body["timestamp"].is_string());

    let out = server
        .test("/v2/models/sum/versions/v2/predict", json!({"inputs": [[5]]}))
        .await
        .unwrap();
    assert_eq!(out["outputs"], json!([5]));
    assert_eq!(out["model_name"], json!("sum"), "version tag is dropped from model_name");

    let listing = server
        .run(Event::new(Value::Null).path("/v2/models").method(Method::Get))
        .await
        .unwrap();
    assert_eq!(listing.body, json!({"models": ["sum", "sum:v2"]}));
}

#[tokio::test]
async fn test_request_id_and_operation_from_body() {
    let router = ModelRouter::new();
    router.add_route(ModelServer::new("sum", RowSum)).await.unwrap();
    let server = served(router).await;

    // A lone route takes unprefixed paths; the body names op and id.
    let out = server
        .run(Event::new(json!({"operation": "predict", "id": "caller-7", "inputs": [[2, 2]]})))
        .await
        .unwrap();
    assert_eq!(out.body["id"], json!("caller-7"));
    assert_eq!(out.body["outputs"], json!([4]));
}

#[tokio::test]
async fn test_invalid_requests_fail_the_step() {
    let router = ModelRouter::new();
    router.add_route(ModelServer::new("sum", RowSum)).await.unwrap();
    let server = served(router).await;

    let err = server.test("/v2/models/sum/infer", json!({"rows": []})).await.unwrap_err();
    assert!(matches!(
        err,
        GraphError::StepFailed { source: StepError::Serving(ServingError::Validation(_)), .. }
    ));

    let err = server.test("/v2/models/sum/train", json!({"inputs": []})).await.unwrap_err();
    let GraphError::StepFailed { source, .. } = err else {
        panic!("expected a step failure");
    };
    assert_eq!(source.to_string(), "illegal model operation train, method=POST");
}

#[tokio::test]
async fn test_dict_inputs_follow_artifact_feature_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("model.bin"), b"weights").unwrap();
    std::fs::write(
        dir.path().join(METADATA_FILE),
        json!({"inputs": [{"name": "a"}, {"name": "b"}], "outputs": [{"name": "y"}]}).to_string(),
    )
    .unwrap();

    let server = ModelServer::new("first", FirstRow { loaded: AtomicBool::new(false) })
        .model_path(dir.path().to_str().unwrap())
        .model_suffix(".bin");
    server.post_init(LoadMode::Sync).await.unwrap();
    assert_eq!(
        server.artifact().unwrap().model_file,
        Some(dir.path().join("model.bin"))
    );

    let out = server
        .handle(Event::new(json!({"inputs": [{"b": 20, "a": 10}]})).path("predict_dict"))
        .await
        .unwrap();
    assert_eq!(out.body["outputs"], json!([10, 20]));

    let meta = server.handle(Event::new(Value::Null).method(Method::Get)).await.unwrap();
    assert!(meta.terminated);
    assert_eq!(meta.body["name"], json!("first"));
    assert_eq!(meta.body["inputs"][1]["name"], json!("b"));
}

#[tokio::test]
async fn test_async_load_gates_requests_by_trigger() {
    let release = Arc::new(AtomicBool::new(false));
    let server = Arc::new(
        ModelServer::new("gated", Gated { release: release.clone() })
            .load_mode(LoadMode::Async)
            .readiness(ReadinessConfig {
                poll_interval: Duration::from_millis(20),
                max_attempts: 200,
            }),
    );
    server.post_init(LoadMode::Async).await.unwrap();

    // Synchronous callers fail fast while loading.
    let err = server
        .handle(Event::new(json!({"inputs": [1]})).trigger(TriggerKind::Http))
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::NotReady { .. }));

    let ready = server
        .handle(Event::new(Value::Null).path("ready").method(Method::Get))
        .await
        .unwrap();
    assert_eq!(ready.status_code, Some(408));

    // Stream events wait for the load to finish.
    let waiting = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .handle(Event::new(json!({"inputs": [1]})).trigger(TriggerKind::Stream))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());
    release.store(true, Ordering::SeqCst);

    let out = waiting.await.unwrap().unwrap();
    assert_eq!(out.body["outputs"], json!(["ok"]));

    let ready = server
        .handle(Event::with_id("r1", Value::Null).path("ready").method(Method::Get))
        .await
        .unwrap();
    assert_eq!(ready.status_code, Some(200));
    assert_eq!(ready.body, json!("Model gated is ready (event_id = r1)"));
}

#[tokio::test]
async fn test_monitoring_records_successes_and_failures() {
    let stream = Arc::new(MemoryStream::new());
    let monitoring = ServingMonitoring {
        registry: Arc::new(StaticEndpoints::new().with_endpoint("sum", "ep-1")),
        stream: stream.clone(),
        config: LogPusherConfig::default(),
        function_uri: "proj/fn".into(),
    };
    let server = ModelServer::new("sum", RowSum).monitoring(monitoring).shard_by_endpoint(true);
    server.post_init(LoadMode::Sync).await.unwrap();

    let out = server
        .handle(Event::with_id("ok-1", json!({"inputs": [[1, 1]]})))
        .await
        .unwrap();
    assert_eq!(out.body["model_endpoint_uid"], json!("ep-1"));

    let err = server
        .handle(Event::with_id("bad-1", json!({"inputs": [7]})))
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::Model { ref op, .. } if op == "infer"));

    server.log_pusher().unwrap().flush().await;
    let records = stream.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.partition_key.as_deref() == Some("ep-1")));

    let success = &records[0].body;
    assert_eq!(success["endpoint_id"], json!("ep-1"));
    assert_eq!(success["function_uri"], json!("proj/fn"));
    assert_eq!(success["resp"]["outputs"], json!([2]));

    let failure = &records[1].body;
    assert_eq!(failure["request"]["id"], json!("bad-1"));
    assert!(failure["error"].as_str().unwrap().contains("rows must be lists"));
}
