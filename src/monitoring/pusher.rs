//! Sampled, asynchronous emission of model monitoring records.
//!
//! `push` builds the record on the caller's task and hands it to a bounded
//! channel drained by one emitter task, so records reach the stream in push
//! order. A full channel or a failing stream drops the record with a warning.
//! Neither ever fails the request that produced it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};

use super::sink::OutputStream;
use crate::telemetry;

/// Timestamp layout of the `when` field and of serving responses.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";

/// Format a timestamp as `YYYY-MM-DD HH:MM:SS.ffffff+00:00`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone)]
pub struct LogPusherConfig {
    /// Percentage (0-100) of inputs kept per successful call.
    pub sampling_percentage: f64,
    /// Records buffered between callers and the emitter.
    pub buffer: usize,
    /// Log every emitted record.
    pub verbose: bool,
}

impl Default for LogPusherConfig {
    fn default() -> Self {
        Self {
            sampling_percentage: 100.0,
            buffer: 1024,
            verbose: false,
        }
    }
}

/// Fields shared by every record of one pusher.
#[derive(Debug, Clone, Default)]
pub struct RecordContext {
    /// Implementation name of the serving unit.
    pub class: String,
    pub model: String,
    pub worker: Option<u32>,
    pub host: String,
    pub function_uri: String,
    pub endpoint_id: Option<String>,
    pub labels: Map<String, Value>,
    pub metrics: Map<String, Value>,
}

impl RecordContext {
    pub fn new(class: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            model: model.into(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// One observed call.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub start: DateTime<Utc>,
    pub op: String,
    pub request: Value,
    pub response: Option<Value>,
    pub error: Option<String>,
    /// Overrides the context's model name.
    pub model: Option<String>,
    pub partition_key: Option<String>,
    /// Call-level metrics, merged over the context's metrics.
    pub metrics: Map<String, Value>,
}

impl LogEntry {
    pub fn new(start: DateTime<Utc>, op: impl Into<String>, request: Value) -> Self {
        Self {
            start,
            op: op.into(),
            request,
            response: None,
            error: None,
            model: None,
            partition_key: None,
            metrics: Map::new(),
        }
    }

    pub fn response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn metrics(mut self, metrics: Map<String, Value>) -> Self {
        self.metrics = metrics;
        self
    }
}

enum Command {
    Record { record: Value, partition_key: Option<String> },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

/// Handle to a running emitter. Cheap to clone.
#[derive(Clone)]
pub struct LogPusher {
    tx: mpsc::Sender<Command>,
    context: Arc<RecordContext>,
    sampling_percentage: f64,
    counters: Arc<Counters>,
}

impl LogPusher {
    /// Start the emitter task on the current runtime.
    pub fn spawn(stream: Arc<dyn OutputStream>, context: RecordContext, config: LogPusherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let counters = Arc::new(Counters::default());
        let context = Arc::new(context);
        tokio::spawn(emit_loop(rx, stream, counters.clone(), context.model.clone(), config.verbose));
        Self {
            tx,
            context,
            sampling_percentage: config.sampling_percentage.clamp(0.0, 100.0),
            counters,
        }
    }

    pub fn context(&self) -> &RecordContext {
        &self.context
    }

    pub fn sampling_percentage(&self) -> f64 {
        self.sampling_percentage
    }

    /// Records handed to the stream successfully.
    pub fn pushed(&self) -> u64 {
        self.counters.pushed.load(Ordering::Relaxed)
    }

    /// Records lost to a full buffer or a failing stream.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Sample and enqueue a record for `entry`. Never blocks.
    pub fn push(&self, entry: LogEntry) {
        let partition_key = entry.partition_key.clone();
        let Some(record) = self.build_record(entry) else {
            return;
        };
        if let Err(e) = self.tx.try_send(Command::Record { record, partition_key }) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            telemetry::record_monitoring_dropped(&self.context.model);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "buffer full",
                mpsc::error::TrySendError::Closed(_) => "emitter stopped",
            };
            tracing::warn!(model = %self.context.model, reason, "dropping monitoring record");
        }
    }

    /// Wait until every record pushed so far has been handed to the stream.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Build the record for `entry`, or `None` when sampling kept no input.
    pub fn build_record(&self, entry: LogEntry) -> Option<Value> {
        let mut data = self.base_data(entry.model.as_deref());
        data.insert("op".into(), Value::String(entry.op));
        data.insert("when".into(), Value::String(format_timestamp(entry.start)));

        // Failures are always recorded.
        if let Some(error) = entry.error {
            data.insert("request".into(), entry.request);
            data.insert("error".into(), Value::String(error));
            return Some(Value::Object(data));
        }

        let mut request = entry.request;
        let mut response = entry.response;
        normalize_inputs(&mut request);
        let microsec = (Utc::now() - entry.start).num_microseconds().unwrap_or(i64::MAX);

        if self.sampling_percentage < 100.0 {
            let count = input_count(&request);
            let picked = pick_random_requests(count, self.sampling_percentage);
            if picked.is_empty() {
                return None;
            }
            retain_indices(&mut request, "inputs", &picked);
            if let Some(response) = response.as_mut() {
                retain_indices(response, "outputs", &picked);
            }
        }

        let effective = input_count(&request);
        data.insert("request".into(), request);
        data.insert("resp".into(), response.unwrap_or(Value::Null));
        data.insert("microsec".into(), json!(microsec));
        let mut metrics = self.context.metrics.clone();
        metrics.extend(entry.metrics);
        if !metrics.is_empty() {
            data.insert("metrics".into(), Value::Object(metrics));
        }
        data.insert("effective_sample_count".into(), json!(effective));
        Some(Value::Object(data))
    }

    fn base_data(&self, model: Option<&str>) -> Map<String, Value> {
        let ctx = &self.context;
        let mut data = Map::new();
        data.insert("class".into(), json!(ctx.class));
        data.insert("worker".into(), json!(ctx.worker));
        data.insert("model".into(), json!(model.unwrap_or(&ctx.model)));
        data.insert("host".into(), json!(ctx.host));
        data.insert("function_uri".into(), json!(ctx.function_uri));
        data.insert("endpoint_id".into(), json!(ctx.endpoint_id));
        data.insert("sampling_percentage".into(), json!(self.sampling_percentage));
        if !ctx.labels.is_empty() {
            data.insert("labels".into(), Value::Object(ctx.labels.clone()));
        }
        data
    }
}

impl std::fmt::Debug for LogPusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPusher")
            .field("model", &self.context.model)
            .field("sampling_percentage", &self.sampling_percentage)
            .field("pushed", &self.pushed())
            .field("dropped", &self.dropped())
            .finish()
    }
}

async fn emit_loop(
    mut rx: mpsc::Receiver<Command>,
    stream: Arc<dyn OutputStream>,
    counters: Arc<Counters>,
    model: String,
    verbose: bool,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record { record, partition_key } => {
                if verbose {
                    tracing::info!(model = %model, record = %record, "monitoring record");
                }
                match stream.push(vec![record], partition_key.as_deref()).await {
                    Ok(()) => {
                        counters.pushed.fetch_add(1, Ordering::Relaxed);
                        telemetry::record_monitoring_pushed(&model);
                    }
                    Err(e) => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        telemetry::record_monitoring_dropped(&model);
                        tracing::warn!(model = %model, error = %e, "failed to push monitoring record");
                    }
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!(model = %model, "monitoring emitter stopped");
}

/// Make `request["inputs"]` a list of lists. A flat list is one input.
fn normalize_inputs(request: &mut Value) {
    if let Some(Value::Array(items)) = request.get_mut("inputs") {
        if items.iter().any(|item| !item.is_array()) {
            let flat = std::mem::take(items);
            items.push(Value::Array(flat));
        }
    }
}

fn input_count(request: &Value) -> usize {
    request
        .get("inputs")
        .and_then(Value::as_array)
        .map_or(1, Vec::len)
}

fn retain_indices(value: &mut Value, key: &str, picked: &[usize]) {
    if let Some(Value::Array(items)) = value.get_mut(key) {
        let kept: Vec<Value> = picked.iter().filter_map(|&i| items.get(i).cloned()).collect();
        *items = kept;
    }
}

/// Indices chosen independently with probability `percentage / 100`.
pub fn pick_random_requests(count: usize, percentage: f64) -> Vec<usize> {
    let mut rng = rand::thread_rng();
    let threshold = percentage / 100.0;
    (0..count).filter(|_| rng.gen::<f64>() < threshold).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::MemoryStream;
    use chrono::TimeZone;

    fn pusher(stream: Arc<MemoryStream>, sampling: f64) -> LogPusher {
        let mut context = RecordContext::new("EchoServer", "m1");
        context.endpoint_id = Some("ep-1".into());
        LogPusher::spawn(
            stream,
            context,
            LogPusherConfig { sampling_percentage: sampling, ..Default::default() },
        )
    }

    fn call(i: usize) -> LogEntry {
        LogEntry::new(Utc::now(), "infer", json!({"id": i.to_string(), "inputs": [[i]]}))
            .response(json!({"outputs": [i]}))
    }

    #[test]
    fn timestamp_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(format_timestamp(at), "2024-03-05 07:08:09.000000+00:00");
    }

    #[test]
    fn pick_bounds() {
        assert_eq!(pick_random_requests(50, 100.0).len(), 50);
        assert!(pick_random_requests(50, 0.0).is_empty());
    }

    #[test]
    fn normalize_wraps_flat_inputs() {
        let mut request = json!({"inputs": [1, 2, 3]});
        normalize_inputs(&mut request);
        assert_eq!(request["inputs"], json!([[1, 2, 3]]));

        let mut request = json!({"inputs": [[1], [2]]});
        normalize_inputs(&mut request);
        assert_eq!(request["inputs"], json!([[1], [2]]));
    }

    #[tokio::test]
    async fn full_sampling_logs_every_call() {
        let stream = Arc::new(MemoryStream::new());
        let pusher = pusher(stream.clone(), 100.0);
        for i in 0..100 {
            pusher.push(call(i));
        }
        pusher.flush().await;
        assert_eq!(stream.len(), 100);
        assert_eq!(pusher.pushed(), 100);

        // Submission order is preserved.
        let ids: Vec<String> = stream
            .bodies()
            .iter()
            .map(|r| r["request"]["id"].as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn zero_sampling_logs_nothing() {
        let stream = Arc::new(MemoryStream::new());
        let pusher = pusher(stream.clone(), 0.0);
        for i in 0..100 {
            pusher.push(call(i));
        }
        pusher.flush().await;
        assert!(stream.is_empty());
    }

    #[tokio::test]
    async fn partial_sampling_approaches_percentage() {
        let stream = Arc::new(MemoryStream::new());
        let pusher = LogPusher::spawn(
            stream.clone(),
            RecordContext::new("EchoServer", "m1"),
            LogPusherConfig { sampling_percentage: 30.0, buffer: 4096, verbose: false },
        );
        for i in 0..2000 {
            pusher.push(call(i));
        }
        pusher.flush().await;
        let logged = stream.len();
        assert!((450..=750).contains(&logged), "logged {logged} of 2000 at 30%");
    }

    #[tokio::test]
    async fn sampling_keeps_matching_outputs() {
        let stream = Arc::new(MemoryStream::new());
        let pusher = pusher(stream.clone(), 50.0);
        let inputs: Vec<Value> = (0..200).map(|i| json!([i])).collect();
        let outputs: Vec<Value> = (0..200).map(|i| json!(i)).collect();
        let entry = LogEntry::new(Utc::now(), "infer", json!({"inputs": inputs}))
            .response(json!({"outputs": outputs}));
        pusher.push(entry);
        pusher.flush().await;

        let record = &stream.bodies()[0];
        let kept_inputs = record["request"]["inputs"].as_array().unwrap();
        let kept_outputs = record["resp"]["outputs"].as_array().unwrap();
        assert_eq!(kept_inputs.len(), kept_outputs.len());
        assert_eq!(record["effective_sample_count"], json!(kept_inputs.len()));
        for (input, output) in kept_inputs.iter().zip(kept_outputs) {
            assert_eq!(&input[0], output);
        }
    }

    #[tokio::test]
    async fn errors_are_never_sampled_out() {
        let stream = Arc::new(MemoryStream::new());
        let pusher = pusher(stream.clone(), 0.0);
        pusher.push(
            LogEntry::new(Utc::now(), "infer", json!({"inputs": [[1]]}))
                .error("boom")
                .partition_key("ep-1"),
        );
        pusher.flush().await;

        let records = stream.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].partition_key.as_deref(), Some("ep-1"));
        let body = &records[0].body;
        assert_eq!(body["error"], "boom");
        assert_eq!(body["op"], "infer");
        assert_eq!(body["endpoint_id"], "ep-1");
        assert!(body.get("resp").is_none());
    }

    #[tokio::test]
    async fn failing_stream_only_counts_drops() {
        let stream = Arc::new(MemoryStream::new());
        stream.set_failing(true);
        let pusher = pusher(stream.clone(), 100.0);
        pusher.push(call(1));
        pusher.flush().await;
        assert_eq!(pusher.dropped(), 1);
        assert_eq!(pusher.pushed(), 0);
    }

    #[tokio::test]
    async fn record_carries_base_fields() {
        let stream = Arc::new(MemoryStream::new());
        let pusher = pusher(stream.clone(), 100.0);
        pusher.push(call(3));
        pusher.flush().await;

        let record = &stream.bodies()[0];
        for field in ["class", "worker", "model", "host", "function_uri", "endpoint_id", "sampling_percentage", "when", "microsec"] {
            assert!(record.get(field).is_some(), "missing {field}");
        }
        assert_eq!(record["class"], "EchoServer");
        assert_eq!(record["effective_sample_count"], 1);
    }

    #[tokio::test]
    async fn call_metrics_override_context_metrics() {
        let stream = Arc::new(MemoryStream::new());
        let mut context = RecordContext::new("EchoServer", "m1");
        context.worker = Some(3);
        context.labels.insert("team".into(), json!("fraud"));
        context.metrics.insert("version".into(), json!(1));
        context.metrics.insert("drift".into(), json!(0.0));
        let pusher = LogPusher::spawn(stream.clone(), context, LogPusherConfig::default());

        let mut metrics = Map::new();
        metrics.insert("drift".into(), json!(0.25));
        pusher.push(call(1).metrics(metrics));
        pusher.flush().await;

        let record = &stream.bodies()[0];
        assert_eq!(record["worker"], 3);
        assert_eq!(record["labels"], json!({"team": "fraud"}));
        assert_eq!(record["metrics"], json!({"version": 1, "drift": 0.25}));
    }
}
