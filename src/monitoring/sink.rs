//! Output streams receiving monitoring records.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream rejected records: {0}")]
    Rejected(String),
}

/// Destination of monitoring records (a message stream in production).
#[async_trait]
pub trait OutputStream: Send + Sync {
    /// Append records, all sharing the same partition key.
    async fn push(&self, records: Vec<Value>, partition_key: Option<&str>) -> Result<(), PushError>;
}

/// A record captured by [`MemoryStream`].
#[derive(Debug, Clone, PartialEq)]
pub struct PushedRecord {
    pub body: Value,
    pub partition_key: Option<String>,
}

/// In-memory stream. Can be switched to reject pushes.
#[derive(Debug, Default)]
pub struct MemoryStream {
    records: Mutex<Vec<PushedRecord>>,
    failing: AtomicBool,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<PushedRecord> {
        self.records.lock().clone()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.records.lock().iter().map(|r| r.body.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[async_trait]
impl OutputStream for MemoryStream {
    async fn push(&self, records: Vec<Value>, partition_key: Option<&str>) -> Result<(), PushError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PushError::Rejected("memory stream set to fail".into()));
        }
        let key = partition_key.map(str::to_string);
        self.records.lock().extend(records.into_iter().map(|body| PushedRecord {
            body,
            partition_key: key.clone(),
        }));
        Ok(())
    }
}

/// Appends records as JSON lines to a file.
#[derive(Debug)]
pub struct FileStream {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileStream {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PushError> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path, file: tokio::sync::Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OutputStream for FileStream {
    async fn push(&self, records: Vec<Value>, _partition_key: Option<&str>) -> Result<(), PushError> {
        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_stream_keeps_partition_key() {
        let stream = MemoryStream::new();
        stream.push(vec![json!({"a": 1}), json!({"a": 2})], Some("k1")).await.unwrap();
        let records = stream.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.partition_key.as_deref() == Some("k1")));
    }

    #[tokio::test]
    async fn memory_stream_can_fail() {
        let stream = MemoryStream::new();
        stream.set_failing(true);
        assert!(stream.push(vec![json!({})], None).await.is_err());
        assert!(stream.is_empty());
    }

    #[tokio::test]
    async fn file_stream_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let stream = FileStream::open(&path).await.unwrap();
        stream.push(vec![json!({"op": "infer"})], None).await.unwrap();
        stream.push(vec![json!({"op": "explain"})], None).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines, vec![json!({"op": "infer"}), json!({"op": "explain"})]);
    }
}
