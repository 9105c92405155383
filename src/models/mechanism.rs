//! Execution mechanisms a model can be dispatched under.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Concurrency strategy used to invoke a model's predict call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMechanism {
    /// Inline in the caller's task; blocks the traversal thread.
    #[default]
    Naive,
    /// Shared bounded pool of OS threads.
    ThreadPool,
    /// Shared bounded pool of worker subprocesses.
    ProcessPool,
    /// One persistent subprocess owned by the model.
    DedicatedProcess,
    /// `predict_async` awaited on the scheduler runtime.
    Asyncio,
}

impl ExecutionMechanism {
    pub const ALL: [ExecutionMechanism; 5] = [
        Self::Naive,
        Self::ThreadPool,
        Self::ProcessPool,
        Self::DedicatedProcess,
        Self::Asyncio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::ThreadPool => "thread_pool",
            Self::ProcessPool => "process_pool",
            Self::DedicatedProcess => "dedicated_process",
            Self::Asyncio => "asyncio",
        }
    }

    /// Mechanisms whose calls cross a process boundary.
    pub fn is_out_of_process(&self) -> bool {
        matches!(self, Self::ProcessPool | Self::DedicatedProcess)
    }
}

impl fmt::Display for ExecutionMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown execution mechanism: {0}")]
pub struct UnknownMechanism(pub String);

impl FromStr for ExecutionMechanism {
    type Err = UnknownMechanism;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMechanism(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrips_names() {
        for mechanism in ExecutionMechanism::ALL {
            assert_eq!(mechanism.as_str().parse::<ExecutionMechanism>().unwrap(), mechanism);
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = "fork".parse::<ExecutionMechanism>().unwrap_err();
        assert!(err.to_string().contains("fork"));
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ExecutionMechanism::DedicatedProcess).unwrap();
        assert_eq!(json, "\"dedicated_process\"");
    }

    #[test]
    fn out_of_process_classification() {
        assert!(ExecutionMechanism::ProcessPool.is_out_of_process());
        assert!(ExecutionMechanism::DedicatedProcess.is_out_of_process());
        assert!(!ExecutionMechanism::ThreadPool.is_out_of_process());
    }
}
