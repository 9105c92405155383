//! Load state of a model-serving unit and the per-event readiness check.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::error::ServingError;
use crate::event::TriggerKind;

/// Where a server is in its load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum LoadState {
    Loading,
    Ready,
    /// Terminal. Carries the load error.
    Failed(String),
}

/// How `ModelServer::post_init` runs the load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    #[default]
    Sync,
    Async,
}

/// Poll schedule for non-synchronous triggers waiting on a load.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 50,
        }
    }
}

/// Load state shared between the loader and the event path.
#[derive(Debug)]
pub struct ModelLifecycle {
    model: String,
    state: watch::Sender<LoadState>,
}

impl ModelLifecycle {
    pub fn new(model: impl Into<String>) -> Self {
        let (state, _) = watch::channel(LoadState::Loading);
        Self {
            model: model.into(),
            state,
        }
    }

    /// A lifecycle for a model object that needs no load.
    pub fn ready(model: impl Into<String>) -> Self {
        let lifecycle = Self::new(model);
        lifecycle.state.send_replace(LoadState::Ready);
        lifecycle
    }

    pub fn state(&self) -> LoadState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == LoadState::Ready
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    pub(crate) fn mark_ready(&self) {
        self.transition(LoadState::Ready);
    }

    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        self.transition(LoadState::Failed(reason.into()));
    }

    /// Failed is terminal.
    fn transition(&self, next: LoadState) {
        self.state.send_if_modified(|current| {
            if matches!(current, LoadState::Failed(_)) || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Gate an event on the load state.
    ///
    /// Synchronous callers fail fast while loading. Other triggers poll up
    /// to `max_attempts` times before giving up.
    pub async fn check(&self, trigger: TriggerKind, config: &ReadinessConfig) -> Result<(), ServingError> {
        match self.state() {
            LoadState::Ready => return Ok(()),
            LoadState::Failed(reason) => return Err(self.load_failed(reason)),
            LoadState::Loading if trigger.is_synchronous() => {
                return Err(ServingError::NotReady {
                    model: self.model.clone(),
                });
            }
            LoadState::Loading => {}
        }

        tracing::info!(model = %self.model, "waiting for model to load");
        let mut rx = self.subscribe();
        for attempt in 1..=config.max_attempts {
            // Woken early by a state change, otherwise re-checked every interval.
            let _ = tokio::time::timeout(config.poll_interval, rx.changed()).await;
            match self.state() {
                LoadState::Ready => return Ok(()),
                LoadState::Failed(reason) => return Err(self.load_failed(reason)),
                LoadState::Loading => {
                    tracing::debug!(model = %self.model, attempt, "model still loading");
                }
            }
        }

        Err(ServingError::ReadinessTimeout {
            model: self.model.clone(),
            attempts: config.max_attempts,
            reason: String::new(),
        })
    }

    fn load_failed(&self, reason: String) -> ServingError {
        ServingError::LoadFailed {
            model: self.model.clone(),
            reason,
        }
    }
}
