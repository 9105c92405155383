//! Admission gate and drain tracking for graph servers.
//!
//! Each admitted event holds an [`InFlight`] token for its traversal. Each
//! branch spawned behind a queue step holds one more, taken on behalf of the
//! event that reached the queue. Draining closes admission and waits until
//! both counts reach zero.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Outstanding work at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Load {
    /// Traversals whose caller may still be waiting.
    pub events: u32,
    /// Background branches spawned after a queue step.
    pub branches: u32,
}

impl Load {
    pub fn total(&self) -> u32 {
        self.events + self.branches
    }

    pub fn is_idle(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    /// The deadline passed with this work still running.
    Timeout(Load),
}

#[derive(Debug, Clone, Copy)]
enum Work {
    Event,
    Branch,
}

pub struct ShutdownCoordinator {
    state: watch::Sender<ShutdownState>,
    load: Arc<watch::Sender<Load>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ShutdownState::Running),
            load: Arc::new(watch::Sender::new(Load::default())),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Admit a new event. `None` once draining has started.
    pub fn admit(&self) -> Option<InFlight> {
        self.is_accepting().then(|| self.enter(Work::Event))
    }

    /// Track a branch of an already admitted event.
    ///
    /// Never refused: queue branches of admitted events still run while the
    /// server drains.
    pub fn track_branch(&self) -> InFlight {
        self.enter(Work::Branch)
    }

    fn enter(&self, work: Work) -> InFlight {
        self.load.send_modify(|load| match work {
            Work::Event => load.events += 1,
            Work::Branch => load.branches += 1,
        });
        InFlight {
            load: self.load.clone(),
            work,
        }
    }

    pub fn in_flight(&self) -> Load {
        *self.load.borrow()
    }

    /// Wait for outstanding work without closing admission.
    pub async fn wait_idle(&self, timeout: Duration) -> ShutdownResult {
        let mut load = self.load.subscribe();
        let idle = async move { load.wait_for(Load::is_idle).await.map(|_| ()) };
        match tokio::time::timeout(timeout, idle).await {
            Ok(_) => ShutdownResult::Complete,
            Err(_) => ShutdownResult::Timeout(self.in_flight()),
        }
    }

    /// Close admission, wait up to `timeout` for outstanding work, then stop.
    pub async fn drain(&self, timeout: Duration) -> ShutdownResult {
        self.state.send_replace(ShutdownState::Draining);
        let result = self.wait_idle(timeout).await;
        self.state.send_replace(ShutdownState::Stopped);
        tracing::debug!(?result, "shutdown drain finished");
        result
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Token for one unit of outstanding work; released on drop.
pub struct InFlight {
    load: Arc<watch::Sender<Load>>,
    work: Work,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let work = self.work;
        self.load.send_modify(|load| match work {
            Work::Event => load.events = load.events.saturating_sub(1),
            Work::Branch => load.branches = load.branches.saturating_sub(1),
        });
    }
}
