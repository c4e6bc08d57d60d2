//! Provis controller runtime: the reconciler core plus the dispatcher and
//! manager that drive it.

#![forbid(unsafe_code)]

mod daemonset;
mod dispatch;
mod manager;

pub use daemonset::{DaemonSetController, RESYNC_PERIOD};
pub use dispatch::{spawn_dispatcher, Options};
pub use manager::Manager;

use std::sync::Arc;
use std::time::Duration;

use provis_core::ObjectKey;
use tokio_util::sync::CancellationToken;

/// Outcome of a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    /// Minimum delay before the dispatcher re-invokes for the same key.
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    /// Done; re-invoke after `after` even if no new event arrives.
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// Done; no self-requeue requested.
    pub fn done() -> Self {
        Self::default()
    }
}

/// Capability set a controller exposes to the manager.
#[async_trait::async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Stable identifier used for logs, metrics and queue naming.
    fn name(&self) -> &'static str;

    /// Conform dependent state to the authoritative record behind `key`.
    ///
    /// Errors are returned whole; retry policy lives in the dispatcher.
    async fn reconcile(&self, ctx: &CancellationToken, key: ObjectKey) -> anyhow::Result<Outcome>;

    /// Wire this controller's event source and options into the manager.
    fn build(self: Arc<Self>, manager: &mut Manager) -> anyhow::Result<()>;
}
