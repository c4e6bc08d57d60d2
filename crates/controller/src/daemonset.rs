//! DaemonSet state controller: keeps the cluster projection in sync with the
//! API server's view of daemonsets.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use provis_cluster::Projection;
use provis_core::ObjectKey;
use provis_kubehub::{spawn_daemonset_source, KubeStore, ObjectStore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::Options;
use crate::{Controller, Manager, Outcome};

/// Re-sync cadence requested on every successful reconcile; bounds projection
/// staleness even when watch events are lost.
pub const RESYNC_PERIOD: Duration = Duration::from_secs(60);

/// Bounds cache write contention and bulk-event stampedes.
const MAX_CONCURRENT_RECONCILES: usize = 10;

pub struct DaemonSetController {
    store: Arc<dyn ObjectStore>,
    cluster: Arc<dyn Projection>,
}

impl DaemonSetController {
    pub fn new(store: Arc<dyn ObjectStore>, cluster: Arc<dyn Projection>) -> Self {
        Self { store, cluster }
    }

    /// Controller backed by the live API server.
    pub fn for_client(client: kube::Client, cluster: Arc<dyn Projection>) -> Self {
        Self::new(Arc::new(KubeStore::new(client)), cluster)
    }
}

#[async_trait::async_trait]
impl Controller for DaemonSetController {
    fn name(&self) -> &'static str {
        "state.daemonset"
    }

    async fn reconcile(&self, ctx: &CancellationToken, key: ObjectKey) -> Result<Outcome> {
        match self.store.get(ctx, &key).await {
            Ok(ds) => {
                self.cluster.upsert_daemonset(ctx, &ds).await?;
                Ok(Outcome::requeue(RESYNC_PERIOD))
            }
            Err(e) if e.is_not_found() => {
                // Definitive absence: drop it from the projection. Not an
                // error from the reconciler's perspective.
                self.cluster.forget_daemonset(&key);
                debug!(key = %key, "daemonset absent; forgotten");
                Ok(Outcome::requeue(RESYNC_PERIOD))
            }
            // Transient lookup failure (network, 5xx, cancellation): leave
            // the projection untouched and let the dispatcher back off.
            Err(e) => Err(e.into()),
        }
    }

    fn build(self: Arc<Self>, manager: &mut Manager) -> Result<()> {
        let source = spawn_daemonset_source(manager.client(), manager.shutdown_token());
        manager.register(
            self,
            source,
            Options {
                max_concurrent: MAX_CONCURRENT_RECONCILES,
                ..Default::default()
            },
        );
        Ok(())
    }
}
