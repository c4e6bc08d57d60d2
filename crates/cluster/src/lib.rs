//! Provis cluster projection: the in-memory DaemonSet model that
//! node-provisioning logic reads when accounting for per-node overhead.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::DaemonSet;
use metrics::gauge;
use provis_core::{DaemonSetDescriptor, ObjectKey};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Write seam between reconcilers and cluster state.
///
/// Upsert may fail and the caller retries via requeue; forget is infallible
/// and idempotent. Implementations guarantee per-key write atomicity: a
/// failed upsert leaves the prior descriptor (or absence) intact.
#[async_trait::async_trait]
pub trait Projection: Send + Sync {
    /// Install or replace the descriptor for this daemonset.
    async fn upsert_daemonset(
        &self,
        ctx: &CancellationToken,
        ds: &DaemonSet,
    ) -> Result<(), ClusterError>;

    /// Drop the descriptor for `key`. A no-op when already absent.
    fn forget_daemonset(&self, key: &ObjectKey);
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("daemonset is missing namespace or name metadata")]
    MissingKey,
    #[error("daemonset {0} has no pod template")]
    MissingPodTemplate(ObjectKey),
    #[error("cancelled")]
    Cancelled,
}

/// Read-side view, republished after every mutation. Sorted by key.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub epoch: u64,
    pub daemonsets: Vec<DaemonSetDescriptor>,
}

/// In-memory cluster state.
///
/// Writers go through the keyed map under the lock; readers take the swapped
/// snapshot and never contend with reconciles.
pub struct Cluster {
    daemonsets: RwLock<FxHashMap<ObjectKey, DaemonSetDescriptor>>,
    snap: ArcSwap<ClusterSnapshot>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            daemonsets: RwLock::new(FxHashMap::default()),
            snap: ArcSwap::from_pointee(ClusterSnapshot::default()),
        }
    }

    /// Current lock-free snapshot for downstream consumers.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.snap.load_full()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<DaemonSetDescriptor> {
        self.daemonsets
            .read()
            .expect("daemonset map lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.daemonsets
            .read()
            .expect("daemonset map lock poisoned")
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.daemonsets
            .read()
            .expect("daemonset map lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Caller holds the write lock, so publishers are serialized.
    fn publish(&self, map: &FxHashMap<ObjectKey, DaemonSetDescriptor>) {
        let mut daemonsets: Vec<DaemonSetDescriptor> = map.values().cloned().collect();
        daemonsets.sort_by(|a, b| a.key.cmp(&b.key));
        gauge!("cluster_daemonsets", daemonsets.len() as f64);
        let epoch = self.snap.load().epoch + 1;
        self.snap.store(Arc::new(ClusterSnapshot { epoch, daemonsets }));
    }
}

fn descriptor_from(ds: &DaemonSet, now: DateTime<Utc>) -> Result<DaemonSetDescriptor, ClusterError> {
    let namespace = ds.metadata.namespace.clone().ok_or(ClusterError::MissingKey)?;
    let name = ds.metadata.name.clone().ok_or(ClusterError::MissingKey)?;
    let key = ObjectKey::new(namespace, name);
    let spec = ds
        .spec
        .as_ref()
        .ok_or_else(|| ClusterError::MissingPodTemplate(key.clone()))?;
    Ok(DaemonSetDescriptor {
        key,
        generation: ds.metadata.generation.unwrap_or(0),
        pod_template: spec.template.clone(),
        updated_at: now,
    })
}

#[async_trait::async_trait]
impl Projection for Cluster {
    async fn upsert_daemonset(
        &self,
        ctx: &CancellationToken,
        ds: &DaemonSet,
    ) -> Result<(), ClusterError> {
        if ctx.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }
        // Validate and build the descriptor before touching the map; the
        // insert below is the only mutation, so upsert is all-or-nothing.
        let desc = descriptor_from(ds, Utc::now())?;
        let key = desc.key.clone();
        let generation = desc.generation;
        {
            let mut map = self.daemonsets.write().expect("daemonset map lock poisoned");
            map.insert(key.clone(), desc);
            self.publish(&map);
        }
        debug!(key = %key, generation, "daemonset upserted");
        Ok(())
    }

    fn forget_daemonset(&self, key: &ObjectKey) {
        let mut map = self.daemonsets.write().expect("daemonset map lock poisoned");
        if map.remove(key).is_some() {
            self.publish(&map);
            debug!(key = %key, "daemonset forgotten");
        }
    }
}
