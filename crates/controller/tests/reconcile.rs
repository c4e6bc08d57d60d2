#![forbid(unsafe_code)]

//! End-to-end reconcile behavior of the daemonset state controller against
//! an in-memory store and the real cluster projection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use provis_cluster::{Cluster, ClusterError, Projection};
use provis_controller::{Controller, DaemonSetController, Outcome, RESYNC_PERIOD};
use provis_core::ObjectKey;
use provis_kubehub::{ObjectStore, StoreError};
use tokio_util::sync::CancellationToken;

fn daemonset(ns: &str, name: &str, generation: i64) -> DaemonSet {
    DaemonSet {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            generation: Some(generation),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            template: PodTemplateSpec::default(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn server_error() -> StoreError {
    StoreError::Api(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "service unavailable".to_string(),
        reason: String::new(),
        code: 503,
    }))
}

/// In-memory authoritative store with a reachability switch.
#[derive(Default)]
struct FakeStore {
    objects: Mutex<HashMap<ObjectKey, DaemonSet>>,
    unreachable: AtomicBool,
}

impl FakeStore {
    fn put(&self, ds: DaemonSet) {
        let key = ObjectKey::new(
            ds.metadata.namespace.clone().unwrap(),
            ds.metadata.name.clone().unwrap(),
        );
        self.objects.lock().unwrap().insert(key, ds);
    }

    fn remove(&self, key: &ObjectKey) {
        self.objects.lock().unwrap().remove(key);
    }

    fn set_unreachable(&self, v: bool) {
        self.unreachable.store(v, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ObjectStore for FakeStore {
    async fn get(&self, ctx: &CancellationToken, key: &ObjectKey) -> Result<DaemonSet, StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(server_error());
        }
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }
}

/// Projection wrapper counting calls and optionally failing the next upsert.
struct Recording {
    inner: Cluster,
    upserts: AtomicUsize,
    forgets: AtomicUsize,
    fail_next_upsert: AtomicBool,
}

impl Recording {
    fn new() -> Self {
        Self {
            inner: Cluster::new(),
            upserts: AtomicUsize::new(0),
            forgets: AtomicUsize::new(0),
            fail_next_upsert: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl Projection for Recording {
    async fn upsert_daemonset(
        &self,
        ctx: &CancellationToken,
        ds: &DaemonSet,
    ) -> Result<(), ClusterError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_upsert.swap(false, Ordering::SeqCst) {
            return Err(ClusterError::Cancelled);
        }
        self.inner.upsert_daemonset(ctx, ds).await
    }

    fn forget_daemonset(&self, key: &ObjectKey) {
        self.forgets.fetch_add(1, Ordering::SeqCst);
        self.inner.forget_daemonset(key);
    }
}

fn controller(store: Arc<FakeStore>, projection: Arc<Recording>) -> DaemonSetController {
    DaemonSetController::new(store, projection)
}

#[tokio::test]
async fn found_daemonset_is_upserted_and_requeued() {
    let store = Arc::new(FakeStore::default());
    let projection = Arc::new(Recording::new());
    store.put(daemonset("kube-system", "fluentd", 1));
    let ctrl = controller(store, projection.clone());

    let key = ObjectKey::new("kube-system", "fluentd");
    let outcome = ctrl
        .reconcile(&CancellationToken::new(), key.clone())
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::requeue(RESYNC_PERIOD));
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(60)));
    assert_eq!(projection.upserts.load(Ordering::SeqCst), 1);
    assert!(projection.inner.contains(&key));
}

#[tokio::test]
async fn absent_daemonset_is_forgotten_without_error() {
    let store = Arc::new(FakeStore::default());
    let projection = Arc::new(Recording::new());
    let key = ObjectKey::new("ns-a", "x");

    // Seed the projection, then delete from the store.
    store.put(daemonset("ns-a", "x", 1));
    let ctrl = controller(store.clone(), projection.clone());
    ctrl.reconcile(&CancellationToken::new(), key.clone())
        .await
        .unwrap();
    assert!(projection.inner.contains(&key));
    store.remove(&key);

    let outcome = ctrl
        .reconcile(&CancellationToken::new(), key.clone())
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::requeue(RESYNC_PERIOD));
    assert_eq!(projection.forgets.load(Ordering::SeqCst), 1);
    assert!(!projection.inner.contains(&key));
}

#[tokio::test]
async fn unreachable_store_leaves_projection_untouched() {
    let store = Arc::new(FakeStore::default());
    let projection = Arc::new(Recording::new());
    store.set_unreachable(true);
    let ctrl = controller(store, projection.clone());

    let err = ctrl
        .reconcile(&CancellationToken::new(), ObjectKey::new("ns", "y"))
        .await
        .unwrap_err();

    let store_err = err.downcast_ref::<StoreError>().expect("store error surfaces whole");
    assert!(!store_err.is_not_found());
    assert_eq!(projection.upserts.load(Ordering::SeqCst), 0);
    assert_eq!(projection.forgets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_upsert_is_retried_wholesale() {
    let store = Arc::new(FakeStore::default());
    let projection = Arc::new(Recording::new());
    store.put(daemonset("ns", "z", 1));
    projection.fail_next_upsert.store(true, Ordering::SeqCst);
    let ctrl = controller(store, projection.clone());
    let key = ObjectKey::new("ns", "z");

    ctrl.reconcile(&CancellationToken::new(), key.clone())
        .await
        .unwrap_err();
    assert!(!projection.inner.contains(&key));

    // Retry re-reads and re-upserts; nothing partial was published.
    let outcome = ctrl
        .reconcile(&CancellationToken::new(), key.clone())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::requeue(RESYNC_PERIOD));
    assert_eq!(projection.upserts.load(Ordering::SeqCst), 2);
    assert!(projection.inner.contains(&key));
}

#[tokio::test]
async fn precancelled_ctx_is_a_transient_error() {
    let store = Arc::new(FakeStore::default());
    let projection = Arc::new(Recording::new());
    store.put(daemonset("ns", "q", 1));
    let ctrl = controller(store, projection.clone());

    let ctx = CancellationToken::new();
    ctx.cancel();
    let err = ctrl
        .reconcile(&ctx, ObjectKey::new("ns", "q"))
        .await
        .unwrap_err();

    assert!(err.downcast_ref::<StoreError>().is_some());
    assert_eq!(projection.upserts.load(Ordering::SeqCst), 0);
    assert_eq!(projection.forgets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn distinct_keys_reconcile_independently() {
    let store = Arc::new(FakeStore::default());
    let projection = Arc::new(Recording::new());
    store.put(daemonset("ns-1", "a", 1));
    store.put(daemonset("ns-2", "b", 1));
    let ctrl = Arc::new(controller(store, projection.clone()));

    let ctx = CancellationToken::new();
    let (ra, rb) = tokio::join!(
        ctrl.reconcile(&ctx, ObjectKey::new("ns-1", "a")),
        ctrl.reconcile(&ctx, ObjectKey::new("ns-2", "b")),
    );

    assert_eq!(ra.unwrap(), Outcome::requeue(RESYNC_PERIOD));
    assert_eq!(rb.unwrap(), Outcome::requeue(RESYNC_PERIOD));
    assert!(projection.inner.contains(&ObjectKey::new("ns-1", "a")));
    assert!(projection.inner.contains(&ObjectKey::new("ns-2", "b")));
}

#[tokio::test]
async fn repeated_reconcile_is_idempotent() {
    let store = Arc::new(FakeStore::default());
    let projection = Arc::new(Recording::new());
    store.put(daemonset("kube-system", "fluentd", 7));
    let ctrl = controller(store, projection.clone());
    let key = ObjectKey::new("kube-system", "fluentd");

    for _ in 0..3 {
        ctrl.reconcile(&CancellationToken::new(), key.clone())
            .await
            .unwrap();
    }

    assert_eq!(projection.inner.len(), 1);
    assert_eq!(projection.inner.get(&key).unwrap().generation, 7);
}
