//! Provis kube integration: authoritative-store client and the DaemonSet
//! watch event source.

#![forbid(unsafe_code)]

use anyhow::Result;
use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use provis_core::ObjectKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Authoritative lookup against the object store.
///
/// Absence is reported distinctly from other failures; reconcilers rely on
/// that distinction to drive deletion versus backoff-retry.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, ctx: &CancellationToken, key: &ObjectKey) -> Result<DaemonSet, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("daemonset {0} not found")]
    NotFound(ObjectKey),
    #[error("lookup cancelled")]
    Cancelled,
    #[error(transparent)]
    Api(#[from] kube::Error),
}

impl StoreError {
    /// Definitive absence, as opposed to a transient lookup failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

// Classify on the API status code, never on message text.
fn classify(key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key.clone()),
        other => StoreError::Api(other),
    }
}

/// Store client backed by the Kubernetes API server.
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, ctx: &CancellationToken, key: &ObjectKey) -> Result<DaemonSet, StoreError> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &key.namespace);
        // Biased toward cancellation so an already-cancelled ctx never
        // issues the request.
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(StoreError::Cancelled),
            res = api.get(&key.name) => res.map_err(|e| classify(key, e)),
        }
    }
}

const SOURCE_QUEUE_CAP: usize = 1024;

/// Spawn a cluster-wide DaemonSet watch and return the request stream.
///
/// Every Applied/Deleted/Restarted event is forwarded unfiltered as an
/// `ObjectKey`; the reconciler decides whether anything changes.
pub fn spawn_daemonset_source(
    client: Client,
    token: CancellationToken,
) -> mpsc::Receiver<ObjectKey> {
    let (tx, rx) = mpsc::channel(SOURCE_QUEUE_CAP);
    tokio::spawn(async move {
        if let Err(e) = run_daemonset_watch(client, tx, token).await {
            warn!(error = %e, "daemonset watch failed");
        }
    });
    rx
}

async fn run_daemonset_watch(
    client: Client,
    tx: mpsc::Sender<ObjectKey>,
    token: CancellationToken,
) -> Result<()> {
    let api: Api<DaemonSet> = Api::all(client);
    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!("daemonset watch started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("daemonset watch stopping");
                return Ok(());
            }
            ev = stream.try_next() => match ev? {
                Some(Event::Applied(ds)) => forward(&tx, &ds, "applied").await,
                Some(Event::Deleted(ds)) => forward(&tx, &ds, "deleted").await,
                Some(Event::Restarted(list)) => {
                    debug!(count = list.len(), "watch restart");
                    for ds in list.iter() {
                        forward(&tx, ds, "restarted").await;
                    }
                }
                None => {
                    warn!("daemonset watch stream ended");
                    return Ok(());
                }
            }
        }
    }
}

async fn forward(tx: &mpsc::Sender<ObjectKey>, ds: &DaemonSet, kind: &'static str) {
    let (Some(ns), Some(name)) = (ds.metadata.namespace.as_deref(), ds.metadata.name.as_deref())
    else {
        warn!("daemonset event missing namespace or name; skipped");
        return;
    };
    counter!("watch_events_total", 1u64, "kind" => kind);
    let _ = tx.send(ObjectKey::new(ns, name)).await;
}
