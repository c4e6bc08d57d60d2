//! Provis core types shared across the workspace.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Toleration};
use serde::{Deserialize, Serialize};

/// Namespace/name pair identifying a namespaced object.
///
/// Doubles as the reconcile request key and the projection key: both sides
/// address a DaemonSet the same way, so there is one type for both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The slice of a DaemonSet record the provisioning projection cares about.
#[derive(Debug, Clone)]
pub struct DaemonSetDescriptor {
    pub key: ObjectKey,
    /// Spec generation as reported by the API server; non-decreasing per key.
    pub generation: i64,
    /// Pod template carried whole; consumers pull resource requests, node
    /// selectors, tolerations and affinity out of it when simulating placement.
    pub pod_template: PodTemplateSpec,
    /// Wall-clock stamp of the last successful upsert, for staleness diagnostics.
    pub updated_at: DateTime<Utc>,
}

impl DaemonSetDescriptor {
    /// Node selector from the pod template, if any.
    pub fn node_selector(&self) -> Option<&BTreeMap<String, String>> {
        self.pod_template
            .spec
            .as_ref()
            .and_then(|s| s.node_selector.as_ref())
    }

    /// Tolerations from the pod template.
    pub fn tolerations(&self) -> &[Toleration] {
        self.pod_template
            .spec
            .as_ref()
            .and_then(|s| s.tolerations.as_deref())
            .unwrap_or(&[])
    }
}
