//! Cluster API seam.
//!
//! Everything the orchestrator does against the control plane goes through
//! [`ClusterClient`]. [`KubeCluster`] talks to a real API server through `kube`;
//! [`InMemoryCluster`] keeps objects in memory with the same conflict, selector and
//! merge-patch semantics.

pub mod kubernetes;
pub mod memory;

pub use self::kubernetes::KubeCluster;
pub use self::memory::{InMemoryCluster, Verb};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::networking::v1::IngressClass;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by the cluster seam, classified by API status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("API error: {status} {reason} - {message}")]
    Api {
        status: u16,
        reason: String,
        message: String,
    },

    #[error("Control plane unreachable: {0}")]
    Unavailable(String),

    #[error("Malformed object: {0}")]
    Decode(String),
}

impl ClusterError {
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Conflict(_) => 409,
            Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            Self::Invalid(_) => 422,
            Self::Api { status, .. } => *status,
            Self::Unavailable(_) => 503,
            Self::Decode(_) => 500,
        }
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Conflict(_) => "AlreadyExists",
            Self::NotFound(_) => "NotFound",
            Self::Forbidden(_) => "Forbidden",
            Self::Invalid(_) => "Invalid",
            Self::Api { reason, .. } => reason,
            Self::Unavailable(_) => "ServiceUnavailable",
            Self::Decode(_) => "Decode",
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Conflict(m)
            | Self::NotFound(m)
            | Self::Forbidden(m)
            | Self::Invalid(m)
            | Self::Unavailable(m)
            | Self::Decode(m) => m,
            Self::Api { message, .. } => message,
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Namespaced object types the orchestrator reads and writes.
pub trait ClusterObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Minimal control-plane surface used by the orchestrator.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<K, ClusterError>;

    /// List objects, optionally filtered by a label selector (`k=v,k2!=v2,k3`).
    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<K>, ClusterError>;

    async fn create<K: ClusterObject>(&self, namespace: &str, object: &K)
        -> Result<K, ClusterError>;

    /// JSON merge patch (RFC 7386): `null` removes a key.
    async fn patch<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, ClusterError>;

    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str)
        -> Result<(), ClusterError>;

    async fn list_namespaces(&self, selector: Option<&str>)
        -> Result<Vec<Namespace>, ClusterError>;

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError>;

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>, ClusterError>;

    async fn list_ingress_classes(&self) -> Result<Vec<IngressClass>, ClusterError>;
}

/// Outcome of an idempotent create.
#[derive(Debug, Clone)]
pub struct Applied<K> {
    pub object: K,
    pub created: bool,
}

/// Create `object`; if it already exists, apply `on_conflict` as a merge patch and
/// reuse the existing object instead of failing.
pub async fn create_or_patch<C, K>(
    cluster: &C,
    namespace: &str,
    object: &K,
    on_conflict: &Value,
) -> Result<Applied<K>, ClusterError>
where
    C: ClusterClient,
    K: ClusterObject,
{
    match cluster.create(namespace, object).await {
        Ok(created) => Ok(Applied {
            object: created,
            created: true,
        }),
        Err(ClusterError::Conflict(_)) => {
            let name = object.meta().name.clone().unwrap_or_default();
            debug!(
                kind = %K::kind(&()),
                namespace = %namespace,
                name = %name,
                "Object exists, patching instead of creating"
            );
            let patched = cluster.patch::<K>(namespace, &name, on_conflict).await?;
            Ok(Applied {
                object: patched,
                created: false,
            })
        }
        Err(e) => Err(e),
    }
}

/// Merge patch that only touches `metadata.labels`.
#[must_use]
pub fn labels_patch<K: ClusterObject>(object: &K) -> Value {
    json!({ "metadata": { "labels": object.meta().labels.clone().unwrap_or_default() } })
}

/// `Kind/name` reference used in operation reports.
#[must_use]
pub fn object_key<K: ClusterObject>(name: &str) -> String {
    format!("{}/{}", K::kind(&()), name)
}
