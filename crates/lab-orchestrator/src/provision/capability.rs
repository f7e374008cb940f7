//! Optional cluster features, probed before use.
//!
//! Each probe answers `Granted(details)` or `Denied(reason)`. Callers pick the
//! fallback for a denial (ephemeral storage, `NodePort` service) without looking
//! at error bodies.

use crate::cluster::{ClusterClient, ClusterError};
use crate::config::{IngressConfig, StorageConfig};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_CLASS_ANNOTATIONS: [&str; 2] = [
    "storageclass.kubernetes.io/is-default-class",
    "storageclass.beta.kubernetes.io/is-default-class",
];
const DEFAULT_INGRESS_CLASS_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Capability<T> {
    Granted(T),
    Denied { reason: String },
}

impl<T> Capability<T> {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    #[must_use]
    pub fn granted(&self) -> Option<&T> {
        match self {
            Self::Granted(details) => Some(details),
            Self::Denied { .. } => None,
        }
    }
}

/// Storage class a claim should request. `None` lets the cluster default apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageGrant {
    pub storage_class: Option<String>,
}

/// IngressClass a route should request. `None` lets the cluster default apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressGrant {
    pub class_name: Option<String>,
}

fn is_default(annotations: Option<&std::collections::BTreeMap<String, String>>, keys: &[&str]) -> bool {
    annotations.is_some_and(|a| {
        keys.iter()
            .any(|key| a.get(*key).is_some_and(|v| v.eq_ignore_ascii_case("true")))
    })
}

pub struct CapabilityProbe<C> {
    cluster: Arc<C>,
}

impl<C: ClusterClient> CapabilityProbe<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    /// Persistent storage is available when the configured class exists, or when
    /// no class is configured and the cluster marks one as default.
    pub async fn storage(&self, config: &StorageConfig) -> Capability<StorageGrant> {
        let classes = match self.cluster.list_storage_classes().await {
            Ok(classes) => classes,
            Err(ClusterError::Forbidden(_)) => {
                debug!("Cannot list StorageClasses, assuming storage is available");
                return Capability::Granted(StorageGrant {
                    storage_class: config.storage_class_name.clone(),
                });
            }
            Err(e) => {
                warn!(error = %e, "StorageClass probe failed");
                return Capability::denied(format!("storage probe failed: {e}"));
            }
        };

        if let Some(wanted) = &config.storage_class_name {
            return if classes
                .iter()
                .any(|c| c.metadata.name.as_deref() == Some(wanted.as_str()))
            {
                Capability::Granted(StorageGrant {
                    storage_class: Some(wanted.clone()),
                })
            } else {
                Capability::denied(format!("storage class '{wanted}' does not exist"))
            };
        }

        if classes
            .iter()
            .any(|c| is_default(c.metadata.annotations.as_ref(), &DEFAULT_CLASS_ANNOTATIONS))
        {
            Capability::Granted(StorageGrant {
                storage_class: None,
            })
        } else {
            Capability::denied("no default storage class")
        }
    }

    /// Routes are available when ingress is enabled and a usable IngressClass
    /// exists.
    pub async fn ingress(&self, config: &IngressConfig) -> Capability<IngressGrant> {
        if !config.enabled {
            return Capability::denied("ingress disabled");
        }
        let classes = match self.cluster.list_ingress_classes().await {
            Ok(classes) => classes,
            Err(ClusterError::Forbidden(_)) => {
                debug!("Cannot list IngressClasses, assuming ingress is available");
                return Capability::Granted(IngressGrant {
                    class_name: config.class_name.clone(),
                });
            }
            Err(e) => {
                warn!(error = %e, "IngressClass probe failed");
                return Capability::denied(format!("ingress probe failed: {e}"));
            }
        };

        if let Some(wanted) = &config.class_name {
            return if classes
                .iter()
                .any(|c| c.metadata.name.as_deref() == Some(wanted.as_str()))
            {
                Capability::Granted(IngressGrant {
                    class_name: Some(wanted.clone()),
                })
            } else {
                Capability::denied(format!("IngressClass '{wanted}' does not exist"))
            };
        }

        if classes.is_empty() {
            return Capability::denied("no IngressClass installed");
        }
        let has_default = classes.iter().any(|c| {
            is_default(
                c.metadata.annotations.as_ref(),
                &[DEFAULT_INGRESS_CLASS_ANNOTATION],
            )
        });
        // Without a default class an unclassed Ingress is ignored, so name one.
        let class_name = if has_default {
            None
        } else {
            classes.first().and_then(|c| c.metadata.name.clone())
        };
        Capability::Granted(IngressGrant { class_name })
    }
}
