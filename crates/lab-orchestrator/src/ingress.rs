//! Optional HTTP routes in front of exposed components.

use crate::cluster::{create_or_patch, ClusterClient};
use crate::config::IngressConfig;
use crate::error::Result;
use crate::naming::ResourceNaming;
use crate::provision::WorkloadType;
use k8s_openapi::api::networking::v1::Ingress;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const MAX_HOST_LABEL_LENGTH: usize = 63;

/// Where a route sends traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget<'a> {
    pub name: &'a str,
    pub host: &'a str,
    pub service: &'a str,
    pub port: i32,
    pub class_name: Option<&'a str>,
}

pub struct IngressAttacher<C> {
    cluster: Arc<C>,
    config: IngressConfig,
}

impl<C: ClusterClient> IngressAttacher<C> {
    pub fn new(cluster: Arc<C>, config: IngressConfig) -> Self {
        Self { cluster, config }
    }

    /// Enabled flag, then the deny list, then the allow list (empty allows all).
    #[must_use]
    pub fn should_attach(&self, workload_type: WorkloadType) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self.config.deny.contains(&workload_type) {
            return false;
        }
        self.config.allow.is_empty() || self.config.allow.contains(&workload_type)
    }

    /// `<slug(base[-component]-user)>.<baseDomain>`. The user suffix keeps hosts
    /// of different users apart.
    #[must_use]
    pub fn host_for(&self, base: &str, user_id: &str, component: Option<&str>) -> String {
        host_for(&self.config.base_domain, base, user_id, component)
    }

    pub fn build(&self, target: &RouteTarget<'_>, labels: &BTreeMap<String, String>) -> Result<Ingress> {
        let mut spec = json!({
            "rules": [{
                "host": target.host,
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {
                            "service": {
                                "name": target.service,
                                "port": { "number": target.port }
                            }
                        }
                    }]
                }
            }]
        });
        if let Some(class) = target.class_name {
            spec["ingressClassName"] = json!(class);
        }
        if let Some(secret) = &self.config.tls_secret_name {
            spec["tls"] = json!([{ "hosts": [target.host], "secretName": secret }]);
        }

        Ok(serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {
                "name": target.name,
                "labels": labels
            },
            "spec": spec
        }))?)
    }

    /// Create the route, or update labels and spec of the one already there.
    #[instrument(skip(self, ingress), fields(namespace = %namespace))]
    pub async fn apply(&self, namespace: &str, ingress: &Ingress) -> Result<(Ingress, bool)> {
        let on_conflict = json!({
            "metadata": { "labels": ingress.metadata.labels.clone().unwrap_or_default() },
            "spec": ingress.spec,
        });
        let applied = create_or_patch(self.cluster.as_ref(), namespace, ingress, &on_conflict).await?;
        let name = ingress.metadata.name.as_deref().unwrap_or_default();
        if applied.created {
            info!(ingress = %name, "Created ingress");
        } else {
            debug!(ingress = %name, "Updated existing ingress");
        }
        Ok((applied.object, applied.created))
    }
}

/// Hostname for a route under `base_domain`.
#[must_use]
pub fn host_for(base_domain: &str, base: &str, user_id: &str, component: Option<&str>) -> String {
    let suffix = ResourceNaming::user_suffix(user_id);
    let raw = match component {
        Some(component) => format!("{base}-{component}-{suffix}"),
        None => format!("{base}-{suffix}"),
    };
    let label = ResourceNaming::slugify(&raw, MAX_HOST_LABEL_LENGTH);
    format!("{label}.{base_domain}")
}
