//! Per-user namespaces.

use crate::cluster::{ClusterClient, ClusterError};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::labels::{self, LABEL_MANAGED_BY, LABEL_USER_ID, LABEL_USER_ROLE};
use crate::naming::ResourceNaming;
use k8s_openapi::api::core::v1::Namespace;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct NamespaceManager<C> {
    cluster: Arc<C>,
    config: Arc<OrchestratorConfig>,
}

impl<C: ClusterClient> NamespaceManager<C> {
    pub fn new(cluster: Arc<C>, config: Arc<OrchestratorConfig>) -> Self {
        Self { cluster, config }
    }

    /// Create the user's namespace if it does not exist yet.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn ensure(&self, user: &UserIdentity) -> Result<String> {
        let name = self.config.namespace_for(&user.user_id);
        let namespace: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": name,
                "labels": {
                    LABEL_MANAGED_BY: self.config.managed_by,
                    LABEL_USER_ID: ResourceNaming::label_value(&user.user_id),
                    LABEL_USER_ROLE: user.role.as_str(),
                }
            }
        }))?;

        match self.cluster.create_namespace(&namespace).await {
            Ok(_) => {
                info!(namespace = %name, "Created user namespace");
                Ok(name)
            }
            Err(ClusterError::Conflict(_)) => {
                debug!(namespace = %name, "Namespace already exists");
                Ok(name)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Managed namespaces whose `user-id` is not among `known_user_ids`.
    #[instrument(skip(self, known_user_ids), fields(known = known_user_ids.len()))]
    pub async fn orphaned(&self, known_user_ids: &[String]) -> Result<Vec<String>> {
        let known: BTreeSet<String> = known_user_ids
            .iter()
            .map(|id| ResourceNaming::label_value(id))
            .collect();
        let selector = labels::selector(&[(LABEL_MANAGED_BY, self.config.managed_by.as_str())]);
        let namespaces = self.cluster.list_namespaces(Some(&selector)).await?;

        let mut orphans: Vec<String> = namespaces
            .iter()
            .filter_map(|ns| {
                let owner = ns.metadata.labels.as_ref()?.get(LABEL_USER_ID)?;
                if known.contains(owner) {
                    None
                } else {
                    ns.metadata.name.clone()
                }
            })
            .collect();
        orphans.sort();
        debug!(orphans = orphans.len(), "Scanned managed namespaces");
        Ok(orphans)
    }

    /// Delete a namespace this system manages, with everything in it.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let selector = labels::selector(&[(LABEL_MANAGED_BY, self.config.managed_by.as_str())]);
        let managed = self
            .cluster
            .list_namespaces(Some(&selector))
            .await?
            .iter()
            .any(|ns| ns.metadata.name.as_deref() == Some(name));
        if !managed {
            warn!(namespace = %name, "Refusing to delete unmanaged namespace");
            return Err(Error::Permission(format!(
                "namespace '{name}' is not managed by {}",
                self.config.managed_by
            )));
        }
        self.cluster.delete_namespace(name).await?;
        info!(namespace = %name, "Deleted namespace");
        Ok(())
    }
}
