//! Name → workloads resolution with ownership enforcement.

use crate::cluster::{ClusterClient, ClusterError};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::labels::{self, ObjectRef, LABEL_APP, LABEL_STACK_NAME, LABEL_USER_ID};
use crate::naming::ResourceNaming;
use crate::provision::WorkloadType;
use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Workloads a name resolved to, all owned by the caller.
#[derive(Debug, Clone)]
pub struct ResolvedStack {
    pub namespace: String,
    pub workloads: Vec<ResolvedWorkload>,
    pub stack_name: Option<String>,
    pub display_name: String,
    pub app_type: Option<WorkloadType>,
}

#[derive(Debug, Clone)]
pub struct ResolvedWorkload {
    pub deployment: Deployment,
    pub object: ObjectRef,
}

impl ResolvedStack {
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.workloads.iter().map(|w| w.object.name.clone()).collect()
    }

    #[must_use]
    pub fn is_stack(&self) -> bool {
        self.stack_name.is_some()
    }
}

/// Resolves a user-facing name to one workload or a whole stack.
pub struct StackResolver<C> {
    cluster: Arc<C>,
    config: Arc<OrchestratorConfig>,
}

impl<C: ClusterClient> StackResolver<C> {
    pub fn new(cluster: Arc<C>, config: Arc<OrchestratorConfig>) -> Self {
        Self { cluster, config }
    }

    /// A non-privileged caller may only address their own namespace.
    pub fn ensure_namespace_access(&self, user: &UserIdentity, namespace: &str) -> Result<()> {
        if user.is_privileged() {
            return Ok(());
        }
        let own = self.config.namespace_for(&user.user_id);
        if namespace == own {
            Ok(())
        } else {
            warn!(
                user_id = %user.user_id,
                namespace = %namespace,
                "Denied access to foreign namespace"
            );
            Err(Error::Permission(format!(
                "user '{}' may not access namespace '{namespace}'",
                user.username
            )))
        }
    }

    /// Exact deployment name first, expanded to its stack; then `stack-name`; then
    /// `app`.
    #[instrument(skip(self, user), fields(namespace = %namespace, name = %name, user_id = %user.user_id))]
    pub async fn resolve(
        &self,
        namespace: &str,
        name: &str,
        user: &UserIdentity,
    ) -> Result<ResolvedStack> {
        self.ensure_namespace_access(user, namespace)?;

        let mut deployments = self.lookup(namespace, name, user).await?;
        if deployments.is_empty() {
            return Err(Error::NotFound(format!(
                "no application named '{name}' in namespace '{namespace}'"
            )));
        }
        deployments.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let managed_by = &self.config.managed_by;
        let workloads: Vec<ResolvedWorkload> = deployments
            .into_iter()
            .map(|deployment| {
                let object = ObjectRef::from_meta(&deployment.metadata, managed_by);
                ResolvedWorkload { deployment, object }
            })
            .collect();

        if !user.is_privileged() {
            if let Some(foreign) = workloads
                .iter()
                .find(|w| !w.object.managed || !w.object.is_owned_by(user))
            {
                warn!(
                    workload = %foreign.object.name,
                    owner = ?foreign.object.owner,
                    "Ownership check failed"
                );
                return Err(Error::Permission(format!(
                    "'{}' is not owned by '{}'",
                    foreign.object.name, user.username
                )));
            }
        }

        let stack_name = workloads
            .iter()
            .find_map(|w| w.object.stack_name.clone());
        let app_type = workloads.iter().find_map(|w| w.object.app_type);
        let display_name = stack_name.clone().unwrap_or_else(|| name.to_string());
        debug!(workloads = workloads.len(), stack = ?stack_name, "Resolved application");

        Ok(ResolvedStack {
            namespace: namespace.to_string(),
            workloads,
            stack_name,
            display_name,
            app_type,
        })
    }

    async fn lookup(
        &self,
        namespace: &str,
        name: &str,
        user: &UserIdentity,
    ) -> Result<Vec<Deployment>> {
        match self.cluster.get::<Deployment>(namespace, name).await {
            Ok(exact) => {
                let object = ObjectRef::from_meta(&exact.metadata, &self.config.managed_by);
                let Some(stack) = object.stack_name else {
                    return Ok(vec![exact]);
                };
                let user_id = ResourceNaming::label_value(&user.user_id);
                let mut selector = vec![(LABEL_STACK_NAME, stack.as_str())];
                if !user.is_privileged() {
                    selector.push((LABEL_USER_ID, user_id.as_str()));
                }
                let mut siblings: Vec<Deployment> = self
                    .cluster
                    .list(namespace, Some(&labels::selector(&selector)))
                    .await?;
                // The exact match may belong to someone else; keep it so the
                // ownership check sees it.
                if !siblings.iter().any(|d| d.metadata.name == exact.metadata.name) {
                    siblings.push(exact);
                }
                return Ok(siblings);
            }
            Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let by_stack: Vec<Deployment> = self
            .cluster
            .list(namespace, Some(&labels::selector(&[(LABEL_STACK_NAME, name)])))
            .await?;
        if !by_stack.is_empty() {
            return Ok(by_stack);
        }

        Ok(self
            .cluster
            .list(namespace, Some(&labels::selector(&[(LABEL_APP, name)])))
            .await?)
    }
}
