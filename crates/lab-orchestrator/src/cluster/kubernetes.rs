//! [`ClusterClient`] backed by a live API server.

use super::{ClusterClient, ClusterError, ClusterObject};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::networking::v1::IngressClass;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Error as KubeError};
use serde_json::Value;
use tracing::{debug, instrument};

impl From<KubeError> for ClusterError {
    fn from(err: KubeError) -> Self {
        match err {
            KubeError::Api(ae) => match ae.code {
                409 => Self::Conflict(ae.message),
                404 => Self::NotFound(ae.message),
                403 => Self::Forbidden(ae.message),
                422 => Self::Invalid(ae.message),
                503 => Self::Unavailable(ae.message),
                code => Self::Api {
                    status: code,
                    reason: ae.reason,
                    message: ae.message,
                },
            },
            KubeError::SerdeError(e) => Self::Decode(e.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Cluster client over a `kube::Client`.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: "lab-orchestrator".to_string(),
        }
    }

    /// Build from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn namespaced<K: ClusterObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn list_params(selector: Option<&str>) -> ListParams {
        match selector {
            Some(selector) if !selector.is_empty() => ListParams::default().labels(selector),
            _ => ListParams::default(),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<K, ClusterError> {
        Ok(self.namespaced::<K>(namespace).get(name).await?)
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<K>, ClusterError> {
        let list = self
            .namespaced::<K>(namespace)
            .list(&Self::list_params(selector))
            .await?;
        Ok(list.items)
    }

    #[instrument(skip(self, object), fields(kind = %K::kind(&())))]
    async fn create<K: ClusterObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..PostParams::default()
        };
        Ok(self.namespaced::<K>(namespace).create(&params, object).await?)
    }

    #[instrument(skip(self, patch), fields(kind = %K::kind(&())))]
    async fn patch<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, ClusterError> {
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..PatchParams::default()
        };
        Ok(self
            .namespaced::<K>(namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await?)
    }

    #[instrument(skip(self), fields(kind = %K::kind(&())))]
    async fn delete<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.namespaced::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        debug!(namespace = %namespace, name = %name, "Delete accepted");
        Ok(())
    }

    async fn list_namespaces(
        &self,
        selector: Option<&str>,
    ) -> Result<Vec<Namespace>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&Self::list_params(selector)).await?.items)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), namespace).await?)
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>, ClusterError> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_ingress_classes(&self) -> Result<Vec<IngressClass>, ClusterError> {
        let api: Api<IngressClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}
