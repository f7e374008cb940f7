use super::capability::{Capability, CapabilityProbe, IngressGrant};
use super::manifests::{self, DataVolume, ServiceExposure};
use super::stacks::{ComponentPlan, StackPlan};
use super::{
    ComponentInfo, ComponentKind, ComponentRole, DatabaseCredentials, ProvisionResult, ServiceInfo,
    StackCredentials, StorageMode, WorkloadType,
};
use crate::cluster::{
    create_or_patch, labels_patch, object_key, ClusterClient, ClusterError, ClusterObject,
};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result, StackOperation};
use crate::identity::UserIdentity;
use crate::ingress::{IngressAttacher, RouteTarget};
use crate::labels::{LabelSet, ObjectRef};
use crate::naming::ResourceNaming;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::Resource;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// A fully validated, clamped and quota-checked request, ready to apply.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub namespace: String,
    pub owner: UserIdentity,
    pub stack: StackPlan,
}

/// What provisioning applied, alongside the typed result.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub result: ProvisionResult,
    /// `Kind/name` of every object created or updated, in apply order.
    pub applied: Vec<String>,
}

/// Progress through one provisioning run, used to report partial stacks.
#[derive(Debug, Default)]
struct Progress {
    applied: Vec<String>,
}

impl Progress {
    fn record(&mut self, key: String) {
        self.applied.push(key);
    }

    fn fail(&self, failed: String, cause: impl Into<Error>) -> Error {
        let cause = cause.into();
        error!(object = %failed, error = %cause, "Provisioning step failed");
        Error::partial(StackOperation::Create, self.applied.clone(), failed, cause)
    }
}

/// Routing decision for the whole stack.
#[derive(Debug, Clone)]
enum Routing {
    Ingress(IngressGrant),
    NodePort { reason: String },
}

pub struct StackProvisioner<C> {
    cluster: Arc<C>,
    config: Arc<OrchestratorConfig>,
    probe: CapabilityProbe<C>,
    ingress: IngressAttacher<C>,
}

impl<C: ClusterClient> StackProvisioner<C> {
    pub fn new(cluster: Arc<C>, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            probe: CapabilityProbe::new(cluster.clone()),
            ingress: IngressAttacher::new(cluster.clone(), config.ingress.clone()),
            cluster,
            config,
        }
    }

    /// Apply secret, PVC, services, deployments and routes in that order. Existing
    /// objects are reused, so re-running a failed provision converges.
    #[instrument(skip(self, plan), fields(namespace = %plan.namespace, app = %plan.stack.name, app_type = %plan.stack.workload_type))]
    pub async fn provision(&self, plan: &ProvisionPlan) -> Result<Provisioned> {
        let stack = &plan.stack;
        let namespace = plan.namespace.as_str();
        let labels = LabelSet {
            managed_by: &self.config.managed_by,
            user: &plan.owner,
            app_type: stack.workload_type,
            app: &stack.name,
            stack_name: stack.workload_type.is_stack().then_some(stack.name.as_str()),
        };
        self.ensure_names_available(plan).await?;
        let mut progress = Progress::default();

        let credentials = match (&stack.secret_name, &stack.credentials) {
            (Some(secret), Some(generated)) => Some(
                self.apply_secret(namespace, secret, &labels, generated, &mut progress)
                    .await?,
            ),
            _ => None,
        };

        let storage = match &stack.claim_name {
            Some(claim) => Some(self.apply_claim(namespace, claim, &labels, &mut progress).await?),
            None => None,
        };
        let data_volume = match &storage {
            Some(StorageMode::Persistent { claim }) => Some(DataVolume::Claim(claim.clone())),
            Some(StorageMode::Ephemeral { .. }) => Some(DataVolume::EmptyDir),
            None => None,
        };

        let routing = self.routing(stack.workload_type).await;
        if let Routing::NodePort { reason } = &routing {
            debug!(%reason, "Exposing components through NodePort");
        }

        let mut services = Vec::with_capacity(stack.components.len());
        for component in &stack.components {
            let info = self
                .apply_service(namespace, component, &labels, &routing, &mut progress)
                .await?;
            services.push(info);
        }

        let mut components = Vec::with_capacity(stack.components.len());
        for (component, mut service) in stack.components.iter().zip(services) {
            let created = self
                .apply_deployment(namespace, component, &labels, data_volume.as_ref(), &mut progress)
                .await?;
            if let Routing::Ingress(grant) = &routing {
                if component.kind.is_exposed() {
                    self.apply_route(plan, component, grant, &labels, &mut service, &mut progress)
                        .await?;
                }
            }
            components.push(ComponentInfo {
                component: component.kind,
                deployment: component.deployment_name.clone(),
                image: component.image.clone(),
                replicas: component.replicas,
                created,
                service: Some(service),
            });
        }

        let result = match (credentials, storage) {
            (Some(database), Some(storage)) => ProvisionResult::Stack {
                stack_name: stack.name.clone(),
                app_type: stack.workload_type,
                credentials: stack_credentials(stack, &components, database)?,
                components,
                storage,
            },
            _ => {
                let component = components.into_iter().next().ok_or_else(|| {
                    Error::Validation(format!("'{}' has no components", stack.name))
                })?;
                ProvisionResult::Single { component }
            }
        };

        info!(objects = progress.applied.len(), "Provisioned application");
        Ok(Provisioned {
            result,
            applied: progress.applied,
        })
    }

    /// Every object the plan would reuse must be unlabeled or labeled for the same
    /// application. Runs before the first write.
    async fn ensure_names_available(&self, plan: &ProvisionPlan) -> Result<()> {
        let namespace = plan.namespace.as_str();
        let app = plan.stack.name.as_str();
        if let Some(secret) = &plan.stack.secret_name {
            self.ensure_unclaimed::<Secret>(namespace, secret, app).await?;
        }
        if let Some(claim) = &plan.stack.claim_name {
            self.ensure_unclaimed::<PersistentVolumeClaim>(namespace, claim, app)
                .await?;
        }
        for component in &plan.stack.components {
            self.ensure_unclaimed::<Service>(namespace, &component.service_name, app)
                .await?;
            self.ensure_unclaimed::<Deployment>(namespace, &component.deployment_name, app)
                .await?;
        }
        Ok(())
    }

    async fn ensure_unclaimed<K: ClusterObject>(&self, namespace: &str, name: &str, app: &str) -> Result<()> {
        let existing: K = match self.cluster.get(namespace, name).await {
            Ok(existing) => existing,
            Err(ClusterError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let object = ObjectRef::from_meta(existing.meta(), &self.config.managed_by);
        match object.claimed_app() {
            Some(owner) if owner != app => {
                warn!(object = %object_key::<K>(name), %owner, "Name belongs to another application");
                Err(Error::Validation(format!(
                    "{} is already in use by application '{owner}'",
                    object_key::<K>(name)
                )))
            }
            _ => Ok(()),
        }
    }

    /// A conflicting secret keeps its stored credentials; only labels are updated.
    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        labels: &LabelSet<'_>,
        generated: &DatabaseCredentials,
        progress: &mut Progress,
    ) -> Result<DatabaseCredentials> {
        let key = object_key::<Secret>(name);
        let secret = manifests::secret(name, &labels.common(), generated)?;
        match self.cluster.create(namespace, &secret).await {
            Ok(_) => {
                debug!(secret = %name, "Created database secret");
                progress.record(key);
                Ok(generated.clone())
            }
            Err(ClusterError::Conflict(_)) => {
                let existing: Secret = self
                    .cluster
                    .patch(namespace, name, &labels_patch(&secret))
                    .await
                    .map_err(|e| progress.fail(key.clone(), e))?;
                progress.record(key.clone());
                let stored = DatabaseCredentials::from_secret(&existing).ok_or_else(|| {
                    progress.fail(
                        key,
                        Error::Validation(format!(
                            "secret '{name}' exists but does not hold database credentials"
                        )),
                    )
                })?;
                info!(secret = %name, "Reusing existing database credentials");
                Ok(stored)
            }
            Err(e) => Err(progress.fail(key, e)),
        }
    }

    /// A missing storage class or a rejected claim degrades to ephemeral storage.
    async fn apply_claim(
        &self,
        namespace: &str,
        name: &str,
        labels: &LabelSet<'_>,
        progress: &mut Progress,
    ) -> Result<StorageMode> {
        let grant = match self.probe.storage(&self.config.storage).await {
            Capability::Granted(grant) => grant,
            Capability::Denied { reason } => {
                warn!(claim = %name, %reason, "Persistent storage unavailable, using emptyDir");
                return Ok(StorageMode::Ephemeral { reason });
            }
        };

        let key = object_key::<PersistentVolumeClaim>(name);
        let claim = manifests::persistent_volume_claim(
            name,
            &labels.common(),
            &self.config.storage.database_volume_size,
            grant.storage_class.as_deref(),
        )?;
        match create_or_patch(self.cluster.as_ref(), namespace, &claim, &labels_patch(&claim)).await {
            Ok(_) => {
                progress.record(key);
                Ok(StorageMode::Persistent {
                    claim: name.to_string(),
                })
            }
            Err(ClusterError::Invalid(reason)) => {
                warn!(claim = %name, %reason, "Claim rejected, using emptyDir");
                Ok(StorageMode::Ephemeral { reason })
            }
            Err(e) => Err(progress.fail(key, e)),
        }
    }

    async fn routing(&self, workload_type: WorkloadType) -> Routing {
        if !self.ingress.should_attach(workload_type) {
            return Routing::NodePort {
                reason: format!("routes are not enabled for {workload_type}"),
            };
        }
        match self.probe.ingress(&self.config.ingress).await {
            Capability::Granted(grant) => Routing::Ingress(grant),
            Capability::Denied { reason } => {
                warn!(%reason, "Ingress unavailable, exposing through NodePort");
                Routing::NodePort { reason }
            }
        }
    }

    async fn apply_service(
        &self,
        namespace: &str,
        component: &ComponentPlan,
        labels: &LabelSet<'_>,
        routing: &Routing,
        progress: &mut Progress,
    ) -> Result<ServiceInfo> {
        let exposure = match routing {
            Routing::NodePort { .. } if component.kind.is_exposed() => ServiceExposure::NodePort,
            _ => ServiceExposure::ClusterIp,
        };
        let key = object_key::<Service>(&component.service_name);
        let service = manifests::service(
            component,
            &labels.for_component(component.kind),
            &labels.selector(component.kind),
            exposure,
        )?;
        let applied = create_or_patch(self.cluster.as_ref(), namespace, &service, &labels_patch(&service))
            .await
            .map_err(|e| progress.fail(key.clone(), e))?;
        progress.record(key);

        let spec = applied.object.spec.as_ref();
        let node_port = spec
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| ports.first())
            .and_then(|p| p.node_port);
        let service_type = spec
            .and_then(|s| s.type_.clone())
            .unwrap_or_else(|| exposure.as_str().to_string());
        Ok(ServiceInfo {
            name: component.service_name.clone(),
            service_type,
            port: component.port,
            node_port,
            host: None,
            url: None,
        })
    }

    /// Returns whether the deployment was created rather than reused.
    async fn apply_deployment(
        &self,
        namespace: &str,
        component: &ComponentPlan,
        labels: &LabelSet<'_>,
        data: Option<&DataVolume>,
        progress: &mut Progress,
    ) -> Result<bool> {
        let key = object_key::<Deployment>(&component.deployment_name);
        let deployment = manifests::deployment(
            component,
            &labels.for_component(component.kind),
            &labels.selector(component.kind),
            data,
        )?;
        let applied = create_or_patch(
            self.cluster.as_ref(),
            namespace,
            &deployment,
            &labels_patch(&deployment),
        )
        .await
        .map_err(|e| progress.fail(key.clone(), e))?;
        if applied.created {
            info!(deployment = %component.deployment_name, replicas = component.replicas, "Created deployment");
        } else {
            info!(deployment = %component.deployment_name, "Deployment exists, reusing it");
        }
        progress.record(key);
        Ok(applied.created)
    }

    /// The primary web component gets `<app>-ingress`; other exposed components
    /// get a route per component.
    async fn apply_route(
        &self,
        plan: &ProvisionPlan,
        component: &ComponentPlan,
        grant: &IngressGrant,
        labels: &LabelSet<'_>,
        service: &mut ServiceInfo,
        progress: &mut Progress,
    ) -> Result<()> {
        let stack = &plan.stack;
        let primary = component.kind.role() == ComponentRole::Web;
        let (name, host) = if primary {
            (
                ResourceNaming::ingress_name(&stack.name),
                self.ingress.host_for(&stack.name, &plan.owner.user_id, None),
            )
        } else {
            (
                ResourceNaming::ingress_name(&component.deployment_name),
                self.ingress
                    .host_for(&stack.name, &plan.owner.user_id, Some(component.kind.as_str())),
            )
        };
        let key = object_key::<Ingress>(&name);
        let ingress = self.ingress.build(
            &RouteTarget {
                name: &name,
                host: &host,
                service: &component.service_name,
                port: component.port,
                class_name: grant.class_name.as_deref(),
            },
            &labels.for_component(component.kind),
        )?;
        self.ingress
            .apply(&plan.namespace, &ingress)
            .await
            .map_err(|e| progress.fail(key.clone(), e))?;
        progress.record(key);

        let scheme = if self.config.ingress.tls_secret_name.is_some() {
            "https"
        } else {
            "http"
        };
        service.url = Some(format!("{scheme}://{host}"));
        service.host = Some(host);
        Ok(())
    }
}

fn stack_credentials(
    stack: &StackPlan,
    components: &[ComponentInfo],
    database: DatabaseCredentials,
) -> Result<StackCredentials> {
    let db_host = stack
        .database_host()
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("stack '{}' has no database", stack.name)))?;
    Ok(match stack.workload_type {
        WorkloadType::WordPress => StackCredentials::WordPress {
            database,
            site_url: components
                .iter()
                .find(|c| c.component == ComponentKind::WordPress)
                .and_then(|c| c.service.as_ref())
                .and_then(|s| s.url.clone()),
        },
        WorkloadType::MySql => StackCredentials::MySql { database, db_host },
        WorkloadType::Lamp => StackCredentials::Lamp { database, db_host },
        WorkloadType::Custom => {
            return Err(Error::Validation(
                "custom applications carry no credentials".to_string(),
            ))
        }
    })
}
