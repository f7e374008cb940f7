//! Request-level facade.
//!
//! [`DeploymentOrchestrator`] runs each operation end to end: validate, check
//! entitlement, clamp, gate on quota, then mutate. Nothing is written to the
//! cluster until every check has passed.

use crate::clamp::{self, ResourceSpec};
use crate::cluster::{object_key, ClusterClient, ClusterError, ClusterObject};
use crate::collaborators::{DeploymentCatalog, DeploymentRecord, QuotaOverrideStore};
use crate::config::{OrchestratorConfig, ResourceDefaults};
use crate::error::{Error, Result, StackOperation};
use crate::identity::UserIdentity;
use crate::labels::{self, LABEL_APP, LABEL_MANAGED_BY, LABEL_STACK_NAME, LABEL_USER_ID};
use crate::lifecycle::{ComponentStatus, LifecycleController, LifecycleReport, LifecycleSummary};
use crate::namespaces::NamespaceManager;
use crate::naming::ResourceNaming;
use crate::provision::stacks::CustomContainer;
use crate::provision::{
    DatabaseCredentials, ProvisionPlan, ProvisionResult, ServiceInfo, StackCredentials, StackPlan,
    StackProvisioner, WorkloadType,
};
use crate::quota::{PlannedAllocation, PreflightQuotaChecker, QuotaAccountant, UsageSnapshot, UsageSummary};
use crate::resolver::{ResolvedStack, StackResolver};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Resource values a request may set; anything left out comes from
/// `defaultResources`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub replicas: Option<i32>,
}

impl ResourceRequest {
    #[must_use]
    pub fn resolve(&self, defaults: &ResourceDefaults) -> ResourceSpec {
        ResourceSpec {
            cpu_request: self
                .cpu_request
                .clone()
                .unwrap_or_else(|| defaults.cpu_request.clone()),
            cpu_limit: self
                .cpu_limit
                .clone()
                .unwrap_or_else(|| defaults.cpu_limit.clone()),
            memory_request: self
                .memory_request
                .clone()
                .unwrap_or_else(|| defaults.memory_request.clone()),
            memory_limit: self
                .memory_limit
                .clone()
                .unwrap_or_else(|| defaults.memory_limit.clone()),
            replicas: self.replicas.unwrap_or(defaults.replicas),
        }
    }
}

/// Request to launch one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub name: String,
    pub workload_type: WorkloadType,
    /// Container image; required for `custom`.
    #[serde(default)]
    pub image: Option<String>,
    /// Container port for `custom`; defaults to 80.
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Passed through to the catalog for the expiry sweep.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreateRequest {
    pub fn new(name: impl Into<String>, workload_type: WorkloadType) -> Self {
        Self {
            name: name.into(),
            workload_type,
            image: None,
            port: None,
            env: BTreeMap::new(),
            resources: ResourceRequest::default(),
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub namespace: String,
    /// `Kind/name` of every object created or updated.
    pub resources_applied: Vec<String>,
    pub service_info: Vec<ServiceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<StackCredentials>,
    pub result: ProvisionResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleOutcome {
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_type: Option<WorkloadType>,
    pub components: Vec<ComponentStatus>,
    pub summary: LifecycleSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub namespace: String,
    pub name: String,
    /// `Kind/name` of every object removed.
    pub deleted: Vec<String>,
}

pub struct DeploymentOrchestrator<C> {
    config: Arc<OrchestratorConfig>,
    resolver: StackResolver<C>,
    accountant: Arc<QuotaAccountant<C>>,
    preflight: Arc<PreflightQuotaChecker<C>>,
    lifecycle: LifecycleController<C>,
    provisioner: StackProvisioner<C>,
    namespaces: NamespaceManager<C>,
    cluster: Arc<C>,
    catalog: Arc<dyn DeploymentCatalog>,
}

impl<C: ClusterClient> DeploymentOrchestrator<C> {
    pub fn new(
        cluster: Arc<C>,
        config: Arc<OrchestratorConfig>,
        overrides: Arc<dyn QuotaOverrideStore>,
        catalog: Arc<dyn DeploymentCatalog>,
    ) -> Self {
        let accountant = Arc::new(QuotaAccountant::new(
            cluster.clone(),
            config.clone(),
            overrides,
        ));
        let preflight = Arc::new(PreflightQuotaChecker::new(cluster.clone()));
        Self {
            resolver: StackResolver::new(cluster.clone(), config.clone()),
            lifecycle: LifecycleController::new(
                cluster.clone(),
                &config,
                accountant.clone(),
                preflight.clone(),
            ),
            provisioner: StackProvisioner::new(cluster.clone(), config.clone()),
            namespaces: NamespaceManager::new(cluster.clone(), config.clone()),
            accountant,
            preflight,
            cluster,
            config,
            catalog,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Launch an application in the caller's namespace.
    #[instrument(skip(self, user, request), fields(user_id = %user.user_id, app = %request.name, app_type = %request.workload_type))]
    pub async fn create(&self, user: &UserIdentity, request: CreateRequest) -> Result<CreateOutcome> {
        ResourceNaming::validate_app_name(&request.name)?;

        let policy = self.config.roles.policy(user.role);
        if !policy.allows(request.workload_type) {
            warn!(role = %user.role, "Workload type not allowed for role");
            return Err(Error::Permission(format!(
                "role '{}' may not create '{}' applications",
                user.role, request.workload_type
            )));
        }

        let requested = request.resources.resolve(&self.config.default_resources);
        let resources = clamp::clamp(&policy.floors, &requested)?;
        debug!(?requested, clamped = ?resources, "Resolved resources against role floors");
        let stack = self.plan(&request, &resources)?;
        let namespace = self.config.namespace_for(&user.user_id);

        let snapshot = self.accountant.snapshot_namespace(&namespace).await?;
        ensure_reusable(&stack, &snapshot)?;
        let allocation = planned_allocation(&stack, &snapshot);
        let apps = u64::from(!snapshot.app_keys.contains(&stack.name));
        self.accountant
            .assert_within(user, &snapshot.usage, &allocation.as_usage(apps))
            .await?;
        self.preflight.check(&namespace, &allocation).await?;

        self.namespaces.ensure(user).await?;
        let provisioned = self
            .provisioner
            .provision(&ProvisionPlan {
                namespace: namespace.clone(),
                owner: user.clone(),
                stack,
            })
            .await?;

        let record = DeploymentRecord {
            user_id: user.user_id.clone(),
            name: request.name.clone(),
            namespace: namespace.clone(),
            app_type: request.workload_type,
            created_at: Utc::now(),
            expires_at: request.expires_at,
            deleted_at: None,
        };
        if let Err(e) = self.catalog.record_created(record).await {
            warn!(error = %e, "Failed to record deployment in catalog");
        }

        let service_info = provisioned
            .result
            .components()
            .iter()
            .filter_map(|c| c.service.clone())
            .collect();
        info!(namespace = %namespace, objects = provisioned.applied.len(), "Application created");
        Ok(CreateOutcome {
            namespace,
            resources_applied: provisioned.applied,
            service_info,
            credentials: provisioned.result.credentials().cloned(),
            result: provisioned.result,
        })
    }

    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn pause(&self, namespace: &str, name: &str, user: &UserIdentity) -> Result<LifecycleOutcome> {
        let stack = self.resolver.resolve(namespace, name, user).await?;
        let report = self.lifecycle.pause(&stack, user).await?;
        Ok(self.outcome(&stack, report, user).await)
    }

    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn resume(&self, namespace: &str, name: &str, user: &UserIdentity) -> Result<LifecycleOutcome> {
        let stack = self.resolver.resolve(namespace, name, user).await?;
        let report = self.lifecycle.resume(&stack, user).await?;
        Ok(self.outcome(&stack, report, user).await)
    }

    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn status(&self, namespace: &str, name: &str, user: &UserIdentity) -> Result<LifecycleOutcome> {
        let stack = self.resolver.resolve(namespace, name, user).await?;
        let report = self.lifecycle.status(&stack);
        Ok(self.outcome(&stack, report, user).await)
    }

    /// Remove an application's deployments, and optionally its services and
    /// routes (`delete_service`) and its claim and secret (`delete_persistent`).
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn delete(
        &self,
        namespace: &str,
        name: &str,
        user: &UserIdentity,
        delete_service: bool,
        delete_persistent: bool,
    ) -> Result<DeleteOutcome> {
        let stack = self.resolver.resolve(namespace, name, user).await?;
        let mut deleted = Vec::new();

        for workload in &stack.workloads {
            self.delete_one::<Deployment>(namespace, &workload.object.name, &mut deleted)
                .await?;
        }

        let selector = self.stack_selector(&stack);
        if delete_service {
            self.delete_matching::<Service>(namespace, &selector, &mut deleted)
                .await?;
            self.delete_matching::<Ingress>(namespace, &selector, &mut deleted)
                .await?;
        }
        if delete_persistent {
            self.delete_matching::<PersistentVolumeClaim>(namespace, &selector, &mut deleted)
                .await?;
            self.delete_matching::<Secret>(namespace, &selector, &mut deleted)
                .await?;
        }

        let owner = owner_id(&stack, user);
        if let Err(e) = self.catalog.record_deleted(&owner, &stack.display_name).await {
            warn!(error = %e, "Failed to record deletion in catalog");
        }
        info!(
            namespace = %namespace,
            app = %stack.display_name,
            objects = deleted.len(),
            "Application deleted"
        );
        Ok(DeleteOutcome {
            namespace: namespace.to_string(),
            name: stack.display_name,
            deleted,
        })
    }

    pub async fn usage_summary(&self, user: &UserIdentity) -> Result<UsageSummary> {
        self.accountant.usage_summary(user).await
    }

    pub async fn ensure_namespace(&self, user: &UserIdentity) -> Result<String> {
        self.namespaces.ensure(user).await
    }

    pub async fn orphaned_namespaces(&self, known_user_ids: &[String]) -> Result<Vec<String>> {
        self.namespaces.orphaned(known_user_ids).await
    }

    /// Only an admin may remove a whole namespace.
    pub async fn delete_namespace(&self, name: &str, actor: &UserIdentity) -> Result<()> {
        if !actor.is_privileged() {
            return Err(Error::Permission(format!(
                "user '{}' may not delete namespaces",
                actor.username
            )));
        }
        self.namespaces.delete(name).await
    }

    fn plan(&self, request: &CreateRequest, resources: &ResourceSpec) -> Result<StackPlan> {
        match request.workload_type {
            WorkloadType::Custom => {
                let image = request.image.clone().ok_or_else(|| {
                    Error::Validation("an image is required for custom applications".to_string())
                })?;
                let container = CustomContainer {
                    image,
                    port: request.port.unwrap_or(80),
                    env: request.env.clone(),
                };
                StackPlan::custom(&request.name, &container, resources)
            }
            stack_type => StackPlan::stack(
                &request.name,
                stack_type,
                resources,
                &self.config.images,
                DatabaseCredentials::generate(stack_type, &request.name),
            ),
        }
    }

    /// Labels that tie services, routes, claims and secrets to one application
    /// and its owner.
    fn stack_selector(&self, stack: &ResolvedStack) -> String {
        let managed_by = self.config.managed_by.as_str();
        let owner = stack.workloads.iter().find_map(|w| w.object.user_id.clone());
        let app = stack
            .workloads
            .first()
            .and_then(|w| w.object.app.clone())
            .unwrap_or_else(|| stack.display_name.clone());

        let mut pairs = vec![(LABEL_MANAGED_BY, managed_by)];
        match &stack.stack_name {
            Some(stack_name) => pairs.push((LABEL_STACK_NAME, stack_name.as_str())),
            None => pairs.push((LABEL_APP, app.as_str())),
        }
        if let Some(owner) = &owner {
            pairs.push((LABEL_USER_ID, owner.as_str()));
        }
        let mut selector = labels::selector(&pairs);
        if stack.stack_name.is_none() {
            selector.push_str(&format!(",!{LABEL_STACK_NAME}"));
        }
        selector
    }

    async fn delete_matching<K: ClusterObject>(
        &self,
        namespace: &str,
        selector: &str,
        deleted: &mut Vec<String>,
    ) -> Result<()> {
        let objects: Vec<K> = self
            .cluster
            .list(namespace, Some(selector))
            .await
            .map_err(|e| {
                Error::partial(
                    StackOperation::Delete,
                    deleted.clone(),
                    format!("{}/*", K::kind(&())),
                    e.into(),
                )
            })?;
        for object in objects {
            let name = object.meta().name.clone().unwrap_or_default();
            self.delete_one::<K>(namespace, &name, deleted).await?;
        }
        Ok(())
    }

    async fn delete_one<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        deleted: &mut Vec<String>,
    ) -> Result<()> {
        let key = object_key::<K>(name);
        match self.cluster.delete::<K>(namespace, name).await {
            Ok(()) => {
                debug!(object = %key, "Deleted");
                deleted.push(key);
                Ok(())
            }
            Err(ClusterError::NotFound(_)) => {
                debug!(object = %key, "Already gone");
                Ok(())
            }
            Err(e) => {
                error!(object = %key, error = %e, "Delete failed");
                Err(Error::partial(
                    StackOperation::Delete,
                    deleted.clone(),
                    key,
                    e.into(),
                ))
            }
        }
    }

    async fn outcome(
        &self,
        stack: &ResolvedStack,
        report: LifecycleReport,
        user: &UserIdentity,
    ) -> LifecycleOutcome {
        let owner = owner_id(stack, user);
        let expires_at = match self.catalog.get(&owner, &stack.display_name).await {
            Ok(record) => record.and_then(|r| r.expires_at),
            Err(e) => {
                warn!(error = %e, "Catalog lookup failed");
                None
            }
        };
        LifecycleOutcome {
            namespace: stack.namespace.clone(),
            name: stack.display_name.clone(),
            stack_name: stack.stack_name.clone(),
            app_type: stack.app_type,
            components: report.components,
            summary: report.summary,
            expires_at,
        }
    }
}

/// The stack owner's id, falling back to the caller.
fn owner_id(stack: &ResolvedStack, user: &UserIdentity) -> String {
    stack
        .workloads
        .iter()
        .find_map(|w| w.object.user_id.clone())
        .unwrap_or_else(|| user.user_id.clone())
}

/// A planned deployment that already exists must belong to the same application;
/// reusing another app's deployment would relabel it and skip its quota charge.
fn ensure_reusable(stack: &StackPlan, snapshot: &UsageSnapshot) -> Result<()> {
    for component in &stack.components {
        if let Some(Some(owner)) = snapshot.workloads.get(&component.deployment_name) {
            if owner != &stack.name {
                return Err(Error::Validation(format!(
                    "name '{}' is already in use by application '{owner}'",
                    component.deployment_name
                )));
            }
        }
    }
    Ok(())
}

/// New pods and deployments a plan adds. Components that already exist are
/// reused as they are and add nothing.
fn planned_allocation(stack: &StackPlan, snapshot: &UsageSnapshot) -> PlannedAllocation {
    let mut total = PlannedAllocation::default();
    for component in &stack.components {
        if snapshot.workloads.contains_key(&component.deployment_name) {
            continue;
        }
        let replicas = u64::try_from(component.replicas).unwrap_or(0);
        total += PlannedAllocation::for_workload(&component.resources, replicas, true);
    }
    total
}
