//! Pause / resume state machine.
//!
//! State is never stored. It is derived from desired and observed replica counts
//! plus the pause annotations:
//!
//! - `paused`: desired replicas is 0, or the pause flag is set
//! - `running`: ready >= desired and at least one replica available
//! - `starting`: anything else
//!
//! Pause and resume patch one deployment at a time. A failure part way leaves a
//! mixed stack, which is a valid state that a retry converges from.

use crate::cluster::{object_key, ClusterClient};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result, StackOperation};
use crate::identity::{Role, UserIdentity};
use crate::labels::{
    ObjectRef, ANNOTATION_PAUSED, ANNOTATION_PAUSED_AT, ANNOTATION_PAUSED_BY,
    ANNOTATION_SAVED_REPLICAS, LIFECYCLE_ANNOTATIONS,
};
use crate::provision::ComponentKind;
use crate::quota::{PlannedAllocation, PodResources, PreflightQuotaChecker, QuotaAccountant};
use crate::resolver::{ResolvedStack, ResolvedWorkload};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Starting,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StackState {
    Running,
    Paused,
    Mixed,
}

/// Observed state of one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<ComponentKind>,
    pub state: ComponentState,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_paused: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_running: bool,
}

impl ComponentStatus {
    #[must_use]
    pub fn observe(deployment: &Deployment, object: &ObjectRef) -> Self {
        let desired = desired_replicas(deployment);
        let status = deployment.status.as_ref();
        let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
        let available = status.and_then(|s| s.available_replicas).unwrap_or(0);
        Self {
            name: object.name.clone(),
            component: object.component,
            state: component_state(object.paused, desired, ready, available),
            desired_replicas: desired,
            ready_replicas: ready,
            available_replicas: available,
            saved_replicas: object.saved_replicas,
            paused_by: object.paused_by.clone(),
            paused_at: object.paused_at.clone(),
            already_paused: false,
            already_running: false,
        }
    }
}

#[must_use]
pub fn component_state(paused_flag: bool, desired: i32, ready: i32, available: i32) -> ComponentState {
    if paused_flag || desired == 0 {
        ComponentState::Paused
    } else if ready >= desired && available > 0 {
        ComponentState::Running
    } else {
        ComponentState::Starting
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleSummary {
    pub state: StackState,
    pub total: usize,
    pub running: usize,
    pub starting: usize,
    pub paused: usize,
}

impl LifecycleSummary {
    #[must_use]
    pub fn of(components: &[ComponentStatus]) -> Self {
        let count = |state| components.iter().filter(|c| c.state == state).count();
        let running = count(ComponentState::Running);
        let starting = count(ComponentState::Starting);
        let paused = count(ComponentState::Paused);
        let total = components.len();
        let state = if total > 0 && paused == total {
            StackState::Paused
        } else if total > 0 && running == total {
            StackState::Running
        } else {
            StackState::Mixed
        };
        Self {
            state,
            total,
            running,
            starting,
            paused,
        }
    }
}

/// Per-component results of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleReport {
    pub components: Vec<ComponentStatus>,
    pub summary: LifecycleSummary,
}

impl LifecycleReport {
    #[must_use]
    pub fn new(components: Vec<ComponentStatus>) -> Self {
        let summary = LifecycleSummary::of(&components);
        Self {
            components,
            summary,
        }
    }
}

fn desired_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

fn is_paused(workload: &ResolvedWorkload) -> bool {
    workload.object.paused || desired_replicas(&workload.deployment) == 0
}

/// Scale to zero and remember how to come back, in one patch.
#[must_use]
pub fn pause_patch(desired: i32, actor: &str, at: DateTime<Utc>) -> Value {
    json!({
        "metadata": {
            "annotations": {
                ANNOTATION_PAUSED: "true",
                ANNOTATION_SAVED_REPLICAS: desired.max(1).to_string(),
                ANNOTATION_PAUSED_BY: actor,
                ANNOTATION_PAUSED_AT: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            }
        },
        "spec": { "replicas": 0 }
    })
}

/// Restore replicas and drop every lifecycle annotation, in one patch.
#[must_use]
pub fn resume_patch(replicas: i32) -> Value {
    let annotations: Map<String, Value> = LIFECYCLE_ANNOTATIONS
        .iter()
        .map(|key| ((*key).to_string(), Value::Null))
        .collect();
    json!({
        "metadata": { "annotations": annotations },
        "spec": { "replicas": replicas }
    })
}

/// Identity quota is charged to: the workload's owner when an admin acts on
/// someone else's stack, the caller otherwise.
fn quota_subject(object: &ObjectRef, caller: &UserIdentity) -> UserIdentity {
    match (&object.user_id, caller.is_privileged()) {
        (Some(owner_id), true) if !object.is_owned_by(caller) => UserIdentity::new(
            owner_id.clone(),
            object.owner.clone().unwrap_or_else(|| owner_id.clone()),
            object.user_role.unwrap_or(Role::Student),
        ),
        _ => caller.clone(),
    }
}

/// Applies pause and resume to resolved stacks.
pub struct LifecycleController<C> {
    cluster: Arc<C>,
    managed_by: String,
    accountant: Arc<QuotaAccountant<C>>,
    preflight: Arc<PreflightQuotaChecker<C>>,
}

impl<C: ClusterClient> LifecycleController<C> {
    pub fn new(
        cluster: Arc<C>,
        config: &OrchestratorConfig,
        accountant: Arc<QuotaAccountant<C>>,
        preflight: Arc<PreflightQuotaChecker<C>>,
    ) -> Self {
        Self {
            cluster,
            managed_by: config.managed_by.clone(),
            accountant,
            preflight,
        }
    }

    /// Read-only view of the stack.
    #[must_use]
    pub fn status(&self, stack: &ResolvedStack) -> LifecycleReport {
        LifecycleReport::new(
            stack
                .workloads
                .iter()
                .map(|w| ComponentStatus::observe(&w.deployment, &w.object))
                .collect(),
        )
    }

    #[instrument(skip(self, stack, actor), fields(namespace = %stack.namespace, stack = %stack.display_name))]
    pub async fn pause(&self, stack: &ResolvedStack, actor: &UserIdentity) -> Result<LifecycleReport> {
        let now = Utc::now();
        let mut components = Vec::with_capacity(stack.workloads.len());
        let mut patched = Vec::new();

        for workload in &stack.workloads {
            if is_paused(workload) {
                debug!(deployment = %workload.object.name, "Already paused");
                let mut status = ComponentStatus::observe(&workload.deployment, &workload.object);
                status.already_paused = true;
                components.push(status);
                continue;
            }

            let desired = desired_replicas(&workload.deployment);
            let patch = pause_patch(desired, &actor.username, now);
            let updated: Deployment = match self
                .cluster
                .patch(&stack.namespace, &workload.object.name, &patch)
                .await
            {
                Ok(updated) => updated,
                Err(e) => {
                    error!(deployment = %workload.object.name, error = %e, "Failed to pause");
                    return Err(Error::partial(
                        StackOperation::Pause,
                        patched,
                        object_key::<Deployment>(&workload.object.name),
                        e.into(),
                    ));
                }
            };
            info!(
                deployment = %workload.object.name,
                saved_replicas = desired.max(1),
                "Paused workload"
            );
            patched.push(object_key::<Deployment>(&workload.object.name));
            let object = ObjectRef::from_meta(&updated.metadata, &self.managed_by);
            components.push(ComponentStatus::observe(&updated, &object));
        }

        Ok(LifecycleReport::new(components))
    }

    /// Restore each paused component after re-checking quota for the replicas it
    /// brings back. A quota rejection stops at that component.
    #[instrument(skip(self, stack, user), fields(namespace = %stack.namespace, stack = %stack.display_name))]
    pub async fn resume(&self, stack: &ResolvedStack, user: &UserIdentity) -> Result<LifecycleReport> {
        let mut components = Vec::with_capacity(stack.workloads.len());
        let mut patched = Vec::new();

        for workload in &stack.workloads {
            if !is_paused(workload) {
                debug!(deployment = %workload.object.name, "Already running");
                let mut status = ComponentStatus::observe(&workload.deployment, &workload.object);
                status.already_running = true;
                components.push(status);
                continue;
            }

            let replicas = workload.object.saved_replicas.unwrap_or(1).max(1);
            let key = object_key::<Deployment>(&workload.object.name);
            let pod = PodResources::of_deployment(&workload.deployment);
            let pods = u64::try_from(replicas).unwrap_or(1);
            let allocation = PlannedAllocation {
                requests_cpu_m: pod.requests_cpu_m * pods,
                limits_cpu_m: pod.limits_cpu_m * pods,
                requests_mem_mi: pod.requests_mem_mi * pods,
                limits_mem_mi: pod.limits_mem_mi * pods,
                pods,
                deployments: 0,
            };

            let subject = quota_subject(&workload.object, user);
            let gate = async {
                let snapshot = self.accountant.snapshot_namespace(&stack.namespace).await?;
                self.accountant
                    .assert_within(&subject, &snapshot.usage, &allocation.as_usage(0))
                    .await?;
                self.preflight.check(&stack.namespace, &allocation).await
            };
            if let Err(e) = gate.await {
                info!(deployment = %workload.object.name, error = %e, "Resume blocked");
                return Err(match e {
                    quota @ Error::Quota { .. } => quota,
                    other => Error::partial(StackOperation::Resume, patched, key, other),
                });
            }

            let updated: Deployment = match self
                .cluster
                .patch(&stack.namespace, &workload.object.name, &resume_patch(replicas))
                .await
            {
                Ok(updated) => updated,
                Err(e) => {
                    error!(deployment = %workload.object.name, error = %e, "Failed to resume");
                    return Err(Error::partial(StackOperation::Resume, patched, key, e.into()));
                }
            };
            info!(deployment = %workload.object.name, replicas, "Resumed workload");
            patched.push(key);
            let object = ObjectRef::from_meta(&updated.metadata, &self.managed_by);
            components.push(ComponentStatus::observe(&updated, &object));
        }

        Ok(LifecycleReport::new(components))
    }
}
