use super::{evaluate, PlannedUsage, QuotaLimits, Usage, UsageSummary};
use crate::cluster::{ClusterClient, ClusterError};
use crate::collaborators::QuotaOverrideStore;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::labels::ObjectRef;
use crate::units;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Usage plus the keys it was computed from, so callers can tell which apps and
/// workloads already exist. `workloads` maps each deployment to the application
/// its labels claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub usage: Usage,
    pub app_keys: BTreeSet<String>,
    pub workloads: BTreeMap<String, Option<String>>,
}

impl UsageSnapshot {
    /// Fold live deployments into a snapshot.
    #[must_use]
    pub fn from_deployments(deployments: &[Deployment], managed_by: &str) -> Self {
        let mut snapshot = Self::default();
        for deployment in deployments {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            let replicas = deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1)
                .max(0);
            let remaining = deployment
                .status
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(0);
            if deployment.metadata.deletion_timestamp.is_some() && remaining == 0 {
                debug!(deployment = %name, "Skipping deployment being deleted");
                continue;
            }

            let object = ObjectRef::from_meta(&deployment.metadata, managed_by);
            snapshot.app_keys.insert(object.logical_app_key());
            snapshot
                .workloads
                .insert(name, object.claimed_app().map(str::to_string));

            // Paused workloads hold their app slot but no pods.
            if object.paused || replicas == 0 {
                continue;
            }
            let replicas = u64::try_from(replicas).unwrap_or(0);
            let pod = PodResources::of_deployment(deployment);

            let usage = &mut snapshot.usage;
            usage.pods_used = usage.pods_used.saturating_add(replicas);
            usage.cpu_m_used = usage
                .cpu_m_used
                .saturating_add(pod.requests_cpu_m.saturating_mul(replicas));
            usage.mem_mi_used = usage
                .mem_mi_used
                .saturating_add(pod.requests_mem_mi.saturating_mul(replicas));
        }
        snapshot.usage.apps_used = snapshot.app_keys.len() as u64;
        snapshot
    }
}

/// Per-pod resources summed over the pod's containers. A container with only
/// limits set is scheduled with requests equal to its limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodResources {
    pub requests_cpu_m: u64,
    pub limits_cpu_m: u64,
    pub requests_mem_mi: u64,
    pub limits_mem_mi: u64,
}

impl PodResources {
    #[must_use]
    pub fn of(pod: &PodSpec) -> Self {
        pod.containers
            .iter()
            .map(container_resources)
            .fold(Self::default(), |total, c| Self {
                requests_cpu_m: total.requests_cpu_m.saturating_add(c.requests_cpu_m),
                limits_cpu_m: total.limits_cpu_m.saturating_add(c.limits_cpu_m),
                requests_mem_mi: total.requests_mem_mi.saturating_add(c.requests_mem_mi),
                limits_mem_mi: total.limits_mem_mi.saturating_add(c.limits_mem_mi),
            })
    }

    #[must_use]
    pub fn of_deployment(deployment: &Deployment) -> Self {
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(Self::of)
            .unwrap_or_default()
    }
}

fn container_resources(container: &Container) -> PodResources {
    let Some(resources) = container.resources.as_ref() else {
        return PodResources::default();
    };
    let requests = resources.requests.as_ref();
    let limits = resources.limits.as_ref();
    let request = |key: &str| {
        requests
            .and_then(|r| r.get(key))
            .or_else(|| limits.and_then(|l| l.get(key)))
    };
    let limit = |key: &str| limits.and_then(|l| l.get(key));
    let read = |quantity: Option<&Quantity>, parse: fn(&Quantity) -> Option<u64>| {
        let quantity = quantity?;
        let value = parse(quantity);
        if value.is_none() {
            warn!(container = %container.name, value = %quantity.0, "Unparseable container resource, counting zero");
        }
        value
    };
    PodResources {
        requests_cpu_m: read(request("cpu"), units::quantity_millicores).unwrap_or(0),
        limits_cpu_m: read(limit("cpu"), units::quantity_millicores).unwrap_or(0),
        requests_mem_mi: read(request("memory"), units::quantity_mebibytes).unwrap_or(0),
        limits_mem_mi: read(limit("memory"), units::quantity_mebibytes).unwrap_or(0),
    }
}

/// Computes usage from live cluster state and checks it against role ceilings.
pub struct QuotaAccountant<C> {
    cluster: Arc<C>,
    config: Arc<OrchestratorConfig>,
    overrides: Arc<dyn QuotaOverrideStore>,
}

impl<C: ClusterClient> QuotaAccountant<C> {
    pub fn new(
        cluster: Arc<C>,
        config: Arc<OrchestratorConfig>,
        overrides: Arc<dyn QuotaOverrideStore>,
    ) -> Self {
        Self {
            cluster,
            config,
            overrides,
        }
    }

    /// Current usage in `user`'s namespace. Fails closed when the cluster cannot
    /// be read.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn snapshot(&self, user: &UserIdentity) -> Result<UsageSnapshot> {
        let namespace = self.config.namespace_for(&user.user_id);
        self.snapshot_namespace(&namespace).await
    }

    pub async fn snapshot_namespace(&self, namespace: &str) -> Result<UsageSnapshot> {
        let deployments = match self.cluster.list::<Deployment>(namespace, None).await {
            Ok(deployments) => deployments,
            // No namespace yet means nothing deployed yet.
            Err(ClusterError::NotFound(_)) => Vec::new(),
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Unable to compute usage");
                return Err(e.into());
            }
        };
        let snapshot = UsageSnapshot::from_deployments(&deployments, &self.config.managed_by);
        debug!(
            namespace = %namespace,
            apps = snapshot.usage.apps_used,
            pods = snapshot.usage.pods_used,
            cpu_m = snapshot.usage.cpu_m_used,
            mem_mi = snapshot.usage.mem_mi_used,
            "Computed usage"
        );
        Ok(snapshot)
    }

    pub async fn usage(&self, user: &UserIdentity) -> Result<Usage> {
        Ok(self.snapshot(user).await?.usage)
    }

    /// Role limits, replaced by an active per-user override. Returns whether an
    /// override applied.
    pub async fn limits_for(&self, user: &UserIdentity) -> (QuotaLimits, bool) {
        let role_limits = self.config.roles.policy(user.role).limits;
        match self.overrides.override_for(&user.user_id).await {
            Ok(Some(record)) if record.is_active(Utc::now()) => (record.limits, true),
            Ok(Some(_)) => {
                debug!(user_id = %user.user_id, "Ignoring expired quota override");
                (role_limits, false)
            }
            Ok(None) => (role_limits, false),
            Err(e) => {
                warn!(user_id = %user.user_id, error = %e, "Quota override lookup failed, using role limits");
                (role_limits, false)
            }
        }
    }

    /// Fail with a quota error when `usage + planned` exceeds any limit.
    pub async fn assert_quota(&self, user: &UserIdentity, planned: &PlannedUsage) -> Result<()> {
        let snapshot = self.snapshot(user).await?;
        self.assert_within(user, &snapshot.usage, planned).await
    }

    /// Same as [`Self::assert_quota`] against an already computed usage.
    pub async fn assert_within(
        &self,
        user: &UserIdentity,
        usage: &Usage,
        planned: &PlannedUsage,
    ) -> Result<()> {
        let (limits, _) = self.limits_for(user).await;
        let violations = evaluate(&limits, usage, planned);
        if violations.is_empty() {
            return Ok(());
        }
        info!(
            user_id = %user.user_id,
            violations = violations.len(),
            "Quota check rejected request"
        );
        Err(Error::Quota { violations })
    }

    pub async fn usage_summary(&self, user: &UserIdentity) -> Result<UsageSummary> {
        let usage = self.usage(user).await?;
        let (limits, overridden) = self.limits_for(user).await;
        Ok(UsageSummary::new(user.role, limits, usage, overridden))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, Verb};
    use crate::collaborators::{MockQuotaOverrideStore, StaticOverrides};
    use crate::identity::Role;
    use crate::quota::QuotaOverride;
    use chrono::Duration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use serde_json::json;

    fn deployment(name: &str, labels: serde_json::Value, replicas: i32, cpu: &str, mem: &str) -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name, "labels": labels },
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": { "app": name } },
                "template": {
                    "metadata": { "labels": { "app": name } },
                    "spec": { "containers": [{
                        "name": "main",
                        "image": "nginx",
                        "resources": { "requests": { "cpu": cpu, "memory": mem } }
                    }]}
                }
            }
        }))
        .unwrap()
    }

    fn accountant(cluster: Arc<InMemoryCluster>) -> QuotaAccountant<InMemoryCluster> {
        QuotaAccountant::new(
            cluster,
            Arc::new(OrchestratorConfig::default()),
            Arc::new(StaticOverrides::default()),
        )
    }

    fn student() -> UserIdentity {
        UserIdentity::new("7", "alice", Role::Student)
    }

    #[tokio::test]
    async fn stack_components_count_as_one_app() {
        let cluster = Arc::new(InMemoryCluster::new());
        for (name, component) in [("blog-wordpress", "wordpress"), ("blog-mariadb", "mariadb")] {
            cluster
                .insert(
                    "lab-7",
                    &deployment(
                        name,
                        json!({ "stack-name": "blog", "component": component }),
                        1,
                        "250m",
                        "256Mi",
                    ),
                )
                .unwrap();
        }
        cluster
            .insert("lab-7", &deployment("api", json!({ "app": "api" }), 2, "0.5", "1Gi"))
            .unwrap();

        let usage = accountant(cluster).usage(&student()).await.unwrap();
        assert_eq!(
            usage,
            Usage {
                apps_used: 2,
                pods_used: 4,
                cpu_m_used: 1500,
                mem_mi_used: 2560,
            }
        );
    }

    #[test]
    fn byte_and_exponent_container_values_are_counted() {
        let api = deployment("api", json!({ "app": "api" }), 1, "25e1m", "536870912");
        let snapshot = UsageSnapshot::from_deployments(&[api], "lab-orchestrator");
        assert_eq!(snapshot.usage.cpu_m_used, 250);
        assert_eq!(snapshot.usage.mem_mi_used, 512);
        assert_eq!(snapshot.workloads["api"].as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn paused_apps_hold_slot_without_pods() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .insert("lab-7", &deployment("idle", json!({ "app": "idle" }), 0, "1", "1Gi"))
            .unwrap();
        let usage = accountant(cluster).usage(&student()).await.unwrap();
        assert_eq!(usage.apps_used, 1);
        assert_eq!(usage.pods_used, 0);
        assert_eq!(usage.cpu_m_used, 0);
    }

    #[test]
    fn deleting_workloads_without_replicas_are_skipped() {
        let mut gone = deployment("gone", json!({}), 1, "1", "1Gi");
        gone.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let snapshot = UsageSnapshot::from_deployments(&[gone], "lab-orchestrator");
        assert_eq!(snapshot.usage, Usage::default());
        assert!(snapshot.workloads.is_empty());
    }

    #[tokio::test]
    async fn missing_namespace_is_zero_usage() {
        let cluster = Arc::new(InMemoryCluster::new());
        let usage = accountant(cluster).usage(&student()).await.unwrap();
        assert_eq!(usage, Usage::default());
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_closed() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.fail_on(
            Verb::List,
            "Deployment",
            ClusterError::Unavailable("connection refused".to_string()),
        );
        let err = accountant(cluster)
            .assert_quota(&student(), &PlannedUsage::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn assert_quota_names_violated_dimension() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .insert("lab-7", &deployment("api", json!({ "app": "api" }), 2, "900m", "256Mi"))
            .unwrap();
        let planned = PlannedUsage {
            apps: 1,
            pods: 1,
            cpu_m: 300,
            mem_mi: 128,
        };
        let err = accountant(cluster)
            .assert_quota(&student(), &planned)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Quota exceeded: cpu_m: 2100/2000");
    }

    #[tokio::test]
    async fn active_override_replaces_role_limits() {
        let mut store = MockQuotaOverrideStore::new();
        store.expect_override_for().returning(|_| {
            Ok(Some(QuotaOverride {
                limits: QuotaLimits {
                    max_apps: 50,
                    max_pods: 50,
                    max_requests_cpu_m: 50_000,
                    max_requests_mem_mi: 50_000,
                },
                expires_at: Some(Utc::now() + Duration::hours(1)),
            }))
        });
        let accountant = QuotaAccountant::new(
            Arc::new(InMemoryCluster::new()),
            Arc::new(OrchestratorConfig::default()),
            Arc::new(store),
        );
        let summary = accountant.usage_summary(&student()).await.unwrap();
        assert!(summary.overridden);
        assert_eq!(summary.limits.max_apps, 50);
        assert_eq!(summary.remaining.cpu_m, 50_000);
    }

    #[tokio::test]
    async fn expired_override_is_ignored() {
        let mut store = MockQuotaOverrideStore::new();
        store.expect_override_for().returning(|_| {
            Ok(Some(QuotaOverride {
                limits: QuotaLimits {
                    max_apps: 50,
                    max_pods: 50,
                    max_requests_cpu_m: 50_000,
                    max_requests_mem_mi: 50_000,
                },
                expires_at: Some(Utc::now() - Duration::hours(1)),
            }))
        });
        let accountant = QuotaAccountant::new(
            Arc::new(InMemoryCluster::new()),
            Arc::new(OrchestratorConfig::default()),
            Arc::new(store),
        );
        let (limits, overridden) = accountant.limits_for(&student()).await;
        assert!(!overridden);
        assert_eq!(limits.max_apps, 3);
    }
}
