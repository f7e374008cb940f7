use super::{PlannedUsage, QuotaViolation};
use crate::clamp::ResourceSpec;
use crate::cluster::{ClusterClient, ClusterError};
use crate::error::{Error, Result};
use crate::units;
use k8s_openapi::api::core::v1::ResourceQuota;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Resources an operation is about to add to a namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlannedAllocation {
    pub requests_cpu_m: u64,
    pub limits_cpu_m: u64,
    pub requests_mem_mi: u64,
    pub limits_mem_mi: u64,
    pub pods: u64,
    pub deployments: u64,
}

impl PlannedAllocation {
    /// `replicas` pods of `spec`, from one new or scaled deployment.
    #[must_use]
    pub fn for_workload(spec: &ResourceSpec, replicas: u64, new_deployment: bool) -> Self {
        Self {
            requests_cpu_m: spec.cpu_request_m().saturating_mul(replicas),
            limits_cpu_m: spec.cpu_limit_m().saturating_mul(replicas),
            requests_mem_mi: spec.memory_request_mi().saturating_mul(replicas),
            limits_mem_mi: spec.memory_limit_mi().saturating_mul(replicas),
            pods: replicas,
            deployments: u64::from(new_deployment),
        }
    }

    /// The logical-quota view of this allocation.
    #[must_use]
    pub fn as_usage(&self, apps: u64) -> PlannedUsage {
        PlannedUsage {
            apps,
            pods: self.pods,
            cpu_m: self.requests_cpu_m,
            mem_mi: self.requests_mem_mi,
        }
    }
}

impl std::ops::AddAssign for PlannedAllocation {
    fn add_assign(&mut self, other: Self) {
        self.requests_cpu_m = self.requests_cpu_m.saturating_add(other.requests_cpu_m);
        self.limits_cpu_m = self.limits_cpu_m.saturating_add(other.limits_cpu_m);
        self.requests_mem_mi = self.requests_mem_mi.saturating_add(other.requests_mem_mi);
        self.limits_mem_mi = self.limits_mem_mi.saturating_add(other.limits_mem_mi);
        self.pods = self.pods.saturating_add(other.pods);
        self.deployments = self.deployments.saturating_add(other.deployments);
    }
}

#[derive(Debug, Clone, Copy)]
enum Unit {
    Millicores,
    Mebibytes,
    Count,
}

impl Unit {
    fn parse(self, quantity: &Quantity) -> Option<u64> {
        match self {
            Self::Millicores => units::quantity_millicores(quantity),
            Self::Mebibytes => units::quantity_mebibytes(quantity),
            Self::Count => units::quantity_count(quantity),
        }
    }
}

/// Quota keys checked, with their aliases, in report order.
const DIMENSIONS: &[(&[&str], Unit)] = &[
    (&["requests.cpu", "cpu"], Unit::Millicores),
    (&["limits.cpu"], Unit::Millicores),
    (&["requests.memory", "memory"], Unit::Mebibytes),
    (&["limits.memory"], Unit::Mebibytes),
    (&["pods"], Unit::Count),
    (&["count/deployments.apps"], Unit::Count),
];

fn planned_for(planned: &PlannedAllocation, key: &str) -> u64 {
    match key {
        "requests.cpu" | "cpu" => planned.requests_cpu_m,
        "limits.cpu" => planned.limits_cpu_m,
        "requests.memory" | "memory" => planned.requests_mem_mi,
        "limits.memory" => planned.limits_mem_mi,
        "pods" => planned.pods,
        "count/deployments.apps" => planned.deployments,
        _ => 0,
    }
}

/// Violations of one `ResourceQuota`. Dimensions the operation does not add to
/// are never reported.
#[must_use]
pub fn evaluate_quota(quota: &ResourceQuota, planned: &PlannedAllocation) -> Vec<QuotaViolation> {
    let name = quota.metadata.name.clone().unwrap_or_default();
    let empty = BTreeMap::new();
    let status = quota.status.as_ref();
    let hard = status
        .and_then(|s| s.hard.as_ref())
        .or_else(|| quota.spec.as_ref().and_then(|s| s.hard.as_ref()))
        .unwrap_or(&empty);
    let used = status.and_then(|s| s.used.as_ref()).unwrap_or(&empty);

    let mut violations = Vec::new();
    for (keys, unit) in DIMENSIONS {
        for key in *keys {
            let Some(hard_quantity) = hard.get(*key) else {
                continue;
            };
            let Some(limit) = unit.parse(hard_quantity) else {
                warn!(quota = %name, key = %key, value = %hard_quantity.0, "Unparseable hard limit, not enforced");
                continue;
            };
            let planned = planned_for(planned, key);
            if planned == 0 {
                continue;
            }
            let current = match used.get(*key) {
                Some(quantity) => unit.parse(quantity).unwrap_or_else(|| {
                    warn!(quota = %name, key = %key, value = %quantity.0, "Unparseable quota usage, counting zero");
                    0
                }),
                None => 0,
            };
            if current.saturating_add(planned) > limit {
                violations.push(QuotaViolation::cluster(&name, key, current, planned, limit));
            }
        }
    }
    violations
}

/// Checks a planned allocation against the namespace's `ResourceQuota` objects so
/// the caller gets an itemized error instead of an admission rejection.
pub struct PreflightQuotaChecker<C> {
    cluster: Arc<C>,
}

impl<C: ClusterClient> PreflightQuotaChecker<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    #[instrument(skip(self, planned), fields(namespace = %namespace))]
    pub async fn check(&self, namespace: &str, planned: &PlannedAllocation) -> Result<()> {
        let quotas = match self.cluster.list::<ResourceQuota>(namespace, None).await {
            Ok(quotas) => quotas,
            Err(ClusterError::Forbidden(reason)) => {
                debug!(%reason, "Cannot read ResourceQuotas, skipping preflight check");
                return Ok(());
            }
            Err(ClusterError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let violations: Vec<QuotaViolation> = quotas
            .iter()
            .flat_map(|quota| evaluate_quota(quota, planned))
            .collect();
        if violations.is_empty() {
            debug!(quotas = quotas.len(), "Preflight quota check passed");
            return Ok(());
        }
        info!(
            violations = violations.len(),
            "Planned allocation exceeds namespace ResourceQuota"
        );
        Err(Error::Quota { violations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, Verb};
    use crate::quota::QuotaScope;
    use serde_json::json;

    fn quota(name: &str, hard: serde_json::Value, used: serde_json::Value) -> ResourceQuota {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ResourceQuota",
            "metadata": { "name": name },
            "spec": { "hard": hard },
            "status": { "hard": hard, "used": used }
        }))
        .unwrap()
    }

    fn planned() -> PlannedAllocation {
        PlannedAllocation {
            requests_cpu_m: 500,
            limits_cpu_m: 1000,
            requests_mem_mi: 512,
            limits_mem_mi: 1024,
            pods: 2,
            deployments: 1,
        }
    }

    #[test]
    fn reports_each_exceeded_dimension() {
        let q = quota(
            "compute",
            json!({ "requests.cpu": "2", "limits.memory": "2Gi", "pods": "4" }),
            json!({ "requests.cpu": "1600m", "limits.memory": "1Gi", "pods": "3" }),
        );
        let violations = evaluate_quota(&q, &planned());
        let dims: Vec<_> = violations.iter().map(|v| v.dimension.as_str()).collect();
        assert_eq!(dims, vec!["requests.cpu", "pods"]);
        assert_eq!(
            violations[0].scope,
            QuotaScope::Cluster {
                quota: "compute".to_string()
            }
        );
        assert_eq!(
            violations[0].to_string(),
            "requests.cpu: 2100/2000 (ResourceQuota compute)"
        );
    }

    #[test]
    fn falls_back_to_spec_hard_and_aliases() {
        let q: ResourceQuota = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ResourceQuota",
            "metadata": { "name": "legacy" },
            "spec": { "hard": { "cpu": "500m", "memory": "512Mi" } }
        }))
        .unwrap();
        // Equality passes.
        assert!(evaluate_quota(&q, &planned()).is_empty());
        let bigger = PlannedAllocation {
            requests_mem_mi: 513,
            ..planned()
        };
        assert_eq!(evaluate_quota(&q, &bigger)[0].dimension, "memory");
    }

    #[test]
    fn huge_allocations_saturate_and_still_violate() {
        let mut total = PlannedAllocation {
            requests_cpu_m: u64::MAX - 1,
            ..planned()
        };
        total += planned();
        assert_eq!(total.requests_cpu_m, u64::MAX);
        assert_eq!(total.pods, 4);

        let q = quota("compute", json!({ "requests.cpu": "2" }), json!({ "requests.cpu": "1" }));
        let violations = evaluate_quota(&q, &total);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].dimension, "requests.cpu");
    }

    #[test]
    fn byte_valued_memory_limits_are_enforced() {
        let q = quota(
            "memory",
            json!({ "requests.memory": "1073741824" }),
            json!({ "requests.memory": "0" }),
        );
        let two_gib = PlannedAllocation {
            requests_mem_mi: 2048,
            ..planned()
        };
        let violations = evaluate_quota(&q, &two_gib);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].limit, 1024);
        assert!(evaluate_quota(&q, &planned()).is_empty());
    }

    #[test]
    fn exponent_limits_are_enforced() {
        let q = quota(
            "cpu",
            json!({ "requests.cpu": "1e3m" }),
            json!({ "requests.cpu": "0" }),
        );
        let two_cores = PlannedAllocation {
            requests_cpu_m: 2000,
            ..planned()
        };
        let violations = evaluate_quota(&q, &two_cores);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].limit, 1000);
    }

    #[tokio::test]
    async fn aggregates_across_quota_objects() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .insert("lab-7", &quota("pods", json!({ "pods": "2" }), json!({ "pods": "1" })))
            .unwrap();
        cluster
            .insert(
                "lab-7",
                &quota(
                    "deployments",
                    json!({ "count/deployments.apps": "3" }),
                    json!({ "count/deployments.apps": "3" }),
                ),
            )
            .unwrap();
        let err = PreflightQuotaChecker::new(cluster)
            .check("lab-7", &planned())
            .await
            .unwrap_err();
        match err {
            Error::Quota { violations } => assert_eq!(violations.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn forbidden_listing_skips_check() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .insert("lab-7", &quota("pods", json!({ "pods": "0" }), json!({})))
            .unwrap();
        cluster.fail_on(
            Verb::List,
            "ResourceQuota",
            ClusterError::Forbidden("resourcequotas is forbidden".to_string()),
        );
        PreflightQuotaChecker::new(cluster)
            .check("lab-7", &planned())
            .await
            .unwrap();
    }

    #[test]
    fn allocation_for_workload() {
        let spec = ResourceSpec {
            cpu_request: "250m".to_string(),
            cpu_limit: "500m".to_string(),
            memory_request: "256Mi".to_string(),
            memory_limit: "1Gi".to_string(),
            replicas: 2,
        };
        let mut total = PlannedAllocation::for_workload(&spec, 2, true);
        total += PlannedAllocation::for_workload(&spec, 1, false);
        assert_eq!(total.requests_cpu_m, 750);
        assert_eq!(total.limits_mem_mi, 3072);
        assert_eq!(total.pods, 3);
        assert_eq!(total.deployments, 1);
        assert_eq!(total.as_usage(1).cpu_m, 750);
    }
}
