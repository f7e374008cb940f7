//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use lab_orchestrator::collaborators::{InMemoryCatalog, StaticOverrides};
use lab_orchestrator::quota::QuotaOverride;
use lab_orchestrator::{
    DeploymentOrchestrator, InMemoryCluster, OrchestratorConfig, QuotaLimits, Role, UserIdentity,
};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Lab {
    pub cluster: Arc<InMemoryCluster>,
    pub orchestrator: DeploymentOrchestrator<InMemoryCluster>,
}

/// A cluster with a default storage class and one ingress class, where
/// deployments become ready as soon as they are scaled.
pub fn lab() -> Lab {
    lab_with_overrides(HashMap::new())
}

pub fn lab_with_overrides(overrides: HashMap<String, QuotaOverride>) -> Lab {
    let cluster = Arc::new(InMemoryCluster::new().with_rollout_simulation());
    cluster.add_storage_class("local-path", true);
    cluster.add_ingress_class("nginx");
    let orchestrator = DeploymentOrchestrator::new(
        cluster.clone(),
        Arc::new(OrchestratorConfig::default()),
        Arc::new(StaticOverrides::new(overrides)),
        Arc::new(InMemoryCatalog::new()),
    );
    Lab {
        cluster,
        orchestrator,
    }
}

/// Override capping alice at one core and 2Gi of requests.
pub fn tight_quota_for_alice() -> HashMap<String, QuotaOverride> {
    HashMap::from([(
        "7".to_string(),
        QuotaOverride {
            limits: QuotaLimits {
                max_apps: 3,
                max_pods: 6,
                max_requests_cpu_m: 1000,
                max_requests_mem_mi: 2048,
            },
            expires_at: None,
        },
    )])
}

pub fn alice() -> UserIdentity {
    UserIdentity::new("7", "alice", Role::Student)
}

pub fn bob() -> UserIdentity {
    UserIdentity::new("8", "bob", Role::Student)
}

pub fn admin() -> UserIdentity {
    UserIdentity::new("1", "root", Role::Admin)
}
