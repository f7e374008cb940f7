//! Pause, resume and quota enforcement across operations.

mod common;

use common::{admin, alice, bob, lab, lab_with_overrides, tight_quota_for_alice};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ResourceQuota;
use lab_orchestrator::lifecycle::{ComponentState, StackState};
use lab_orchestrator::orchestrator::ResourceRequest;
use lab_orchestrator::quota::QuotaScope;
use lab_orchestrator::{CreateRequest, Error, ErrorKind, WorkloadType};
use serde_json::json;

fn custom(name: &str, cpu: &str, memory: &str, replicas: i32) -> CreateRequest {
    let mut request = CreateRequest::new(name, WorkloadType::Custom);
    request.image = Some("nginx:1.27".to_string());
    request.resources = ResourceRequest {
        cpu_request: Some(cpu.to_string()),
        memory_request: Some(memory.to_string()),
        replicas: Some(replicas),
        ..ResourceRequest::default()
    };
    request
}

fn wordpress(replicas: i32) -> CreateRequest {
    let mut request = CreateRequest::new("blog", WorkloadType::WordPress);
    request.resources.replicas = Some(replicas);
    request
}

fn annotation(deployment: &Deployment, key: &str) -> Option<String> {
    deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key).cloned())
}

#[tokio::test]
async fn pause_is_idempotent_and_remembers_replicas() {
    let lab = lab();
    lab.orchestrator.create(&alice(), wordpress(2)).await.unwrap();

    let first = lab.orchestrator.pause("lab-7", "blog", &alice()).await.unwrap();
    assert_eq!(first.summary.state, StackState::Paused);
    assert!(first.components.iter().all(|c| !c.already_paused));
    assert!(first
        .components
        .iter()
        .all(|c| c.paused_by.as_deref() == Some("alice")));

    let second = lab.orchestrator.pause("lab-7", "blog", &alice()).await.unwrap();
    assert!(second.components.iter().all(|c| c.already_paused));

    let web: Deployment = lab.cluster.object("lab-7", "blog-wordpress").unwrap();
    assert_eq!(web.spec.unwrap().replicas, Some(0));
    let web: Deployment = lab.cluster.object("lab-7", "blog-wordpress").unwrap();
    assert_eq!(
        annotation(&web, "lab-orchestrator/saved-replicas").as_deref(),
        Some("2")
    );
    let db: Deployment = lab.cluster.object("lab-7", "blog-mariadb").unwrap();
    assert_eq!(
        annotation(&db, "lab-orchestrator/saved-replicas").as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn resume_restores_replicas_and_clears_annotations() {
    let lab = lab();
    lab.orchestrator.create(&alice(), wordpress(2)).await.unwrap();
    lab.orchestrator.pause("lab-7", "blog", &alice()).await.unwrap();

    let resumed = lab.orchestrator.resume("lab-7", "blog", &alice()).await.unwrap();
    assert_eq!(resumed.summary.state, StackState::Running);
    assert!(resumed
        .components
        .iter()
        .all(|c| c.state == ComponentState::Running));

    let web: Deployment = lab.cluster.object("lab-7", "blog-wordpress").unwrap();
    for key in [
        "lab-orchestrator/paused",
        "lab-orchestrator/saved-replicas",
        "lab-orchestrator/paused-by",
        "lab-orchestrator/paused-at",
    ] {
        assert_eq!(annotation(&web, key), None, "{key} should be cleared");
    }
    assert_eq!(web.spec.unwrap().replicas, Some(2));

    let again = lab.orchestrator.resume("lab-7", "blog", &alice()).await.unwrap();
    assert!(again.components.iter().all(|c| c.already_running));
}

#[tokio::test]
async fn only_owner_or_admin_may_pause() {
    let lab = lab();
    lab.orchestrator.create(&alice(), wordpress(1)).await.unwrap();

    let err = lab
        .orchestrator
        .pause("lab-7", "blog", &bob())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);

    let paused = lab.orchestrator.pause("lab-7", "blog", &admin()).await.unwrap();
    assert!(paused
        .components
        .iter()
        .all(|c| c.paused_by.as_deref() == Some("root")));

    let status = lab.orchestrator.status("lab-7", "blog", &alice()).await.unwrap();
    assert_eq!(status.summary.paused, 2);
    assert_eq!(status.stack_name.as_deref(), Some("blog"));
}

#[tokio::test]
async fn quota_counts_existing_workloads() {
    let lab = lab_with_overrides(tight_quota_for_alice());
    lab.orchestrator
        .create(&alice(), custom("api", "250m", "512Mi", 2))
        .await
        .unwrap();

    let err = lab
        .orchestrator
        .create(&alice(), custom("worker", "300m", "256Mi", 2))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cpu_m: 1100/1000"), "{err}");
    assert!(lab.cluster.object::<Deployment>("lab-7", "worker").is_none());

    lab.orchestrator
        .create(&alice(), custom("worker", "200m", "450Mi", 2))
        .await
        .unwrap();
    let usage = lab.orchestrator.usage_summary(&alice()).await.unwrap();
    assert_eq!(usage.usage.apps_used, 2);
    assert_eq!(usage.usage.pods_used, 4);
    assert_eq!(usage.usage.cpu_m_used, 900);
}

#[tokio::test]
async fn resume_blocked_by_quota_leaves_app_paused() {
    let lab = lab_with_overrides(tight_quota_for_alice());
    lab.orchestrator
        .create(&alice(), custom("api", "250m", "256Mi", 2))
        .await
        .unwrap();
    lab.orchestrator.pause("lab-7", "api", &alice()).await.unwrap();
    lab.orchestrator
        .create(&alice(), custom("worker", "300m", "256Mi", 2))
        .await
        .unwrap();

    let err = lab
        .orchestrator
        .resume("lab-7", "api", &alice())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Quota);

    let status = lab.orchestrator.status("lab-7", "api", &alice()).await.unwrap();
    assert_eq!(status.summary.state, StackState::Paused);
}

#[tokio::test]
async fn namespace_resource_quota_is_checked_before_create() {
    let lab = lab();
    let quota: ResourceQuota = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ResourceQuota",
        "metadata": { "name": "lab-quota" },
        "spec": { "hard": { "pods": "1" } }
    }))
    .unwrap();
    lab.cluster.insert("lab-7", &quota).unwrap();

    let err = lab
        .orchestrator
        .create(&alice(), custom("api", "100m", "128Mi", 2))
        .await
        .unwrap_err();
    match err {
        Error::Quota { violations } => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].dimension, "pods");
            assert_eq!(
                violations[0].scope,
                QuotaScope::Cluster {
                    quota: "lab-quota".to_string()
                }
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(lab.cluster.names::<Deployment>("lab-7").is_empty());
}

#[tokio::test]
async fn status_distinguishes_starting_components() {
    let lab = lab();
    lab.orchestrator.create(&alice(), wordpress(2)).await.unwrap();
    lab.cluster.set_deployment_status("lab-7", "blog-wordpress", 1, 1);

    let status = lab.orchestrator.status("lab-7", "blog", &alice()).await.unwrap();
    assert_eq!(status.summary.state, StackState::Mixed);
    assert_eq!(status.summary.running, 1);
    assert_eq!(status.summary.starting, 1);
    let web = status
        .components
        .iter()
        .find(|c| c.name == "blog-wordpress")
        .unwrap();
    assert_eq!(web.state, ComponentState::Starting);
    assert_eq!(web.ready_replicas, 1);
}
