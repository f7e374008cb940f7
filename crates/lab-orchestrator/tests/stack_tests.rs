//! Stack provisioning and teardown against the in-memory cluster.

mod common;

use common::{admin, alice, bob, lab};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use lab_orchestrator::cluster::{ClusterError, Verb};
use lab_orchestrator::orchestrator::ResourceRequest;
use lab_orchestrator::provision::{DatabaseCredentials, StorageMode};
use lab_orchestrator::{CreateRequest, Error, ErrorKind, ProvisionResult, StackCredentials, WorkloadType};
use serde_json::json;

fn custom(name: &str) -> CreateRequest {
    let mut request = CreateRequest::new(name, WorkloadType::Custom);
    request.image = Some("nginx:1.27".to_string());
    request
}

#[tokio::test]
async fn wordpress_stack_is_fully_labeled() {
    let lab = lab();
    let outcome = lab
        .orchestrator
        .create(&alice(), CreateRequest::new("blog", WorkloadType::WordPress))
        .await
        .unwrap();

    assert_eq!(outcome.namespace, "lab-7");
    assert_eq!(outcome.resources_applied.len(), 7);
    match &outcome.result {
        ProvisionResult::Stack {
            stack_name,
            storage,
            components,
            ..
        } => {
            assert_eq!(stack_name, "blog");
            assert_eq!(
                storage,
                &StorageMode::Persistent {
                    claim: "blog-pvc".to_string()
                }
            );
            assert_eq!(components.len(), 2);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    for name in ["blog-mariadb", "blog-wordpress"] {
        let d: Deployment = lab.cluster.object("lab-7", name).unwrap();
        let labels = d.metadata.labels.unwrap();
        assert_eq!(labels["managed-by"], "lab-orchestrator");
        assert_eq!(labels["stack-name"], "blog");
        assert_eq!(labels["user-id"], "7");
        assert_eq!(labels["owner"], "alice");
        assert_eq!(labels["app-type"], "wordpress");
    }
    let ingress: Ingress = lab.cluster.object("lab-7", "blog-ingress").unwrap();
    let rules = ingress.spec.unwrap().rules.unwrap();
    assert_eq!(rules[0].host.as_deref(), Some("blog-7.lab.local"));
}

#[tokio::test]
async fn lamp_stack_returns_lamp_credentials() {
    let lab = lab();
    let teacher = lab_orchestrator::UserIdentity::new("42", "prof", lab_orchestrator::Role::Teacher);
    let outcome = lab
        .orchestrator
        .create(&teacher, CreateRequest::new("shop", WorkloadType::Lamp))
        .await
        .unwrap();
    match outcome.credentials {
        Some(StackCredentials::Lamp { db_host, database }) => {
            assert_eq!(db_host, "shop-mysql-service");
            assert_eq!(database.database, "app");
        }
        other => panic!("unexpected credentials: {other:?}"),
    }
    assert_eq!(lab.cluster.names::<Deployment>("lab-42").len(), 3);
    // Web and phpMyAdmin get routes; the database does not.
    assert_eq!(
        lab.cluster.names::<Ingress>("lab-42"),
        vec!["shop-ingress", "shop-phpmyadmin-ingress"]
    );
}

#[tokio::test]
async fn existing_secret_keeps_its_credentials() {
    let lab = lab();
    let original: Secret = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": "blog-db-secret" },
        "stringData": {
            "database": "wordpress",
            "username": "wordpress",
            "password": "original-password",
            "root-password": "original-root"
        }
    }))
    .unwrap();
    lab.cluster.insert("lab-7", &original).unwrap();

    let outcome = lab
        .orchestrator
        .create(&alice(), CreateRequest::new("blog", WorkloadType::WordPress))
        .await
        .unwrap();
    let returned = outcome.credentials.unwrap();
    assert_eq!(returned.database().password, "original-password");
    assert_eq!(returned.database().root_password, "original-root");

    let stored: Secret = lab.cluster.object("lab-7", "blog-db-secret").unwrap();
    assert_eq!(
        DatabaseCredentials::from_secret(&stored).unwrap().password,
        "original-password"
    );
    assert_eq!(
        stored.metadata.labels.unwrap()["managed-by"],
        "lab-orchestrator"
    );
}

#[tokio::test]
async fn delete_keeps_persistent_objects_by_default() {
    let lab = lab();
    lab.orchestrator
        .create(&alice(), CreateRequest::new("blog", WorkloadType::WordPress))
        .await
        .unwrap();
    lab.orchestrator.create(&alice(), custom("api")).await.unwrap();

    let outcome = lab
        .orchestrator
        .delete("lab-7", "blog", &alice(), true, false)
        .await
        .unwrap();
    assert_eq!(
        outcome.deleted,
        vec![
            "Deployment/blog-mariadb",
            "Deployment/blog-wordpress",
            "Service/blog-mariadb-service",
            "Service/blog-wordpress-service",
            "Ingress/blog-ingress",
        ]
    );
    assert_eq!(lab.cluster.names::<Deployment>("lab-7"), vec!["api"]);
    assert_eq!(lab.cluster.names::<Service>("lab-7"), vec!["api-service"]);
    assert_eq!(lab.cluster.names::<Secret>("lab-7"), vec!["blog-db-secret"]);
    assert_eq!(
        lab.cluster.names::<PersistentVolumeClaim>("lab-7"),
        vec!["blog-pvc"]
    );
}

#[tokio::test]
async fn delete_persistent_removes_claim_and_secret() {
    let lab = lab();
    lab.orchestrator
        .create(&alice(), CreateRequest::new("blog", WorkloadType::WordPress))
        .await
        .unwrap();
    let outcome = lab
        .orchestrator
        .delete("lab-7", "blog", &alice(), true, true)
        .await
        .unwrap();
    assert!(outcome.deleted.contains(&"PersistentVolumeClaim/blog-pvc".to_string()));
    assert!(outcome.deleted.contains(&"Secret/blog-db-secret".to_string()));
    assert!(lab.cluster.names::<Secret>("lab-7").is_empty());

    let err = lab
        .orchestrator
        .status("lab-7", "blog", &alice())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn delete_without_services_leaves_them() {
    let lab = lab();
    lab.orchestrator.create(&alice(), custom("api")).await.unwrap();
    let outcome = lab
        .orchestrator
        .delete("lab-7", "api", &alice(), false, false)
        .await
        .unwrap();
    assert_eq!(outcome.deleted, vec!["Deployment/api"]);
    assert_eq!(lab.cluster.names::<Service>("lab-7"), vec!["api-service"]);
}

#[tokio::test]
async fn other_users_cannot_delete() {
    let lab = lab();
    lab.orchestrator
        .create(&alice(), CreateRequest::new("blog", WorkloadType::WordPress))
        .await
        .unwrap();
    let err = lab
        .orchestrator
        .delete("lab-7", "blog", &bob(), true, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert_eq!(lab.cluster.names::<Deployment>("lab-7").len(), 2);

    let outcome = lab
        .orchestrator
        .delete("lab-7", "blog", &admin(), true, true)
        .await
        .unwrap();
    assert_eq!(outcome.deleted.len(), 7);
}

#[tokio::test]
async fn failed_stack_reports_progress_and_converges_on_retry() {
    let lab = lab();
    lab.cluster.fail_on_named(
        Verb::Create,
        "Deployment",
        "blog-wordpress",
        ClusterError::Api {
            status: 500,
            reason: "InternalError".to_string(),
            message: "etcdserver: request timed out".to_string(),
        },
    );
    let err = lab
        .orchestrator
        .create(&alice(), CreateRequest::new("blog", WorkloadType::WordPress))
        .await
        .unwrap_err();
    match &err {
        Error::PartialStack {
            affected, failed, ..
        } => {
            assert_eq!(failed, "Deployment/blog-wordpress");
            assert_eq!(
                affected,
                &vec![
                    "Secret/blog-db-secret".to_string(),
                    "PersistentVolumeClaim/blog-pvc".to_string(),
                    "Service/blog-mariadb-service".to_string(),
                    "Service/blog-wordpress-service".to_string(),
                    "Deployment/blog-mariadb".to_string(),
                ]
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_retryable());

    lab.cluster.clear_failures();
    let outcome = lab
        .orchestrator
        .create(&alice(), CreateRequest::new("blog", WorkloadType::WordPress))
        .await
        .unwrap();
    let created: Vec<bool> = outcome
        .result
        .components()
        .iter()
        .map(|c| c.created)
        .collect();
    assert_eq!(created, vec![false, true]);
}

#[tokio::test]
async fn bare_memory_values_reach_the_cluster_as_mebibytes() {
    let lab = lab();
    let mut request = custom("api");
    request.resources = ResourceRequest {
        cpu_request: Some("0.5".to_string()),
        memory_request: Some("512".to_string()),
        memory_limit: Some("512".to_string()),
        ..ResourceRequest::default()
    };
    lab.orchestrator.create(&alice(), request).await.unwrap();

    let deployment: Deployment = lab.cluster.object("lab-7", "api").unwrap();
    let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
    let resources = container.resources.as_ref().unwrap();
    let requests = resources.requests.as_ref().unwrap();
    let limits = resources.limits.as_ref().unwrap();
    assert_eq!(requests["memory"].0, "512Mi");
    assert_eq!(limits["memory"].0, "512Mi");
    assert_eq!(requests["cpu"].0, "500m");

    let usage = lab.orchestrator.usage_summary(&alice()).await.unwrap();
    assert_eq!(usage.usage.mem_mi_used, 512);
}

#[tokio::test]
async fn stack_cannot_take_over_another_apps_objects() {
    let lab = lab();
    lab.orchestrator
        .create(&alice(), custom("blog-mariadb"))
        .await
        .unwrap();

    let err = lab
        .orchestrator
        .create(&alice(), CreateRequest::new("blog", WorkloadType::WordPress))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("already in use"), "{err}");

    assert_eq!(lab.cluster.names::<Deployment>("lab-7"), vec!["blog-mariadb"]);
    assert!(lab.cluster.names::<Secret>("lab-7").is_empty());
    let kept: Deployment = lab.cluster.object("lab-7", "blog-mariadb").unwrap();
    let labels = kept.metadata.labels.unwrap();
    assert_eq!(labels["app-type"], "custom");
    assert!(!labels.contains_key("stack-name"));

    let usage = lab.orchestrator.usage_summary(&alice()).await.unwrap();
    assert_eq!(usage.usage.apps_used, 1);
}
