//! Manifest builders. Pure functions from a plan to typed objects; nothing here
//! talks to the cluster.

use super::stacks::ComponentPlan;
use super::DatabaseCredentials;
use crate::error::Result;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use serde_json::json;
use std::collections::BTreeMap;

/// How a service is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceExposure {
    ClusterIp,
    NodePort,
}

impl ServiceExposure {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterIp => "ClusterIP",
            Self::NodePort => "NodePort",
        }
    }
}

/// Backing for the database data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataVolume {
    Claim(String),
    EmptyDir,
}

pub fn secret(
    name: &str,
    labels: &BTreeMap<String, String>,
    credentials: &DatabaseCredentials,
) -> Result<Secret> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": name,
            "labels": labels
        },
        "type": "Opaque",
        "stringData": credentials.string_data()
    }))?)
}

pub fn persistent_volume_claim(
    name: &str,
    labels: &BTreeMap<String, String>,
    size: &str,
    storage_class: Option<&str>,
) -> Result<PersistentVolumeClaim> {
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": {
            "requests": {
                "storage": size
            }
        }
    });
    if let Some(class) = storage_class {
        spec["storageClassName"] = json!(class);
    }

    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
            "labels": labels
        },
        "spec": spec
    }))?)
}

pub fn service(
    plan: &ComponentPlan,
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
    exposure: ServiceExposure,
) -> Result<Service> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": plan.service_name,
            "labels": labels
        },
        "spec": {
            "type": exposure.as_str(),
            "selector": selector,
            "ports": [{
                "name": "http",
                "port": plan.port,
                "targetPort": plan.port,
                "protocol": "TCP"
            }]
        }
    }))?)
}

pub fn deployment(
    plan: &ComponentPlan,
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
    data: Option<&DataVolume>,
) -> Result<Deployment> {
    let mut pod_labels = labels.clone();
    pod_labels.extend(selector.clone());

    let mut container = json!({
        "name": plan.kind.as_str(),
        "image": plan.image,
        "ports": [{
            "containerPort": plan.port,
            "protocol": "TCP"
        }],
        "env": plan.env,
        "resources": {
            "requests": {
                "cpu": plan.resources.cpu_request,
                "memory": plan.resources.memory_request
            },
            "limits": {
                "cpu": plan.resources.cpu_limit,
                "memory": plan.resources.memory_limit
            }
        }
    });

    let mut volumes = Vec::new();
    if let (Some(path), Some(volume)) = (plan.data_path, data) {
        container["volumeMounts"] = json!([{
            "name": plan.volume_name(),
            "mountPath": path
        }]);
        volumes.push(match volume {
            DataVolume::Claim(claim) => json!({
                "name": plan.volume_name(),
                "persistentVolumeClaim": { "claimName": claim }
            }),
            DataVolume::EmptyDir => json!({
                "name": plan.volume_name(),
                "emptyDir": {}
            }),
        });
    }

    // RWO volumes cannot be shared between old and new pods.
    let strategy = if plan.data_path.is_some() {
        json!({ "type": "Recreate" })
    } else {
        json!({ "type": "RollingUpdate" })
    };

    Ok(serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": plan.deployment_name,
            "labels": labels
        },
        "spec": {
            "replicas": plan.replicas,
            "strategy": strategy,
            "selector": {
                "matchLabels": selector
            },
            "template": {
                "metadata": {
                    "labels": pod_labels
                },
                "spec": {
                    "containers": [container],
                    "volumes": volumes
                }
            }
        }
    }))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clamp::ResourceSpec;
    use crate::provision::ComponentKind;

    fn plan(kind: ComponentKind, data_path: Option<&'static str>) -> ComponentPlan {
        ComponentPlan {
            kind,
            deployment_name: format!("blog-{kind}"),
            service_name: format!("blog-{kind}-service"),
            image: "mariadb:10.11".to_string(),
            port: kind.default_port(),
            replicas: 1,
            resources: ResourceSpec {
                cpu_request: "250m".to_string(),
                cpu_limit: "500m".to_string(),
                memory_request: "256Mi".to_string(),
                memory_limit: "512Mi".to_string(),
                replicas: 1,
            },
            env: vec![json!({ "name": "MARIADB_DATABASE", "value": "wordpress" })],
            data_path,
        }
    }

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([("managed-by".to_string(), "lab-orchestrator".to_string())])
    }

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "blog".to_string()),
            ("component".to_string(), "mariadb".to_string()),
        ])
    }

    #[test]
    fn database_deployment_mounts_claim() {
        let d = deployment(
            &plan(ComponentKind::MariaDb, Some("/var/lib/mysql")),
            &labels(),
            &selector(),
            Some(&DataVolume::Claim("blog-pvc".to_string())),
        )
        .unwrap();
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("Recreate"));
        let pod = spec.template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "blog-pvc"
        );
        let container = &pod.containers[0];
        assert_eq!(container.volume_mounts.as_ref().unwrap()[0].mount_path, "/var/lib/mysql");
        let labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(labels.get("component").map(String::as_str), Some("mariadb"));
        assert_eq!(labels.get("managed-by").map(String::as_str), Some("lab-orchestrator"));
    }

    #[test]
    fn ephemeral_database_uses_empty_dir() {
        let d = deployment(
            &plan(ComponentKind::MariaDb, Some("/var/lib/mysql")),
            &labels(),
            &selector(),
            Some(&DataVolume::EmptyDir),
        )
        .unwrap();
        let volumes = d.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert!(volumes[0].empty_dir.is_some());
    }

    #[test]
    fn service_and_claim() {
        let svc = service(
            &plan(ComponentKind::WordPress, None),
            &labels(),
            &selector(),
            ServiceExposure::NodePort,
        )
        .unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.ports.unwrap()[0].port, 80);

        let pvc = persistent_volume_claim("blog-pvc", &labels(), "1Gi", Some("local-path")).unwrap();
        assert_eq!(
            pvc.spec.unwrap().storage_class_name.as_deref(),
            Some("local-path")
        );
    }

    #[test]
    fn secret_uses_string_data() {
        let creds = DatabaseCredentials {
            database: "wordpress".to_string(),
            username: "wordpress".to_string(),
            password: "p".to_string(),
            root_password: "r".to_string(),
        };
        let s = secret("blog-db-secret", &labels(), &creds).unwrap();
        let data = s.string_data.unwrap();
        assert_eq!(data.get("root-password").map(String::as_str), Some("r"));
        assert!(s.data.is_none());
    }
}
