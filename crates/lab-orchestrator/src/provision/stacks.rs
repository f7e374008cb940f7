//! Per-shape component plans.
//!
//! A [`StackPlan`] is everything the provisioner needs to emit manifests: names,
//! images, ports, environment and which component owns the data volume. Database
//! credentials live in the stack secret and reach containers through
//! `secretKeyRef`, so a secret that already exists keeps working unchanged.

use super::{ComponentKind, DatabaseCredentials, WorkloadType};
use crate::clamp::ResourceSpec;
use crate::config::ImagesConfig;
use crate::error::{Error, Result};
use crate::naming::ResourceNaming;
use k8s_openapi::api::core::v1::Secret;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const SECRET_KEY_DATABASE: &str = "database";
pub const SECRET_KEY_USERNAME: &str = "username";
pub const SECRET_KEY_PASSWORD: &str = "password";
pub const SECRET_KEY_ROOT_PASSWORD: &str = "root-password";

const PASSWORD_LENGTH: usize = 24;
const DATA_VOLUME: &str = "data";
const MYSQL_DATA_PATH: &str = "/var/lib/mysql";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentPlan {
    pub kind: ComponentKind,
    pub deployment_name: String,
    pub service_name: String,
    pub image: String,
    pub port: i32,
    pub replicas: i32,
    pub resources: ResourceSpec,
    /// Container `env` entries, already in API shape.
    pub env: Vec<Value>,
    /// Mount point of the stack data volume, for the database component.
    pub data_path: Option<&'static str>,
}

impl ComponentPlan {
    #[must_use]
    pub fn volume_name(&self) -> &'static str {
        DATA_VOLUME
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackPlan {
    pub name: String,
    pub workload_type: WorkloadType,
    pub components: Vec<ComponentPlan>,
    pub secret_name: Option<String>,
    pub claim_name: Option<String>,
    #[serde(skip)]
    pub credentials: Option<DatabaseCredentials>,
}

/// Inputs for a single custom container.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomContainer {
    pub image: String,
    pub port: i32,
    pub env: BTreeMap<String, String>,
}

impl DatabaseCredentials {
    /// Fresh credentials for a new stack.
    #[must_use]
    pub fn generate(workload_type: WorkloadType, app: &str) -> Self {
        let (database, username) = match workload_type {
            WorkloadType::WordPress => ("wordpress".to_string(), "wordpress".to_string()),
            WorkloadType::MySql => (app.replace('-', "_"), "labuser".to_string()),
            WorkloadType::Lamp | WorkloadType::Custom => ("app".to_string(), "app".to_string()),
        };
        Self {
            database,
            username,
            password: random_password(),
            root_password: random_password(),
        }
    }

    /// Credentials stored in an existing stack secret.
    #[must_use]
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let read = |key: &str| -> Option<String> {
            if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
                return String::from_utf8(value.0.clone()).ok();
            }
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(key))
                .cloned()
        };
        Some(Self {
            database: read(SECRET_KEY_DATABASE)?,
            username: read(SECRET_KEY_USERNAME)?,
            password: read(SECRET_KEY_PASSWORD)?,
            root_password: read(SECRET_KEY_ROOT_PASSWORD)?,
        })
    }

    /// `stringData` for the stack secret.
    #[must_use]
    pub fn string_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (SECRET_KEY_DATABASE.to_string(), self.database.clone()),
            (SECRET_KEY_USERNAME.to_string(), self.username.clone()),
            (SECRET_KEY_PASSWORD.to_string(), self.password.clone()),
            (SECRET_KEY_ROOT_PASSWORD.to_string(), self.root_password.clone()),
        ])
    }
}

fn random_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

fn secret_env(name: &str, secret: &str, key: &str) -> Value {
    json!({
        "name": name,
        "valueFrom": { "secretKeyRef": { "name": secret, "key": key } }
    })
}

fn plain_env(name: &str, value: &str) -> Value {
    json!({ "name": name, "value": value })
}

/// Database servers hold an RWO volume, so they never scale past one replica.
fn database_resources(resources: &ResourceSpec) -> ResourceSpec {
    ResourceSpec {
        replicas: 1,
        ..resources.clone()
    }
}

impl StackPlan {
    pub fn custom(name: &str, container: &CustomContainer, resources: &ResourceSpec) -> Result<Self> {
        if container.image.trim().is_empty() {
            return Err(Error::Validation(
                "a custom application needs an image".to_string(),
            ));
        }
        if !(1..=65535).contains(&container.port) {
            return Err(Error::Validation(format!(
                "container port {} is out of range",
                container.port
            )));
        }
        let env = container
            .env
            .iter()
            .map(|(k, v)| plain_env(k, v))
            .collect();
        Ok(Self {
            name: name.to_string(),
            workload_type: WorkloadType::Custom,
            components: vec![ComponentPlan {
                kind: ComponentKind::App,
                deployment_name: name.to_string(),
                service_name: ResourceNaming::service_name(name),
                image: container.image.clone(),
                port: container.port,
                replicas: resources.replicas,
                resources: resources.clone(),
                env,
                data_path: None,
            }],
            secret_name: None,
            claim_name: None,
            credentials: None,
        })
    }

    /// Plan for one of the database-backed shapes.
    pub fn stack(
        name: &str,
        workload_type: WorkloadType,
        resources: &ResourceSpec,
        images: &ImagesConfig,
        credentials: DatabaseCredentials,
    ) -> Result<Self> {
        if !workload_type.is_stack() {
            return Err(Error::Validation(format!(
                "'{workload_type}' is not a multi-component stack"
            )));
        }
        let secret = ResourceNaming::db_secret_name(name);
        let claim = ResourceNaming::pvc_name(name);
        let db_kind = workload_type.components()[0];
        let db_service = ResourceNaming::service_name(&ResourceNaming::component_name(
            name,
            db_kind.as_str(),
        ));

        let components = workload_type
            .components()
            .iter()
            .map(|kind| {
                let deployment_name = ResourceNaming::component_name(name, kind.as_str());
                let image = images
                    .for_component(*kind)
                    .map(str::to_string)
                    .ok_or_else(|| Error::Config(format!("no image configured for {kind}")))?;
                let (env, data_path, component_resources) =
                    component_env(*kind, &secret, &db_service, resources);
                Ok(ComponentPlan {
                    kind: *kind,
                    service_name: ResourceNaming::service_name(&deployment_name),
                    deployment_name,
                    image,
                    port: kind.default_port(),
                    replicas: component_resources.replicas,
                    resources: component_resources,
                    env,
                    data_path,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            workload_type,
            components,
            secret_name: Some(secret),
            claim_name: Some(claim),
            credentials: Some(credentials),
        })
    }

    #[must_use]
    pub fn component(&self, kind: ComponentKind) -> Option<&ComponentPlan> {
        self.components.iter().find(|c| c.kind == kind)
    }

    /// Service name of the database component, when the shape has one.
    #[must_use]
    pub fn database_host(&self) -> Option<&str> {
        self.components
            .iter()
            .find(|c| c.data_path.is_some())
            .map(|c| c.service_name.as_str())
    }
}

fn component_env(
    kind: ComponentKind,
    secret: &str,
    db_service: &str,
    resources: &ResourceSpec,
) -> (Vec<Value>, Option<&'static str>, ResourceSpec) {
    let db_host = format!("{db_service}:3306");
    match kind {
        ComponentKind::MariaDb => (
            vec![
                secret_env("MARIADB_ROOT_PASSWORD", secret, SECRET_KEY_ROOT_PASSWORD),
                secret_env("MARIADB_DATABASE", secret, SECRET_KEY_DATABASE),
                secret_env("MARIADB_USER", secret, SECRET_KEY_USERNAME),
                secret_env("MARIADB_PASSWORD", secret, SECRET_KEY_PASSWORD),
            ],
            Some(MYSQL_DATA_PATH),
            database_resources(resources),
        ),
        ComponentKind::MySql => (
            vec![
                secret_env("MYSQL_ROOT_PASSWORD", secret, SECRET_KEY_ROOT_PASSWORD),
                secret_env("MYSQL_DATABASE", secret, SECRET_KEY_DATABASE),
                secret_env("MYSQL_USER", secret, SECRET_KEY_USERNAME),
                secret_env("MYSQL_PASSWORD", secret, SECRET_KEY_PASSWORD),
            ],
            Some(MYSQL_DATA_PATH),
            database_resources(resources),
        ),
        ComponentKind::WordPress => (
            vec![
                plain_env("WORDPRESS_DB_HOST", &db_host),
                secret_env("WORDPRESS_DB_NAME", secret, SECRET_KEY_DATABASE),
                secret_env("WORDPRESS_DB_USER", secret, SECRET_KEY_USERNAME),
                secret_env("WORDPRESS_DB_PASSWORD", secret, SECRET_KEY_PASSWORD),
            ],
            None,
            resources.clone(),
        ),
        ComponentKind::PhpMyAdmin => (
            vec![
                plain_env("PMA_HOST", db_service),
                plain_env("PMA_PORT", "3306"),
            ],
            None,
            ResourceSpec {
                replicas: 1,
                ..resources.clone()
            },
        ),
        ComponentKind::Web => (
            vec![
                plain_env("DB_HOST", db_service),
                secret_env("DB_NAME", secret, SECRET_KEY_DATABASE),
                secret_env("DB_USER", secret, SECRET_KEY_USERNAME),
                secret_env("DB_PASSWORD", secret, SECRET_KEY_PASSWORD),
            ],
            None,
            resources.clone(),
        ),
        ComponentKind::App => (Vec::new(), None, resources.clone()),
    }
}
