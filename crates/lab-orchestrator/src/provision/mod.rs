//! Stack provisioning.
//!
//! Every workload shape is a fixed list of components plus a secret and a PVC for
//! the database. [`StackProvisioner`] applies the manifests in dependency order:
//! secret, PVC, services, deployments, ingress.

pub mod capability;
pub mod manifests;
pub mod provisioner;
pub mod stacks;

pub use self::capability::{Capability, CapabilityProbe};
pub use self::provisioner::{ProvisionPlan, StackProvisioner};
pub use self::stacks::{ComponentPlan, StackPlan};

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported workload shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    Custom,
    #[serde(rename = "wordpress")]
    WordPress,
    #[serde(rename = "mysql")]
    MySql,
    Lamp,
}

impl WorkloadType {
    pub const ALL: [WorkloadType; 4] = [
        WorkloadType::Custom,
        WorkloadType::WordPress,
        WorkloadType::MySql,
        WorkloadType::Lamp,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::WordPress => "wordpress",
            Self::MySql => "mysql",
            Self::Lamp => "lamp",
        }
    }

    /// Components in deployment order.
    #[must_use]
    pub fn components(&self) -> &'static [ComponentKind] {
        match self {
            Self::Custom => &[ComponentKind::App],
            Self::WordPress => &[ComponentKind::MariaDb, ComponentKind::WordPress],
            Self::MySql => &[ComponentKind::MySql, ComponentKind::PhpMyAdmin],
            Self::Lamp => &[
                ComponentKind::MySql,
                ComponentKind::Web,
                ComponentKind::PhpMyAdmin,
            ],
        }
    }

    /// Multi-component shapes get a database secret, a PVC and `stack-name` labels.
    #[must_use]
    pub fn is_stack(&self) -> bool {
        !matches!(self, Self::Custom)
    }
}

impl std::fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "custom" => Ok(Self::Custom),
            "wordpress" => Ok(Self::WordPress),
            "mysql" => Ok(Self::MySql),
            "lamp" => Ok(Self::Lamp),
            other => Err(format!("unknown workload type '{other}'")),
        }
    }
}

/// One component of a workload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    App,
    #[serde(rename = "wordpress")]
    WordPress,
    #[serde(rename = "mariadb")]
    MariaDb,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "phpmyadmin")]
    PhpMyAdmin,
    Web,
}

/// What a component does inside its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentRole {
    Web,
    Database,
    AdminUi,
}

impl ComponentKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::WordPress => "wordpress",
            Self::MariaDb => "mariadb",
            Self::MySql => "mysql",
            Self::PhpMyAdmin => "phpmyadmin",
            Self::Web => "web",
        }
    }

    #[must_use]
    pub fn role(&self) -> ComponentRole {
        match self {
            Self::App | Self::WordPress | Self::Web => ComponentRole::Web,
            Self::MariaDb | Self::MySql => ComponentRole::Database,
            Self::PhpMyAdmin => ComponentRole::AdminUi,
        }
    }

    /// Port the stock image listens on. Custom apps bring their own.
    #[must_use]
    pub fn default_port(&self) -> i32 {
        match self {
            Self::MariaDb | Self::MySql => 3306,
            Self::App | Self::WordPress | Self::PhpMyAdmin | Self::Web => 80,
        }
    }

    /// Databases stay cluster-internal; everything else may be exposed.
    #[must_use]
    pub fn is_exposed(&self) -> bool {
        self.role() != ComponentRole::Database
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app" => Ok(Self::App),
            "wordpress" => Ok(Self::WordPress),
            "mariadb" => Ok(Self::MariaDb),
            "mysql" => Ok(Self::MySql),
            "phpmyadmin" => Ok(Self::PhpMyAdmin),
            "web" => Ok(Self::Web),
            other => Err(format!("unknown component '{other}'")),
        }
    }
}

/// How a component's service is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    /// `ClusterIP` or `NodePort`.
    #[serde(rename = "type")]
    pub service_type: String,
    pub port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One provisioned component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentInfo {
    pub component: ComponentKind,
    pub deployment: String,
    pub image: String,
    pub replicas: i32,
    /// False when an existing deployment was reused.
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceInfo>,
}

/// Where database data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StorageMode {
    Persistent { claim: String },
    Ephemeral { reason: String },
}

/// Database credentials stored in the stack secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseCredentials {
    pub database: String,
    pub username: String,
    pub password: String,
    pub root_password: String,
}

/// Credentials handed back for each stack shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StackCredentials {
    #[serde(rename = "wordpress")]
    WordPress {
        database: DatabaseCredentials,
        /// Where the WordPress installer is reached.
        #[serde(skip_serializing_if = "Option::is_none")]
        site_url: Option<String>,
    },
    #[serde(rename = "mysql")]
    MySql {
        database: DatabaseCredentials,
        /// Host name phpMyAdmin connects to.
        db_host: String,
    },
    Lamp {
        database: DatabaseCredentials,
        db_host: String,
    },
}

impl StackCredentials {
    #[must_use]
    pub fn database(&self) -> &DatabaseCredentials {
        match self {
            Self::WordPress { database, .. }
            | Self::MySql { database, .. }
            | Self::Lamp { database, .. } => database,
        }
    }
}

/// Outcome of provisioning one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionResult {
    Single {
        component: ComponentInfo,
    },
    Stack {
        stack_name: String,
        app_type: WorkloadType,
        components: Vec<ComponentInfo>,
        credentials: StackCredentials,
        storage: StorageMode,
    },
}

impl ProvisionResult {
    #[must_use]
    pub fn components(&self) -> &[ComponentInfo] {
        match self {
            Self::Single { component } => std::slice::from_ref(component),
            Self::Stack { components, .. } => components,
        }
    }

    #[must_use]
    pub fn credentials(&self) -> Option<&StackCredentials> {
        match self {
            Self::Single { .. } => None,
            Self::Stack { credentials, .. } => Some(credentials),
        }
    }
}
