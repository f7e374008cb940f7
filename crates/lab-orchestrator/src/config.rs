//! Orchestrator Configuration
//!
//! Loaded from a mounted YAML file. Every section has defaults so an empty file is
//! a working configuration.

use crate::error::{Error, Result};
use crate::identity::Role;
use crate::provision::{ComponentKind, WorkloadType};
use crate::quota::{QuotaLimits, QuotaOverride};
use crate::units;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Main orchestrator configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Prepended to the user slug to form the user's namespace
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,

    /// Value of the `managed-by` label on every object we create
    #[serde(default = "default_managed_by")]
    pub managed_by: String,

    #[serde(default)]
    pub roles: RolesConfig,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub images: ImagesConfig,

    #[serde(default)]
    pub default_resources: ResourceDefaults,

    /// Static per-user limit overrides keyed by user id
    #[serde(default)]
    pub quota_overrides: HashMap<String, QuotaOverride>,
}

fn default_namespace_prefix() -> String {
    "lab-".to_string()
}

fn default_managed_by() -> String {
    "lab-orchestrator".to_string()
}

/// Policy for each platform role
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RolesConfig {
    #[serde(default = "default_student_policy")]
    pub student: RolePolicy,

    #[serde(default = "default_teacher_policy")]
    pub teacher: RolePolicy,

    #[serde(default = "default_admin_policy")]
    pub admin: RolePolicy,
}

impl RolesConfig {
    #[must_use]
    pub fn policy(&self, role: Role) -> &RolePolicy {
        match role {
            Role::Student => &self.student,
            Role::Teacher => &self.teacher,
            Role::Admin => &self.admin,
        }
    }
}

/// Limits, floors and entitlements for one role
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePolicy {
    pub limits: QuotaLimits,

    #[serde(default)]
    pub floors: ResourceFloors,

    /// Workload types the role may create
    #[serde(default = "default_allowed_types")]
    pub allowed_workload_types: Vec<WorkloadType>,
}

impl RolePolicy {
    #[must_use]
    pub fn allows(&self, workload_type: WorkloadType) -> bool {
        self.allowed_workload_types.contains(&workload_type)
    }
}

fn default_allowed_types() -> Vec<WorkloadType> {
    WorkloadType::ALL.to_vec()
}

fn default_student_policy() -> RolePolicy {
    RolePolicy {
        limits: QuotaLimits {
            max_apps: 3,
            max_pods: 6,
            max_requests_cpu_m: 2000,
            max_requests_mem_mi: 4096,
        },
        floors: ResourceFloors {
            cpu_request: "100m".to_string(),
            cpu_limit: "250m".to_string(),
            memory_request: "128Mi".to_string(),
            memory_limit: "256Mi".to_string(),
            replicas: 1,
        },
        allowed_workload_types: vec![
            WorkloadType::Custom,
            WorkloadType::WordPress,
            WorkloadType::MySql,
        ],
    }
}

fn default_teacher_policy() -> RolePolicy {
    RolePolicy {
        limits: QuotaLimits {
            max_apps: 10,
            max_pods: 20,
            max_requests_cpu_m: 8000,
            max_requests_mem_mi: 16384,
        },
        floors: ResourceFloors::default(),
        allowed_workload_types: default_allowed_types(),
    }
}

fn default_admin_policy() -> RolePolicy {
    RolePolicy {
        limits: QuotaLimits {
            max_apps: 100,
            max_pods: 200,
            max_requests_cpu_m: 64000,
            max_requests_mem_mi: 131_072,
        },
        floors: ResourceFloors::default(),
        allowed_workload_types: default_allowed_types(),
    }
}

/// Minimum values a container may request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFloors {
    #[serde(default = "default_floor_cpu_request")]
    pub cpu_request: String,

    #[serde(default = "default_floor_cpu_limit")]
    pub cpu_limit: String,

    #[serde(default = "default_floor_memory_request")]
    pub memory_request: String,

    #[serde(default = "default_floor_memory_limit")]
    pub memory_limit: String,

    #[serde(default = "default_floor_replicas")]
    pub replicas: i32,
}

fn default_floor_cpu_request() -> String {
    "50m".to_string()
}

fn default_floor_cpu_limit() -> String {
    "100m".to_string()
}

fn default_floor_memory_request() -> String {
    "64Mi".to_string()
}

fn default_floor_memory_limit() -> String {
    "128Mi".to_string()
}

fn default_floor_replicas() -> i32 {
    1
}

/// Ingress configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    #[serde(default = "default_ingress_enabled")]
    pub enabled: bool,

    /// Hosts are `<slug>.<baseDomain>`
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// IngressClass to request; any available class when unset
    #[serde(default)]
    pub class_name: Option<String>,

    /// Workload types that get a route; empty means all
    #[serde(default)]
    pub allow: Vec<WorkloadType>,

    /// Workload types that never get a route; wins over `allow`
    #[serde(default)]
    pub deny: Vec<WorkloadType>,

    #[serde(default)]
    pub tls_secret_name: Option<String>,
}

fn default_ingress_enabled() -> bool {
    true
}

fn default_base_domain() -> String {
    "lab.local".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Storage class for database claims; the cluster default when unset
    #[serde(default)]
    pub storage_class_name: Option<String>,

    #[serde(default = "default_database_volume_size")]
    pub database_volume_size: String,
}

fn default_database_volume_size() -> String {
    "1Gi".to_string()
}

/// Stock images for stack components
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesConfig {
    #[serde(default = "default_wordpress_image")]
    pub wordpress: String,

    #[serde(default = "default_mariadb_image")]
    pub mariadb: String,

    #[serde(default = "default_mysql_image")]
    pub mysql: String,

    #[serde(default = "default_phpmyadmin_image")]
    pub phpmyadmin: String,

    #[serde(default = "default_web_image")]
    pub web: String,
}

impl ImagesConfig {
    /// Stock image for a component. `App` has none; the request supplies it.
    #[must_use]
    pub fn for_component(&self, component: ComponentKind) -> Option<&str> {
        match component {
            ComponentKind::App => None,
            ComponentKind::WordPress => Some(&self.wordpress),
            ComponentKind::MariaDb => Some(&self.mariadb),
            ComponentKind::MySql => Some(&self.mysql),
            ComponentKind::PhpMyAdmin => Some(&self.phpmyadmin),
            ComponentKind::Web => Some(&self.web),
        }
    }
}

fn default_wordpress_image() -> String {
    "wordpress:6-apache".to_string()
}

fn default_mariadb_image() -> String {
    "mariadb:10.11".to_string()
}

fn default_mysql_image() -> String {
    "mysql:8.0".to_string()
}

fn default_phpmyadmin_image() -> String {
    "phpmyadmin:5".to_string()
}

fn default_web_image() -> String {
    "php:8.2-apache".to_string()
}

/// Values used when a request omits resources
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefaults {
    #[serde(default = "default_cpu_request")]
    pub cpu_request: String,

    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,

    #[serde(default = "default_memory_request")]
    pub memory_request: String,

    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

fn default_cpu_request() -> String {
    "250m".to_string()
}

fn default_cpu_limit() -> String {
    "500m".to_string()
}

fn default_memory_request() -> String {
    "256Mi".to_string()
}

fn default_memory_limit() -> String {
    "512Mi".to_string()
}

fn default_replicas() -> i32 {
    1
}

impl Default for RolesConfig {
    fn default() -> Self {
        RolesConfig {
            student: default_student_policy(),
            teacher: default_teacher_policy(),
            admin: default_admin_policy(),
        }
    }
}

impl Default for ResourceFloors {
    fn default() -> Self {
        ResourceFloors {
            cpu_request: default_floor_cpu_request(),
            cpu_limit: default_floor_cpu_limit(),
            memory_request: default_floor_memory_request(),
            memory_limit: default_floor_memory_limit(),
            replicas: default_floor_replicas(),
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        IngressConfig {
            enabled: default_ingress_enabled(),
            base_domain: default_base_domain(),
            class_name: None,
            allow: Vec::new(),
            deny: Vec::new(),
            tls_secret_name: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            storage_class_name: None,
            database_volume_size: default_database_volume_size(),
        }
    }
}

impl Default for ImagesConfig {
    fn default() -> Self {
        ImagesConfig {
            wordpress: default_wordpress_image(),
            mariadb: default_mariadb_image(),
            mysql: default_mysql_image(),
            phpmyadmin: default_phpmyadmin_image(),
            web: default_web_image(),
        }
    }
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        ResourceDefaults {
            cpu_request: default_cpu_request(),
            cpu_limit: default_cpu_limit(),
            memory_request: default_memory_request(),
            memory_limit: default_memory_limit(),
            replicas: default_replicas(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            namespace_prefix: default_namespace_prefix(),
            managed_by: default_managed_by(),
            roles: RolesConfig::default(),
            ingress: IngressConfig::default(),
            storage: StorageConfig::default(),
            images: ImagesConfig::default(),
            default_resources: ResourceDefaults::default(),
            quota_overrides: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from mounted file
    pub fn from_mounted_file(config_path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path).map_err(|e| {
            Error::Config(format!("Failed to read config file {config_path}: {e}"))
        })?;
        debug!(path = %config_path, "Loaded orchestrator config file");
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: OrchestratorConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse config YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later against the cluster.
    pub fn validate(&self) -> Result<()> {
        let prefix_ok = !self.namespace_prefix.is_empty()
            && self.namespace_prefix.len() <= 20
            && self
                .namespace_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !self.namespace_prefix.starts_with('-');
        if !prefix_ok {
            return Err(Error::Config(format!(
                "namespacePrefix '{}' must be 1-20 lowercase alphanumeric characters or '-', not starting with '-'",
                self.namespace_prefix
            )));
        }

        if self.managed_by.is_empty()
            || crate::naming::ResourceNaming::label_value(&self.managed_by) != self.managed_by
        {
            return Err(Error::Config(format!(
                "managedBy '{}' is not a valid label value",
                self.managed_by
            )));
        }

        for role in [Role::Student, Role::Teacher, Role::Admin] {
            let floors = &self.roles.policy(role).floors;
            check_quantities(
                &format!("roles.{role}.floors"),
                &floors.cpu_request,
                &floors.cpu_limit,
                &floors.memory_request,
                &floors.memory_limit,
            )?;
            if floors.replicas < 0 {
                return Err(Error::Config(format!(
                    "roles.{role}.floors.replicas must not be negative"
                )));
            }
        }

        let defaults = &self.default_resources;
        check_quantities(
            "defaultResources",
            &defaults.cpu_request,
            &defaults.cpu_limit,
            &defaults.memory_request,
            &defaults.memory_limit,
        )?;
        if defaults.replicas < 1 {
            return Err(Error::Config(
                "defaultResources.replicas must be at least 1".to_string(),
            ));
        }

        units::memory_to_mebibytes(&self.storage.database_volume_size).map_err(|e| {
            Error::Config(format!("storage.databaseVolumeSize: {e}"))
        })?;

        if self.ingress.enabled && self.ingress.base_domain.trim().is_empty() {
            return Err(Error::Config(
                "ingress.baseDomain is required when ingress is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Namespace owned by `user_id`.
    #[must_use]
    pub fn namespace_for(&self, user_id: &str) -> String {
        crate::naming::ResourceNaming::namespace_for(&self.namespace_prefix, user_id)
    }
}

fn check_quantities(
    section: &str,
    cpu_request: &str,
    cpu_limit: &str,
    memory_request: &str,
    memory_limit: &str,
) -> Result<()> {
    let wrap = |field: &str, e: Error| Error::Config(format!("{section}.{field}: {e}"));
    units::cpu_to_millicores(cpu_request).map_err(|e| wrap("cpuRequest", e))?;
    units::cpu_to_millicores(cpu_limit).map_err(|e| wrap("cpuLimit", e))?;
    units::memory_to_mebibytes(memory_request).map_err(|e| wrap("memoryRequest", e))?;
    units::memory_to_mebibytes(memory_limit).map_err(|e| wrap("memoryLimit", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_is_default() {
        let config = OrchestratorConfig::from_yaml_str("").unwrap();
        assert_eq!(config.namespace_prefix, "lab-");
        assert_eq!(config.managed_by, "lab-orchestrator");
        assert_eq!(config.roles.student.limits.max_apps, 3);
        assert!(!config.roles.student.allows(WorkloadType::Lamp));
        assert!(config.roles.teacher.allows(WorkloadType::Lamp));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_section_defaults() {
        let yaml = r"
namespacePrefix: student-
roles:
  student:
    limits:
      maxApps: 2
      maxPods: 4
      maxRequestsCpuM: 1000
      maxRequestsMemMi: 2048
    floors:
      cpuRequest: 200m
ingress:
  baseDomain: labs.example.edu
  deny: [mysql]
storage:
  storageClassName: fast-ssd
quotaOverrides:
  '42':
    limits:
      maxApps: 5
      maxPods: 10
      maxRequestsCpuM: 4000
      maxRequestsMemMi: 8192
    expiresAt: 2030-01-01T00:00:00Z
";
        let config = OrchestratorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.namespace_for("42"), "student-42");
        let student = config.roles.policy(Role::Student);
        assert_eq!(student.limits.max_requests_cpu_m, 1000);
        assert_eq!(student.floors.cpu_request, "200m");
        assert_eq!(student.floors.memory_limit, "128Mi");
        assert_eq!(student.allowed_workload_types.len(), 4);
        assert_eq!(config.ingress.deny, vec![WorkloadType::MySql]);
        assert!(config.ingress.enabled);
        assert_eq!(config.storage.storage_class_name.as_deref(), Some("fast-ssd"));
        assert_eq!(config.storage.database_volume_size, "1Gi");
        assert_eq!(config.images.mariadb, "mariadb:10.11");
        assert_eq!(config.quota_overrides["42"].limits.max_apps, 5);
        assert!(config.quota_overrides["42"].expires_at.is_some());
    }

    #[test]
    fn rejects_invalid_values() {
        for yaml in [
            "namespacePrefix: Lab_",
            "managedBy: 'has space'",
            "defaultResources:\n  cpuRequest: lots",
            "storage:\n  databaseVolumeSize: big",
            "ingress:\n  baseDomain: ''",
            "roles:\n  admin:\n    limits: {maxApps: 1, maxPods: 1, maxRequestsCpuM: 1, maxRequestsMemMi: 1}\n    floors:\n      replicas: -1",
        ] {
            let err = OrchestratorConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{yaml}: {err}");
        }
        assert!(OrchestratorConfig::from_yaml_str("roles: [").is_err());
    }

    #[test]
    fn images_by_component() {
        let images = ImagesConfig::default();
        assert_eq!(images.for_component(ComponentKind::App), None);
        assert_eq!(
            images.for_component(ComponentKind::PhpMyAdmin),
            Some("phpmyadmin:5")
        );
    }
}
