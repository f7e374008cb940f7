//! Per-role resource floors.
//!
//! There are no ceilings here; aggregate ceilings belong to the quota accountant.

use crate::config::ResourceFloors;
use crate::error::{Error, Result};
use crate::units;
use serde::{Deserialize, Serialize};

/// Container resources and replica count for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub replicas: i32,
}

impl ResourceSpec {
    #[must_use]
    pub fn cpu_request_m(&self) -> u64 {
        units::cpu_to_millicores(&self.cpu_request).unwrap_or(0)
    }

    #[must_use]
    pub fn memory_request_mi(&self) -> u64 {
        units::memory_to_mebibytes(&self.memory_request).unwrap_or(0)
    }

    #[must_use]
    pub fn cpu_limit_m(&self) -> u64 {
        units::cpu_to_millicores(&self.cpu_limit).unwrap_or(0)
    }

    #[must_use]
    pub fn memory_limit_mi(&self) -> u64 {
        units::memory_to_mebibytes(&self.memory_limit).unwrap_or(0)
    }
}

/// Raise every value of `spec` to at least its floor, and each limit to at least
/// its request. Values come back in `<n>m` / `<n>Mi` form, unchanged in amount
/// when above their floor.
pub fn clamp(floors: &ResourceFloors, spec: &ResourceSpec) -> Result<ResourceSpec> {
    if spec.replicas < 0 {
        return Err(Error::Validation(format!(
            "replicas must not be negative, got {}",
            spec.replicas
        )));
    }

    let cpu_request = units::max_cpu(&spec.cpu_request, &floors.cpu_request)?;
    let cpu_limit = units::max_cpu(&spec.cpu_limit, &floors.cpu_limit)?;
    let cpu_limit = units::max_cpu(cpu_limit, cpu_request)?;

    let memory_request = units::max_memory(&spec.memory_request, &floors.memory_request)?;
    let memory_limit = units::max_memory(&spec.memory_limit, &floors.memory_limit)?;
    let memory_limit = units::max_memory(memory_limit, memory_request)?;

    Ok(ResourceSpec {
        cpu_request: units::normalize_cpu(cpu_request)?,
        cpu_limit: units::normalize_cpu(cpu_limit)?,
        memory_request: units::normalize_memory(memory_request)?,
        memory_limit: units::normalize_memory(memory_limit)?,
        replicas: spec.replicas.max(floors.replicas),
    })
}
