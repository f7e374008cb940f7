//! Quota accounting.
//!
//! Two gates run before anything is created: the logical per-role ceilings
//! computed from live workloads ([`accountant`]) and the cluster's own
//! `ResourceQuota` objects ([`preflight`]).

pub mod accountant;
pub mod preflight;

pub use self::accountant::{PodResources, QuotaAccountant, UsageSnapshot};
pub use self::preflight::{PlannedAllocation, PreflightQuotaChecker};

use crate::identity::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-role ceilings on aggregate usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    pub max_apps: u64,
    pub max_pods: u64,
    pub max_requests_cpu_m: u64,
    pub max_requests_mem_mi: u64,
}

/// Usage derived from live workloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub apps_used: u64,
    pub pods_used: u64,
    pub cpu_m_used: u64,
    pub mem_mi_used: u64,
}

/// Resources a pending operation would add.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlannedUsage {
    pub apps: u64,
    pub pods: u64,
    pub cpu_m: u64,
    pub mem_mi: u64,
}

impl PlannedUsage {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::ops::AddAssign for PlannedUsage {
    fn add_assign(&mut self, other: Self) {
        self.apps += other.apps;
        self.pods += other.pods;
        self.cpu_m += other.cpu_m;
        self.mem_mi += other.mem_mi;
    }
}

/// Headroom left under each ceiling. Never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Remaining {
    pub apps: u64,
    pub pods: u64,
    pub cpu_m: u64,
    pub mem_mi: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub role: Role,
    pub limits: QuotaLimits,
    pub usage: Usage,
    pub remaining: Remaining,
    /// True when the limits come from an active per-user override.
    pub overridden: bool,
}

impl UsageSummary {
    #[must_use]
    pub fn new(role: Role, limits: QuotaLimits, usage: Usage, overridden: bool) -> Self {
        let remaining = Remaining {
            apps: limits.max_apps.saturating_sub(usage.apps_used),
            pods: limits.max_pods.saturating_sub(usage.pods_used),
            cpu_m: limits.max_requests_cpu_m.saturating_sub(usage.cpu_m_used),
            mem_mi: limits.max_requests_mem_mi.saturating_sub(usage.mem_mi_used),
        };
        Self {
            role,
            limits,
            usage,
            remaining,
            overridden,
        }
    }
}

/// Which gate produced a violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum QuotaScope {
    Logical,
    Cluster { quota: String },
}

/// One exceeded dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaViolation {
    pub dimension: String,
    pub used: u64,
    pub planned: u64,
    pub limit: u64,
    #[serde(flatten)]
    pub scope: QuotaScope,
}

impl QuotaViolation {
    #[must_use]
    pub fn logical(dimension: &str, used: u64, planned: u64, limit: u64) -> Self {
        Self {
            dimension: dimension.to_string(),
            used,
            planned,
            limit,
            scope: QuotaScope::Logical,
        }
    }

    #[must_use]
    pub fn cluster(quota: &str, dimension: &str, used: u64, planned: u64, limit: u64) -> Self {
        Self {
            dimension: dimension.to_string(),
            used,
            planned,
            limit,
            scope: QuotaScope::Cluster {
                quota: quota.to_string(),
            },
        }
    }

    #[must_use]
    pub fn requested_total(&self) -> u64 {
        self.used.saturating_add(self.planned)
    }
}

impl std::fmt::Display for QuotaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            QuotaScope::Logical => {
                write!(f, "{}: {}/{}", self.dimension, self.requested_total(), self.limit)
            }
            QuotaScope::Cluster { quota } => write!(
                f,
                "{}: {}/{} (ResourceQuota {quota})",
                self.dimension,
                self.requested_total(),
                self.limit
            ),
        }
    }
}

/// Per-user replacement for the role limits, optionally time bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaOverride {
    pub limits: QuotaLimits,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl QuotaOverride {
    /// An override whose expiry has passed is treated as absent.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// Compare `usage + planned` against `limits`. Equality passes.
#[must_use]
pub fn evaluate(limits: &QuotaLimits, usage: &Usage, planned: &PlannedUsage) -> Vec<QuotaViolation> {
    [
        ("apps", usage.apps_used, planned.apps, limits.max_apps),
        ("pods", usage.pods_used, planned.pods, limits.max_pods),
        (
            "cpu_m",
            usage.cpu_m_used,
            planned.cpu_m,
            limits.max_requests_cpu_m,
        ),
        (
            "mem_mi",
            usage.mem_mi_used,
            planned.mem_mi,
            limits.max_requests_mem_mi,
        ),
    ]
    .into_iter()
    .filter(|(_, used, planned, limit)| used.saturating_add(*planned) > *limit)
    .map(|(dimension, used, planned, limit)| QuotaViolation::logical(dimension, used, planned, limit))
    .collect()
}
