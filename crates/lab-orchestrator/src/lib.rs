/*
 * 5D Labs Lab Platform - Kubernetes Orchestrator for Per-User Lab Workloads
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Lab orchestrator core library
//!
//! Provisions, isolates, meters and lifecycle-manages per-user lab workloads on a
//! shared Kubernetes cluster.
//!
//! ## Architecture
//!
//! ```text
//! request (user, workload type, resources)
//!     │
//!     ▼
//! ResourceClamper ──► QuotaAccountant + PreflightQuotaChecker
//!     │
//!     ▼
//! StackProvisioner ──► IngressAttacher
//!     │
//!     ▼
//! LifecycleController (pause / resume / status)
//! ```
//!
//! Every cluster call goes through the [`cluster::ClusterClient`] seam, implemented
//! by [`cluster::KubeCluster`] for a real control plane and by
//! [`cluster::InMemoryCluster`] for tests and dry runs.

pub mod clamp;
pub mod cluster;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod identity;
pub mod ingress;
pub mod labels;
pub mod lifecycle;
pub mod naming;
pub mod namespaces;
pub mod orchestrator;
pub mod provision;
pub mod quota;
pub mod resolver;
pub mod units;

// Re-export commonly used types
pub use cluster::{ClusterClient, ClusterError, InMemoryCluster, KubeCluster};
pub use config::OrchestratorConfig;
pub use error::{Error, ErrorKind, Result};
pub use identity::{Role, UserIdentity};
pub use orchestrator::{
    CreateOutcome, CreateRequest, DeleteOutcome, DeploymentOrchestrator, LifecycleOutcome,
};
pub use provision::{ProvisionResult, StackCredentials, WorkloadType};
pub use quota::{QuotaLimits, Usage, UsageSummary};
