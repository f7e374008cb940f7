//! Seams to the services around the orchestrator: the relational deployment
//! catalog and the per-user quota override records.

use crate::provision::WorkloadType;
use crate::quota::QuotaOverride;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator rejected request: {0}")]
    Rejected(String),
}

/// Catalog entry for one created application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub user_id: String,
    pub name: String,
    pub namespace: String,
    pub app_type: WorkloadType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// Key-value record store for deployment metadata, keyed by (user id, name).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeploymentCatalog: Send + Sync {
    async fn record_created(&self, record: DeploymentRecord) -> Result<(), CollaboratorError>;

    async fn record_deleted(&self, user_id: &str, name: &str) -> Result<(), CollaboratorError>;

    async fn get(&self, user_id: &str, name: &str)
        -> Result<Option<DeploymentRecord>, CollaboratorError>;
}

/// Source of per-user quota overrides.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotaOverrideStore: Send + Sync {
    async fn override_for(&self, user_id: &str)
        -> Result<Option<QuotaOverride>, CollaboratorError>;
}

/// Overrides fixed at startup, usually from `quotaOverrides` in the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticOverrides {
    overrides: HashMap<String, QuotaOverride>,
}

impl StaticOverrides {
    #[must_use]
    pub fn new(overrides: HashMap<String, QuotaOverride>) -> Self {
        Self { overrides }
    }
}

#[async_trait]
impl QuotaOverrideStore for StaticOverrides {
    async fn override_for(
        &self,
        user_id: &str,
    ) -> Result<Option<QuotaOverride>, CollaboratorError> {
        Ok(self.overrides.get(user_id).cloned())
    }
}

/// Process-local catalog for the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    records: Mutex<HashMap<(String, String), DeploymentRecord>>,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), DeploymentRecord>>, CollaboratorError>
    {
        self.records
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("catalog lock poisoned".to_string()))
    }
}

#[async_trait]
impl DeploymentCatalog for InMemoryCatalog {
    async fn record_created(&self, record: DeploymentRecord) -> Result<(), CollaboratorError> {
        self.lock()?
            .insert((record.user_id.clone(), record.name.clone()), record);
        Ok(())
    }

    async fn record_deleted(&self, user_id: &str, name: &str) -> Result<(), CollaboratorError> {
        if let Some(record) = self
            .lock()?
            .get_mut(&(user_id.to_string(), name.to_string()))
        {
            record.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Option<DeploymentRecord>, CollaboratorError> {
        Ok(self
            .lock()?
            .get(&(user_id.to_string(), name.to_string()))
            .cloned())
    }
}
