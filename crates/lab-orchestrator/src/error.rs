//! Error taxonomy shared by every orchestrator operation.
//!
//! Each variant maps to a stable [`ErrorKind`] so request handlers can branch on
//! the kind without parsing messages. Quota and partial-stack errors carry
//! structured detail for programmatic handling.

use crate::cluster::ClusterError;
use crate::quota::QuotaViolation;
use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Machine-checkable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Permission,
    Quota,
    NotFound,
    ClusterUnavailable,
    PartialStack,
    Cluster,
    Config,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::Quota => "quota",
            Self::NotFound => "not_found",
            Self::ClusterUnavailable => "cluster_unavailable",
            Self::PartialStack => "partial_stack",
            Self::Cluster => "cluster",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Multi-object operation that can leave a stack partially applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StackOperation {
    Create,
    Delete,
    Pause,
    Resume,
}

impl std::fmt::Display for StackOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Delete => write!(f, "delete"),
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Quota exceeded: {}", describe_violations(.violations))]
    Quota { violations: Vec<QuotaViolation> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cluster unavailable: {0}")]
    ClusterUnavailable(String),

    #[error(
        "Stack {operation} partially applied ({} object(s) affected), failed on {failed}: {reason}",
        .affected.len()
    )]
    PartialStack {
        operation: StackOperation,
        affected: Vec<String>,
        failed: String,
        reason: String,
    },

    #[error("Cluster rejected request: {status} {reason}: {message}")]
    Cluster {
        status: u16,
        reason: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Quota { .. } => ErrorKind::Quota,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ClusterUnavailable(_) => ErrorKind::ClusterUnavailable,
            Self::PartialStack { .. } => ErrorKind::PartialStack,
            Self::Cluster { .. } => ErrorKind::Cluster,
            Self::Config(_) => ErrorKind::Config,
            Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Only an unreachable control plane is worth retrying as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ClusterUnavailable(_))
    }

    /// Wrap a failure in a multi-object operation. Nothing applied yet means the
    /// original error is surfaced unchanged.
    #[must_use]
    pub fn partial(
        operation: StackOperation,
        affected: Vec<String>,
        failed: impl Into<String>,
        cause: Error,
    ) -> Self {
        if affected.is_empty() {
            return cause;
        }
        Self::PartialStack {
            operation,
            affected,
            failed: failed.into(),
            reason: cause.to_string(),
        }
    }
}

impl From<ClusterError> for Error {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(message) => Self::NotFound(message),
            ClusterError::Unavailable(message) => Self::ClusterUnavailable(message),
            ClusterError::Decode(message) => Self::Cluster {
                status: 500,
                reason: "Decode".to_string(),
                message,
            },
            other => Self::Cluster {
                status: other.status(),
                reason: other.reason().to_string(),
                message: other.message().to_string(),
            },
        }
    }
}

fn describe_violations(violations: &[QuotaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
