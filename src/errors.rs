//! Typed error hierarchy for the CloudX platform.
//!
//! `PlatformError` is returned by every internal operation (store-backed
//! services and the workspace provisioner). The HTTP layer translates it into
//! a status code in `platform::api::ApiError`.

use thiserror::Error;

/// Errors from platform operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Container {id} not found")]
    ContainerNotFound { id: String },

    #[error("A workspace launch is already in progress for project {project_id}")]
    LaunchInProgress { project_id: i64 },

    #[error("Project {project_id} already has {limit} workspace(s) running")]
    QuotaExceeded { project_id: i64, limit: usize },

    #[error("Workspace container {container} was not ready after {waited_secs}s")]
    ReadinessTimeout { container: String, waited_secs: u64 },

    #[error("Unsupported container action '{action}'. Valid actions: stop, restart, delete")]
    InvalidAction { action: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Container runtime error: {0:#}")]
    Runtime(#[source] anyhow::Error),

    #[error("Database error: {0:#}")]
    Database(#[source] anyhow::Error),
}

impl PlatformError {
    /// Short machine-readable category, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProjectNotFound { .. } | Self::ContainerNotFound { .. } => "not_found",
            Self::LaunchInProgress { .. } => "conflict",
            Self::QuotaExceeded { .. } => "quota",
            Self::ReadinessTimeout { .. } => "timeout",
            Self::InvalidAction { .. } | Self::BadRequest(_) => "bad_request",
            Self::Runtime(_) => "provisioning",
            Self::Database(_) => "database",
        }
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;
