//! Persistence layer.
//!
//! Handlers never talk to a database directly: they go through the
//! [`Store`] trait, shared as a [`DbHandle`]. [`PgStore`] is the production
//! implementation; [`MemoryStore`] backs `--in-memory` runs and tests.

mod memory;
mod postgres;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use super::models::*;

/// Shared, cloneable handle to the configured store.
pub type DbHandle = Arc<dyn Store>;

/// Limit applied to "recent" listings when the caller gives none.
pub const DEFAULT_LIST_LIMIT: i64 = 50;
/// Hard upper bound on any listing limit.
pub const MAX_LIST_LIMIT: i64 = 500;

/// Clamp a caller-supplied listing limit into `1..=MAX_LIST_LIMIT`.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Create all tables if they don't exist yet. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<()>;

    /// Cheap round-trip used by `/health`.
    async fn ping(&self) -> Result<()>;

    // ── Projects ─────────────────────────────────────────────────────
    async fn create_project(&self, new: &NewProject) -> Result<Project>;
    async fn get_project(&self, id: i64) -> Result<Option<Project>>;
    /// Newest first. `offset`/`limit` are already validated by the caller.
    async fn list_projects(&self, offset: i64, limit: i64) -> Result<Vec<Project>>;
    async fn count_projects(&self) -> Result<i64>;
    async fn update_project(&self, id: i64, update: &ProjectUpdate) -> Result<Option<Project>>;

    /// Returns `false` if the project doesn't exist. Adding an existing
    /// collaborator succeeds without changing the set.
    async fn add_collaborator(&self, project_id: i64, username: &str) -> Result<bool>;
    /// Returns `false` if the project doesn't exist. Removing a non-member
    /// succeeds without changing the set.
    async fn remove_collaborator(&self, project_id: i64, username: &str) -> Result<bool>;

    // ── Deployments ──────────────────────────────────────────────────
    async fn create_deployment(&self, new: &NewDeployment) -> Result<Deployment>;
    async fn list_deployments(&self, project_id: Option<i64>, limit: i64) -> Result<Vec<Deployment>>;

    // ── Activity log ─────────────────────────────────────────────────
    async fn log_activity(&self, new: &NewActivity) -> Result<ActivityLog>;
    async fn list_activities(&self, limit: i64) -> Result<Vec<ActivityLog>>;

    // ── System metrics ───────────────────────────────────────────────
    async fn record_metric(&self, new: &NewMetric) -> Result<SystemMetric>;
    async fn list_metrics(&self, limit: i64) -> Result<Vec<SystemMetric>>;

    // ── Sessions ─────────────────────────────────────────────────────
    /// Insert the session or bump `last_seen` if it already exists.
    async fn touch_session(
        &self,
        session_id: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<UserSession>;

    // ── Workspaces ───────────────────────────────────────────────────
    async fn record_workspace(&self, new: &NewWorkspace) -> Result<Workspace>;
    async fn list_workspaces(&self, project_id: Option<i64>) -> Result<Vec<Workspace>>;
    async fn update_workspace_status(&self, container_id: &str, status: &str) -> Result<bool>;
    async fn remove_workspace(&self, container_id: &str) -> Result<bool>;

    // ── Diagnostics ──────────────────────────────────────────────────
    /// Insert a row into the connectivity test table and return it along
    /// with the five most recent rows.
    async fn db_test(&self, message: &str) -> Result<(DbTestRecord, Vec<DbTestRecord>)>;

    async fn dashboard_stats(&self) -> Result<DashboardStats>;
}
