use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use super::Store;
use crate::config::DatabaseConfig;
use crate::platform::models::*;

/// Project columns plus the collaborator set folded into an array.
const PROJECT_SELECT: &str = "
    SELECT p.id, p.name, p.description, p.repository_url, p.status, p.owner, p.tags,
           ARRAY(
               SELECT c.username FROM project_collaborators c
               WHERE c.project_id = p.id ORDER BY c.added_at, c.username
           ) AS collaborators,
           p.created_at, p.updated_at
    FROM projects p";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS projects (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        repository_url TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        owner TEXT NOT NULL DEFAULT 'anonymous',
        tags TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS project_collaborators (
        project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        username TEXT NOT NULL,
        added_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (project_id, username)
    );

    CREATE TABLE IF NOT EXISTS deployments (
        id BIGSERIAL PRIMARY KEY,
        project_id BIGINT NOT NULL REFERENCES projects(id),
        environment TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        version TEXT,
        commit_hash TEXT,
        deployed_by TEXT,
        duration_seconds INTEGER,
        deployed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS activity_logs (
        id BIGSERIAL PRIMARY KEY,
        action TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT '',
        ip_address TEXT,
        user_agent TEXT,
        severity TEXT NOT NULL DEFAULT 'info',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS system_metrics (
        id BIGSERIAL PRIMARY KEY,
        metric_name TEXT NOT NULL,
        metric_value DOUBLE PRECISION NOT NULL,
        unit TEXT,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS user_sessions (
        session_id TEXT PRIMARY KEY,
        ip_address TEXT,
        user_agent TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        last_seen TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS workspaces (
        id BIGSERIAL PRIMARY KEY,
        project_id BIGINT NOT NULL,
        container_id TEXT NOT NULL UNIQUE,
        container_name TEXT NOT NULL,
        editor_port INTEGER NOT NULL,
        ssh_port INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS test_table (
        id BIGSERIAL PRIMARY KEY,
        message TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool using the given settings. Does not create the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(config.connect_options())
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to PostgreSQL at {}:{}/{}",
                    config.host, config.port, config.name
                )
            })?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to create tables")?;
        info!("database schema ready");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }

    async fn create_project(&self, new: &NewProject) -> Result<Project> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO projects (name, description, repository_url, status, owner, tags)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(&new.name)
        .bind(new.description.as_deref().unwrap_or_default())
        .bind(new.repository_url.as_deref())
        .bind(new.status.as_deref().unwrap_or(DEFAULT_PROJECT_STATUS))
        .bind(new.owner.as_deref().unwrap_or(DEFAULT_OWNER))
        .bind(new.tags.clone().unwrap_or_default())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert project")?;

        self.get_project(id)
            .await?
            .with_context(|| format!("Project {} vanished after insert", id))
    }

    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let sql = format!("{PROJECT_SELECT} WHERE p.id = $1");
        sqlx::query_as::<_, Project>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load project {}", id))
    }

    async fn list_projects(&self, offset: i64, limit: i64) -> Result<Vec<Project>> {
        let sql = format!("{PROJECT_SELECT} ORDER BY p.created_at DESC, p.id DESC LIMIT $1 OFFSET $2");
        sqlx::query_as::<_, Project>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list projects")
    }

    async fn count_projects(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count projects")
    }

    async fn update_project(&self, id: i64, update: &ProjectUpdate) -> Result<Option<Project>> {
        let result = sqlx::query(
            "UPDATE projects SET
                 name = COALESCE($2, name),
                 description = COALESCE($3, description),
                 repository_url = COALESCE($4, repository_url),
                 status = COALESCE($5, status),
                 owner = COALESCE($6, owner),
                 tags = COALESCE($7, tags),
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(update.name.as_deref())
        .bind(update.description.as_deref())
        .bind(update.repository_url.as_deref())
        .bind(update.status.as_deref())
        .bind(update.owner.as_deref())
        .bind(update.tags.clone())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update project {}", id))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_project(id).await
    }

    async fn add_collaborator(&self, project_id: i64, username: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO project_collaborators (project_id, username)
             SELECT id, $2 FROM projects WHERE id = $1
             ON CONFLICT (project_id, username) DO NOTHING",
        )
        .bind(project_id)
        .bind(username)
        .execute(&self.pool)
        .await
        .context("Failed to add collaborator")?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Nothing inserted: either already a member or no such project.
        self.project_exists(project_id).await
    }

    async fn remove_collaborator(&self, project_id: i64, username: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM project_collaborators WHERE project_id = $1 AND username = $2",
        )
        .bind(project_id)
        .bind(username)
        .execute(&self.pool)
        .await
        .context("Failed to remove collaborator")?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.project_exists(project_id).await
    }

    async fn create_deployment(&self, new: &NewDeployment) -> Result<Deployment> {
        sqlx::query_as::<_, Deployment>(
            "INSERT INTO deployments
                 (project_id, environment, status, version, commit_hash, deployed_by, duration_seconds)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id, project_id, environment, status, version, commit_hash,
                       deployed_by, duration_seconds, deployed_at",
        )
        .bind(new.project_id)
        .bind(&new.environment)
        .bind(new.status.as_deref().unwrap_or("pending"))
        .bind(new.version.as_deref())
        .bind(new.commit_hash.as_deref())
        .bind(new.deployed_by.as_deref())
        .bind(new.duration_seconds)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert deployment")
    }

    async fn list_deployments(&self, project_id: Option<i64>, limit: i64) -> Result<Vec<Deployment>> {
        sqlx::query_as::<_, Deployment>(
            "SELECT id, project_id, environment, status, version, commit_hash,
                    deployed_by, duration_seconds, deployed_at
             FROM deployments
             WHERE ($1::BIGINT IS NULL OR project_id = $1)
             ORDER BY deployed_at DESC, id DESC
             LIMIT $2",
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list deployments")
    }

    async fn log_activity(&self, new: &NewActivity) -> Result<ActivityLog> {
        sqlx::query_as::<_, ActivityLog>(
            "INSERT INTO activity_logs (action, details, ip_address, user_agent, severity)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, action, details, ip_address, user_agent, severity, created_at",
        )
        .bind(&new.action)
        .bind(&new.details)
        .bind(new.ip_address.as_deref())
        .bind(new.user_agent.as_deref())
        .bind(&new.severity)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert activity log")
    }

    async fn list_activities(&self, limit: i64) -> Result<Vec<ActivityLog>> {
        sqlx::query_as::<_, ActivityLog>(
            "SELECT id, action, details, ip_address, user_agent, severity, created_at
             FROM activity_logs ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list activity logs")
    }

    async fn record_metric(&self, new: &NewMetric) -> Result<SystemMetric> {
        sqlx::query_as::<_, SystemMetric>(
            "INSERT INTO system_metrics (metric_name, metric_value, unit)
             VALUES ($1, $2, $3)
             RETURNING id, metric_name, metric_value, unit, recorded_at",
        )
        .bind(&new.metric_name)
        .bind(new.metric_value)
        .bind(new.unit.as_deref())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert metric")
    }

    async fn list_metrics(&self, limit: i64) -> Result<Vec<SystemMetric>> {
        sqlx::query_as::<_, SystemMetric>(
            "SELECT id, metric_name, metric_value, unit, recorded_at
             FROM system_metrics ORDER BY recorded_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list metrics")
    }

    async fn touch_session(
        &self,
        session_id: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<UserSession> {
        sqlx::query_as::<_, UserSession>(
            "INSERT INTO user_sessions (session_id, ip_address, user_agent)
             VALUES ($1, $2, $3)
             ON CONFLICT (session_id) DO UPDATE SET last_seen = now()
             RETURNING session_id, ip_address, user_agent, created_at, last_seen",
        )
        .bind(session_id)
        .bind(ip_address)
        .bind(user_agent)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert user session")
    }

    async fn record_workspace(&self, new: &NewWorkspace) -> Result<Workspace> {
        sqlx::query_as::<_, Workspace>(
            "INSERT INTO workspaces
                 (project_id, container_id, container_name, editor_port, ssh_port, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, project_id, container_id, container_name, editor_port, ssh_port,
                       status, created_at",
        )
        .bind(new.project_id)
        .bind(&new.container_id)
        .bind(&new.container_name)
        .bind(i32::from(new.editor_port))
        .bind(i32::from(new.ssh_port))
        .bind(&new.status)
        .fetch_one(&self.pool)
        .await
        .context("Failed to record workspace")
    }

    async fn list_workspaces(&self, project_id: Option<i64>) -> Result<Vec<Workspace>> {
        sqlx::query_as::<_, Workspace>(
            "SELECT id, project_id, container_id, container_name, editor_port, ssh_port,
                    status, created_at
             FROM workspaces
             WHERE ($1::BIGINT IS NULL OR project_id = $1)
             ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list workspaces")
    }

    async fn update_workspace_status(&self, container_id: &str, status: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE workspaces SET status = $2 WHERE container_id = $1")
            .bind(container_id)
            .bind(status)
            .execute(&self.pool)
            .await
            .context("Failed to update workspace status")?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_workspace(&self, container_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workspaces WHERE container_id = $1")
            .bind(container_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove workspace")?;
        Ok(result.rows_affected() > 0)
    }

    async fn db_test(&self, message: &str) -> Result<(DbTestRecord, Vec<DbTestRecord>)> {
        let record = sqlx::query_as::<_, DbTestRecord>(
            "INSERT INTO test_table (message) VALUES ($1) RETURNING id, message, created_at",
        )
        .bind(message)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert test record")?;

        let recent = sqlx::query_as::<_, DbTestRecord>(
            "SELECT id, message, created_at FROM test_table ORDER BY created_at DESC, id DESC LIMIT 5",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent test records")?;

        Ok((record, recent))
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats> {
        let (projects, deployments, activities, workspaces): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM projects),
                    (SELECT COUNT(*) FROM deployments),
                    (SELECT COUNT(*) FROM activity_logs),
                    (SELECT COUNT(*) FROM workspaces)",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to load dashboard counts")?;

        Ok(DashboardStats {
            projects,
            deployments,
            activities,
            workspaces,
        })
    }
}

impl PgStore {
    async fn project_exists(&self, id: i64) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM projects WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check project existence")
    }
}
