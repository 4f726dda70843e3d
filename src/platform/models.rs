use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROJECT_STATUS: &str = "active";
pub const DEFAULT_OWNER: &str = "anonymous";
pub const DEFAULT_SEVERITY: &str = "info";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub repository_url: Option<String>,
    pub status: String,
    pub owner: String,
    pub tags: Vec<String>,
    /// Ordered set of usernames; never contains duplicates.
    pub collaborators: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Add `username` unless already present. Returns whether the set changed.
    pub fn add_collaborator(&mut self, username: &str) -> bool {
        if self.collaborators.iter().any(|c| c == username) {
            return false;
        }
        self.collaborators.push(username.to_string());
        true
    }

    /// Remove `username` if present. Returns whether the set changed.
    pub fn remove_collaborator(&mut self, username: &str) -> bool {
        let before = self.collaborators.len();
        self.collaborators.retain(|c| c != username);
        self.collaborators.len() != before
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl NewProject {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Field replacement for an existing project. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub repository_url: Option<String>,
    pub status: Option<String>,
    pub owner: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl ProjectUpdate {
    pub fn apply(&self, project: &mut Project) {
        if let Some(name) = &self.name {
            project.name = name.clone();
        }
        if let Some(description) = &self.description {
            project.description = description.clone();
        }
        if let Some(repository_url) = &self.repository_url {
            project.repository_url = Some(repository_url.clone());
        }
        if let Some(status) = &self.status {
            project.status = status.clone();
        }
        if let Some(owner) = &self.owner {
            project.owner = owner.clone();
        }
        if let Some(tags) = &self.tags {
            project.tags = tags.clone();
        }
    }
}

/// One page of projects plus the derived page count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPage {
    pub projects: Vec<Project>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub pages: i64,
}

impl ProjectPage {
    pub fn page_count(total: i64, per_page: i64) -> i64 {
        if per_page <= 0 {
            return 0;
        }
        (total + per_page - 1) / per_page
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Deployment {
    pub id: i64,
    pub project_id: i64,
    pub environment: String,
    pub status: String,
    pub version: Option<String>,
    pub commit_hash: Option<String>,
    pub deployed_by: Option<String>,
    pub duration_seconds: Option<i32>,
    pub deployed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDeployment {
    pub project_id: i64,
    pub environment: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub deployed_by: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct ActivityLog {
    pub id: i64,
    pub action: String,
    pub details: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub severity: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewActivity {
    pub action: String,
    pub details: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct SystemMetric {
    pub id: i64,
    pub metric_name: String,
    pub metric_value: f64,
    pub unit: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMetric {
    pub metric_name: String,
    pub metric_value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct UserSession {
    pub session_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Tracked workspace container. The generated password is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Workspace {
    pub id: i64,
    pub project_id: i64,
    pub container_id: String,
    pub container_name: String,
    pub editor_port: i32,
    pub ssh_port: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWorkspace {
    pub project_id: i64,
    pub container_id: String,
    pub container_name: String,
    pub editor_port: u16,
    pub ssh_port: u16,
    pub status: String,
}

/// Connection info returned once, right after a successful launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSession {
    pub workspace: Workspace,
    pub editor_url: String,
    pub ssh_command: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct DbTestRecord {
    pub id: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Counts shown on the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DashboardStats {
    pub projects: i64,
    pub deployments: i64,
    pub activities: i64,
    pub workspaces: i64,
}
