use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;

use super::Store;
use crate::platform::models::*;

/// In-process store. Data lives as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    projects: BTreeMap<i64, Project>,
    deployments: Vec<Deployment>,
    activities: Vec<ActivityLog>,
    metrics: Vec<SystemMetric>,
    sessions: BTreeMap<String, UserSession>,
    workspaces: Vec<Workspace>,
    db_test: Vec<DbTestRecord>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.inner
            .lock()
            .map_err(|e| anyhow!("Memory store lock poisoned: {}", e))
    }
}

/// Most recent `limit` items of an append-ordered list, newest first.
fn newest<T: Clone>(items: &[T], limit: i64) -> Vec<T> {
    items.iter().rev().take(limit.max(0) as usize).cloned().collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    async fn create_project(&self, new: &NewProject) -> Result<Project> {
        let mut t = self.lock()?;
        let id = t.next_id();
        let now = Utc::now();
        let project = Project {
            id,
            name: new.name.clone(),
            description: new.description.clone().unwrap_or_default(),
            repository_url: new.repository_url.clone(),
            status: new
                .status
                .clone()
                .unwrap_or_else(|| DEFAULT_PROJECT_STATUS.to_string()),
            owner: new.owner.clone().unwrap_or_else(|| DEFAULT_OWNER.to_string()),
            tags: new.tags.clone().unwrap_or_default(),
            collaborators: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        t.projects.insert(id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        Ok(self.lock()?.projects.get(&id).cloned())
    }

    async fn list_projects(&self, offset: i64, limit: i64) -> Result<Vec<Project>> {
        let t = self.lock()?;
        Ok(t.projects
            .values()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_projects(&self) -> Result<i64> {
        Ok(self.lock()?.projects.len() as i64)
    }

    async fn update_project(&self, id: i64, update: &ProjectUpdate) -> Result<Option<Project>> {
        let mut t = self.lock()?;
        Ok(t.projects.get_mut(&id).map(|project| {
            update.apply(project);
            project.updated_at = Utc::now();
            project.clone()
        }))
    }

    async fn add_collaborator(&self, project_id: i64, username: &str) -> Result<bool> {
        let mut t = self.lock()?;
        Ok(match t.projects.get_mut(&project_id) {
            Some(project) => {
                project.add_collaborator(username);
                true
            }
            None => false,
        })
    }

    async fn remove_collaborator(&self, project_id: i64, username: &str) -> Result<bool> {
        let mut t = self.lock()?;
        Ok(match t.projects.get_mut(&project_id) {
            Some(project) => {
                project.remove_collaborator(username);
                true
            }
            None => false,
        })
    }

    async fn create_deployment(&self, new: &NewDeployment) -> Result<Deployment> {
        let mut t = self.lock()?;
        if !t.projects.contains_key(&new.project_id) {
            return Err(anyhow!(
                "Project {} does not exist (foreign key violation)",
                new.project_id
            ));
        }
        let id = t.next_id();
        let deployment = Deployment {
            id,
            project_id: new.project_id,
            environment: new.environment.clone(),
            status: new.status.clone().unwrap_or_else(|| "pending".to_string()),
            version: new.version.clone(),
            commit_hash: new.commit_hash.clone(),
            deployed_by: new.deployed_by.clone(),
            duration_seconds: new.duration_seconds,
            deployed_at: Utc::now(),
        };
        t.deployments.push(deployment.clone());
        Ok(deployment)
    }

    async fn list_deployments(&self, project_id: Option<i64>, limit: i64) -> Result<Vec<Deployment>> {
        let t = self.lock()?;
        let filtered: Vec<Deployment> = t
            .deployments
            .iter()
            .filter(|d| project_id.is_none_or(|pid| d.project_id == pid))
            .cloned()
            .collect();
        Ok(newest(&filtered, limit))
    }

    async fn log_activity(&self, new: &NewActivity) -> Result<ActivityLog> {
        let mut t = self.lock()?;
        let id = t.next_id();
        let entry = ActivityLog {
            id,
            action: new.action.clone(),
            details: new.details.clone(),
            ip_address: new.ip_address.clone(),
            user_agent: new.user_agent.clone(),
            severity: new.severity.clone(),
            created_at: Utc::now(),
        };
        t.activities.push(entry.clone());
        Ok(entry)
    }

    async fn list_activities(&self, limit: i64) -> Result<Vec<ActivityLog>> {
        Ok(newest(&self.lock()?.activities, limit))
    }

    async fn record_metric(&self, new: &NewMetric) -> Result<SystemMetric> {
        let mut t = self.lock()?;
        let id = t.next_id();
        let metric = SystemMetric {
            id,
            metric_name: new.metric_name.clone(),
            metric_value: new.metric_value,
            unit: new.unit.clone(),
            recorded_at: Utc::now(),
        };
        t.metrics.push(metric.clone());
        Ok(metric)
    }

    async fn list_metrics(&self, limit: i64) -> Result<Vec<SystemMetric>> {
        Ok(newest(&self.lock()?.metrics, limit))
    }

    async fn touch_session(
        &self,
        session_id: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<UserSession> {
        let mut t = self.lock()?;
        let now = Utc::now();
        let session = t
            .sessions
            .entry(session_id.to_string())
            .and_modify(|s| s.last_seen = now)
            .or_insert_with(|| UserSession {
                session_id: session_id.to_string(),
                ip_address: ip_address.map(str::to_string),
                user_agent: user_agent.map(str::to_string),
                created_at: now,
                last_seen: now,
            });
        Ok(session.clone())
    }

    async fn record_workspace(&self, new: &NewWorkspace) -> Result<Workspace> {
        let mut t = self.lock()?;
        let id = t.next_id();
        let workspace = Workspace {
            id,
            project_id: new.project_id,
            container_id: new.container_id.clone(),
            container_name: new.container_name.clone(),
            editor_port: i32::from(new.editor_port),
            ssh_port: i32::from(new.ssh_port),
            status: new.status.clone(),
            created_at: Utc::now(),
        };
        t.workspaces.push(workspace.clone());
        Ok(workspace)
    }

    async fn list_workspaces(&self, project_id: Option<i64>) -> Result<Vec<Workspace>> {
        let t = self.lock()?;
        Ok(t.workspaces
            .iter()
            .filter(|w| project_id.is_none_or(|pid| w.project_id == pid))
            .cloned()
            .collect())
    }

    async fn update_workspace_status(&self, container_id: &str, status: &str) -> Result<bool> {
        let mut t = self.lock()?;
        let mut found = false;
        for w in t.workspaces.iter_mut().filter(|w| w.container_id == container_id) {
            w.status = status.to_string();
            found = true;
        }
        Ok(found)
    }

    async fn remove_workspace(&self, container_id: &str) -> Result<bool> {
        let mut t = self.lock()?;
        let before = t.workspaces.len();
        t.workspaces.retain(|w| w.container_id != container_id);
        Ok(t.workspaces.len() != before)
    }

    async fn db_test(&self, message: &str) -> Result<(DbTestRecord, Vec<DbTestRecord>)> {
        let mut t = self.lock()?;
        let id = t.next_id();
        let record = DbTestRecord {
            id,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        t.db_test.push(record.clone());
        let recent = newest(&t.db_test, 5);
        Ok((record, recent))
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats> {
        let t = self.lock()?;
        Ok(DashboardStats {
            projects: t.projects.len() as i64,
            deployments: t.deployments.len() as i64,
            activities: t.activities.len() as i64,
            workspaces: t.workspaces.len() as i64,
        })
    }
}
