//! Scripted container runtime and store doubles for tests that must not
//! touch Docker or PostgreSQL.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;

use super::db::{MemoryStore, Store};
use super::models::*;
use super::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerStatus, PROJECT_LABEL, RuntimeError,
    RuntimeResult,
};

/// How a freshly started container behaves under `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// Running with bound ports after this many inspects.
    ReadyAfter(usize),
    /// Stays in `created` forever.
    Never,
    /// Reports `exited` on the first inspect.
    Exits,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    state: String,
    inspects: usize,
    host_ports: HashMap<u16, u16>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    created: Vec<ContainerSpec>,
    removed: Vec<String>,
    next_id: u32,
}

pub struct FakeRuntime {
    startup: Startup,
    reachable: bool,
    /// `ping` and `inspect` never answer.
    stalled: bool,
    state: Mutex<FakeState>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    /// Containers are ready on the first inspect.
    pub fn new() -> Self {
        Self::with_startup(Startup::ReadyAfter(0))
    }

    pub fn with_startup(startup: Startup) -> Self {
        Self {
            startup,
            reachable: true,
            stalled: false,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Containers are created but the daemon hangs on `ping` and `inspect`.
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Self::new()
        }
    }

    /// Every call fails as if the daemon were down.
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(&self) -> RuntimeResult<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(RuntimeError::Other(anyhow!(
                "Docker is not reachable: connection refused"
            )))
        }
    }

    /// Specs passed to `create_and_start`, in order.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    /// Ids passed to `remove`, in order.
    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    /// Ids of containers that still exist.
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a container behind the provisioner's back.
    pub fn vanish(&self, id: &str) {
        self.lock().containers.remove(id);
    }

    /// Start a container this service did not launch, as another tool
    /// sharing the daemon would.
    pub fn add_foreign(&self, name: &str, image: &str) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("foreign{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: ContainerSpec {
                    name: name.to_string(),
                    image: image.to_string(),
                    env: Vec::new(),
                    published_ports: Vec::new(),
                    labels: HashMap::new(),
                },
                state: "running".to_string(),
                inspects: 0,
                host_ports: HashMap::new(),
            },
        );
        id
    }

    pub fn state_of(&self, id: &str) -> Option<String> {
        self.lock().containers.get(id).map(|c| c.state.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.check_reachable()
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.check_reachable()?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("fake{:04}", state.next_id);
        let base = 49_000 + (state.next_id as u16) * 10;
        let host_ports = spec
            .published_ports
            .iter()
            .enumerate()
            .map(|(i, port)| (*port, base + i as u16))
            .collect();
        state.created.push(spec.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: "created".to_string(),
                inspects: 0,
                host_ports,
            },
        );
        Ok(id)
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerStatus> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.check_reachable()?;
        let startup = self.startup;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        if container.state == "created" {
            match startup {
                Startup::ReadyAfter(n) if container.inspects >= n => {
                    container.state = "running".to_string();
                }
                Startup::Exits => container.state = "exited".to_string(),
                _ => {}
            }
        }
        container.inspects += 1;

        let running = container.state == "running";
        Ok(ContainerStatus {
            id: id.to_string(),
            state: container.state.clone(),
            running,
            host_ports: if running {
                container.host_ports.clone()
            } else {
                HashMap::new()
            },
            labels: container.spec.labels.clone(),
        })
    }

    async fn list(&self, label: &str, value: &str) -> RuntimeResult<Vec<ContainerInfo>> {
        self.check_reachable()?;
        let state = self.lock();
        let mut out: Vec<ContainerInfo> = state
            .containers
            .iter()
            .filter(|(_, c)| c.spec.labels.get(label).is_some_and(|v| v == value))
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: c.spec.name.clone(),
                image: c.spec.image.clone(),
                state: c.state.clone(),
                status: c.state.clone(),
                created: Some(Utc::now()),
                project_id: c.spec.labels.get(PROJECT_LABEL).and_then(|v| v.parse().ok()),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        self.set_state(id, "exited")
    }

    async fn restart(&self, id: &str) -> RuntimeResult<()> {
        self.set_state(id, "running")
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        if state.containers.remove(id).is_none() {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn logs(&self, id: &str, tail: usize) -> RuntimeResult<String> {
        self.check_reachable()?;
        let state = self.lock();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let lines: Vec<String> = (1..=3)
            .map(|i| format!("{} line {}\n", container.spec.name, i))
            .collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines[skip..].concat())
    }
}

impl FakeRuntime {
    fn set_state(&self, id: &str, to: &str) -> RuntimeResult<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.state = to.to_string();
        Ok(())
    }
}

/// Store whose health check and best-effort writes (activity rows, session
/// records) fail while everything else goes to an in-memory store.
#[derive(Default)]
pub struct DegradedStore {
    inner: MemoryStore,
}

impl DegradedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unavailable<T>() -> anyhow::Result<T> {
    Err(anyhow!("database unavailable"))
}

#[async_trait]
impl Store for DegradedStore {
    async fn init_schema(&self) -> anyhow::Result<()> {
        self.inner.init_schema().await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        unavailable()
    }

    async fn create_project(&self, new: &NewProject) -> anyhow::Result<Project> {
        self.inner.create_project(new).await
    }

    async fn get_project(&self, id: i64) -> anyhow::Result<Option<Project>> {
        self.inner.get_project(id).await
    }

    async fn list_projects(&self, offset: i64, limit: i64) -> anyhow::Result<Vec<Project>> {
        self.inner.list_projects(offset, limit).await
    }

    async fn count_projects(&self) -> anyhow::Result<i64> {
        self.inner.count_projects().await
    }

    async fn update_project(
        &self,
        id: i64,
        update: &ProjectUpdate,
    ) -> anyhow::Result<Option<Project>> {
        self.inner.update_project(id, update).await
    }

    async fn add_collaborator(&self, project_id: i64, username: &str) -> anyhow::Result<bool> {
        self.inner.add_collaborator(project_id, username).await
    }

    async fn remove_collaborator(&self, project_id: i64, username: &str) -> anyhow::Result<bool> {
        self.inner.remove_collaborator(project_id, username).await
    }

    async fn create_deployment(&self, new: &NewDeployment) -> anyhow::Result<Deployment> {
        self.inner.create_deployment(new).await
    }

    async fn list_deployments(
        &self,
        project_id: Option<i64>,
        limit: i64,
    ) -> anyhow::Result<Vec<Deployment>> {
        self.inner.list_deployments(project_id, limit).await
    }

    async fn log_activity(&self, _new: &NewActivity) -> anyhow::Result<ActivityLog> {
        unavailable()
    }

    async fn list_activities(&self, limit: i64) -> anyhow::Result<Vec<ActivityLog>> {
        self.inner.list_activities(limit).await
    }

    async fn record_metric(&self, new: &NewMetric) -> anyhow::Result<SystemMetric> {
        self.inner.record_metric(new).await
    }

    async fn list_metrics(&self, limit: i64) -> anyhow::Result<Vec<SystemMetric>> {
        self.inner.list_metrics(limit).await
    }

    async fn touch_session(
        &self,
        _session_id: &str,
        _ip_address: Option<&str>,
        _user_agent: Option<&str>,
    ) -> anyhow::Result<UserSession> {
        unavailable()
    }

    async fn record_workspace(&self, new: &NewWorkspace) -> anyhow::Result<Workspace> {
        self.inner.record_workspace(new).await
    }

    async fn list_workspaces(&self, project_id: Option<i64>) -> anyhow::Result<Vec<Workspace>> {
        self.inner.list_workspaces(project_id).await
    }

    async fn update_workspace_status(
        &self,
        container_id: &str,
        status: &str,
    ) -> anyhow::Result<bool> {
        self.inner.update_workspace_status(container_id, status).await
    }

    async fn remove_workspace(&self, container_id: &str) -> anyhow::Result<bool> {
        self.inner.remove_workspace(container_id).await
    }

    async fn db_test(&self, message: &str) -> anyhow::Result<(DbTestRecord, Vec<DbTestRecord>)> {
        self.inner.db_test(message).await
    }

    async fn dashboard_stats(&self) -> anyhow::Result<DashboardStats> {
        self.inner.dashboard_stats().await
    }
}
