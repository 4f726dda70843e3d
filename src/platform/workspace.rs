use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::activity::{ActivityLogger, RequestMeta};
use super::db::DbHandle;
use super::models::*;
use super::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerStatus, MANAGED_LABEL, PROJECT_LABEL,
    RuntimeError,
};
use super::ws::{WsMessage, WsSender, broadcast_message};
use crate::config::WorkspaceConfig;
use crate::errors::{PlatformError, PlatformResult};

/// Log lines returned when the caller doesn't ask for a count.
pub const DEFAULT_LOG_TAIL: usize = 200;
const MAX_LOG_TAIL: usize = 5000;
/// Upper bound on the runtime ping behind `/health`.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Stop,
    Restart,
    Delete,
}

impl ContainerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Delete => "delete",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Stop => "stopped",
            Self::Restart => "restarted",
            Self::Delete => "deleted",
        }
    }
}

impl FromStr for ContainerAction {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "delete" | "remove" => Ok(Self::Delete),
            other => Err(PlatformError::InvalidAction {
                action: other.to_string(),
            }),
        }
    }
}

/// A managed container joined with its tracked ports, if any.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedContainer {
    #[serde(flatten)]
    pub info: ContainerInfo,
    pub editor_port: Option<i32>,
    pub ssh_port: Option<i32>,
}

/// Removes the project from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<i64>>,
    project_id: i64,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<i64>>, project_id: i64) -> PlatformResult<Self> {
        let mut in_flight = set.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(project_id) {
            return Err(PlatformError::LaunchInProgress { project_id });
        }
        Ok(Self { set, project_id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.project_id);
    }
}

/// Removes a created container when dropped while still armed, so a launch
/// abandoned mid-flight (client gone, handler cancelled) leaves nothing
/// running untracked.
struct ContainerCleanup {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerCleanup {
    fn arm(runtime: Arc<dyn ContainerRuntime>, id: &str) -> Self {
        Self {
            runtime,
            id: Some(id.to_string()),
        }
    }

    /// The container is tracked now; keep it.
    fn disarm(mut self) {
        self.id = None;
    }

    /// Remove the container before returning.
    async fn remove_now(mut self) {
        if let Some(id) = self.id.take() {
            remove_quietly(self.runtime.as_ref(), &id).await;
        }
    }
}

impl Drop for ContainerCleanup {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = self.runtime.clone();
                warn!(container_id = %id, "launch abandoned, removing container");
                handle.spawn(async move { remove_quietly(runtime.as_ref(), &id).await });
            }
            // The reaper collects it once a runtime is back.
            Err(_) => warn!(container_id = %id, "launch abandoned outside a runtime"),
        }
    }
}

async fn remove_quietly(runtime: &dyn ContainerRuntime, id: &str) {
    match runtime.remove(id).await {
        Ok(()) | Err(RuntimeError::NotFound(_)) => {}
        Err(e) => warn!(container_id = id, error = %e, "failed to remove container"),
    }
}

/// Starts and manages per-project workspace containers.
///
/// Launches are bounded three ways: one in flight per project, a quota of
/// tracked workspaces per project, and a global semaphore.
pub struct WorkspaceProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    db: DbHandle,
    activity: ActivityLogger,
    ws_tx: WsSender,
    config: WorkspaceConfig,
    launch_permits: Semaphore,
    in_flight: Mutex<HashSet<i64>>,
}

impl WorkspaceProvisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: DbHandle,
        ws_tx: WsSender,
        config: WorkspaceConfig,
    ) -> Self {
        Self {
            runtime,
            activity: ActivityLogger::new(db.clone()),
            db,
            ws_tx,
            launch_permits: Semaphore::new(config.max_concurrent_launches.max(1)),
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Whether the container runtime answers a ping within [`PING_TIMEOUT`].
    pub async fn runtime_reachable(&self) -> bool {
        match tokio::time::timeout(PING_TIMEOUT, self.runtime.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "container runtime ping failed");
                false
            }
            Err(_) => {
                debug!("container runtime ping timed out");
                false
            }
        }
    }

    fn readiness_timeout_error(&self, name: &str) -> PlatformError {
        PlatformError::ReadinessTimeout {
            container: name.to_string(),
            waited_secs: self.config.readiness_timeout_secs,
        }
    }

    fn published_ports(&self) -> [u16; 2] {
        [self.config.editor_port, self.config.ssh_port]
    }

    /// Launch a workspace container for `project_id` and wait until it is
    /// reachable. The returned password is not stored anywhere.
    pub async fn launch(
        &self,
        project_id: i64,
        meta: &RequestMeta,
    ) -> PlatformResult<WorkspaceSession> {
        self.db
            .get_project(project_id)
            .await
            .map_err(PlatformError::Database)?
            .ok_or(PlatformError::ProjectNotFound { id: project_id })?;

        let _guard = InFlightGuard::acquire(&self.in_flight, project_id)?;

        let tracked = self
            .db
            .list_workspaces(Some(project_id))
            .await
            .map_err(PlatformError::Database)?;
        if tracked.len() >= self.config.max_per_project {
            return Err(PlatformError::QuotaExceeded {
                project_id,
                limit: self.config.max_per_project,
            });
        }

        let _permit = self
            .launch_permits
            .acquire()
            .await
            .map_err(|_| PlatformError::Runtime(anyhow!("Launch queue is closed")))?;

        let password = hex::encode(rand::random::<[u8; 4]>());
        let name = format!(
            "cloudx-ws-{}-{}",
            project_id,
            hex::encode(rand::random::<[u8; 2]>())
        );

        let spec = ContainerSpec {
            name: name.clone(),
            image: self.config.image.clone(),
            env: vec![(self.config.password_env.clone(), password.clone())],
            published_ports: self.published_ports().to_vec(),
            labels: HashMap::from([
                (PROJECT_LABEL.to_string(), project_id.to_string()),
                (MANAGED_LABEL.to_string(), "true".to_string()),
            ]),
        };

        info!(project_id, container = %name, image = %spec.image, "launching workspace");
        // One deadline covers creation and readiness. A container created
        // after it passes is labelled and left to the reaper.
        let deadline = Instant::now() + self.config.readiness_timeout();
        let container_id =
            match tokio::time::timeout_at(deadline, self.runtime.create_and_start(&spec)).await {
                Ok(created) => created?,
                Err(_) => return Err(self.readiness_timeout_error(&name)),
            };
        let cleanup = ContainerCleanup::arm(self.runtime.clone(), &container_id);

        let status = match self.wait_until_ready(&container_id, &name, deadline).await {
            Ok(status) => status,
            Err(e) => {
                warn!(project_id, container = %name, error = %e, "workspace never became ready");
                cleanup.remove_now().await;
                return Err(e);
            }
        };

        let (Some(editor_port), Some(ssh_port)) = (
            status.host_ports.get(&self.config.editor_port).copied(),
            status.host_ports.get(&self.config.ssh_port).copied(),
        ) else {
            cleanup.remove_now().await;
            return Err(PlatformError::Runtime(anyhow!(
                "Workspace container {} has no host port bindings",
                name
            )));
        };

        let new = NewWorkspace {
            project_id,
            container_id: container_id.clone(),
            container_name: name.clone(),
            editor_port,
            ssh_port,
            status: status.state.clone(),
        };
        let workspace = match self.db.record_workspace(&new).await {
            Ok(w) => w,
            Err(e) => {
                cleanup.remove_now().await;
                return Err(PlatformError::Database(e));
            }
        };
        cleanup.disarm();

        self.activity
            .log(
                "workspace_launched",
                format!(
                    "Launched workspace {} for project {} (editor :{}, ssh :{})",
                    name, project_id, editor_port, ssh_port
                ),
                meta,
            )
            .await;
        broadcast_message(
            &self.ws_tx,
            &WsMessage::WorkspaceLaunched {
                workspace: workspace.clone(),
            },
        );

        info!(project_id, container = %name, editor_port, ssh_port, "workspace ready");

        let host = &self.config.public_host;
        Ok(WorkspaceSession {
            editor_url: format!("http://{}:{}", host, editor_port),
            ssh_command: format!("ssh -p {} {}@{}", ssh_port, self.config.ssh_user, host),
            password,
            workspace,
        })
    }

    /// Poll until running with both ports bound, the container exits, or
    /// `deadline` passes. A hung `inspect` is cut off at the deadline too.
    async fn wait_until_ready(
        &self,
        id: &str,
        name: &str,
        deadline: Instant,
    ) -> PlatformResult<ContainerStatus> {
        let ports = self.published_ports();

        loop {
            let status = match tokio::time::timeout_at(deadline, self.runtime.inspect(id)).await {
                Ok(inspected) => inspected?,
                Err(_) => return Err(self.readiness_timeout_error(name)),
            };
            if status.is_ready(&ports) {
                return Ok(status);
            }
            if status.has_exited() {
                return Err(PlatformError::Runtime(anyhow!(
                    "Workspace container {} stopped during startup (state: {})",
                    name,
                    status.state
                )));
            }
            if Instant::now() >= deadline {
                return Err(self.readiness_timeout_error(name));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Inspect `id` and make sure this service launched it. Containers
    /// without the managed label are reported as not found.
    async fn managed_container(&self, id: &str) -> PlatformResult<ContainerStatus> {
        let status = self.runtime.inspect(id).await?;
        if !status.is_managed() {
            debug!(container_id = id, "refusing to touch unmanaged container");
            return Err(PlatformError::ContainerNotFound { id: id.to_string() });
        }
        Ok(status)
    }

    /// Managed containers, newest ids first as the runtime reports them,
    /// with the ports recorded at launch.
    pub async fn list_containers(&self) -> PlatformResult<Vec<ManagedContainer>> {
        let containers = self.runtime.list(MANAGED_LABEL, "true").await?;
        let tracked: HashMap<String, Workspace> = self
            .db
            .list_workspaces(None)
            .await
            .map_err(PlatformError::Database)?
            .into_iter()
            .map(|w| (w.container_id.clone(), w))
            .collect();

        Ok(containers
            .into_iter()
            .map(|info| {
                let ws = tracked.get(&info.id);
                ManagedContainer {
                    editor_port: ws.map(|w| w.editor_port),
                    ssh_port: ws.map(|w| w.ssh_port),
                    info,
                }
            })
            .collect())
    }

    /// Apply `action` to a managed container. `container_id` may be any id
    /// form the runtime resolves; tracked rows are matched on the full id.
    pub async fn container_action(
        &self,
        container_id: &str,
        action: ContainerAction,
        meta: &RequestMeta,
    ) -> PlatformResult<()> {
        let status = self.managed_container(container_id).await?;
        let container_id = status.id.as_str();
        match action {
            ContainerAction::Stop => {
                self.runtime.stop(container_id).await?;
                self.set_tracked_status(container_id, "exited").await?;
            }
            ContainerAction::Restart => {
                self.runtime.restart(container_id).await?;
                self.set_tracked_status(container_id, "running").await?;
            }
            ContainerAction::Delete => {
                self.runtime.remove(container_id).await?;
                self.db
                    .remove_workspace(container_id)
                    .await
                    .map_err(PlatformError::Database)?;
            }
        }

        info!(container_id, action = action.as_str(), "container action applied");
        self.activity
            .log(
                &format!("container_{}", action.as_str()),
                format!("{} container {}", action.as_str(), container_id),
                meta,
            )
            .await;
        broadcast_message(
            &self.ws_tx,
            &WsMessage::ContainerAction {
                container_id: container_id.to_string(),
                action: action.as_str().to_string(),
            },
        );
        Ok(())
    }

    async fn set_tracked_status(&self, container_id: &str, status: &str) -> PlatformResult<()> {
        self.db
            .update_workspace_status(container_id, status)
            .await
            .map_err(PlatformError::Database)?;
        Ok(())
    }

    pub async fn container_logs(
        &self,
        container_id: &str,
        tail: Option<usize>,
    ) -> PlatformResult<String> {
        let status = self.managed_container(container_id).await?;
        let tail = tail.unwrap_or(DEFAULT_LOG_TAIL).clamp(1, MAX_LOG_TAIL);
        Ok(self.runtime.logs(&status.id, tail).await?)
    }

    /// Drop tracked workspaces whose container is gone, refresh the status
    /// of the rest, and remove managed containers that have no row and no
    /// launch in flight. Returns how many rows and containers were dropped.
    pub async fn reap(&self) -> PlatformResult<usize> {
        // Order matters: a launch records its row before leaving the
        // in-flight set, so any container listed here either shows up in
        // `in_flight` or in `tracked`.
        let managed = self.runtime.list(MANAGED_LABEL, "true").await?;
        let in_flight: HashSet<i64> = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let tracked = self
            .db
            .list_workspaces(None)
            .await
            .map_err(PlatformError::Database)?;
        let tracked_ids: HashSet<String> =
            tracked.iter().map(|w| w.container_id.clone()).collect();

        let mut dropped = 0;
        for container in managed {
            if tracked_ids.contains(&container.id)
                || container.project_id.is_some_and(|p| in_flight.contains(&p))
            {
                continue;
            }
            match self.runtime.remove(&container.id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {
                    info!(container = %container.name, "removed untracked workspace container");
                    dropped += 1;
                }
                Err(e) => {
                    warn!(container = %container.name, error = %e, "failed to remove untracked container")
                }
            }
        }

        for ws in tracked {
            match self.runtime.inspect(&ws.container_id).await {
                Ok(status) => {
                    if status.state != ws.status {
                        self.set_tracked_status(&ws.container_id, &status.state)
                            .await?;
                    }
                }
                Err(RuntimeError::NotFound(_)) => {
                    self.db
                        .remove_workspace(&ws.container_id)
                        .await
                        .map_err(PlatformError::Database)?;
                    info!(
                        project_id = ws.project_id,
                        container = %ws.container_name,
                        "dropped workspace whose container is gone"
                    );
                    dropped += 1;
                }
                // Runtime unreachable: keep every row until it answers again.
                Err(e) => return Err(e.into()),
            }
        }
        Ok(dropped)
    }

    /// Run [`reap`](Self::reap) every `interval` until the task is aborted.
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.reap().await {
                    Ok(0) => {}
                    Ok(n) => info!(dropped = n, "workspace reaper pass"),
                    Err(e) => debug!(error = %e, "workspace reaper pass failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::db::MemoryStore;
    use crate::platform::test_support::{FakeRuntime, Startup};
    use crate::platform::ws;

    struct Harness {
        runtime: Arc<FakeRuntime>,
        db: DbHandle,
        provisioner: WorkspaceProvisioner,
        ws_tx: WsSender,
    }

    fn fast_config() -> WorkspaceConfig {
        WorkspaceConfig {
            readiness_timeout_secs: 1,
            poll_interval_ms: 10,
            public_host: "dev.example.com".into(),
            ..Default::default()
        }
    }

    async fn harness_with(runtime: FakeRuntime, config: WorkspaceConfig) -> (Harness, i64) {
        let runtime = Arc::new(runtime);
        let db: DbHandle = Arc::new(MemoryStore::new());
        let project = db.create_project(&NewProject::named("Demo")).await.unwrap();
        let ws_tx = ws::channel();
        let provisioner =
            WorkspaceProvisioner::new(runtime.clone(), db.clone(), ws_tx.clone(), config);
        (
            Harness {
                runtime,
                db,
                provisioner,
                ws_tx,
            },
            project.id,
        )
    }

    async fn harness() -> (Harness, i64) {
        harness_with(FakeRuntime::new(), fast_config()).await
    }

    #[test]
    fn test_container_action_parse() {
        assert_eq!("stop".parse::<ContainerAction>().unwrap(), ContainerAction::Stop);
        assert_eq!("restart".parse::<ContainerAction>().unwrap(), ContainerAction::Restart);
        assert_eq!("delete".parse::<ContainerAction>().unwrap(), ContainerAction::Delete);
        assert_eq!("remove".parse::<ContainerAction>().unwrap(), ContainerAction::Delete);
        assert!(matches!(
            "pause".parse::<ContainerAction>(),
            Err(PlatformError::InvalidAction { .. })
        ));
    }

    #[tokio::test]
    async fn test_launch_returns_connection_details() {
        let (h, project_id) = harness().await;
        let mut rx = h.ws_tx.subscribe();

        let session = h
            .provisioner
            .launch(project_id, &RequestMeta::default())
            .await
            .unwrap();

        assert_eq!(session.password.len(), 8);
        assert!(session.password.chars().all(|c| c.is_ascii_hexdigit()));
        let port = session.workspace.editor_port;
        assert_eq!(session.editor_url, format!("http://dev.example.com:{}", port));
        assert_eq!(
            session.ssh_command,
            format!("ssh -p {} coder@dev.example.com", session.workspace.ssh_port)
        );

        let name = &session.workspace.container_name;
        let prefix = format!("cloudx-ws-{}-", project_id);
        assert!(name.starts_with(&prefix));
        assert_eq!(name.len(), prefix.len() + 4);

        let created = h.runtime.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].image, "cloudx/workspace:latest");
        assert_eq!(
            created[0].env,
            vec![("PASSWORD".to_string(), session.password.clone())]
        );
        assert_eq!(created[0].labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(
            created[0].labels.get(PROJECT_LABEL),
            Some(&project_id.to_string())
        );

        let tracked = h.db.list_workspaces(Some(project_id)).await.unwrap();
        assert_eq!(tracked.len(), 1);

        let activities = h.db.list_activities(10).await.unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].action, "workspace_launched");
        assert!(!activities[0].details.contains(&session.password));

        let frame = rx.recv().await.unwrap();
        assert!(frame.payload.contains("workspace_launched"));
        assert!(!frame.payload.contains(&session.password));
    }

    #[tokio::test]
    async fn test_launch_unknown_project() {
        let (h, _) = harness().await;
        let err = h
            .provisioner
            .launch(999, &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::ProjectNotFound { id: 999 }));
        assert!(h.runtime.created().is_empty());
    }

    #[tokio::test]
    async fn test_launch_waits_for_readiness() {
        let (h, project_id) =
            harness_with(FakeRuntime::with_startup(Startup::ReadyAfter(3)), fast_config()).await;
        let session = h
            .provisioner
            .launch(project_id, &RequestMeta::default())
            .await
            .unwrap();
        assert_eq!(session.workspace.status, "running");
    }

    #[tokio::test]
    async fn test_readiness_timeout_removes_container() {
        let config = WorkspaceConfig {
            readiness_timeout_secs: 0,
            ..fast_config()
        };
        let (h, project_id) =
            harness_with(FakeRuntime::with_startup(Startup::Never), config).await;

        let err = h
            .provisioner
            .launch(project_id, &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::ReadinessTimeout { .. }));
        assert_eq!(h.runtime.removed().len(), 1);
        assert!(h.runtime.live_ids().is_empty());
        assert!(h.db.list_workspaces(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exited_container_is_removed() {
        let (h, project_id) =
            harness_with(FakeRuntime::with_startup(Startup::Exits), fast_config()).await;
        let err = h
            .provisioner
            .launch(project_id, &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Runtime(_)));
        assert!(err.to_string().contains("stopped during startup"));
        assert!(h.runtime.live_ids().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_runtime_error() {
        let (h, project_id) = harness_with(FakeRuntime::unreachable(), fast_config()).await;
        let err = h
            .provisioner
            .launch(project_id, &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Runtime(_)));
        assert!(!h.provisioner.runtime_reachable().await);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let config = WorkspaceConfig {
            max_per_project: 2,
            ..fast_config()
        };
        let (h, project_id) = harness_with(FakeRuntime::new(), config).await;
        let meta = RequestMeta::default();

        h.provisioner.launch(project_id, &meta).await.unwrap();
        h.provisioner.launch(project_id, &meta).await.unwrap();
        let err = h.provisioner.launch(project_id, &meta).await.unwrap_err();
        assert!(matches!(
            err,
            PlatformError::QuotaExceeded { limit: 2, .. }
        ));
        assert_eq!(h.runtime.created().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_launch_for_same_project_is_rejected() {
        let (h, project_id) = harness().await;
        let _held = InFlightGuard::acquire(&h.provisioner.in_flight, project_id).unwrap();
        let err = h
            .provisioner
            .launch(project_id, &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::LaunchInProgress { .. }));
    }

    #[tokio::test]
    async fn test_in_flight_guard_released_after_failure() {
        let config = WorkspaceConfig {
            readiness_timeout_secs: 0,
            ..fast_config()
        };
        let (h, project_id) =
            harness_with(FakeRuntime::with_startup(Startup::Never), config).await;
        let meta = RequestMeta::default();
        let _ = h.provisioner.launch(project_id, &meta).await;
        // A second attempt fails for readiness again, not for being in flight.
        let err = h.provisioner.launch(project_id, &meta).await.unwrap_err();
        assert!(matches!(err, PlatformError::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_list_containers_includes_ports() {
        let (h, project_id) = harness().await;
        let session = h
            .provisioner
            .launch(project_id, &RequestMeta::default())
            .await
            .unwrap();

        let containers = h.provisioner.list_containers().await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].info.project_id, Some(project_id));
        assert_eq!(containers[0].editor_port, Some(session.workspace.editor_port));
    }

    #[tokio::test]
    async fn test_container_actions() {
        let (h, project_id) = harness().await;
        let meta = RequestMeta::default();
        let session = h.provisioner.launch(project_id, &meta).await.unwrap();
        let id = session.workspace.container_id.clone();

        h.provisioner
            .container_action(&id, ContainerAction::Stop, &meta)
            .await
            .unwrap();
        assert_eq!(h.runtime.state_of(&id).as_deref(), Some("exited"));
        assert_eq!(h.db.list_workspaces(None).await.unwrap()[0].status, "exited");

        h.provisioner
            .container_action(&id, ContainerAction::Restart, &meta)
            .await
            .unwrap();
        assert_eq!(h.runtime.state_of(&id).as_deref(), Some("running"));

        h.provisioner
            .container_action(&id, ContainerAction::Delete, &meta)
            .await
            .unwrap();
        assert!(h.runtime.live_ids().is_empty());
        assert!(h.db.list_workspaces(None).await.unwrap().is_empty());

        let err = h
            .provisioner
            .container_action(&id, ContainerAction::Stop, &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::ContainerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_container_logs_tail() {
        let (h, project_id) = harness().await;
        let session = h
            .provisioner
            .launch(project_id, &RequestMeta::default())
            .await
            .unwrap();
        let id = &session.workspace.container_id;

        let all = h.provisioner.container_logs(id, None).await.unwrap();
        assert_eq!(all.lines().count(), 3);
        let last = h.provisioner.container_logs(id, Some(1)).await.unwrap();
        assert_eq!(last.lines().count(), 1);
        assert!(last.contains("line 3"));
    }

    #[tokio::test]
    async fn test_reap_drops_vanished_containers() {
        let (h, project_id) = harness().await;
        let meta = RequestMeta::default();
        let a = h.provisioner.launch(project_id, &meta).await.unwrap();
        let b = h.provisioner.launch(project_id, &meta).await.unwrap();

        h.runtime.vanish(&a.workspace.container_id);
        assert_eq!(h.provisioner.reap().await.unwrap(), 1);

        let remaining = h.db.list_workspaces(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].container_id, b.workspace.container_id);

        assert_eq!(h.provisioner.reap().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unmanaged_container_is_off_limits() {
        let (h, _) = harness().await;
        let meta = RequestMeta::default();
        let db_container = h.runtime.add_foreign("postgres", "postgres:16");

        let err = h
            .provisioner
            .container_logs(&db_container, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::ContainerNotFound { .. }));

        for action in [ContainerAction::Stop, ContainerAction::Restart, ContainerAction::Delete] {
            let err = h
                .provisioner
                .container_action(&db_container, action, &meta)
                .await
                .unwrap_err();
            assert!(matches!(err, PlatformError::ContainerNotFound { .. }));
        }
        assert_eq!(h.runtime.live_ids(), vec![db_container.clone()]);
        assert_eq!(h.runtime.state_of(&db_container).as_deref(), Some("running"));
        assert!(h.provisioner.list_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_launch_removes_container() {
        let config = WorkspaceConfig {
            readiness_timeout_secs: 30,
            ..fast_config()
        };
        let (h, project_id) =
            harness_with(FakeRuntime::with_startup(Startup::ReadyAfter(1000)), config).await;

        let meta = RequestMeta::default();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            h.provisioner.launch(project_id, &meta),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(h.runtime.created().len(), 1);

        // Removal runs on a spawned task.
        for _ in 0..100 {
            if h.runtime.live_ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.runtime.live_ids().is_empty());
        assert!(h.db.list_workspaces(None).await.unwrap().is_empty());

        // The project is free to launch again.
        assert!(InFlightGuard::acquire(&h.provisioner.in_flight, project_id).is_ok());
    }

    fn managed_spec(project_id: i64) -> ContainerSpec {
        ContainerSpec {
            name: format!("cloudx-ws-{}-late", project_id),
            image: "cloudx/workspace:latest".into(),
            env: Vec::new(),
            published_ports: vec![8080, 22],
            labels: HashMap::from([
                (PROJECT_LABEL.to_string(), project_id.to_string()),
                (MANAGED_LABEL.to_string(), "true".to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn test_reap_removes_untracked_managed_containers() {
        let (h, project_id) = harness().await;
        let meta = RequestMeta::default();
        let kept = h.provisioner.launch(project_id, &meta).await.unwrap();
        let foreign = h.runtime.add_foreign("postgres", "postgres:16");
        let orphan = h
            .runtime
            .create_and_start(&managed_spec(project_id))
            .await
            .unwrap();

        assert_eq!(h.provisioner.reap().await.unwrap(), 1);
        let mut live = h.runtime.live_ids();
        live.sort();
        let mut expected = vec![kept.workspace.container_id.clone(), foreign];
        expected.sort();
        assert_eq!(live, expected);
        assert_eq!(h.runtime.removed(), vec![orphan]);
    }

    #[tokio::test]
    async fn test_reap_skips_launch_in_flight() {
        let (h, project_id) = harness().await;
        let starting = h
            .runtime
            .create_and_start(&managed_spec(project_id))
            .await
            .unwrap();

        let held = InFlightGuard::acquire(&h.provisioner.in_flight, project_id).unwrap();
        assert_eq!(h.provisioner.reap().await.unwrap(), 0);
        assert_eq!(h.runtime.live_ids(), vec![starting]);

        drop(held);
        assert_eq!(h.provisioner.reap().await.unwrap(), 1);
        assert!(h.runtime.live_ids().is_empty());
    }

    #[tokio::test]
    async fn test_hung_inspect_stops_at_deadline() {
        let (h, project_id) = harness_with(FakeRuntime::stalled(), fast_config()).await;

        let started = std::time::Instant::now();
        let err = h
            .provisioner
            .launch(project_id, &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::ReadinessTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(h.runtime.removed().len(), 1);
        assert!(h.runtime.live_ids().is_empty());
    }

    #[tokio::test]
    async fn test_hung_ping_reports_unreachable() {
        let (h, _) = harness_with(FakeRuntime::stalled(), fast_config()).await;
        let started = std::time::Instant::now();
        assert!(!h.provisioner.runtime_reachable().await);
        assert!(started.elapsed() < PING_TIMEOUT + Duration::from_secs(2));
    }
}
