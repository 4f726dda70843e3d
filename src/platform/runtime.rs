//! Container runtime seam.
//!
//! The provisioner only sees [`ContainerRuntime`]; [`DockerRuntime`] talks to
//! the Docker Engine API through `bollard`.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, RestartContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::errors::PlatformError;

/// Label marking containers this service launched.
pub const MANAGED_LABEL: &str = "cloudx.managed";
/// Label carrying the owning project id.
pub const PROJECT_LABEL: &str = "cloudx.project_id";

/// Seconds the runtime waits for a graceful stop before killing.
const STOP_GRACE_SECS: i32 = 10;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RuntimeError> for PlatformError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(id) => PlatformError::ContainerNotFound { id },
            RuntimeError::Other(e) => PlatformError::Runtime(e),
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// What to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// Container TCP ports to publish on runtime-chosen host ports.
    pub published_ports: Vec<u16>,
    pub labels: HashMap<String, String>,
}

/// Point-in-time view of one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStatus {
    pub id: String,
    pub state: String,
    pub running: bool,
    /// Container port → bound host port, only for ports that are bound.
    pub host_ports: HashMap<u16, u16>,
    pub labels: HashMap<String, String>,
}

impl ContainerStatus {
    /// Running with a host binding for every port in `ports`.
    pub fn is_ready(&self, ports: &[u16]) -> bool {
        self.running && ports.iter().all(|p| self.host_ports.contains_key(p))
    }

    /// Launched by this service.
    pub fn is_managed(&self) -> bool {
        self.labels.get(MANAGED_LABEL).is_some_and(|v| v == "true")
    }

    /// The container has stopped and will not become ready on its own.
    pub fn has_exited(&self) -> bool {
        matches!(self.state.as_str(), "exited" | "dead" | "removing")
    }
}

/// Listing entry for a managed container.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub created: Option<DateTime<Utc>>,
    pub project_id: Option<i64>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime answers.
    async fn ping(&self) -> RuntimeResult<()>;

    /// Create and start a detached container. Returns its id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerStatus>;

    /// Containers carrying `label=value`, including stopped ones.
    async fn list(&self, label: &str, value: &str) -> RuntimeResult<Vec<ContainerInfo>>;

    async fn stop(&self, id: &str) -> RuntimeResult<()>;
    async fn restart(&self, id: &str) -> RuntimeResult<()>;
    /// Force-remove, stopping first if needed.
    async fn remove(&self, id: &str) -> RuntimeResult<()>;

    /// Last `tail` lines of combined stdout/stderr.
    async fn logs(&self, id: &str, tail: usize) -> RuntimeResult<String>;
}

// ── Docker ───────────────────────────────────────────────────────────

/// Docker Engine backend.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    /// The daemon is not contacted until the first call.
    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| anyhow!("Failed to connect to Docker: {}", e))?;
        Ok(Self { docker })
    }
}

/// Map a bollard error, treating HTTP 404 as a missing container.
fn classify(id: &str, what: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        other => RuntimeError::Other(anyhow!("Failed to {} container {}: {}", what, id, other)),
    }
}

fn port_key(port: u16) -> String {
    format!("{}/tcp", port)
}

/// Parse `"8080/tcp"` into `8080`.
fn parse_port_key(key: &str) -> Option<u16> {
    key.split('/').next()?.parse().ok()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| anyhow!("Docker is not reachable: {}", e))?;
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .published_ports
            .iter()
            .map(|port| {
                (
                    port_key(*port),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        // Empty host port lets the daemon pick a free one.
                        host_port: Some(String::new()),
                    }]),
                )
            })
            .collect();

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| anyhow!("Failed to create container {}: {}", spec.name, e))?;

        debug!(container = %spec.name, id = %created.id, "container created");

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            // Don't leave a created-but-never-started container behind.
            let _ = self.remove(&created.id).await;
            return Err(classify(&created.id, "start", e));
        }

        info!(container = %spec.name, id = %created.id, image = %spec.image, "container started");
        Ok(created.id)
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerStatus> {
        let resp = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(id, "inspect", e))?;

        let state = resp.state.as_ref();
        let running = state.and_then(|s| s.running).unwrap_or(false);
        let state_name = state
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let host_ports = resp
            .network_settings
            .and_then(|ns| ns.ports)
            .map(|ports| {
                ports
                    .into_iter()
                    .filter_map(|(key, bindings)| {
                        let container_port = parse_port_key(&key)?;
                        let host_port = bindings?
                            .into_iter()
                            .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))?;
                        Some((container_port, host_port))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let labels = resp.config.and_then(|c| c.labels).unwrap_or_default();

        Ok(ContainerStatus {
            id: resp.id.unwrap_or_else(|| id.to_string()),
            state: state_name,
            running,
            host_ports,
            labels,
        })
    }

    async fn list(&self, label: &str, value: &str) -> RuntimeResult<Vec<ContainerInfo>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}={}", label, value)]);

        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow!("Failed to list containers: {}", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let project_id = c
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(PROJECT_LABEL))
                    .and_then(|v| v.parse().ok());
                Some(ContainerInfo {
                    id,
                    name,
                    image: c.image.unwrap_or_default(),
                    state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                    created: c.created.and_then(|ts| DateTime::from_timestamp(ts, 0)),
                    project_id,
                })
            })
            .collect())
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        let options = StopContainerOptionsBuilder::default()
            .t(STOP_GRACE_SECS)
            .build();
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| classify(id, "stop", e))
    }

    async fn restart(&self, id: &str) -> RuntimeResult<()> {
        let options = RestartContainerOptionsBuilder::default()
            .t(STOP_GRACE_SECS)
            .build();
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(|e| classify(id, "restart", e))
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify(id, "remove", e))
    }

    async fn logs(&self, id: &str, tail: usize) -> RuntimeResult<String> {
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .tail(&tail.to_string())
            .build();

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(classify(id, "read logs of", e)),
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(running: bool, state: &str, ports: &[(u16, u16)]) -> ContainerStatus {
        ContainerStatus {
            id: "abc".into(),
            state: state.into(),
            running,
            host_ports: ports.iter().copied().collect(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_parse_port_key() {
        assert_eq!(parse_port_key("8080/tcp"), Some(8080));
        assert_eq!(parse_port_key("22"), Some(22));
        assert_eq!(parse_port_key("x/tcp"), None);
        assert_eq!(port_key(22), "22/tcp");
    }

    #[test]
    fn test_ready_requires_running_and_all_ports() {
        let ports = [8080, 22];
        assert!(!status(false, "created", &[]).is_ready(&ports));
        assert!(!status(true, "running", &[(8080, 49153)]).is_ready(&ports));
        assert!(status(true, "running", &[(8080, 49153), (22, 49154)]).is_ready(&ports));
    }

    #[test]
    fn test_is_managed_checks_label_value() {
        let mut s = status(true, "running", &[]);
        assert!(!s.is_managed());
        s.labels.insert(MANAGED_LABEL.into(), "false".into());
        assert!(!s.is_managed());
        s.labels.insert(MANAGED_LABEL.into(), "true".into());
        assert!(s.is_managed());
    }

    #[test]
    fn test_has_exited() {
        assert!(status(false, "exited", &[]).has_exited());
        assert!(status(false, "dead", &[]).has_exited());
        assert!(!status(false, "created", &[]).has_exited());
        assert!(!status(true, "running", &[]).has_exited());
    }

    #[test]
    fn test_not_found_maps_to_container_not_found() {
        let err: PlatformError = RuntimeError::NotFound("abc".into()).into();
        assert!(matches!(err, PlatformError::ContainerNotFound { ref id } if id == "abc"));

        let err: PlatformError = RuntimeError::Other(anyhow!("boom")).into();
        assert!(matches!(err, PlatformError::Runtime(_)));
    }

    #[test]
    fn test_classify_404() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(matches!(classify("abc", "stop", err), RuntimeError::NotFound(_)));

        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon error".into(),
        };
        match classify("abc", "stop", err) {
            RuntimeError::Other(e) => assert!(e.to_string().contains("Failed to stop container abc")),
            _ => panic!("Expected Other"),
        }
    }
}
