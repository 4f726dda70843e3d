//! Integration tests for CloudX
//!
//! The CLI tests run the built binary; the platform tests drive the full
//! router against the in-memory store and a scripted container runtime.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn cloudx() -> Command {
    let mut cmd = cargo_bin_cmd!("cloudx");
    // Keep the host environment out of the effective config.
    for key in [
        "CLOUDX_HOST",
        "CLOUDX_PORT",
        "CLOUDX_DEBUG",
        "SECRET_KEY",
        "POSTGRES_HOST",
        "POSTGRES_DB",
        "POSTGRES_USER",
        "POSTGRES_PASSWORD",
        "POSTGRES_PORT",
        "CLOUDX_WORKSPACE_IMAGE",
        "CLOUDX_PUBLIC_HOST",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

// =============================================================================
// CLI
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_cloudx_help() {
        cloudx()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"));
    }

    #[test]
    fn test_cloudx_version() {
        cloudx()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        cloudx().arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_config_shows_defaults_redacted() {
        let dir = TempDir::new().unwrap();
        cloudx()
            .current_dir(dir.path())
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 5000"))
            .stdout(predicate::str::contains("image = \"cloudx/workspace:latest\""))
            .stdout(predicate::str::contains("cloudx_password").not());
    }

    #[test]
    fn test_config_reads_file_and_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            "[server]\nport = 8123\n\n[workspace]\nmax_per_project = 1\n",
        )
        .unwrap();

        cloudx()
            .current_dir(dir.path())
            .args(["--config", path.to_str().unwrap(), "config"])
            .env("POSTGRES_HOST", "pg.internal")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 8123"))
            .stdout(predicate::str::contains("max_per_project = 1"))
            .stdout(predicate::str::contains("host = \"pg.internal\""));
    }

    #[test]
    fn test_config_invalid_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[server\nport = ").unwrap();

        cloudx()
            .args(["--config", path.to_str().unwrap(), "config"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to load configuration"));
    }

    #[test]
    fn test_init_db_reports_unreachable_database() {
        let dir = TempDir::new().unwrap();
        cloudx()
            .current_dir(dir.path())
            .arg("init-db")
            .env("POSTGRES_HOST", "127.0.0.1")
            .env("POSTGRES_PORT", "1")
            .timeout(std::time::Duration::from_secs(60))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to connect to PostgreSQL"));
    }
}

// =============================================================================
// Platform, end to end through the router
// =============================================================================

mod platform_flows {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use cloudx::config::WorkspaceConfig;
    use cloudx::platform::api::AppState;
    use cloudx::platform::db::MemoryStore;
    use cloudx::platform::server::build_router;
    use cloudx::platform::test_support::{FakeRuntime, Startup};

    fn workspace_config() -> WorkspaceConfig {
        WorkspaceConfig {
            readiness_timeout_secs: 1,
            poll_interval_ms: 10,
            max_per_project: 2,
            ..Default::default()
        }
    }

    fn app_with(runtime: Arc<FakeRuntime>) -> Router {
        let state = Arc::new(AppState::new(
            Arc::new(MemoryStore::new()),
            runtime,
            workspace_config(),
            b"integration-key".to_vec(),
        ));
        build_router(state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn create_project(app: &Router, name: &str) -> i64 {
        let (status, body) = call(
            app,
            "POST",
            "/create_project",
            Some(json!({"name": name, "owner": "alice"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["project_id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_project_collaboration_flow() {
        let app = app_with(Arc::new(FakeRuntime::new()));
        let id = create_project(&app, "Team Project").await;

        for user in ["bob", "carol", "bob"] {
            let (status, body) = call(
                &app,
                "POST",
                "/add_collaborator",
                Some(json!({"project_id": id, "username": user})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({"success": true}));
        }

        let (_, body) = call(&app, "GET", &format!("/api/projects/{}", id), None).await;
        assert_eq!(body["project"]["collaborators"], json!(["bob", "carol"]));

        let (status, _) = call(
            &app,
            "POST",
            "/remove_collaborator",
            Some(json!({"project_id": id, "username": "bob"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "GET", &format!("/api/projects/{}", id), None).await;
        assert_eq!(body["project"]["collaborators"], json!(["carol"]));

        let (_, body) = call(&app, "GET", "/api/activities", None).await;
        assert!(body["activities"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn test_health_reports_checks() {
        let app = app_with(Arc::new(FakeRuntime::new()));
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "CloudX Platform");
        assert_eq!(body["checks"]["database"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_launch_then_manage_container() {
        let runtime = Arc::new(FakeRuntime::new());
        let app = app_with(runtime.clone());
        let id = create_project(&app, "ide").await;

        let (status, body) = call(&app, "POST", &format!("/api/projects/{}/launch", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let container_id = body["container_id"].as_str().unwrap().to_string();
        assert_eq!(runtime.live_ids(), vec![container_id.clone()]);

        let (_, body) = call(&app, "GET", "/api/containers", None).await;
        assert_eq!(body["containers"].as_array().unwrap().len(), 1);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/containers/{}/action", container_id),
            Some(json!({"action": "stop"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(runtime.state_of(&container_id).as_deref(), Some("exited"));

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/containers/{}/action", container_id),
            Some(json!({"action": "delete"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(runtime.live_ids().is_empty());

        let (_, body) = call(&app, "GET", &format!("/api/projects/{}/workspaces", id), None).await;
        assert!(body["workspaces"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_launch_with_unreachable_runtime() {
        let app = app_with(Arc::new(FakeRuntime::unreachable()));
        let id = create_project(&app, "offline").await;

        let (status, body) = call(&app, "POST", &format!("/api/projects/{}/launch", id), None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_launch_quota_is_429() {
        let app = app_with(Arc::new(FakeRuntime::new()));
        let id = create_project(&app, "busy").await;
        let uri = format!("/api/projects/{}/launch", id);

        for _ in 0..2 {
            let (status, _) = call(&app, "POST", &uri, None).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_readiness_timeout_removes_container() {
        let runtime = Arc::new(FakeRuntime::with_startup(Startup::Never));
        let app = app_with(runtime.clone());
        let id = create_project(&app, "slow").await;

        let (status, body) = call(&app, "POST", &format!("/api/projects/{}/launch", id), None).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["success"], false);
        assert_eq!(runtime.created().len(), 1);
        assert_eq!(runtime.removed().len(), 1);
        assert!(runtime.live_ids().is_empty());

        let (_, body) = call(&app, "GET", &format!("/api/projects/{}/workspaces", id), None).await;
        assert!(body["workspaces"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dashboard_renders_created_project() {
        let app = app_with(Arc::new(FakeRuntime::new()));
        create_project(&app, "<Visible & Escaped>").await;

        let request = Request::builder().uri("/projects").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("&lt;Visible &amp; Escaped&gt;"));
    }
}
