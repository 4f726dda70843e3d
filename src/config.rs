//! Layered configuration for the CloudX server.
//!
//! Values are resolved in order: built-in defaults, then `cloudx.toml`
//! (if present), then environment variables, then CLI flags (applied by the
//! binary).
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 5000
//! debug = false
//!
//! [database]
//! host = "db"
//! name = "cloudx"
//! user = "cloudx_user"
//! password = "cloudx_password"
//! port = 5432
//! max_connections = 5
//!
//! [workspace]
//! image = "cloudx/workspace:latest"
//! editor_port = 8080
//! ssh_port = 22
//! readiness_timeout_secs = 30
//! max_per_project = 3
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "cloudx.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudxConfig {
    pub server: ServerSection,
    pub database: DatabaseConfig,
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Enables permissive CORS and debug-level logging.
    pub debug: bool,
    /// Key used to sign session cookies. Generated per process when unset.
    pub secret_key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            debug: false,
            secret_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub name: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "db".to_string(),
            name: "cloudx".to_string(),
            user: "cloudx_user".to_string(),
            password: "cloudx_password".to_string(),
            port: 5432,
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    /// Connection settings for the pool. Credentials are passed as fields,
    /// so they never need URL escaping.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub image: String,
    /// Container port of the in-browser editor.
    pub editor_port: u16,
    /// Container port of the SSH daemon.
    pub ssh_port: u16,
    /// Environment variable the generated password is injected as.
    pub password_env: String,
    pub ssh_user: String,
    /// Host name put into the editor URL and SSH command handed to clients.
    pub public_host: String,
    pub readiness_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_concurrent_launches: usize,
    pub max_per_project: usize,
    pub reap_interval_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            image: "cloudx/workspace:latest".to_string(),
            editor_port: 8080,
            ssh_port: 22,
            password_env: "PASSWORD".to_string(),
            ssh_user: "coder".to_string(),
            public_host: "localhost".to_string(),
            readiness_timeout_secs: 30,
            poll_interval_ms: 500,
            max_concurrent_launches: 4,
            max_per_project: 3,
            reap_interval_secs: 60,
        }
    }
}

impl WorkspaceConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

impl CloudxConfig {
    /// Load from `path` (if it exists) and overlay the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML config file. Returns defaults if the file doesn't exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Overlay environment variables resolved through `lookup`.
    ///
    /// Unparseable numeric values are ignored and the previous value kept.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CLOUDX_HOST") {
            self.server.host = v;
        }
        if let Some(port) = lookup("CLOUDX_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(v) = lookup("CLOUDX_DEBUG") {
            self.server.debug = parse_flag(&v);
        }
        if let Some(v) = lookup("SECRET_KEY") {
            self.server.secret_key = Some(v);
        }

        if let Some(v) = lookup("POSTGRES_HOST") {
            self.database.host = v;
        }
        if let Some(v) = lookup("POSTGRES_DB") {
            self.database.name = v;
        }
        if let Some(v) = lookup("POSTGRES_USER") {
            self.database.user = v;
        }
        if let Some(v) = lookup("POSTGRES_PASSWORD") {
            self.database.password = v;
        }
        if let Some(port) = lookup("POSTGRES_PORT").and_then(|v| v.parse().ok()) {
            self.database.port = port;
        }

        if let Some(v) = lookup("CLOUDX_WORKSPACE_IMAGE") {
            self.workspace.image = v;
        }
        if let Some(v) = lookup("CLOUDX_PUBLIC_HOST") {
            self.workspace.public_host = v;
        }
    }

    /// Secret key for cookie signing, generating a random one when unset.
    pub fn secret_key(&self) -> Vec<u8> {
        match &self.server.secret_key {
            Some(key) if !key.is_empty() => key.as_bytes().to_vec(),
            _ => rand::random::<[u8; 32]>().to_vec(),
        }
    }

    /// Copy with credentials masked, for display.
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        shown.database.password = REDACTED.to_string();
        if shown.server.secret_key.is_some() {
            shown.server.secret_key = Some(REDACTED.to_string());
        }
        shown
    }
}

const REDACTED: &str = "********";

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CloudxConfig::default();
        assert_eq!(config.server.port, 5000);
        assert!(!config.server.debug);
        assert_eq!(config.database.host, "db");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.workspace.editor_port, 8080);
        assert_eq!(config.workspace.ssh_port, 22);
        assert_eq!(config.workspace.password_env, "PASSWORD");
        assert_eq!(config.workspace.max_per_project, 3);
    }

    #[test]
    fn test_connect_options() {
        let opts = DatabaseConfig::default().connect_options();
        assert_eq!(opts.get_host(), "db");
        assert_eq!(opts.get_port(), 5432);
        assert_eq!(opts.get_username(), "cloudx_user");
        assert_eq!(opts.get_database(), Some("cloudx"));
    }

    #[test]
    fn test_connect_options_password_with_url_characters() {
        let db = DatabaseConfig {
            host: "pg.internal".into(),
            password: "p@ss/w:rd#1".into(),
            ..Default::default()
        };
        let opts = db.connect_options();
        assert_eq!(opts.get_host(), "pg.internal");
        assert_eq!(opts.get_port(), 5432);
        assert_eq!(opts.get_database(), Some("cloudx"));
    }

    #[test]
    fn test_from_file_missing_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CloudxConfig::from_file(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
[server]
port = 8000

[workspace]
image = "codercom/code-server:4.9"
max_per_project = 1
"#,
        )
        .unwrap();

        let config = CloudxConfig::from_file(&path).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.host, "0.0.0.0"); // default
        assert_eq!(config.workspace.image, "codercom/code-server:4.9");
        assert_eq!(config.workspace.max_per_project, 1);
        assert_eq!(config.workspace.editor_port, 8080); // default
        assert_eq!(config.database.name, "cloudx"); // default
    }

    #[test]
    fn test_from_file_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(CloudxConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = CloudxConfig::default();
        config.apply_env(env_of(&[
            ("POSTGRES_HOST", "localhost"),
            ("POSTGRES_PORT", "6543"),
            ("POSTGRES_PASSWORD", "s3cret"),
            ("SECRET_KEY", "abc"),
            ("CLOUDX_DEBUG", "True"),
        ]));
        assert_eq!(config.database.host, "localhost");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.database.password, "s3cret");
        assert_eq!(config.server.secret_key.as_deref(), Some("abc"));
        assert!(config.server.debug);
    }

    #[test]
    fn test_env_bad_port_is_ignored() {
        let mut config = CloudxConfig::default();
        config.apply_env(env_of(&[("POSTGRES_PORT", "not-a-port")]));
        assert_eq!(config.database.port, 5432);
    }

    #[test]
    fn test_secret_key_generated_when_unset() {
        let config = CloudxConfig::default();
        assert_eq!(config.secret_key().len(), 32);

        let mut config = CloudxConfig::default();
        config.server.secret_key = Some("fixed".into());
        assert_eq!(config.secret_key(), b"fixed".to_vec());
    }

    #[test]
    fn test_redacted_masks_credentials() {
        let mut config = CloudxConfig::default();
        config.server.secret_key = Some("hunter2".into());
        let shown = config.redacted();
        assert_eq!(shown.database.password, REDACTED);
        assert_eq!(shown.server.secret_key.as_deref(), Some(REDACTED));
        assert_eq!(shown.database.user, "cloudx_user");

        let rendered = toml::to_string(&shown).unwrap();
        assert!(!rendered.contains("cloudx_password"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_poll_interval_has_floor() {
        let mut ws = WorkspaceConfig::default();
        ws.poll_interval_ms = 0;
        assert_eq!(ws.poll_interval(), Duration::from_millis(10));
    }
}
