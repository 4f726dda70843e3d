//! Best-effort activity logging.
//!
//! Writing an audit row must never fail the request that triggered it, so
//! every error here is logged and swallowed.

use tracing::warn;

use super::db::DbHandle;
use super::models::{ActivityLog, DEFAULT_SEVERITY, NewActivity};

/// Request metadata attached to activity rows.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone)]
pub struct ActivityLogger {
    db: DbHandle,
}

impl ActivityLogger {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Record `action` at `info` severity.
    pub async fn log(&self, action: &str, details: impl Into<String>, meta: &RequestMeta) {
        self.log_with_severity(action, details, DEFAULT_SEVERITY, meta)
            .await;
    }

    pub async fn log_with_severity(
        &self,
        action: &str,
        details: impl Into<String>,
        severity: &str,
        meta: &RequestMeta,
    ) -> Option<ActivityLog> {
        let entry = NewActivity {
            action: action.to_string(),
            details: details.into(),
            ip_address: meta.ip_address.clone(),
            user_agent: meta.user_agent.clone(),
            severity: severity.to_string(),
        };
        match self.db.log_activity(&entry).await {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(action, error = %e, "failed to record activity");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::platform::db::MemoryStore;

    #[tokio::test]
    async fn test_log_records_row_with_meta() {
        let db: DbHandle = Arc::new(MemoryStore::new());
        let logger = ActivityLogger::new(db.clone());
        let meta = RequestMeta {
            ip_address: Some("10.0.0.1".into()),
            user_agent: Some("curl/8.0".into()),
        };

        logger.log("project_created", "Created project 1", &meta).await;

        let rows = db.list_activities(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "project_created");
        assert_eq!(rows[0].severity, "info");
        assert_eq!(rows[0].ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(rows[0].user_agent.as_deref(), Some("curl/8.0"));
    }

    #[tokio::test]
    async fn test_custom_severity() {
        let db: DbHandle = Arc::new(MemoryStore::new());
        let logger = ActivityLogger::new(db);
        let row = logger
            .log_with_severity("launch_failed", "boom", "error", &RequestMeta::default())
            .await
            .unwrap();
        assert_eq!(row.severity, "error");
    }
}
