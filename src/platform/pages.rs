//! Server-rendered dashboard pages.

use std::fmt::Write as _;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use tracing::warn;

use super::api::SharedState;
use super::models::*;

const STYLE: &str = r#"
      body { font-family: Arial, sans-serif; margin: 40px; background: #f5f5f5; }
      .container { max-width: 960px; margin: 0 auto; background: white; padding: 30px; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); }
      h1 { color: #333; }
      nav a { margin-right: 14px; color: #007bff; text-decoration: none; }
      .status { padding: 15px; margin: 10px 0; border-radius: 5px; }
      .success { background: #d4edda; border: 1px solid #c3e6cb; color: #155724; }
      .error { background: #f8d7da; border: 1px solid #f5c6cb; color: #721c24; }
      .stats { display: flex; gap: 16px; margin: 20px 0; }
      .stat { flex: 1; background: #f8f9fa; border-radius: 6px; padding: 16px; text-align: center; }
      .stat b { display: block; font-size: 28px; color: #007bff; }
      table { width: 100%; border-collapse: collapse; margin: 20px 0; }
      th, td { padding: 10px; text-align: left; border-bottom: 1px solid #ddd; }
      th { background-color: #f2f2f2; }
"#;

/// Escape text for HTML element and attribute content.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
  <head>
    <meta charset="utf-8" />
    <title>{title} - CloudX</title>
    <style>{STYLE}</style>
  </head>
  <body>
    <div class="container">
      <nav><a href="/">Home</a><a href="/dashboard">Dashboard</a><a href="/projects">Projects</a><a href="/analytics">Analytics</a><a href="/dbtest">Database Test</a></nav>
{body}
    </div>
  </body>
</html>"#,
        title = escape_html(title),
    )
}

/// Table with escaped cells.
fn table(headers: &[&str], rows: impl IntoIterator<Item = Vec<String>>) -> String {
    let mut html = String::from("<table><thead><tr>");
    for h in headers {
        let _ = write!(html, "<th>{}</th>", escape_html(h));
    }
    html.push_str("</tr></thead><tbody>");
    let mut empty = true;
    for row in rows {
        empty = false;
        html.push_str("<tr>");
        for cell in row {
            let _ = write!(html, "<td>{}</td>", escape_html(&cell));
        }
        html.push_str("</tr>");
    }
    if empty {
        let _ = write!(
            html,
            r#"<tr><td colspan="{}">Nothing here yet.</td></tr>"#,
            headers.len()
        );
    }
    html.push_str("</tbody></table>");
    html
}

fn error_page(status: StatusCode, title: &str, err: &anyhow::Error) -> Response {
    warn!(page = title, error = %err, "page render failed");
    let body = format!(
        r#"<h1>{}</h1>
<div class="status error"><strong>Error:</strong> Could not load data.<br><strong>Details:</strong> {}</div>"#,
        escape_html(title),
        escape_html(&format!("{:#}", err))
    );
    (status, Html(layout(title, &body))).into_response()
}

fn fmt_ts(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn project_rows(projects: &[Project]) -> impl Iterator<Item = Vec<String>> + '_ {
    projects.iter().map(|p| {
        vec![
            p.id.to_string(),
            p.name.clone(),
            p.owner.clone(),
            p.status.clone(),
            p.collaborators.join(", "),
            fmt_ts(&p.created_at),
        ]
    })
}

const PROJECT_HEADERS: &[&str] = &["ID", "Name", "Owner", "Status", "Collaborators", "Created"];

fn activity_rows(activities: &[ActivityLog]) -> impl Iterator<Item = Vec<String>> + '_ {
    activities.iter().map(|a| {
        vec![
            fmt_ts(&a.created_at),
            a.severity.clone(),
            a.action.clone(),
            a.details.clone(),
            a.ip_address.clone().unwrap_or_default(),
        ]
    })
}

const ACTIVITY_HEADERS: &[&str] = &["Time", "Severity", "Action", "Details", "IP"];

pub fn pages_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(home))
        .route("/dashboard", get(dashboard))
        .route("/projects", get(projects_page))
        .route("/analytics", get(analytics))
        .route("/dbtest", get(dbtest))
}

async fn home(State(state): State<SharedState>) -> Html<String> {
    let body = format!(
        r#"<h1>Welcome to CloudX</h1>
<div class="status success"><strong>Status:</strong> CloudX platform is running successfully!</div>
<p>A cloud-based collaborative development environment featuring:</p>
<ul>
  <li>Project and deployment tracking backed by PostgreSQL</li>
  <li>In-browser editor workspaces launched per project</li>
  <li>Realtime updates over WebSocket</li>
</ul>
<p><em>Started at: {}</em></p>"#,
        fmt_ts(&state.started_at)
    );
    Html(layout("Home", &body))
}

async fn dashboard(State(state): State<SharedState>) -> Response {
    let loaded = async {
        let stats = state.db.dashboard_stats().await?;
        let projects = state.db.list_projects(0, 5).await?;
        let deployments = state.db.list_deployments(None, 5).await?;
        let activities = state.db.list_activities(10).await?;
        anyhow::Ok((stats, projects, deployments, activities))
    }
    .await;

    let (stats, projects, deployments, activities) = match loaded {
        Ok(data) => data,
        Err(e) => return error_page(StatusCode::INTERNAL_SERVER_ERROR, "Dashboard", &e),
    };

    let mut body = String::from("<h1>Dashboard</h1>");
    let _ = write!(
        body,
        r#"<div class="stats">
  <div class="stat"><b>{}</b>Projects</div>
  <div class="stat"><b>{}</b>Deployments</div>
  <div class="stat"><b>{}</b>Workspaces</div>
  <div class="stat"><b>{}</b>Activities</div>
</div>"#,
        stats.projects, stats.deployments, stats.workspaces, stats.activities
    );
    body.push_str("<h3>Recent Projects</h3>");
    body.push_str(&table(PROJECT_HEADERS, project_rows(&projects)));
    body.push_str("<h3>Recent Deployments</h3>");
    body.push_str(&table(
        &["ID", "Project", "Environment", "Status", "Version", "Deployed"],
        deployments.iter().map(|d| {
            vec![
                d.id.to_string(),
                d.project_id.to_string(),
                d.environment.clone(),
                d.status.clone(),
                d.version.clone().unwrap_or_default(),
                fmt_ts(&d.deployed_at),
            ]
        }),
    ));
    body.push_str("<h3>Recent Activity</h3>");
    body.push_str(&table(ACTIVITY_HEADERS, activity_rows(&activities)));

    Html(layout("Dashboard", &body)).into_response()
}

async fn projects_page(State(state): State<SharedState>) -> Response {
    match state.db.list_projects(0, 100).await {
        Ok(projects) => {
            let body = format!(
                "<h1>Projects</h1>{}",
                table(PROJECT_HEADERS, project_rows(&projects))
            );
            Html(layout("Projects", &body)).into_response()
        }
        Err(e) => error_page(StatusCode::INTERNAL_SERVER_ERROR, "Projects", &e),
    }
}

async fn analytics(State(state): State<SharedState>) -> Response {
    let loaded = async {
        let metrics = state.db.list_metrics(50).await?;
        let activities = state.db.list_activities(50).await?;
        anyhow::Ok((metrics, activities))
    }
    .await;

    let (metrics, activities) = match loaded {
        Ok(data) => data,
        Err(e) => return error_page(StatusCode::INTERNAL_SERVER_ERROR, "Analytics", &e),
    };

    let mut body = String::from("<h1>Analytics</h1><h3>System Metrics</h3>");
    body.push_str(&table(
        &["Time", "Metric", "Value", "Unit"],
        metrics.iter().map(|m| {
            vec![
                fmt_ts(&m.recorded_at),
                m.metric_name.clone(),
                format!("{:.2}", m.metric_value),
                m.unit.clone().unwrap_or_default(),
            ]
        }),
    ));
    body.push_str("<h3>Activity Log</h3>");
    body.push_str(&table(ACTIVITY_HEADERS, activity_rows(&activities)));

    Html(layout("Analytics", &body)).into_response()
}

/// Always 200, so the page itself shows whether the database is reachable.
async fn dbtest(State(state): State<SharedState>) -> Response {
    match state.db.db_test("Database connection successful!").await {
        Ok((record, recent)) => {
            let body = format!(
                r#"<h1>Database Connection Test</h1>
<div class="status success"><strong>Success!</strong> Connected to the database.<br>New record created with ID: {}</div>
<h3>Recent Database Records:</h3>
{}"#,
                record.id,
                table(
                    &["ID", "Message", "Created At"],
                    recent.iter().map(|r| {
                        vec![r.id.to_string(), r.message.clone(), fmt_ts(&r.created_at)]
                    }),
                )
            );
            Html(layout("Database Test", &body)).into_response()
        }
        Err(e) => error_page(StatusCode::OK, "Database Connection Failed", &e),
    }
}
