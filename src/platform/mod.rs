//! CloudX platform: dashboard, REST API, realtime channel and workspace
//! provisioning.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (router, CORS, tracing, shutdown)    │
//! │ (browser)│ <─────── │    ├─ session.rs  (signed cookie middleware)     │
//! └──────────┘ WebSocket│    ├─ pages.rs    (HTML dashboard)               │
//!                       │    ├─ ws.rs       (rooms, metrics, keepalive)    │
//!                       │    └─ api.rs      (JSON handlers, AppState)      │
//!                       │         │                                        │
//!                       │         │ WorkspaceProvisioner::launch()         │
//!                       │         v                                        │
//!                       │  workspace.rs  (quota, in-flight guard, reaper)  │
//!                       │         │                                        │
//!                       │         │ ContainerRuntime::create_and_start()   │
//!                       │         v                                        │
//!                       │  runtime.rs    (DockerRuntime over bollard)      │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module         | Responsibility                                         |
//! |----------------|--------------------------------------------------------|
//! | `models`       | Row and payload types: `Project`, `Workspace`, ...     |
//! | `db`           | `Store` trait, `PgStore` (sqlx) and `MemoryStore`      |
//! | `activity`     | Best-effort audit rows, `RequestMeta`                  |
//! | `test_support` | `FakeRuntime`, `DegradedStore` (`test-support` feature)|
//!
//! ## Launch Flow
//!
//! 1. `POST /api/projects/{id}/launch` → `api::launch_workspace()`
//! 2. The provisioner checks the project exists, that no other launch for it
//!    is in flight, and that it is under its workspace quota, then waits for
//!    a global launch permit.
//! 3. A container named `cloudx-ws-{id}-{hex}` is created with a one-time
//!    password in its environment and both service ports published.
//! 4. `inspect` is polled until the container runs with host ports bound.
//!    Containers that exit or time out are removed.
//! 5. A `workspaces` row and an activity row are written, a
//!    `workspace_launched` event is broadcast, and the editor URL, SSH
//!    command and password go back to the caller.

pub mod activity;
pub mod api;
pub mod db;
pub mod models;
pub mod pages;
pub mod runtime;
pub mod server;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workspace;
pub mod ws;
