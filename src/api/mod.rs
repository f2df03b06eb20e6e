//! HTTP API for task management.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/tasks` - List tasks (clears stale agent assignments)
//! - `POST /api/tasks` - Create a task
//! - `GET /api/tasks/:id` / `DELETE /api/tasks/:id`
//! - `PATCH /api/tasks/:id` - Move to another phase (`{"phase": "done"}`)
//! - `POST /api/tasks/:id/plan` - Generate a plan
//! - `POST /api/tasks/:id/approve-plan`
//! - `POST /api/tasks/:id/start-development`
//! - `POST /api/tasks/:id/resume` / `POST /api/tasks/:id/pause`
//! - `POST /api/tasks/:id/subtasks/:sid/skip` / `DELETE /api/tasks/:id/subtasks/:sid`

mod routes;
mod tasks;

pub use routes::{app, serve, AppState};
