//! HTTP surface: spec.md §7 — the worker-facing poll/update/callback
//! endpoints plus the operator-facing health check, grounded on the
//! teacher's `server/app.rs`/`server/routes` shape (`AxumAppState`,
//! `Extension`-based handlers, `CorsLayer`, `TraceLayer`).

pub mod app;
pub mod routes;

pub use app::{build_app, AppState};
