use std::sync::Arc;

use axum::http::{header, Method};
use axum::routing::{get, post, put};
use axum::{Extension, Router};
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::objectstore::ObjectStore;
use crate::queue::{Queue, WakeupMessage, WorkItemUpdateMessage};
use crate::scheduler::Scheduler;
use crate::store::StateStore;

use super::routes;

/// Shared handler state, the way the teacher's `AxumAppState` bundles
/// `Arc`-wrapped collaborators behind one `Clone` struct passed through
/// `Extension`. `pool` is only used by `health_handler`'s connectivity
/// check and is `None` for non-Postgres deployments (in-process tests).
pub struct AppState<St, Obj, Uq, Wq> {
    pub store: Arc<St>,
    pub object_store: Arc<Obj>,
    pub update_queue: Arc<Uq>,
    pub scheduler: Arc<Scheduler<St, Wq>>,
    pub pool: Option<PgPool>,
}

impl<St, Obj, Uq, Wq> Clone for AppState<St, Obj, Uq, Wq> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            object_store: self.object_store.clone(),
            update_queue: self.update_queue.clone(),
            scheduler: self.scheduler.clone(),
            pool: self.pool.clone(),
        }
    }
}

/// Assembles the worker-facing and operator-facing routes, the way the
/// teacher's `build_app` layers CORS and tracing over a route table.
pub fn build_app<St, Obj, Uq, Wq>(state: AppState<St, Obj, Uq, Wq>) -> Router
where
    St: StateStore + Send + Sync + 'static,
    Obj: ObjectStore + Send + Sync + 'static,
    Uq: Queue<WorkItemUpdateMessage> + Send + Sync + 'static,
    Wq: Queue<WakeupMessage> + Send + Sync + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/work", get(routes::work_handler::<St, Obj, Uq, Wq>))
        .route("/work/:id", put(routes::update_handler::<St, Obj, Uq, Wq>))
        .route(
            "/:job_id/response",
            post(routes::callback_handler::<St, Obj, Uq, Wq>),
        )
        .route("/health", get(routes::health_handler::<St, Obj, Uq, Wq>))
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
