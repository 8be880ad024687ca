//! rollguard-api — REST API for rollguard.
//!
//! The deployment pipeline reports deployments and instances here; operators
//! read and change per-application rollback settings and watch or stop
//! monitoring sessions.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | PUT | `/api/v1/deployments` | Report a deployment (starts monitoring on finish) |
//! | GET | `/api/v1/applications/{app}/deployments` | List deployments |
//! | GET | `/api/v1/applications/{app}/deployments/{id}` | Get one deployment |
//! | GET | `/api/v1/applications/{app}/settings` | Read rollback settings |
//! | PUT | `/api/v1/applications/{app}/settings` | Replace rollback settings |
//! | GET | `/api/v1/applications/{app}/sessions` | Archived sessions |
//! | DELETE | `/api/v1/applications/{app}/session` | Stop the active session |
//! | PUT | `/api/v1/instances` | Report an instance |
//! | GET | `/api/v1/sessions` | Active sessions |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use axum::Router;
use axum::routing::{delete, get, put};
use rollguard_health::HealthMonitor;
use rollguard_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub monitor: HealthMonitor,
}

/// Build the complete API router.
pub fn build_router(store: StateStore, monitor: HealthMonitor) -> Router {
    let api_state = ApiState { store, monitor };

    let api_routes = Router::new()
        .route("/deployments", put(handlers::report_deployment))
        .route("/instances", put(handlers::report_instance))
        .route("/sessions", get(handlers::list_active_sessions))
        .route("/applications/{app}/deployments", get(handlers::list_deployments))
        .route("/applications/{app}/deployments/{id}", get(handlers::get_deployment))
        .route(
            "/applications/{app}/settings",
            get(handlers::get_settings).put(handlers::put_settings),
        )
        .route("/applications/{app}/sessions", get(handlers::list_session_history))
        .route("/applications/{app}/session", delete(handlers::stop_session))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
