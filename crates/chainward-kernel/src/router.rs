//! Axum router wiring.

use axum::{
    routing::{get, put},
    Router,
};

use crate::{app_state::AppState, ops, transport};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/ext_proc", get(transport::ext_proc::ext_proc_upgrade))
        .route("/v1/discovery", get(transport::discovery::discovery_upgrade))
        .route(
            "/v1/admin/routes",
            get(ops::admin::list_routes).put(ops::admin::replace_routes),
        )
        .route(
            "/v1/admin/routes/:route_key",
            put(ops::admin::upsert_route).delete(ops::admin::delete_route),
        )
        .route("/v1/admin/subscribers", get(ops::admin::subscribers))
        .route("/v1/admin/policies", get(ops::admin::policies))
        .route("/healthz", get(ops::healthz))
        .route("/readyz", get(ops::readyz))
        .route("/metrics", get(ops::metrics))
        .with_state(state)
}
