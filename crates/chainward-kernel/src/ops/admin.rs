//! Admin API over the embedded distribution server.
//!
//! Writes go through the distribution server, never straight into the
//! kernel: the engine picks them up through its own subscription, exactly
//! like any other node.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use chainward_core::error::{EngineError, ErrorCode};
use chainward_core::params::ParamSchema;
use chainward_core::policy::Phase;
use chainward_core::protocol::discovery::RouteChainResource;

use crate::app_state::AppState;
use crate::chain::build_chain;
use crate::xds::SubscriberStatus;

/// `EngineError` as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = Json(json!({ "error": code.as_str(), "message": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct RoutesView {
    /// Snapshot version held by the distribution server.
    pub version: u64,
    /// Version the local kernel last accepted.
    pub active_version: String,
    pub routes: Vec<RouteChainResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutesBody {
    pub routes: Vec<RouteChainResource>,
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub expected_version: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Published {
    pub version: u64,
}

#[derive(Debug, Serialize)]
pub struct PolicyView {
    pub name: String,
    pub version: String,
    pub description: String,
    pub phases: Vec<Phase>,
    pub requires_request_body: bool,
    pub requires_response_body: bool,
    pub parameters: Vec<ParamSchema>,
}

pub async fn list_routes(State(app): State<AppState>) -> Json<RoutesView> {
    let snap = app.distribution().snapshot();
    Json(RoutesView {
        version: snap.version,
        active_version: app.kernel().routes().version(),
        routes: snap.resources.values().cloned().collect(),
    })
}

pub async fn replace_routes(State(app): State<AppState>, Json(body): Json<RoutesBody>) -> ApiResult<Published> {
    let count = body.routes.len();
    let version = app.publish_routes(body.routes)?;
    tracing::info!(version, routes = count, "admin replaced route snapshot");
    Ok(Json(Published { version }))
}

pub async fn upsert_route(
    State(app): State<AppState>,
    Path(route_key): Path<String>,
    Query(q): Query<VersionQuery>,
    Json(mut resource): Json<RouteChainResource>,
) -> ApiResult<Published> {
    if resource.route_key.is_empty() {
        resource.route_key = route_key.clone();
    }
    if resource.route_key != route_key {
        return Err(EngineError::BadRequest(format!(
            "body route_key `{}` does not match path `{route_key}`",
            resource.route_key
        ))
        .into());
    }
    build_chain(&app.kernel().registry(), &resource)?;
    let version = app.distribution().upsert(resource, q.expected_version)?;
    Ok(Json(Published { version }))
}

pub async fn delete_route(
    State(app): State<AppState>,
    Path(route_key): Path<String>,
    Query(q): Query<VersionQuery>,
) -> ApiResult<Published> {
    let version = app.distribution().remove(&route_key, q.expected_version)?;
    Ok(Json(Published { version }))
}

pub async fn subscribers(State(app): State<AppState>) -> Json<Vec<SubscriberStatus>> {
    Json(app.distribution().subscribers())
}

pub async fn policies(State(app): State<AppState>) -> Json<Vec<PolicyView>> {
    let registry = app.kernel().registry();
    Json(
        registry
            .definitions()
            .map(|d| PolicyView {
                name: d.name.clone(),
                version: d.version.to_string(),
                description: d.description.clone(),
                phases: d.phases.iter().copied().collect(),
                requires_request_body: d.requires_request_body,
                requires_response_body: d.requires_response_body,
                parameters: d.parameters.iter().map(|p| p.schema.clone()).collect(),
            })
            .collect(),
    )
}
