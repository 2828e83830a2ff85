// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The full operator surface: route CRUD, route/risk metrics, and orphan
// position commands. Every endpoint other than the health check requires a
// valid Bearer token, checked via the `AuthBearer` extractor. Errors are
// returned as `{"error": "...", "code": "..."}` bodies with the status codes
// named in the design (400 validation, 404 missing entity, 409 duplicate
// route id, 500 internal failure).
//
// CORS is configured permissively, a development posture; tighten
// `allow_origin` before exposing this beyond a trusted operator network.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api::auth::AuthBearer;
use crate::app_state::{AppState, OrphanCommandError, RouteOpError, RoutePatch};
use crate::domain::Route;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Routes ──────────────────────────────────────────────────
        .route("/api/v1/routes", get(list_routes).post(create_route))
        .route("/api/v1/routes/stats", get(routes_stats))
        .route(
            "/api/v1/routes/:id",
            put(update_route).delete(delete_route),
        )
        .route("/api/v1/routes/:id/toggle", post(toggle_route))
        // ── Orphans ─────────────────────────────────────────────────
        .route("/api/v1/orphans/list", get(list_orphans))
        .route("/api/v1/orphans/close", post(close_orphan))
        .route("/api/v1/orphans/set-stop-loss", post(set_orphan_stop_loss))
        .route("/api/v1/orphans/set-take-profit", post(set_orphan_take_profit))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error envelope
// =============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into(), code })).into_response()
}

impl IntoResponse for RouteOpError {
    fn into_response(self) -> Response {
        match self {
            RouteOpError::Duplicate => error_response(StatusCode::CONFLICT, "route-duplicate", self.to_string()),
            RouteOpError::NotFound => error_response(StatusCode::NOT_FOUND, "route-not-found", self.to_string()),
            RouteOpError::UnknownRuleSet(_) => {
                error_response(StatusCode::BAD_REQUEST, "unknown-rule-set", self.to_string())
            }
            RouteOpError::Internal(e) => {
                warn!(error = %e, "route operation failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal-error", "internal error")
            }
        }
    }
}

impl IntoResponse for OrphanCommandError {
    fn into_response(self) -> Response {
        match self {
            OrphanCommandError::NotFound => {
                error_response(StatusCode::NOT_FOUND, "position-not-found", self.to_string())
            }
            OrphanCommandError::Gateway(e) => {
                error_response(StatusCode::BAD_REQUEST, "gateway-rejected", e.to_string())
            }
        }
    }
}

// =============================================================================
// Handlers — health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Handlers — routes
// =============================================================================

async fn list_routes(State(state): State<Arc<AppState>>, _auth: AuthBearer) -> impl IntoResponse {
    Json(state.routes_overview())
}

async fn routes_stats(State(state): State<Arc<AppState>>, _auth: AuthBearer) -> impl IntoResponse {
    Json(state.routes_stats())
}

#[derive(Debug, Deserialize)]
struct CreateRouteBody {
    #[serde(default)]
    id: String,
    name: String,
    source: crate::types::AccountRef,
    destination: crate::types::AccountRef,
    #[serde(rename = "ruleSet")]
    rule_set: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    notifications: crate::domain::NotificationPrefs,
}

async fn create_route(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(body): Json<CreateRouteBody>,
) -> Response {
    let route = Route {
        id: body.id,
        name: body.name,
        source: body.source,
        destination: body.destination,
        rule_set: body.rule_set,
        enabled: body.enabled,
        notifications: body.notifications,
    };
    match state.create_route(route).await {
        Ok(route) => (StatusCode::OK, Json(route)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn update_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    _auth: AuthBearer,
    Json(patch): Json<RoutePatch>,
) -> Response {
    match state.update_route(&id, patch).await {
        Ok(route) => (StatusCode::OK, Json(route)).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn toggle_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    _auth: AuthBearer,
    Json(body): Json<ToggleBody>,
) -> Response {
    match state.toggle_route(&id, body.enabled).await {
        Ok(route) => (StatusCode::OK, Json(route)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_route(State(state): State<Arc<AppState>>, Path(id): Path<String>, _auth: AuthBearer) -> Response {
    match state.delete_route(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// Handlers — orphans
// =============================================================================

#[derive(Debug, Deserialize)]
struct OrphanListQuery {
    #[serde(rename = "routeId")]
    route_id: Option<String>,
}

async fn list_orphans(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrphanListQuery>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    let orphans = state.list_orphans(query.route_id.as_deref()).await;
    Json(orphans)
}

#[derive(Debug, Deserialize)]
struct PositionIdBody {
    #[serde(rename = "positionId")]
    position_id: String,
}

async fn close_orphan(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(body): Json<PositionIdBody>,
) -> Response {
    match state.close_orphan(&body.position_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SetStopLossBody {
    #[serde(rename = "positionId")]
    position_id: String,
    #[serde(rename = "stopLoss")]
    stop_loss: f64,
}

async fn set_orphan_stop_loss(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(body): Json<SetStopLossBody>,
) -> Response {
    match state.set_orphan_stop_loss(&body.position_id, body.stop_loss).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SetTakeProfitBody {
    #[serde(rename = "positionId")]
    position_id: String,
    #[serde(rename = "takeProfit")]
    take_profit: f64,
}

async fn set_orphan_take_profit(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(body): Json<SetTakeProfitBody>,
) -> Response {
    match state.set_orphan_take_profit(&body.position_id, body.take_profit).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}
