//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the relay for business logic.
//! Admin endpoints require the shared bearer token, presented either as an
//! `x-admin-token` header or a `?token=` query parameter.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::constants::APP_NAME;
use crate::error::{RelayError, RelayResult};

/// Embedded admin panel page.
const ADMIN_PANEL_HTML: &str = include_str!("../../assets/panel.html");

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChannelBody {
    #[serde(default)]
    channel: String,
}

#[derive(Debug, Deserialize)]
struct MuteBody {
    /// Defaults to muting when the body omits the flag.
    #[serde(default = "default_muted")]
    muted: bool,
}

impl Default for MuteBody {
    fn default() -> Self {
        Self { muted: true }
    }
}

fn default_muted() -> bool {
    true
}

/// Parses an optional JSON request body.
///
/// An absent body yields the type's defaults; a body that is present but
/// malformed is a client error and surfaces as a 400.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> RelayResult<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| RelayError::InvalidRequest(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/status", get(public_status))
        .route("/ws", get(ws_handler))
        .route("/admin/status", get(admin_status))
        .route("/admin/panel", get(admin_panel))
        .route("/admin/channel/create", post(admin_create_channel))
        .route("/admin/channel/{channel}", delete(admin_delete_channel))
        .route("/admin/client/{name}/join", post(admin_force_join))
        .route("/admin/client/{name}/leave", post(admin_force_leave))
        .route("/admin/client/{name}/mute", post(admin_force_mute))
        .route("/admin/client/{name}/kick", post(admin_kick))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────────────────────────

/// Checks the admin token from header or query parameter.
fn token_matches(expected: &str, headers: &HeaderMap, query: &TokenQuery) -> bool {
    let header_token = headers.get("x-admin-token").and_then(|v| v.to_str().ok());
    header_token == Some(expected) || query.token.as_deref() == Some(expected)
}

/// Returns the 401 response for missing/mismatched tokens.
fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized" })),
    )
        .into_response()
}

/// Guards an admin handler body; evaluates to a 401 response early when the
/// request carries no valid token.
macro_rules! require_admin {
    ($state:expr, $headers:expr, $query:expr) => {
        if !token_matches(&$state.admin_token, &$headers, &$query) {
            return unauthorized();
        }
    };
}

/// Converts a relay result into an admin JSON response.
fn admin_result<T: serde::Serialize>(result: RelayResult<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe and service identification.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    format!(
        "{} voice relay - up {}s, {} connection(s)",
        APP_NAME,
        state.relay.uptime_secs(),
        state.connections.connection_count()
    )
}

/// Public, unauthenticated summary.
async fn public_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.relay.snapshot();
    Json(json!({
        "uptime": snapshot.uptime,
        "totalClients": snapshot.clients.len(),
        "channels": snapshot.channels,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn admin_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    require_admin!(state, headers, query);
    Json(state.relay.snapshot()).into_response()
}

async fn admin_panel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    require_admin!(state, headers, query);
    Html(ADMIN_PANEL_HTML).into_response()
}

async fn admin_create_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Response {
    require_admin!(state, headers, query);
    let channel = match parse_body::<ChannelBody>(&body) {
        Ok(b) => b.channel,
        Err(err) => return err.into_response(),
    };
    admin_result(
        state
            .relay
            .admin_create_channel(&channel)
            .map(|name| json!({ "ok": true, "channel": name })),
    )
}

async fn admin_delete_channel(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    require_admin!(state, headers, query);
    admin_result(
        state
            .relay
            .admin_delete_channel(&channel)
            .map(|()| json!({ "ok": true })),
    )
}

async fn admin_force_join(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Response {
    require_admin!(state, headers, query);
    let channel = match parse_body::<ChannelBody>(&body) {
        Ok(b) => b.channel,
        Err(err) => return err.into_response(),
    };
    if channel.trim().is_empty() {
        return RelayError::MissingField("channel").into_response();
    }
    admin_result(
        state
            .relay
            .admin_force_join(&name, &channel)
            .map(|()| json!({ "ok": true })),
    )
}

async fn admin_force_leave(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    require_admin!(state, headers, query);
    admin_result(
        state
            .relay
            .admin_force_leave(&name)
            .map(|()| json!({ "ok": true })),
    )
}

async fn admin_force_mute(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Response {
    require_admin!(state, headers, query);
    let muted = match parse_body::<MuteBody>(&body) {
        Ok(b) => b.muted,
        Err(err) => return err.into_response(),
    };
    admin_result(
        state
            .relay
            .admin_force_mute(&name, muted)
            .map(|()| json!({ "ok": true, "name": name, "muted": muted })),
    )
}

async fn admin_kick(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    require_admin!(state, headers, query);
    admin_result(state.relay.admin_kick(&name).map(|()| json!({ "ok": true })))
}
