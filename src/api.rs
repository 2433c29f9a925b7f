use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::MaisonError;
use crate::store::now_ms;
use crate::{db_call, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/db/health", get(db_health))
        .route("/queue/health", get(queue_health))
        .route("/ws/connection-key", get(issue_connection_key))
        .route("/ws", get(crate::ws::ws_upgrade))
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .with_state(state)
}

async fn service_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "maison",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "endpoints": {
            "GET /": "this service info",
            "GET /db/health": "store liveness",
            "GET /queue/health": "extraction queue liveness",
            "GET /ws/connection-key": "exchange a bearer token for a single-use upgrade key",
            "GET /ws": "websocket upgrade (?maidId=&connectionKey=[&sessionId=])",
        },
    }))
}

async fn db_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ok = db_call(&state.store, |s| s.ping()).await.unwrap_or(false);
    Json(serde_json::json!({ "ok": ok }))
}

async fn queue_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": state.queue.is_healthy(),
        "depth": state.queue.depth(),
        "recent_failures": state.queue.failed_tail().len(),
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[derive(Debug, Deserialize)]
struct ConnectionKeyQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<i64>,
}

/// Exchange a bearer token for a single-use, short-TTL connection key.
/// Browsers can't set headers on `new WebSocket(url)`, and the bearer token
/// itself must never ride in a URL.
async fn issue_connection_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ConnectionKeyQuery>,
) -> Result<(StatusCode, Json<serde_json::Value>), MaisonError> {
    let bearer = bearer_token(&headers).ok_or(MaisonError::Unauthorized)?;
    let user_id = state
        .auth
        .resolve_user(bearer)
        .await
        .ok_or(MaisonError::Unauthorized)?;

    if let Some(session_id) = q.session_id {
        let user = user_id.clone();
        db_call(&state.store, move |s| s.find_session(session_id, &user))
            .await??
            .ok_or(MaisonError::SessionNotFound(session_id))?;
    }

    let issued = state.keys.issue(&user_id, q.session_id);
    let mut body = serde_json::json!({
        "connectionKey": issued.key,
        "expiresAt": issued.expires_at,
        "expiresInMs": issued.expires_at - now_ms(),
    });
    if let Some(session_id) = q.session_id {
        body["sessionId"] = serde_json::json!(session_id);
    }
    Ok((StatusCode::CREATED, Json(body)))
}
