use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;

use crate::engine::SessionHandle;
use crate::error::LinkNestError;
use crate::AppState;

mod admin;
mod links;
mod selection;

use admin::*;
use links::*;
use selection::*;

pub const DEFAULT_USER: &str = "default";

/// Run a blocking closure on the spawn_blocking pool and map JoinError.
async fn blocking<T, F>(f: F) -> Result<T, LinkNestError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LinkNestError::Internal(e.to_string()))
}

/// User id from the X-User header, falling back to the shared default user.
fn get_user(headers: &HeaderMap) -> String {
    headers
        .get("x-user")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_USER)
        .to_string()
}

async fn session_for(state: &AppState, headers: &HeaderMap) -> Result<SessionHandle, LinkNestError> {
    state.sessions.get(&get_user(headers)).await
}

/// Auth middleware: checks Bearer token if LINKNEST_API_KEY is configured.
async fn require_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, LinkNestError> {
    let Some(ref expected) = state.api_key else {
        return Ok(next.run(req).await);
    };

    let unauthorized = || LinkNestError::Unauthorized;

    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;

    // constant-time comparison to prevent timing attacks
    if token.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(next.run(req).await)
    } else {
        Err(unauthorized())
    }
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/", get(index))
        .route("/health", get(health));

    let protected = Router::new()
        .route("/links", get(list_links).post(create_link))
        .route("/view", get(get_view))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/selection", get(get_selection).delete(clear_selection))
        .route("/selection/toggle/{id}", post(toggle_selection))
        .route("/selection/all", post(select_all))
        .route("/selection/bulk", post(bulk_action))
        .route("/plan", put(set_plan).get(get_plan))
        .route("/llm-usage", get(llm_usage))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .with_state(state)
}

async fn health_data(state: &AppState) -> serde_json::Value {
    serde_json::json!({
        "name": "linknest",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "ai_enabled": state.sessions.ai_enabled(),
        "sessions": state.sessions.live_count(),
        "free_limit": state.sessions.config().free_limit,
    })
}

/// GET /: health data and the endpoint list.
async fn index(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut data = health_data(&state).await;
    if let Some(obj) = data.as_object_mut() {
        obj.insert("endpoints".to_string(), serde_json::json!({
            "GET /health": "health only",
            "GET /links": "all links of the current user, newest first",
            "POST /links": "save a link (body: {url, tags})",
            "GET /view?q=&group=&sort=": "grouped view (sort: recent|oldest|alphabetical|most-links)",
            "GET /status": "enrichment pass indicator",
            "GET /stats": "link, group and tag counts",
            "GET /selection": "selected link ids",
            "DELETE /selection": "clear the selection",
            "POST /selection/toggle/:id": "select or deselect a visible link",
            "POST /selection/all": "select every visible link",
            "POST /selection/bulk": "apply {action: delete|move|tag} to the selection",
            "GET /plan": "current plan",
            "PUT /plan": "change plan (body: {plan: free|pro})",
            "GET /llm-usage": "LLM call and token totals",
        }));
    }
    Json(data)
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(health_data(&state).await)
}
