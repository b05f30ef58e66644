//! Selection and bulk-action handlers.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use super::session_for;
use crate::engine::{BulkAction, BulkOutcome};
use crate::error::LinkNestError;
use crate::AppState;

pub(super) async fn get_selection(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, LinkNestError> {
    let session = session_for(&state, &headers).await?;
    let ids = session.selection().await?;
    Ok(Json(json!({ "count": ids.len(), "ids": ids })))
}

pub(super) async fn clear_selection(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, LinkNestError> {
    let session = session_for(&state, &headers).await?;
    session.clear_selection().await?;
    Ok(Json(json!({ "count": 0, "ids": [] })))
}

pub(super) async fn toggle_selection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, LinkNestError> {
    let session = session_for(&state, &headers).await?;
    let selected = session.toggle(id.clone()).await?;
    Ok(Json(json!({ "id": id, "selected": selected })))
}

pub(super) async fn select_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, LinkNestError> {
    let session = session_for(&state, &headers).await?;
    let ids = session.select_all().await?;
    Ok(Json(json!({ "count": ids.len(), "ids": ids })))
}

pub(super) async fn bulk_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(action): Json<BulkAction>,
) -> Result<Json<BulkOutcome>, LinkNestError> {
    let session = session_for(&state, &headers).await?;
    Ok(Json(session.bulk(action).await?))
}
