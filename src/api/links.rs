//! Link, view and status handlers.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use super::session_for;
use crate::db::{Link, NewLink};
use crate::engine::{EnrichmentStatus, Stats, View, ViewQuery};
use crate::error::LinkNestError;
use crate::AppState;

pub(super) async fn list_links(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Link>>, LinkNestError> {
    let session = session_for(&state, &headers).await?;
    Ok(Json(session.links().await?))
}

pub(super) async fn create_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<NewLink>,
) -> Result<(StatusCode, Json<Link>), LinkNestError> {
    let session = session_for(&state, &headers).await?;
    let link = session.insert(input.url, input.tags).await?;
    Ok((StatusCode::CREATED, Json(link)))
}

/// GET /view. Also stores the controls, so selection pruning follows them.
pub(super) async fn get_view(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ViewQuery>,
) -> Result<Json<View>, LinkNestError> {
    let session = session_for(&state, &headers).await?;
    Ok(Json(session.set_view(query).await?))
}

pub(super) async fn get_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<EnrichmentStatus>, LinkNestError> {
    let session = session_for(&state, &headers).await?;
    Ok(Json(session.status()))
}

pub(super) async fn get_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Stats>, LinkNestError> {
    let session = session_for(&state, &headers).await?;
    Ok(Json(session.stats().await?))
}
