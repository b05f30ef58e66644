//! Plan and usage handlers.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use super::{blocking, get_user};
use crate::db::{LlmUsageSummary, Plan};
use crate::error::LinkNestError;
use crate::AppState;

#[derive(Deserialize)]
pub(super) struct PlanBody {
    plan: String,
}

pub(super) async fn get_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, LinkNestError> {
    let user = get_user(&headers);
    let db = state.db.clone();
    let plan = blocking(move || db.plan_for(&user)).await??;
    let limit = plan.max_items(state.sessions.config().free_limit);
    Ok(Json(serde_json::json!({ "plan": plan, "max_items": limit })))
}

/// PUT /plan. Takes effect on the next insert; sessions read the plan per call.
pub(super) async fn set_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PlanBody>,
) -> Result<Json<serde_json::Value>, LinkNestError> {
    let plan: Plan = body.plan.parse()?;
    let user = get_user(&headers);
    let db = state.db.clone();
    let u = user.clone();
    blocking(move || db.set_plan(&u, plan)).await??;
    info!(user = %user, plan = plan.as_str(), "plan changed");
    let limit = plan.max_items(state.sessions.config().free_limit);
    Ok(Json(serde_json::json!({ "plan": plan, "max_items": limit })))
}

pub(super) async fn llm_usage(
    State(state): State<AppState>,
) -> Result<Json<LlmUsageSummary>, LinkNestError> {
    let db = state.db.clone();
    let summary = blocking(move || db.llm_usage_summary()).await??;
    Ok(Json(summary))
}
