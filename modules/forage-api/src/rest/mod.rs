pub mod partners;
pub mod runs;
pub mod staging;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use forage_common::{
    BudgetStatus, FeedbackDetails, FeedbackStats, SearchFeedback, Strategy, StrategyKind,
    StrategyTiers,
};
use forage_pipeline::LearningStats;

use crate::auth::AdminAuth;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

// --- Query structs ---

#[derive(Deserialize)]
pub struct TiersQuery {
    kind: Option<StrategyKind>,
    platform: Option<String>,
}

#[derive(Deserialize)]
pub struct StatsQuery {
    since: Option<DateTime<Utc>>,
}

// --- Request bodies ---

#[derive(Deserialize)]
pub struct SeedStrategyRequest {
    kind: StrategyKind,
    platform: String,
    chain_id: Option<String>,
    name: String,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
pub struct EvolveStrategyRequest {
    #[serde(default)]
    config: Value,
    #[serde(default)]
    tags: Vec<String>,
    run_id: Option<String>,
}

#[derive(Deserialize)]
pub struct DeprecateStrategyRequest {
    reason: String,
}

#[derive(Deserialize)]
pub struct FeedbackRequest {
    #[serde(flatten)]
    details: FeedbackDetails,
    reviewer: String,
}

// --- Handlers ---

pub async fn budget(_admin: AdminAuth, State(state): State<Arc<AppState>>) -> ApiResult<BudgetStatus> {
    Ok(Json(state.budget.status().await?))
}

pub async fn strategy_tiers(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Query(q): Query<TiersQuery>,
) -> ApiResult<StrategyTiers> {
    let kind = q.kind.unwrap_or(StrategyKind::Discovery);
    let tiers = state
        .strategies
        .get_strategy_tiers(kind, q.platform.as_deref())
        .await?;
    Ok(Json(tiers))
}

pub async fn seed_strategy(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SeedStrategyRequest>,
) -> Result<(StatusCode, Json<Strategy>), ApiError> {
    let strategy = state
        .strategies
        .seed(Strategy::seed(
            body.kind,
            body.platform,
            body.chain_id,
            body.name,
            body.config,
            body.tags,
        ))
        .await?;
    Ok((StatusCode::CREATED, Json(strategy)))
}

pub async fn evolve_strategy(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<EvolveStrategyRequest>,
) -> Result<(StatusCode, Json<Strategy>), ApiError> {
    let child = state
        .worker
        .evolve_strategy(&id, body.config, body.tags, body.run_id.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(child)))
}

pub async fn deprecate_strategy(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DeprecateStrategyRequest>,
) -> ApiResult<Strategy> {
    Ok(Json(state.strategies.deprecate(&id, &body.reason).await?))
}

/// Attach a reviewer's judgment to one logged search.
pub async fn add_feedback(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<FeedbackRequest>,
) -> ApiResult<SearchFeedback> {
    let row = state
        .feedback
        .add_feedback(&id, body.details, &body.reviewer)
        .await?;
    Ok(Json(row))
}

pub async fn feedback_stats(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<FeedbackStats> {
    Ok(Json(state.feedback.get_stats(q.since).await?))
}

pub async fn learning_stats(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
) -> ApiResult<LearningStats> {
    Ok(Json(state.learning.stats()))
}
