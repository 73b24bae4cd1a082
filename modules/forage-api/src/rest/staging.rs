use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use tracing::info;

use forage_common::{EntityType, ForageError, StagedEntity};
use forage_pipeline::{BulkResult, PartialApproval, ReviewQueueFilter, ReviewQueuePage};

use crate::auth::AdminAuth;
use crate::error::ApiResult;
use crate::AppState;

#[derive(Deserialize)]
pub struct DecisionRequest {
    reviewer: String,
    notes: Option<String>,
}

#[derive(Deserialize)]
pub struct FlagRequest {
    flag: String,
}

#[derive(Deserialize)]
pub struct PartialApproveRequest {
    dish_ids: Vec<String>,
    reviewer: String,
    notes: Option<String>,
}

#[derive(Deserialize)]
pub struct BulkRequest {
    ids: Vec<String>,
    reviewer: String,
    notes: Option<String>,
}

#[derive(Deserialize)]
pub struct AssignChainRequest {
    venue_ids: Vec<String>,
    chain_id: String,
}

pub async fn review_queue(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ReviewQueueFilter>,
) -> ApiResult<ReviewQueuePage> {
    Ok(Json(state.staging.review_queue(&filter).await?))
}

pub async fn get_staged(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path((entity_type, id)): Path<(String, String)>,
) -> ApiResult<StagedEntity> {
    let entity_type: EntityType = entity_type.parse()?;
    Ok(Json(state.staging.get(entity_type, &id).await?))
}

pub async fn approve(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path((entity_type, id)): Path<(String, String)>,
    Json(body): Json<DecisionRequest>,
) -> ApiResult<StagedEntity> {
    let entity_type: EntityType = entity_type.parse()?;
    let entity = state
        .staging
        .approve(entity_type, &id, &body.reviewer, body.notes)
        .await?;
    Ok(Json(entity))
}

pub async fn reject(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path((entity_type, id)): Path<(String, String)>,
    Json(body): Json<DecisionRequest>,
) -> ApiResult<StagedEntity> {
    let entity_type: EntityType = entity_type.parse()?;
    let entity = state
        .staging
        .reject(entity_type, &id, &body.reviewer, body.notes)
        .await?;
    Ok(Json(entity))
}

pub async fn flag(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path((entity_type, id)): Path<(String, String)>,
    Json(body): Json<FlagRequest>,
) -> ApiResult<StagedEntity> {
    let entity_type: EntityType = entity_type.parse()?;
    Ok(Json(state.staging.add_flag(entity_type, &id, &body.flag).await?))
}

pub async fn partial_approve(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path((entity_type, id)): Path<(String, String)>,
    Json(body): Json<PartialApproveRequest>,
) -> ApiResult<PartialApproval> {
    if entity_type.parse::<EntityType>()? != EntityType::Venue {
        return Err(ForageError::Validation("partial approval applies to venues only".into()).into());
    }
    let outcome = state
        .staging
        .partial_approve(&id, &body.dish_ids, &body.reviewer, body.notes)
        .await?;
    Ok(Json(outcome))
}

/// Publish an approved record to the production catalog.
pub async fn promote(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path((entity_type, id)): Path<(String, String)>,
) -> ApiResult<StagedEntity> {
    let entity_type: EntityType = entity_type.parse()?;
    let entity = state
        .staging
        .promote(entity_type, &id, state.catalog.as_ref())
        .await?;
    info!(id = %id, %entity_type, production_id = ?entity.production_id, "Promoted from admin API");
    Ok(Json(entity))
}

pub async fn bulk_approve(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(entity_type): Path<String>,
    Json(body): Json<BulkRequest>,
) -> ApiResult<BulkResult> {
    let entity_type: EntityType = entity_type.parse()?;
    let result = state
        .staging
        .bulk_approve(entity_type, &body.ids, &body.reviewer, body.notes)
        .await?;
    Ok(Json(result))
}

pub async fn bulk_reject(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(entity_type): Path<String>,
    Json(body): Json<BulkRequest>,
) -> ApiResult<BulkResult> {
    let entity_type: EntityType = entity_type.parse()?;
    let result = state
        .staging
        .bulk_reject(entity_type, &body.ids, &body.reviewer, body.notes)
        .await?;
    Ok(Json(result))
}

pub async fn assign_chain(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssignChainRequest>,
) -> ApiResult<BulkResult> {
    Ok(Json(
        state
            .staging
            .assign_chain(&body.venue_ids, &body.chain_id)
            .await?,
    ))
}
