use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use forage_common::{IssuedCredentials, Partner, PartnerConfig};
use forage_pipeline::IntakeResponse;

use crate::auth::{bearer_token, AdminAuth};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

const SIGNATURE_HEADER: &str = "x-signature";
const TIMESTAMP_HEADER: &str = "x-timestamp";

#[derive(Deserialize)]
pub struct CreatePartnerRequest {
    name: String,
    contact_email: String,
    config: Option<PartnerConfig>,
}

/// Credentials are only ever shown in this response.
#[derive(Serialize)]
pub struct PartnerWithCredentials {
    partner: Partner,
    credentials: IssuedCredentials,
}

pub async fn create_partner(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePartnerRequest>,
) -> Result<(StatusCode, Json<PartnerWithCredentials>), ApiError> {
    let (partner, credentials) = state
        .partners
        .create(&body.name, &body.contact_email, body.config.unwrap_or_default())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PartnerWithCredentials {
            partner,
            credentials,
        }),
    ))
}

pub async fn get_partner(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Partner> {
    Ok(Json(state.partners.get(&id).await?))
}

pub async fn activate_partner(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Partner> {
    Ok(Json(state.partners.activate(&id).await?))
}

pub async fn suspend_partner(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Partner> {
    Ok(Json(state.partners.suspend(&id).await?))
}

pub async fn rotate_credentials(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<IssuedCredentials> {
    Ok(Json(state.partners.rotate_credentials(&id).await?))
}

/// Signed partner batch. The body is verified byte-for-byte before parsing.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<IntakeResponse> {
    let api_key = bearer_token(&headers).ok_or(ApiError::Unauthorized("missing api key"))?;
    let signature =
        header_str(&headers, SIGNATURE_HEADER).ok_or(ApiError::Unauthorized("missing signature"))?;
    let timestamp =
        header_str(&headers, TIMESTAMP_HEADER).ok_or(ApiError::Unauthorized("missing timestamp"))?;

    match state.intake.process(api_key, signature, timestamp, &body).await {
        Ok(response) => {
            info!(
                partner_id = %response.partner_id,
                accepted = response.accepted,
                rejected = response.rejected,
                "Webhook batch processed"
            );
            Ok(Json(response))
        }
        Err(e) => {
            warn!(error = %e, "Webhook batch refused");
            Err(e.into())
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().filter(|v| !v.is_empty())
}
