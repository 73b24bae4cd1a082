use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        Json,
    },
};
use futures::Stream;
use serde::Deserialize;
use tracing::info;

use forage_common::{DiscoveryRun, ForageError, RunConfig, RunKind, TriggeredBy};
use forage_pipeline::DiscoveryTarget;

use crate::auth::AdminAuth;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

const DEFAULT_RUN_LIST: usize = 20;
const MAX_RUN_LIST: usize = 100;

#[derive(Deserialize)]
pub struct CreateRunRequest {
    kind: Option<RunKind>,
    #[serde(default)]
    config: RunConfig,
    targets: Vec<DiscoveryTarget>,
}

#[derive(Deserialize)]
pub struct RunsQuery {
    limit: Option<usize>,
}

/// Admit, record and launch a run. The work continues after the response.
pub async fn create_run(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<DiscoveryRun>), ApiError> {
    if body.targets.is_empty() {
        return Err(ForageError::Validation("a run needs at least one target".into()).into());
    }
    let (run, _task) = state
        .worker
        .launch(
            body.kind.unwrap_or(RunKind::Discovery),
            body.config,
            body.targets,
            TriggeredBy::Manual,
        )
        .await?;
    info!(run_id = %run.id, "Run launched from admin API");
    Ok((StatusCode::ACCEPTED, Json(run)))
}

pub async fn list_runs(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Query(q): Query<RunsQuery>,
) -> ApiResult<Vec<DiscoveryRun>> {
    let limit = q.limit.unwrap_or(DEFAULT_RUN_LIST).clamp(1, MAX_RUN_LIST);
    Ok(Json(state.runs.list_recent(limit).await?))
}

pub async fn get_run(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DiscoveryRun> {
    Ok(Json(state.runs.get(&id).await?))
}

pub async fn cancel_run(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DiscoveryRun> {
    Ok(Json(state.runs.request_cancel(&id).await?))
}

/// `init`, then `update` per change, `done` on a terminal status, with
/// `heartbeat` events in between. The stream closes after `done`.
pub async fn run_stream(
    _admin: AdminAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut events = state.runs.subscribe(&id).await?;
    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            let data = event.data().to_string();
            yield Ok::<_, Infallible>(Event::default().event(event.name()).data(data));
        }
    };
    Ok(Sse::new(stream))
}
