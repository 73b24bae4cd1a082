//! HTTP surface for the ingestion pipeline: the admin review API, discovery run
//! control with SSE progress, and the partner webhook.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::set_header::SetResponseHeaderLayer;

use forage_common::Config;
use forage_pipeline::{
    BudgetLedger, CandidateSource, DiscoveryWorker, FeedbackRecorder, LearningHooks,
    PartnerAccounts, PartnerIntake, ProductionCatalog, RunProgressHub, RunTracker, StagingStore,
    StrategyRegistry,
};
use forage_store::{DocumentStore, MemoryCache};

pub mod auth;
pub mod error;
pub mod rest;
pub mod sources;

use sources::StoreCatalog;

pub struct AppState {
    pub config: Config,
    pub staging: StagingStore,
    pub runs: RunTracker,
    pub budget: BudgetLedger,
    pub strategies: StrategyRegistry,
    pub feedback: FeedbackRecorder,
    pub partners: PartnerAccounts,
    pub intake: PartnerIntake,
    pub worker: DiscoveryWorker,
    pub learning: LearningHooks,
    pub catalog: Arc<dyn ProductionCatalog>,
}

impl AppState {
    /// Wire every service onto one store, which also holds the production
    /// catalog. The returned handle is the learning task; it ends once the state
    /// is dropped.
    pub fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        source: Arc<dyn CandidateSource>,
    ) -> (Self, JoinHandle<()>) {
        let strategies = StrategyRegistry::new(store.clone());
        let feedback = FeedbackRecorder::new(store.clone());
        let partners = PartnerAccounts::new(store.clone(), config.webhook.clone());
        let (learning, learner) =
            LearningHooks::spawn(strategies.clone(), feedback.clone(), partners.clone());

        let staging = StagingStore::new(
            store.clone(),
            Arc::new(MemoryCache::default()),
            config.staging.clone(),
        )
        .with_learning(learning.clone());
        let runs = RunTracker::new(
            store.clone(),
            RunProgressHub::new(Duration::from_secs(config.heartbeat_secs)),
        );
        let catalog: Arc<dyn ProductionCatalog> = Arc::new(StoreCatalog::new(store.clone()));
        let budget = BudgetLedger::new(store, config.budget.clone(), config.pricing.clone());
        let worker = DiscoveryWorker::new(
            runs.clone(),
            budget.clone(),
            strategies.clone(),
            staging.clone(),
            feedback.clone(),
            source,
        );
        let intake = PartnerIntake::new(partners.clone(), staging.clone());

        let state = Self {
            config,
            staging,
            runs,
            budget,
            strategies,
            feedback,
            partners,
            intake,
            worker,
            learning,
            catalog,
        };
        (state, learner)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/", get(|| async { "ok" }))
        // Review queue and staged records
        .route("/admin/review-queue", get(rest::staging::review_queue))
        .route("/admin/staging/{entity_type}/bulk-approve", post(rest::staging::bulk_approve))
        .route("/admin/staging/{entity_type}/bulk-reject", post(rest::staging::bulk_reject))
        .route("/admin/staging/{entity_type}/{id}", get(rest::staging::get_staged))
        .route("/admin/staging/{entity_type}/{id}/approve", post(rest::staging::approve))
        .route("/admin/staging/{entity_type}/{id}/reject", post(rest::staging::reject))
        .route("/admin/staging/{entity_type}/{id}/flag", post(rest::staging::flag))
        .route("/admin/staging/{entity_type}/{id}/promote", post(rest::staging::promote))
        .route(
            "/admin/staging/{entity_type}/{id}/partial-approve",
            post(rest::staging::partial_approve),
        )
        .route("/admin/chains/assign", post(rest::staging::assign_chain))
        // Discovery runs
        .route("/admin/runs", get(rest::runs::list_runs).post(rest::runs::create_run))
        .route("/admin/runs/{id}", get(rest::runs::get_run))
        .route("/admin/runs/{id}/cancel", post(rest::runs::cancel_run))
        .route("/admin/runs/{id}/stream", get(rest::runs::run_stream))
        // Budget, strategies, learning
        .route("/admin/budget", get(rest::budget))
        .route("/admin/strategies", post(rest::seed_strategy))
        .route("/admin/strategies/tiers", get(rest::strategy_tiers))
        .route("/admin/strategies/{id}/evolve", post(rest::evolve_strategy))
        .route("/admin/strategies/{id}/deprecate", post(rest::deprecate_strategy))
        .route("/admin/feedback/stats", get(rest::feedback_stats))
        .route("/admin/feedback/{id}/review", post(rest::add_feedback))
        .route("/admin/learning", get(rest::learning_stats))
        // Partners
        .route("/admin/partners", post(rest::partners::create_partner))
        .route("/admin/partners/{id}", get(rest::partners::get_partner))
        .route("/admin/partners/{id}/activate", post(rest::partners::activate_partner))
        .route("/admin/partners/{id}/suspend", post(rest::partners::suspend_partner))
        .route("/admin/partners/{id}/rotate", post(rest::partners::rotate_credentials))
        .route("/partners/webhook", post(rest::partners::webhook))
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        // Method + path + status + latency only
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}
