use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use forage_common::confidence::{self, source_reliability_factor};
use forage_common::{
    DiscoveryRun, EntityType, NewSearchFeedback, Result, RunConfig, RunKind, RunStats,
    SearchResultType, StagingStatus, Strategy, StrategyKind, TriggeredBy, UsageOutcome,
};

use crate::budget::BudgetLedger;
use crate::feedback::FeedbackRecorder;
use crate::runs::RunTracker;
use crate::staging::StagingStore;
use crate::strategy::StrategyRegistry;
use crate::traits::{CandidateSource, DiscoveryTarget, SearchResponse};

/// Weight of the strategy's track record next to the source's own factors.
const SOURCE_RELIABILITY_WEIGHT: f64 = 0.2;

/// Drives one discovery run over a list of targets: pick a strategy, search,
/// score, stage and auto-route, charging every query to the budget.
///
/// Cancellation is checked between targets. Staged data is never retracted.
#[derive(Clone)]
pub struct DiscoveryWorker {
    runs: RunTracker,
    budget: BudgetLedger,
    strategies: StrategyRegistry,
    staging: StagingStore,
    feedback: FeedbackRecorder,
    source: Arc<dyn CandidateSource>,
}

impl DiscoveryWorker {
    pub fn new(
        runs: RunTracker,
        budget: BudgetLedger,
        strategies: StrategyRegistry,
        staging: StagingStore,
        feedback: FeedbackRecorder,
        source: Arc<dyn CandidateSource>,
    ) -> Self {
        Self {
            runs,
            budget,
            strategies,
            staging,
            feedback,
            source,
        }
    }

    /// Admission-check, create and spawn a run. Returns the pending run.
    pub async fn launch(
        &self,
        kind: RunKind,
        config: RunConfig,
        targets: Vec<DiscoveryTarget>,
        triggered_by: TriggeredBy,
    ) -> Result<(DiscoveryRun, JoinHandle<()>)> {
        self.budget.check_admission().await?;
        let run = self.runs.create(kind, config, triggered_by).await?;

        let worker = self.clone();
        let run_id = run.id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.execute(&run_id, targets).await {
                error!(run_id = %run_id, error = %e, "Discovery run aborted");
                if let Err(fail_err) = worker.runs.fail(&run_id, &e.to_string()).await {
                    error!(run_id = %run_id, error = %fail_err, "Failed to mark run failed");
                }
            }
        });
        Ok((run, handle))
    }

    pub async fn execute(&self, run_id: &str, targets: Vec<DiscoveryTarget>) -> Result<DiscoveryRun> {
        let run = self.runs.get(run_id).await?;
        if run.is_cancelled() {
            info!(run_id, "Run cancelled before it started");
            return Ok(run);
        }
        let run = self.runs.start(run_id).await?;

        let limit = run
            .config
            .max_targets
            .map_or(targets.len(), |m| (m as usize).min(targets.len()));
        for target in targets.into_iter().take(limit) {
            if self.runs.is_cancel_requested(run_id).await? {
                info!(run_id, "Cancellation observed, stopping");
                break;
            }
            self.process_target(&run, &target).await?;
        }

        self.runs.complete(run_id).await
    }

    /// Evolve `parent_id` into a new strategy. With a run id, the child is
    /// counted in that run's `new_strategies_created`.
    pub async fn evolve_strategy(
        &self,
        parent_id: &str,
        config: Value,
        tags: Vec<String>,
        run_id: Option<&str>,
    ) -> Result<Strategy> {
        if let Some(run_id) = run_id {
            self.runs.get(run_id).await?;
        }
        let child = self.strategies.evolve(parent_id, config, tags).await?;
        if let Some(run_id) = run_id {
            let delta = RunStats {
                new_strategies_created: 1,
                ..RunStats::default()
            };
            self.runs.record_stats(run_id, delta).await?;
            info!(run_id, parent = parent_id, child = %child.id, "Strategy evolved during run");
        }
        Ok(child)
    }

    async fn process_target(&self, run: &DiscoveryRun, target: &DiscoveryTarget) -> Result<()> {
        let kind = match run.kind {
            RunKind::Discovery => StrategyKind::Discovery,
            RunKind::DishExtraction => StrategyKind::DishExtraction,
        };
        let Some(strategy) = self
            .strategies
            .get_strategy(kind, &target.platform, target.chain_id.as_deref())
            .await?
        else {
            warn!(run_id = %run.id, platform = %target.platform, "No active strategy");
            self.runs
                .add_error(
                    &run.id,
                    &format!("no active strategy for {}", target.platform),
                    Some(&target.query),
                )
                .await?;
            return Ok(());
        };
        self.runs.add_strategy_used(&run.id, &strategy.id).await?;
        self.budget.record_search().await?;

        let mut stats = RunStats {
            queries_executed: 1,
            ..RunStats::default()
        };

        let response = match self.source.search(&strategy, target).await {
            Ok(response) => response,
            Err(e) => {
                warn!(run_id = %run.id, query = %target.query, error = %e, "Search failed");
                stats.queries_failed = 1;
                self.runs
                    .add_error(&run.id, &e.to_string(), Some(&target.query))
                    .await?;
                self.finish_search(run, &strategy, target, SearchResultType::Error, 0, Vec::new())
                    .await?;
                self.runs.record_stats(&run.id, stats).await?;
                return Ok(());
            }
        };
        stats.queries_successful = 1;

        let results = response.candidates.len() as u64;
        let (staged_ids, accepted, counted) = self
            .stage_candidates(run, &strategy, target, response)
            .await?;
        stats.apply(&counted);

        let result_type = if staged_ids.is_empty() {
            SearchResultType::NoResults
        } else if accepted {
            SearchResultType::TruePositive
        } else {
            SearchResultType::FalsePositive
        };
        self.finish_search(run, &strategy, target, result_type, results, staged_ids)
            .await?;
        self.runs.record_stats(&run.id, stats).await?;
        Ok(())
    }

    /// Returns staged ids, whether any candidate survived routing, and the run
    /// counters the candidates contributed.
    async fn stage_candidates(
        &self,
        run: &DiscoveryRun,
        strategy: &Strategy,
        target: &DiscoveryTarget,
        response: SearchResponse,
    ) -> Result<(Vec<String>, bool, RunStats)> {
        for usage in &response.ai_usage {
            self.budget
                .record_ai_call(&usage.provider, usage.input_tokens, usage.output_tokens)
                .await?;
        }

        let policy = self.staging.default_policy();
        let mut staged_ids = Vec::new();
        let mut accepted = false;
        let mut stats = RunStats::default();

        for candidate in response.candidates {
            let mut entity = candidate.entity;
            entity.discovery_run_id = Some(run.id.clone());
            entity.strategy_id = Some(strategy.id.clone());

            let mut factors = candidate.factors;
            factors.push(source_reliability_factor(
                Some(strategy.success_rate),
                SOURCE_RELIABILITY_WEIGHT,
            ));
            let confidence = confidence::score(&factors);

            let outcome = match self.staging.submit(entity, confidence, policy).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Candidate not staged");
                    self.runs
                        .add_error(&run.id, &e.to_string(), Some(&target.query))
                        .await?;
                    continue;
                }
            };

            let staged = outcome.entity;
            staged_ids.push(staged.id.clone());
            if staged.status != StagingStatus::Rejected {
                accepted = true;
            }
            if staged.entity_type() != EntityType::Venue {
                continue;
            }
            if !outcome.merged {
                stats.venues_discovered += 1;
            }
            match staged.status {
                StagingStatus::Approved => stats.venues_verified += 1,
                StagingStatus::Rejected => stats.venues_rejected += 1,
                _ => {}
            }
            if let (Some(chain), None) = (staged.chain_id(), target.chain_id.as_deref()) {
                stats.chains_detected += 1;
                self.runs
                    .add_learned_pattern(
                        &run.id,
                        &format!("{} surfaces chain {chain}", target.platform),
                        Some(&target.query),
                    )
                    .await?;
            }
        }
        Ok((staged_ids, accepted, stats))
    }

    /// Log the search and, when it produced nothing usable, count it against
    /// the strategy. Staged candidates are credited when they are decided.
    ///
    /// Both writes are best-effort: a failure is logged and recorded on the
    /// run, and the run carries on with the next target.
    async fn finish_search(
        &self,
        run: &DiscoveryRun,
        strategy: &Strategy,
        target: &DiscoveryTarget,
        result_type: SearchResultType,
        results_count: u64,
        staged_ids: Vec<String>,
    ) -> Result<()> {
        let logged = self
            .feedback
            .record_search(NewSearchFeedback {
                run_id: Some(run.id.clone()),
                strategy_id: Some(strategy.id.clone()),
                platform: target.platform.clone(),
                chain_id: target.chain_id.clone(),
                query: target.query.clone(),
                result_type,
                results_count,
                staged_ids,
            })
            .await;
        if let Err(e) = logged {
            warn!(run_id = %run.id, error = %e, "Search feedback not recorded");
            self.runs
                .add_error(&run.id, &format!("search feedback: {e}"), Some(&target.query))
                .await?;
        }

        if matches!(result_type, SearchResultType::NoResults | SearchResultType::Error) {
            if let Err(e) = self
                .strategies
                .record_usage(&strategy.id, UsageOutcome::Failure)
                .await
            {
                warn!(
                    run_id = %run.id,
                    strategy_id = %strategy.id,
                    error = %e,
                    "Strategy usage not recorded"
                );
                self.runs
                    .add_error(&run.id, &format!("strategy usage: {e}"), Some(&target.query))
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use forage_common::config::{BudgetConfig, PricingConfig, StagingConfig};
    use forage_common::{ForageError, RunStatus};
    use forage_store::{DocumentStore, MemoryCache, MemoryStore};
    use serde_json::json;

    use super::*;
    use crate::progress::RunProgressHub;
    use crate::testing::{venue_candidate, MockCandidateSource};

    struct Harness {
        worker: DiscoveryWorker,
        runs: RunTracker,
        budget: BudgetLedger,
        strategies: StrategyRegistry,
        feedback: FeedbackRecorder,
        strategy: Strategy,
    }

    async fn harness(source: MockCandidateSource, budget: BudgetConfig) -> Harness {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let runs = RunTracker::new(store.clone(), RunProgressHub::new(Duration::from_secs(3600)));
        let budget = BudgetLedger::new(store.clone(), budget, PricingConfig::default());
        let strategies = StrategyRegistry::new(store.clone());
        let staging = StagingStore::new(
            store.clone(),
            Arc::new(MemoryCache::default()),
            StagingConfig::default(),
        );
        let feedback = FeedbackRecorder::new(store);
        let strategy = strategies
            .seed(Strategy::seed(
                StrategyKind::Discovery,
                "google_maps",
                None,
                "name search",
                json!({}),
                vec![],
            ))
            .await
            .unwrap();
        let worker = DiscoveryWorker::new(
            runs.clone(),
            budget.clone(),
            strategies.clone(),
            staging,
            feedback.clone(),
            Arc::new(source),
        );
        Harness {
            worker,
            runs,
            budget,
            strategies,
            feedback,
            strategy,
        }
    }

    fn target(query: &str) -> DiscoveryTarget {
        DiscoveryTarget {
            platform: "google_maps".into(),
            chain_id: None,
            market: Some("austin".into()),
            query: query.into(),
        }
    }

    #[tokio::test]
    async fn run_stages_candidates_and_records_outcomes() {
        let source = MockCandidateSource::new()
            .on_query("burgers", vec![venue_candidate("Burger Palace", "bp-1")])
            .failing("tacos", "upstream 503");
        let h = harness(source, BudgetConfig::default()).await;

        let (run, handle) = h
            .worker
            .launch(
                RunKind::Discovery,
                RunConfig::default(),
                vec![target("burgers"), target("tacos"), target("sushi")],
                TriggeredBy::Manual,
            )
            .await
            .unwrap();
        handle.await.unwrap();

        let run = h.runs.get(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stats.queries_executed, 3);
        assert_eq!(run.stats.queries_successful, 2);
        assert_eq!(run.stats.queries_failed, 1);
        assert_eq!(run.stats.venues_discovered, 1);
        assert_eq!(run.strategies_used, vec![h.strategy.id.clone()]);
        assert_eq!(run.errors.len(), 1);

        let today = h.budget.today().await.unwrap();
        assert_eq!(today.search_queries(), 3);

        // tacos errored, sushi found nothing.
        let strategy = h.strategies.get(&h.strategy.id).await.unwrap();
        assert_eq!(strategy.failed_uses, 2);

        let perf = h
            .feedback
            .get_strategy_performance(Some(&h.strategy.id))
            .await
            .unwrap();
        assert_eq!(perf.tally.searches, 3);
        assert_eq!(perf.tally.errors, 1);
        assert_eq!(perf.tally.no_results, 1);
    }

    #[tokio::test]
    async fn max_targets_caps_the_run() {
        let source = MockCandidateSource::new();
        let h = harness(source.clone(), BudgetConfig::default()).await;
        let config = RunConfig {
            max_targets: Some(1),
            ..RunConfig::default()
        };
        let run = h
            .runs
            .create(RunKind::Discovery, config, TriggeredBy::Scheduled)
            .await
            .unwrap();
        h.worker
            .execute(&run.id, vec![target("a"), target("b")])
            .await
            .unwrap();
        assert_eq!(source.calls().len(), 1);
    }

    /// Requests cancellation of the run the first time it is searched.
    struct CancellingSource {
        runs: RunTracker,
        run_id: std::sync::Mutex<Option<String>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CandidateSource for CancellingSource {
        async fn search(
            &self,
            _strategy: &Strategy,
            _target: &DiscoveryTarget,
        ) -> anyhow::Result<SearchResponse> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let run_id = self.run_id.lock().unwrap().take();
            if let Some(id) = run_id {
                self.runs.request_cancel(&id).await?;
            }
            Ok(SearchResponse::default())
        }
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_targets() {
        let h = harness(MockCandidateSource::new(), BudgetConfig::default()).await;
        let run = h
            .runs
            .create(RunKind::Discovery, RunConfig::default(), TriggeredBy::Manual)
            .await
            .unwrap();
        let source = Arc::new(CancellingSource {
            runs: h.runs.clone(),
            run_id: std::sync::Mutex::new(Some(run.id.clone())),
            calls: Default::default(),
        });
        let worker = DiscoveryWorker {
            source: source.clone(),
            ..h.worker.clone()
        };

        let run = worker
            .execute(&run.id, vec![target("a"), target("b"), target("c")])
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.is_cancelled());
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(run.stats.queries_executed, 1);
    }

    /// Deprecates the strategy it is searched with and finds nothing.
    struct DeprecatingSource {
        strategies: StrategyRegistry,
    }

    #[async_trait::async_trait]
    impl CandidateSource for DeprecatingSource {
        async fn search(
            &self,
            strategy: &Strategy,
            _target: &DiscoveryTarget,
        ) -> anyhow::Result<SearchResponse> {
            self.strategies.deprecate(&strategy.id, "replaced").await?;
            Ok(SearchResponse::default())
        }
    }

    #[tokio::test]
    async fn strategy_deprecated_mid_run_does_not_abort_the_run() {
        let h = harness(MockCandidateSource::new(), BudgetConfig::default()).await;
        let worker = DiscoveryWorker {
            source: Arc::new(DeprecatingSource {
                strategies: h.strategies.clone(),
            }),
            ..h.worker.clone()
        };
        let run = h
            .runs
            .create(RunKind::Discovery, RunConfig::default(), TriggeredBy::Manual)
            .await
            .unwrap();

        let run = worker
            .execute(&run.id, vec![target("burgers"), target("tacos")])
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stats.queries_executed, 1);
        assert_eq!(run.stats.queries_successful, 1);
        // Usage on the deprecated strategy, then no strategy for the second target.
        assert_eq!(run.errors.len(), 2);
        assert!(run.errors[0].message.contains("strategy usage"));

        let perf = h
            .feedback
            .get_strategy_performance(Some(&h.strategy.id))
            .await
            .unwrap();
        assert_eq!(perf.tally.searches, 1);
    }

    #[tokio::test]
    async fn run_cancelled_while_pending_never_searches() {
        let source = MockCandidateSource::new();
        let h = harness(source.clone(), BudgetConfig::default()).await;
        let pending = h
            .runs
            .create(RunKind::Discovery, RunConfig::default(), TriggeredBy::Manual)
            .await
            .unwrap();
        h.runs.request_cancel(&pending.id).await.unwrap();
        let done = h.worker.execute(&pending.id, vec![target("a")]).await.unwrap();
        assert!(done.is_cancelled());
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn evolving_within_a_run_is_counted() {
        let h = harness(MockCandidateSource::new(), BudgetConfig::default()).await;
        let run = h
            .runs
            .create(RunKind::Discovery, RunConfig::default(), TriggeredBy::Manual)
            .await
            .unwrap();

        let child = h
            .worker
            .evolve_strategy(&h.strategy.id, json!({"radius_km": 5}), vec![], Some(&run.id))
            .await
            .unwrap();
        assert_eq!(child.parent_strategy_id.as_deref(), Some(h.strategy.id.as_str()));
        h.worker
            .evolve_strategy(&h.strategy.id, json!({}), vec![], None)
            .await
            .unwrap();

        let run = h.runs.get(&run.id).await.unwrap();
        assert_eq!(run.stats.new_strategies_created, 1);

        let missing = h
            .worker
            .evolve_strategy(&h.strategy.id, json!({}), vec![], Some("no-such-run"))
            .await;
        assert!(matches!(missing, Err(ForageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn throttled_budget_refuses_new_runs() {
        let budget = BudgetConfig {
            daily_limit_usd: 0.0,
            ..BudgetConfig::default()
        };
        let h = harness(MockCandidateSource::new(), budget).await;
        let result = h
            .worker
            .launch(
                RunKind::Discovery,
                RunConfig::default(),
                vec![target("a")],
                TriggeredBy::Manual,
            )
            .await;
        assert!(matches!(result, Err(ForageError::BudgetExceeded { .. })));
        assert!(h.runs.list_recent(10).await.unwrap().is_empty());
    }
}
