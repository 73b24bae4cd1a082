use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use forage_common::{
    DiscoveryRun, ForageError, LearnedPattern, Result, RunConfig, RunError, RunKind, RunStats,
    RunStatus, TriggeredBy,
};
use forage_store::{Collection, DocumentStore, OrderBy, Query};

use crate::progress::{ProgressEvent, RunProgressHub};

pub const RUNS_COLLECTION: &str = "discovery_runs";

/// Lifecycle bookkeeping for discovery runs. Every mutation is a serialized
/// update and publishes the new snapshot to progress subscribers.
#[derive(Clone)]
pub struct RunTracker {
    runs: Collection<DiscoveryRun>,
    hub: RunProgressHub,
}

impl RunTracker {
    pub fn new(store: Arc<dyn DocumentStore>, hub: RunProgressHub) -> Self {
        Self {
            runs: Collection::new(store, RUNS_COLLECTION),
            hub,
        }
    }

    pub async fn create(
        &self,
        kind: RunKind,
        config: RunConfig,
        triggered_by: TriggeredBy,
    ) -> Result<DiscoveryRun> {
        if config.max_targets == Some(0) {
            return Err(ForageError::Validation("max_targets must be positive".into()));
        }
        let run = self
            .runs
            .insert(None, &DiscoveryRun::new(kind, config, triggered_by))
            .await?;
        info!(run_id = %run.id, ?kind, ?triggered_by, "Created discovery run");
        Ok(run)
    }

    pub async fn get(&self, id: &str) -> Result<DiscoveryRun> {
        Ok(self.runs.require(id).await?)
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<DiscoveryRun>> {
        Ok(self
            .runs
            .query(&Query::new().order_by(OrderBy::desc("created_at")).limit(limit))
            .await?)
    }

    async fn apply<F>(&self, id: &str, mut f: F) -> Result<DiscoveryRun>
    where
        F: FnMut(&mut DiscoveryRun) -> Result<()> + Send,
    {
        let (run, ()) = self.runs.mutate(id, |run| f(run)).await?;
        self.hub.publish(&run);
        Ok(run)
    }

    pub async fn start(&self, id: &str) -> Result<DiscoveryRun> {
        let now = Utc::now();
        let run = self
            .apply(id, |run| {
                transition(run, RunStatus::Running)?;
                run.started_at = Some(now);
                Ok(())
            })
            .await?;
        info!(run_id = id, "Run started");
        Ok(run)
    }

    /// Finish a run. A run with a pending cancel request is stamped cancelled.
    pub async fn complete(&self, id: &str) -> Result<DiscoveryRun> {
        let now = Utc::now();
        let run = self
            .apply(id, |run| {
                transition(run, RunStatus::Completed)?;
                run.completed_at = Some(now);
                if run.cancel_requested {
                    run.cancelled_at = Some(now);
                }
                Ok(())
            })
            .await?;
        info!(run_id = id, cancelled = run.is_cancelled(), stats = %run.stats, "Run completed");
        Ok(run)
    }

    pub async fn fail(&self, id: &str, message: &str) -> Result<DiscoveryRun> {
        let now = Utc::now();
        let run = self
            .apply(id, |run| {
                transition(run, RunStatus::Failed)?;
                run.errors.push(RunError {
                    message: message.to_string(),
                    context: Some("fatal".to_string()),
                    occurred_at: now,
                });
                run.completed_at = Some(now);
                Ok(())
            })
            .await?;
        warn!(run_id = id, error = message, "Run failed");
        Ok(run)
    }

    /// Ask a run to stop. A running run stops at its next cancellation check; a
    /// pending run is closed immediately. Terminal runs are returned unchanged.
    pub async fn request_cancel(&self, id: &str) -> Result<DiscoveryRun> {
        let now = Utc::now();
        let run = self
            .apply(id, |run| {
                if run.status.is_terminal() {
                    return Ok(());
                }
                run.cancel_requested = true;
                if run.status == RunStatus::Pending {
                    run.status = RunStatus::Completed;
                    run.completed_at = Some(now);
                    run.cancelled_at = Some(now);
                }
                Ok(())
            })
            .await?;
        info!(run_id = id, status = %run.status, "Cancel requested");
        Ok(run)
    }

    pub async fn is_cancel_requested(&self, id: &str) -> Result<bool> {
        Ok(self.get(id).await?.cancel_requested)
    }

    pub async fn record_stats(&self, id: &str, delta: RunStats) -> Result<DiscoveryRun> {
        if delta.is_zero() {
            return self.get(id).await;
        }
        self.apply(id, |run| {
            run.stats.apply(&delta);
            Ok(())
        })
        .await
    }

    pub async fn add_strategy_used(&self, id: &str, strategy_id: &str) -> Result<DiscoveryRun> {
        self.apply(id, |run| {
            run.add_strategy(strategy_id);
            Ok(())
        })
        .await
    }

    pub async fn add_learned_pattern(
        &self,
        id: &str,
        pattern: &str,
        context: Option<&str>,
    ) -> Result<DiscoveryRun> {
        let now = Utc::now();
        self.apply(id, |run| {
            run.learned_patterns.push(LearnedPattern {
                pattern: pattern.to_string(),
                context: context.map(str::to_string),
                learned_at: now,
            });
            Ok(())
        })
        .await
    }

    pub async fn add_error(
        &self,
        id: &str,
        message: &str,
        context: Option<&str>,
    ) -> Result<DiscoveryRun> {
        let now = Utc::now();
        self.apply(id, |run| {
            run.errors.push(RunError {
                message: message.to_string(),
                context: context.map(str::to_string),
                occurred_at: now,
            });
            Ok(())
        })
        .await
    }

    /// Event stream for one run: `init`, `update`s, `done`, with heartbeats.
    pub async fn subscribe(&self, id: &str) -> Result<mpsc::Receiver<ProgressEvent>> {
        let snapshots = self.hub.receiver(id);
        match self.get(id).await {
            Ok(run) => Ok(self.hub.stream(run, snapshots)),
            Err(e) => {
                drop(snapshots);
                self.hub.prune(id);
                Err(e)
            }
        }
    }
}

fn transition(run: &mut DiscoveryRun, to: RunStatus) -> Result<()> {
    if !run.status.can_transition_to(to) {
        return Err(ForageError::invalid_transition(run.status, to));
    }
    run.status = to;
    Ok(())
}
