//! Post-commit learning updates.
//!
//! When a staged entity is decided, three things should learn from it: the
//! strategy that found it, the feedback log and the submitting partner's quality
//! score. None of them may hold up or fail the review itself, so decisions are
//! queued on a channel and applied by one background task. Failures are logged
//! and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use forage_common::{
    EntityType, ForageError, ReviewDecision, ReviewOutcome, StagedEntity, UsageOutcome,
};

use crate::feedback::FeedbackRecorder;
use crate::partner::PartnerAccounts;
use crate::strategy::StrategyRegistry;

const QUEUE_CAPACITY: usize = 1024;

/// A committed review decision.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionEvent {
    pub entity_type: EntityType,
    pub staged_id: String,
    pub strategy_id: Option<String>,
    pub partner_id: Option<String>,
    pub discovery_run_id: Option<String>,
    pub decision: ReviewDecision,
    pub confidence: u8,
    pub reviewer: String,
    pub decided_at: DateTime<Utc>,
}

impl DecisionEvent {
    /// None if the entity carries no review.
    pub fn from_entity(entity: &StagedEntity) -> Option<Self> {
        let review = entity.review.as_ref()?;
        Some(Self {
            entity_type: entity.entity_type(),
            staged_id: entity.id.clone(),
            strategy_id: entity.strategy_id.clone(),
            partner_id: entity.partner_id.clone(),
            discovery_run_id: entity.discovery_run_id.clone(),
            decision: review.decision,
            confidence: entity.confidence_score,
            reviewer: review.reviewer.clone(),
            decided_at: review.decided_at,
        })
    }
}

enum LearningMessage {
    Decision(DecisionEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LearningStats {
    pub queued: u64,
    pub applied: u64,
    /// Individual update failures (one decision can fail up to three updates).
    pub failed: u64,
    /// Decisions not queued because the channel was full or closed.
    pub dropped: u64,
}

/// Handle used by the staging store to report decisions.
#[derive(Clone)]
pub struct LearningHooks {
    tx: mpsc::Sender<LearningMessage>,
    counters: Arc<Counters>,
}

impl LearningHooks {
    pub fn spawn(
        strategies: StrategyRegistry,
        feedback: FeedbackRecorder,
        partners: PartnerAccounts,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let counters = Arc::new(Counters::default());
        let worker = Learner {
            strategies,
            feedback,
            partners,
            counters: counters.clone(),
        };

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    LearningMessage::Decision(event) => worker.apply(event).await,
                    LearningMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Learning hooks stopped");
        });

        (Self { tx, counters }, handle)
    }

    /// Queue a decision. Never blocks and never fails the caller.
    pub fn notify(&self, event: DecisionEvent) {
        match self.tx.try_send(LearningMessage::Decision(event)) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Learning update dropped");
            }
        }
    }

    /// Wait until everything queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LearningMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn stats(&self) -> LearningStats {
        LearningStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Learner {
    strategies: StrategyRegistry,
    feedback: FeedbackRecorder,
    partners: PartnerAccounts,
    counters: Arc<Counters>,
}

impl Learner {
    async fn apply(&self, event: DecisionEvent) {
        let accepted = event.decision == ReviewDecision::Approved;

        if let Some(strategy_id) = &event.strategy_id {
            let outcome = if accepted {
                UsageOutcome::Success
            } else {
                UsageOutcome::Failure
            };
            let result = self.strategies.record_usage(strategy_id, outcome).await;
            self.check("strategy usage", &event, result.map(|_| ()));
        }

        let outcome = ReviewOutcome {
            id: String::new(),
            entity_type: event.entity_type,
            staged_id: event.staged_id.clone(),
            strategy_id: event.strategy_id.clone(),
            partner_id: event.partner_id.clone(),
            discovery_run_id: event.discovery_run_id.clone(),
            decision: event.decision,
            confidence: event.confidence,
            reviewer: event.reviewer.clone(),
            decided_at: event.decided_at,
        };
        let result = self.feedback.record_review(outcome).await;
        self.check("review outcome", &event, result.map(|_| ()));

        if let Some(partner_id) = &event.partner_id {
            let result = self
                .partners
                .record_submission(partner_id, event.confidence, accepted)
                .await;
            self.check("partner quality", &event, result.map(|_| ()));
        }

        self.counters.applied.fetch_add(1, Ordering::Relaxed);
    }

    fn check(&self, update: &str, event: &DecisionEvent, result: Result<(), ForageError>) {
        if let Err(e) = result {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                update,
                staged_id = %event.staged_id,
                entity_type = %event.entity_type,
                error = %e,
                "Learning update failed"
            );
        }
    }
}
