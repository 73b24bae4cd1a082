pub mod budget;
pub mod feedback;
pub mod intake;
pub mod learning;
pub mod partner;
pub mod progress;
pub mod runs;
pub mod staging;
pub mod strategy;
pub mod traits;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use budget::BudgetLedger;
pub use feedback::FeedbackRecorder;
pub use intake::{IntakeItemResult, IntakeResponse, PartnerIntake};
pub use learning::{DecisionEvent, LearningHooks, LearningStats};
pub use partner::{hash_api_key, sign_webhook, PartnerAccounts};
pub use progress::{ProgressEvent, RunProgressHub};
pub use runs::RunTracker;
pub use staging::{
    BulkItem, BulkItemStatus, BulkResult, PartialApproval, ReviewQueueFilter, ReviewQueuePage,
    RoutePolicy, StageOutcome, StagingStore,
};
pub use strategy::StrategyRegistry;
pub use traits::{AiUsage, Candidate, CandidateSource, DiscoveryTarget, ProductionCatalog, SearchResponse};
pub use worker::DiscoveryWorker;
